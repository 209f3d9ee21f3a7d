//! Merge invariants: document counts, term frequencies, source sharing,
//! and the concurrent scheduler under real load.

use std::sync::Arc;

use kopis::index::{
    ConcurrentMergeScheduler, Document, DirectoryReader, Field, IndexReader, IndexWriter,
    IndexWriterConfig, MergePolicy, MergeSpecification, OneMerge, SegmentInfo, SegmentInfos,
    SerialMergeScheduler, Term, TermEnum, WriterComponents,
};
use kopis::storage::{MemoryStorage, Storage};

fn config() -> IndexWriterConfig {
    IndexWriterConfig {
        lock_timeout_ms: 200,
        ..IndexWriterConfig::default()
    }
}

fn serial_components() -> WriterComponents {
    WriterComponents {
        merge_scheduler: Some(Arc::new(SerialMergeScheduler)),
        ..WriterComponents::default()
    }
}

fn doc(id: &str, text: &str) -> Document {
    Document::new()
        .add(Field::keyword("id", id))
        .add(Field::text("text", text))
}

/// The merged segment holds exactly the sum of the sources' live
/// documents.
#[test]
fn test_merge_doc_count_invariant() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();

    // Three segments of 4, 3 and 5 docs; delete two docs up front.
    let sizes = [4, 3, 5];
    let mut n = 0;
    for size in sizes {
        for _ in 0..size {
            writer
                .add_document(&doc(&format!("d{n}"), &format!("tok{n} common")))
                .unwrap();
            n += 1;
        }
        writer.flush().unwrap();
    }
    writer.delete_documents(&Term::new("id", "d0")).unwrap();
    writer.delete_documents(&Term::new("id", "d7")).unwrap();
    writer.flush().unwrap();

    writer.optimize(1, true).unwrap();
    writer.commit().unwrap();
    writer.close(true).unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 10, "4 + 3 + 5 minus 2 deletions");
    assert_eq!(reader.max_doc(), 10, "merged segment has no holes");
    assert_eq!(reader.doc_freq(&Term::new("text", "common")).unwrap(), 10);
    reader.close().unwrap();
}

/// Per-term document frequencies in the merged dictionary equal the sum
/// of live frequencies across the sources; dead terms vanish.
#[test]
fn test_merge_term_invariant() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();

    writer.add_document(&doc("a", "shared only-a")).unwrap();
    writer.add_document(&doc("b", "shared only-b")).unwrap();
    writer.flush().unwrap();
    writer.add_document(&doc("c", "shared only-c")).unwrap();
    writer.flush().unwrap();

    writer.delete_documents(&Term::new("id", "b")).unwrap();
    writer.optimize(1, true).unwrap();
    writer.commit().unwrap();
    writer.close(true).unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.doc_freq(&Term::new("text", "shared")).unwrap(), 2);
    assert_eq!(reader.doc_freq(&Term::new("text", "only-a")).unwrap(), 1);
    assert_eq!(reader.doc_freq(&Term::new("text", "only-b")).unwrap(), 0);
    assert_eq!(reader.doc_freq(&Term::new("text", "only-c")).unwrap(), 1);

    // The dictionary agrees with point lookups.
    let mut terms = reader.terms().unwrap();
    let mut seen = Vec::new();
    while terms.next().unwrap() {
        let term = terms.term().unwrap();
        if term.field == "text" {
            seen.push((term.text.clone(), terms.doc_freq()));
        }
    }
    assert_eq!(
        seen,
        vec![
            ("only-a".to_string(), 1),
            ("only-c".to_string(), 1),
            ("shared".to_string(), 2),
        ]
    );
    reader.close().unwrap();
}

/// Proposes both halves of an overlapping pair at once.
#[derive(Debug)]
struct OverlappingPairPolicy;

impl MergePolicy for OverlappingPairPolicy {
    fn find_merges(&self, infos: &SegmentInfos) -> MergeSpecification {
        let mut spec = MergeSpecification::default();
        if infos.len() == 3 {
            let segments: Vec<SegmentInfo> = infos.iter().cloned().collect();
            spec.merges.push(OneMerge::new(segments[0..2].to_vec()));
            spec.merges.push(OneMerge::new(segments[1..3].to_vec()));
        }
        spec
    }

    fn find_merges_for_optimize(
        &self,
        _infos: &SegmentInfos,
        _max_segments: usize,
    ) -> MergeSpecification {
        MergeSpecification::default()
    }

    fn find_merges_to_expunge_deletes(&self, _infos: &SegmentInfos) -> MergeSpecification {
        MergeSpecification::default()
    }
}

/// Two merges may never share a source segment: the second of an
/// overlapping pair is deferred until the first resolves.
#[test]
fn test_overlapping_merges_never_run_together() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let components = WriterComponents {
        merge_policy: Some(Box::new(OverlappingPairPolicy)),
        merge_scheduler: Some(Arc::new(SerialMergeScheduler)),
        deletion_policy: None,
    };
    let writer = IndexWriter::open_with(Arc::clone(&storage), config(), components).unwrap();

    for (id, text) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
        writer.add_document(&doc(id, text)).unwrap();
        writer.flush().unwrap();
    }

    // The serial scheduler ran the accepted merge inline during the third
    // flush; the overlapping one was rejected at registration, so exactly
    // one merge happened: {_0,_1} -> one segment, _2 untouched.
    assert_eq!(writer.pending_merge_count(), 0);
    assert_eq!(writer.segment_count(), 2);
    assert_eq!(writer.num_docs().unwrap(), 3);

    writer.close(true).unwrap();
}

/// Heavy indexing with the concurrent scheduler and the levelled policy:
/// whatever merging happened in the background, no document is lost and
/// the index stays consistent.
#[test]
fn test_concurrent_scheduler_under_load() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let components = WriterComponents {
        merge_scheduler: Some(Arc::new(ConcurrentMergeScheduler::new(2))),
        ..WriterComponents::default()
    };
    let config = IndexWriterConfig {
        max_buffered_docs: 10,
        lock_timeout_ms: 200,
        ..IndexWriterConfig::default()
    };
    let writer = IndexWriter::open_with(Arc::clone(&storage), config, components).unwrap();

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                for i in 0..100 {
                    writer
                        .add_document(&doc(&format!("t{t}-d{i}"), "payload common"))
                        .unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    writer.close(true).unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 400);
    assert_eq!(reader.doc_freq(&Term::new("text", "common")).unwrap(), 400);
    assert_eq!(reader.doc_freq(&Term::new("id", "t3-d99")).unwrap(), 1);
    reader.close().unwrap();
}

/// Closing without waiting aborts outstanding merges instead of finishing
/// them; the committed index is still consistent.
#[test]
fn test_close_without_waiting_aborts_merges() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let components = WriterComponents {
        merge_scheduler: Some(Arc::new(ConcurrentMergeScheduler::new(1))),
        ..WriterComponents::default()
    };
    let config = IndexWriterConfig {
        max_buffered_docs: 5,
        lock_timeout_ms: 200,
        ..IndexWriterConfig::default()
    };
    let writer = IndexWriter::open_with(Arc::clone(&storage), config, components).unwrap();

    for i in 0..60 {
        writer
            .add_document(&doc(&format!("d{i}"), "steady stream"))
            .unwrap();
    }
    writer.close(false).unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 60);
    reader.close().unwrap();
}
