//! Reader guarantees: point-in-time isolation, cheap reopen, atomic
//! updates under concurrent readers, and partial document loading.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kopis::index::{
    Document, DirectoryReader, Field, FieldSelection, FilterReader, IndexReader, IndexWriter,
    IndexWriterConfig, SerialMergeScheduler, StoredFieldValue, StoredValue, Term, TermDocs,
    WriterComponents,
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

/// A reader opened before a commit never observes anything the writer did
/// after that commit, until explicitly reopened.
#[test]
fn test_point_in_time_isolation() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();

    writer.add_document(&doc("a", "alpha")).unwrap();
    writer.add_document(&doc("b", "beta")).unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    assert_eq!(reader.num_docs(), 2);

    // Keep mutating: add, delete, merge, commit repeatedly.
    writer.delete_documents(&Term::new("id", "a")).unwrap();
    writer.add_document(&doc("c", "gamma")).unwrap();
    writer.commit().unwrap();
    writer.optimize(1, true).unwrap();
    writer.commit().unwrap();

    assert_eq!(reader.num_docs(), 2, "isolated from later commits");
    assert!(!reader.has_deletions());
    assert_eq!(reader.doc_freq(&Term::new("text", "gamma")).unwrap(), 0);
    assert_eq!(reader.doc_freq(&Term::new("text", "alpha")).unwrap(), 1);

    let current = reader.reopen().unwrap();
    assert_eq!(current.num_docs(), 2, "b and c live, a deleted");
    assert_eq!(current.doc_freq(&Term::new("text", "gamma")).unwrap(), 1);
    assert_eq!(current.doc_freq(&Term::new("text", "alpha")).unwrap(), 0);

    current.close().unwrap();
    reader.close().unwrap();
    writer.close(true).unwrap();
}

/// Reopening an unchanged index hands back the same reader; after a
/// partial change only the touched segments are reloaded.
#[test]
fn test_reopen_is_idempotent_and_shares_segments() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();

    writer.add_document(&doc("a", "alpha")).unwrap();
    writer.flush().unwrap();
    writer.add_document(&doc("b", "beta")).unwrap();
    writer.commit().unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    let same = reader.reopen().unwrap();
    assert!(Arc::ptr_eq(&reader, &same), "nothing changed");

    // A third segment arrives; the first two are untouched.
    writer.add_document(&doc("c", "gamma")).unwrap();
    writer.commit().unwrap();

    let reopened = reader.reopen().unwrap();
    assert_eq!(reopened.num_docs(), 3);
    assert!(
        reopened.sub_readers()[0].shares_core_with(&reader.sub_readers()[0]),
        "unchanged segment reused by reference"
    );
    assert!(reopened.sub_readers()[1].shares_core_with(&reader.sub_readers()[1]));

    reopened.close().unwrap();
    reader.close().unwrap();
    writer.close(true).unwrap();
}

/// While one thread replaces a document over and over, a searching thread
/// never observes the old document gone with the new one absent (or both
/// present): the update is atomic.
#[test]
fn test_atomic_update_under_concurrent_search() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();

    writer.add_document(&doc("subject", "revision r0")).unwrap();
    writer.flush().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let searcher = {
        let writer = Arc::clone(&writer);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut observations = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let reader = writer.nrt_reader().unwrap();
                let mut docs = reader.term_docs(&Term::new("id", "subject")).unwrap();
                let mut live = 0;
                while docs.next().unwrap() {
                    live += 1;
                }
                assert_eq!(live, 1, "exactly one revision visible at all times");
                observations += 1;
            }
            observations
        })
    };

    for i in 1..40 {
        writer
            .update_document(
                &Term::new("id", "subject"),
                &doc("subject", &format!("revision r{i}")),
            )
            .unwrap();
        writer.flush().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    let observations = searcher.join().unwrap();
    assert!(observations > 0, "the searcher actually ran");

    let reader = writer.nrt_reader().unwrap();
    assert_eq!(reader.num_docs(), 1);
    assert_eq!(reader.doc_freq(&Term::new("text", "r39")).unwrap(), 1);
    writer.close(true).unwrap();
}

/// Stored-field retrieval honors the selector: skipped fields are absent,
/// size-only fields avoid the payload, lazy fields decode on demand.
#[test]
fn test_partial_document_loading() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();

    let payload: Vec<u8> = (0u8..=255).collect();
    writer
        .add_document(
            &Document::new()
                .add(Field::keyword("id", "x"))
                .add(Field::text("title", "a short title"))
                .add(Field::stored("blob", StoredValue::Binary(payload.clone()))),
        )
        .unwrap();
    writer.commit().unwrap();
    writer.close(true).unwrap();

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();

    let selector = |field: &str| match field {
        "title" => FieldSelection::Load,
        "blob" => FieldSelection::Lazy,
        _ => FieldSelection::Skip,
    };
    let document = reader.document(0, &selector).unwrap();

    assert!(document.get("id").is_none(), "skipped field absent");
    assert_eq!(
        document.text("title").unwrap().as_deref(),
        Some("a short title")
    );

    let blob = document.get("blob").unwrap();
    assert_eq!(blob.byte_len(), 256, "length known before decoding");
    assert_eq!(blob.load().unwrap(), StoredValue::Binary(payload));

    // Size-only reports the byte length without the value.
    let sizes = reader
        .document(0, &|_: &str| FieldSelection::SizeOnly)
        .unwrap();
    match sizes.get("blob").unwrap() {
        StoredFieldValue::Size(size) => assert_eq!(*size, 256),
        other => panic!("expected size-only value, got {other:?}"),
    }

    reader.close().unwrap();
}

/// A delegating decorator behaves exactly like the reader it wraps; custom
/// variants embed one and override only what they change.
#[test]
fn test_filter_reader_delegates() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();
    writer.add_document(&doc("a", "alpha")).unwrap();
    writer.add_document(&doc("b", "beta")).unwrap();
    writer.commit().unwrap();
    writer.close(true).unwrap();

    let inner = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    let filtered = FilterReader::new(Arc::clone(&inner) as Arc<dyn IndexReader>);

    assert_eq!(filtered.num_docs(), inner.num_docs());
    assert_eq!(filtered.max_doc(), 2);
    assert_eq!(filtered.doc_freq(&Term::new("text", "beta")).unwrap(), 1);
    let stored = filtered.document(0, &kopis::index::LoadAll).unwrap();
    assert_eq!(stored.text("text").unwrap().as_deref(), Some("alpha"));

    let mut docs = filtered.term_docs(&Term::new("text", "alpha")).unwrap();
    assert!(docs.next().unwrap());
    assert_eq!(docs.doc(), 0);

    inner.close().unwrap();
}

/// Norm bytes flow end to end: longer fields score smaller norms, and a
/// reader-side set_norm overrides the stored byte after its commit.
#[test]
fn test_norms_round_trip_and_rewrite() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer =
        IndexWriter::open_with(Arc::clone(&storage), config(), serial_components()).unwrap();

    writer.add_document(&doc("a", "one")).unwrap();
    writer
        .add_document(&doc("b", "one two three four five six seven eight"))
        .unwrap();
    writer.commit().unwrap();
    writer.close(true).unwrap();

    {
        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        let norms = reader.norms("text").unwrap().unwrap();
        assert_eq!(norms.len(), 2);
        assert!(norms[0] > norms[1], "longer field gets the smaller norm");
        assert!(reader.norms("id").unwrap().is_none(), "keyword omits norms");

        reader.set_norm(1, "text", norms[0]).unwrap();
        reader.close().unwrap(); // commits the rewrite
    }

    let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
    let norms = reader.norms("text").unwrap().unwrap();
    assert_eq!(norms[0], norms[1], "rewritten norm visible after commit");
    reader.close().unwrap();
}
