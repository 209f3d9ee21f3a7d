//! Merging several segments into one.
//!
//! The merge runs in independent passes over the source readers: field
//! infos, stored fields, term dictionary and postings, norms, then term
//! vectors. Deleted documents are dropped and the survivors densely
//! renumbered through per-source doc maps computed from a deletion snapshot
//! taken when the merger is built, so every pass agrees on the same live
//! set. A term whose postings drain to nothing (all its documents were
//! deleted) is omitted from the merged dictionary.
//!
//! Cancellation is cooperative: the copy loops poll a shared abort flag at
//! bounded intervals and unwind with the merge-aborted signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::error::{KopisError, Result};
use crate::index::bit_vector::BitVector;
use crate::index::compound::CompoundFileWriter;
use crate::index::field_infos::FieldInfos;
use crate::index::filenames;
use crate::index::norms::{self, Norms};
use crate::index::postings::PostingsWriter;
use crate::index::reader::{FieldSelection, IndexReader, TermEnum};
use crate::index::segment_info::SegmentInfo;
use crate::index::segment_reader::SegmentReader;
use crate::index::stored_fields::{FieldsWriter, StoredFieldEntry, StoredFieldValue};
use crate::index::term::Term;
use crate::index::term_vectors::{TermVectorFieldData, TermVectorsWriter};
use crate::index::terms::{TermDictTuning, TermDictWriter};
use crate::storage::traits::Storage;

/// How many copy steps pass between abort-flag polls.
const ABORT_CHECK_INTERVAL: u32 = 64;

/// Merges an ordered list of segment readers into one new segment.
pub struct SegmentMerger {
    storage: Arc<dyn Storage>,
    segment: String,
    readers: Vec<Arc<SegmentReader>>,
    tuning: TermDictTuning,
    abort: Option<Arc<AtomicBool>>,
    /// Deletions as observed when the merger was built.
    snapshots: Vec<Option<Arc<BitVector>>>,
    /// Per source: old doc number to merged doc number, `None` if deleted.
    doc_maps: Vec<Vec<Option<u32>>>,
    field_infos: FieldInfos,
    merged_doc_count: u32,
    work: u32,
}

impl SegmentMerger {
    /// Prepare a merge of `readers` into the segment named `segment`.
    ///
    /// The deletion state of every source is snapshotted here; deletes
    /// applied to the readers afterwards do not affect the merge (the
    /// caller reconciles them when installing the result).
    pub fn new(
        storage: Arc<dyn Storage>,
        segment: &str,
        readers: Vec<Arc<SegmentReader>>,
        tuning: TermDictTuning,
    ) -> Self {
        let snapshots: Vec<Option<Arc<BitVector>>> =
            readers.iter().map(|r| r.deleted_docs()).collect();

        let mut doc_maps = Vec::with_capacity(readers.len());
        let mut merged_doc_count = 0u32;
        for (reader, snapshot) in readers.iter().zip(&snapshots) {
            let mut map = Vec::with_capacity(reader.max_doc() as usize);
            for doc in 0..reader.max_doc() {
                if snapshot.as_ref().is_some_and(|d| d.get(doc)) {
                    map.push(None);
                } else {
                    map.push(Some(merged_doc_count));
                    merged_doc_count += 1;
                }
            }
            doc_maps.push(map);
        }

        SegmentMerger {
            storage,
            segment: segment.to_string(),
            readers,
            tuning,
            abort: None,
            snapshots,
            doc_maps,
            field_infos: FieldInfos::new(),
            merged_doc_count,
            work: 0,
        }
    }

    /// Attach the cooperative abort flag.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// The deletion snapshots the doc maps were computed from.
    pub fn deletion_snapshots(&self) -> &[Option<Arc<BitVector>>] {
        &self.snapshots
    }

    /// The per-source document renumbering.
    pub fn doc_maps(&self) -> &[Vec<Option<u32>>] {
        &self.doc_maps
    }

    /// Run all merge passes and return the new segment's metadata.
    pub fn merge(&mut self) -> Result<SegmentInfo> {
        debug!(
            "merging {:?} into {} ({} live docs)",
            self.readers.iter().map(|r| r.segment_name().to_string()).collect::<Vec<_>>(),
            self.segment,
            self.merged_doc_count
        );

        self.merge_field_infos()?;
        self.merge_stored_fields()?;
        self.merge_terms()?;
        self.merge_norms()?;
        if self.field_infos.has_vectors() {
            self.merge_vectors()?;
        }

        let mut info = SegmentInfo::new(&self.segment, self.merged_doc_count);
        info.has_prox = self.field_infos.has_prox();
        info.has_norms = self.field_infos.has_norms();
        info.has_vectors = self.field_infos.has_vectors();
        Ok(info)
    }

    /// Pack the merged segment's core files into a compound container.
    ///
    /// Returns the now-redundant standalone file names for the caller to
    /// delete, and flips the compound flag on `info`.
    pub fn create_compound_file(&self, info: &mut SegmentInfo) -> Result<Vec<String>> {
        let mut names: Vec<String> = filenames::SEGMENT_CORE_EXTENSIONS
            .iter()
            .map(|ext| filenames::segment_file_name(&self.segment, ext))
            .collect();
        if info.has_vectors {
            for ext in filenames::VECTOR_EXTENSIONS {
                names.push(filenames::segment_file_name(&self.segment, ext));
            }
        }

        let container = filenames::segment_file_name(&self.segment, filenames::COMPOUND_EXT);
        let mut writer = CompoundFileWriter::new(Arc::clone(&self.storage), &container);
        for name in &names {
            writer.add_file(name)?;
        }
        writer.finalize()?;

        info.use_compound = true;
        Ok(names)
    }

    /// Sticky union of every source's field table, densely renumbered.
    fn merge_field_infos(&mut self) -> Result<()> {
        let mut merged = FieldInfos::new();
        for reader in &self.readers {
            merged.merge_from(&reader.field_infos());
        }
        merged.write(
            self.storage.as_ref(),
            &filenames::segment_file_name(&self.segment, filenames::FIELD_INFOS_EXT),
        )?;
        self.field_infos = merged;
        Ok(())
    }

    fn merge_stored_fields(&mut self) -> Result<()> {
        let mut writer = FieldsWriter::new(self.storage.as_ref(), &self.segment)?;

        for (r, reader) in self.readers.iter().enumerate() {
            for doc in 0..reader.max_doc() {
                if self.doc_maps[r][doc as usize].is_none() {
                    continue;
                }
                let document =
                    reader.document(doc, &|_: &str| FieldSelection::LoadForMerge)?;
                let mut entries = Vec::with_capacity(document.fields.len());
                for field in document.fields {
                    let number = self
                        .field_infos
                        .by_name(&field.name)
                        .map(|f| f.number)
                        .ok_or_else(|| {
                            KopisError::index(format!(
                                "stored field {} missing from merged field table",
                                field.name
                            ))
                        })?;
                    let (binary, bytes) = match field.value {
                        StoredFieldValue::Raw { binary, bytes } => (binary, bytes),
                        other => {
                            let value = other.load()?;
                            match value {
                                crate::index::document::StoredValue::Text(s) => {
                                    (false, s.into_bytes())
                                }
                                crate::index::document::StoredValue::Binary(b) => (true, b),
                            }
                        }
                    };
                    entries.push(StoredFieldEntry {
                        field_number: number,
                        binary,
                        bytes,
                    });
                }
                entries.sort_by_key(|e| e.field_number);
                writer.add_document(&entries)?;

                self.work += 1;
                self.check_abort()?;
            }
        }

        debug_assert_eq!(writer.doc_count(), self.merged_doc_count);
        writer.close()
    }

    /// Poll the abort flag every [`ABORT_CHECK_INTERVAL`] units of work.
    /// Callers bump `self.work` themselves so the copy loops can keep
    /// field borrows alive across the check.
    fn check_abort(&self) -> Result<()> {
        if self.work % ABORT_CHECK_INTERVAL != 0 {
            return Ok(());
        }
        if let Some(flag) = &self.abort
            && flag.load(Ordering::SeqCst)
        {
            return Err(KopisError::MergeAborted);
        }
        Ok(())
    }

    /// K-way merge of the source term enumerations; for each distinct term
    /// the sources' live postings concatenate in source order.
    fn merge_terms(&mut self) -> Result<()> {
        let mut dict = TermDictWriter::new(self.storage.as_ref(), &self.segment, self.tuning)?;
        let mut postings_writer = PostingsWriter::new(
            self.storage.as_ref(),
            &self.segment,
            self.tuning.skip_interval,
            self.tuning.max_skip_levels,
        )?;

        let mut enums: Vec<Box<dyn TermEnum>> = Vec::with_capacity(self.readers.len());
        let mut alive = Vec::with_capacity(self.readers.len());
        for reader in &self.readers {
            let mut e = reader.terms()?;
            alive.push(e.next()?);
            enums.push(e);
        }

        loop {
            let mut smallest: Option<Term> = None;
            for (i, e) in enums.iter().enumerate() {
                if !alive[i] {
                    continue;
                }
                let term = e.term().expect("live enumeration has a term");
                if smallest.as_ref().is_none_or(|s| term < s) {
                    smallest = Some(term.clone());
                }
            }
            let Some(term) = smallest else { break };

            let number = self
                .field_infos
                .by_name(&term.field)
                .map(|f| f.number)
                .ok_or_else(|| {
                    KopisError::index(format!(
                        "term field {} missing from merged field table",
                        term.field
                    ))
                })?;
            let merged_has_prox = self
                .field_infos
                .by_number(number)
                .is_some_and(|f| !f.omit_positions);

            postings_writer.start_term();
            for (i, e) in enums.iter_mut().enumerate() {
                if !alive[i] || e.term() != Some(&term) {
                    continue;
                }

                let source_has_prox = self.readers[i]
                    .field_infos()
                    .by_name(&term.field)
                    .is_some_and(|f| !f.omit_positions);
                let cursor = self.readers[i].postings_with_deletions(
                    &term,
                    self.snapshots[i].clone(),
                    merged_has_prox && source_has_prox,
                )?;

                if let Some(mut cursor) = cursor {
                    while cursor.next()? {
                        let new_doc = self.doc_maps[i][cursor.doc() as usize]
                            .expect("postings snapshot only yields live docs");
                        let freq = cursor.freq();
                        let positions = if merged_has_prox {
                            if source_has_prox {
                                let mut positions = Vec::with_capacity(freq as usize);
                                for _ in 0..freq {
                                    positions.push(cursor.next_position()?);
                                }
                                positions
                            } else {
                                // The source omitted positions; pad so the
                                // merged prox stream stays aligned.
                                vec![0; freq as usize]
                            }
                        } else {
                            Vec::new()
                        };
                        postings_writer.add_doc(new_doc, freq, &positions)?;

                        self.work += 1;
                        self.check_abort()?;
                    }
                }

                alive[i] = e.next()?;
            }

            let term_info = postings_writer.end_term()?;
            // Every posting lived in deleted documents: drop the term.
            if term_info.doc_freq > 0 {
                dict.add(&term, number, &term_info)?;
            }
        }

        postings_writer.close()?;
        dict.close()
    }

    /// Concatenate per-field norm bytes across sources, live docs only.
    fn merge_norms(&mut self) -> Result<()> {
        if !self.field_infos.has_norms() {
            return Ok(());
        }

        let mut merged = Norms::new();
        let field_numbers: Vec<(u32, String)> = self
            .field_infos
            .iter()
            .filter(|f| f.has_norms())
            .map(|f| (f.number, f.name.clone()))
            .collect();

        for (number, name) in field_numbers {
            let mut bytes = Vec::with_capacity(self.merged_doc_count as usize);
            for (r, reader) in self.readers.iter().enumerate() {
                let column = reader.norms(&name)?;
                for doc in 0..reader.max_doc() {
                    if self.doc_maps[r][doc as usize].is_none() {
                        continue;
                    }
                    bytes.push(
                        column
                            .as_ref()
                            .map(|c| c[doc as usize])
                            .unwrap_or_else(|| norms::encode_norm(1.0)),
                    );
                }
                self.work += 1;
                self.check_abort()?;
            }
            debug_assert_eq!(bytes.len(), self.merged_doc_count as usize);
            merged.push(number, bytes);
        }

        merged.write(
            self.storage.as_ref(),
            &filenames::segment_gen_file_name(&self.segment, filenames::NORMS_EXT, 0),
            self.merged_doc_count,
        )
    }

    /// Copy term vectors for live documents, renumbering fields.
    fn merge_vectors(&mut self) -> Result<()> {
        let mut writer = TermVectorsWriter::new(self.storage.as_ref(), &self.segment)?;

        for (r, reader) in self.readers.iter().enumerate() {
            for doc in 0..reader.max_doc() {
                if self.doc_maps[r][doc as usize].is_none() {
                    continue;
                }
                let vectors = reader.term_vectors(doc)?.unwrap_or_default();
                let mut fields = Vec::with_capacity(vectors.len());
                for vector in vectors {
                    let info = self
                        .field_infos
                        .by_name(&vector.field)
                        .ok_or_else(|| {
                            KopisError::index(format!(
                                "vector field {} missing from merged field table",
                                vector.field
                            ))
                        })?;
                    fields.push(TermVectorFieldData {
                        field_number: info.number,
                        store_positions: info.store_positions_with_vector,
                        store_offsets: info.store_offsets_with_vector,
                        entries: vector.entries,
                    });
                }
                fields.sort_by_key(|f| f.field_number);
                writer.add_document(&fields)?;

                self.work += 1;
                self.check_abort()?;
            }
        }
        writer.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::buffer::DocumentsBuffer;
    use crate::index::document::{Document, Field};
    use crate::index::reader::{LoadAll, TermDocs, TermPositions};
    use crate::storage::{MemoryStorage, Storage};

    fn tuning() -> TermDictTuning {
        TermDictTuning {
            index_interval: 16,
            skip_interval: 16,
            max_skip_levels: 10,
        }
    }

    fn segment(storage: &Arc<dyn Storage>, name: &str, docs: &[&str]) -> Arc<SegmentReader> {
        let mut buffer = DocumentsBuffer::new();
        for (i, text) in docs.iter().enumerate() {
            buffer
                .add_document(
                    &Document::new()
                        .add(Field::text("body", text))
                        .add(Field::keyword("id", &format!("{name}-{i}"))),
                )
                .unwrap();
        }
        let info = buffer.flush(storage.as_ref(), name, tuning()).unwrap();
        Arc::new(SegmentReader::open(Arc::clone(storage), &info, false).unwrap())
    }

    fn merge_readers(
        storage: &Arc<dyn Storage>,
        target: &str,
        readers: Vec<Arc<SegmentReader>>,
    ) -> SegmentInfo {
        let mut merger = SegmentMerger::new(Arc::clone(storage), target, readers, tuning());
        merger.merge().unwrap()
    }

    #[test]
    fn test_merge_concatenates_live_docs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let first = segment(&storage, "_0", &["alpha beta", "beta"]);
        let second = segment(&storage, "_1", &["gamma"]);

        let info = merge_readers(&storage, "_2", vec![first, second]);
        assert_eq!(info.doc_count, 3);

        let merged = SegmentReader::open(Arc::clone(&storage), &info, false).unwrap();
        assert_eq!(merged.num_docs(), 3);
        assert_eq!(merged.doc_freq(&Term::new("body", "beta")).unwrap(), 2);

        // Source order preserved: _0 docs first.
        let doc = merged.document(2, &LoadAll).unwrap();
        assert_eq!(doc.text("id").unwrap().as_deref(), Some("_1-0"));

        let mut positions = merged
            .term_positions(&Term::new("body", "beta"))
            .unwrap();
        assert!(positions.next().unwrap());
        assert_eq!(positions.doc(), 0);
        assert_eq!(positions.next_position().unwrap(), 1);
    }

    #[test]
    fn test_deleted_docs_dropped_and_renumbered() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let first = segment(&storage, "_0", &["alpha", "beta"]);
        let second = segment(&storage, "_1", &["gamma", "delta"]);

        // Delete "alpha" (doc 0 of _0) and "delta" (doc 1 of _1).
        first.delete_document(0).unwrap();
        second.delete_document(1).unwrap();

        let info = merge_readers(&storage, "_2", vec![first, second]);
        assert_eq!(info.doc_count, 2, "only live docs are merged");

        let merged = SegmentReader::open(Arc::clone(&storage), &info, false).unwrap();
        assert!(!merged.has_deletions());

        // Terms with zero live postings vanished from the dictionary.
        assert_eq!(merged.doc_freq(&Term::new("body", "alpha")).unwrap(), 0);
        assert_eq!(merged.doc_freq(&Term::new("body", "delta")).unwrap(), 0);

        // Survivors were densely renumbered.
        let mut docs = merged.term_docs(&Term::new("body", "gamma")).unwrap();
        assert!(docs.next().unwrap());
        assert_eq!(docs.doc(), 1);

        let doc = merged.document(0, &LoadAll).unwrap();
        assert_eq!(doc.text("body").unwrap().as_deref(), Some("beta"));
    }

    #[test]
    fn test_norms_follow_live_docs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let first = segment(&storage, "_0", &["alpha alpha alpha alpha", "beta"]);
        first.delete_document(1).unwrap();
        let second = segment(&storage, "_1", &["gamma"]);

        let source_norms = first.norms("body").unwrap().unwrap();
        let info = merge_readers(&storage, "_2", vec![first, second]);
        let merged = SegmentReader::open(Arc::clone(&storage), &info, false).unwrap();

        let column = merged.norms("body").unwrap().unwrap();
        assert_eq!(column.len(), 2);
        assert_eq!(column[0], source_norms[0], "norm byte carried over");
    }

    #[test]
    fn test_vectors_copied_for_live_docs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut buffer = DocumentsBuffer::new();
        for text in ["alpha beta", "gamma"] {
            buffer
                .add_document(&Document::new().add(
                    Field::text("body", text).with_term_vector(true, false),
                ))
                .unwrap();
        }
        let info = buffer.flush(storage.as_ref(), "_0", tuning()).unwrap();
        let reader =
            Arc::new(SegmentReader::open(Arc::clone(&storage), &info, false).unwrap());
        reader.delete_document(0).unwrap();

        let merged_info = merge_readers(&storage, "_1", vec![reader]);
        assert!(merged_info.has_vectors);

        let merged = SegmentReader::open(Arc::clone(&storage), &merged_info, false).unwrap();
        let vectors = merged.term_vectors(0).unwrap().unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].entries[0].text, "gamma");
    }

    #[test]
    fn test_abort_unwinds() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let docs: Vec<String> = (0..300).map(|i| format!("token{i}")).collect();
        let doc_refs: Vec<&str> = docs.iter().map(String::as_str).collect();
        let reader = segment(&storage, "_0", &doc_refs);

        let flag = Arc::new(AtomicBool::new(true));
        let mut merger =
            SegmentMerger::new(Arc::clone(&storage), "_1", vec![reader], tuning())
                .with_abort_flag(flag);
        let err = merger.merge().unwrap_err();
        assert!(err.is_merge_abort());
    }

    #[test]
    fn test_compound_packaging() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let reader = segment(&storage, "_0", &["alpha"]);

        let mut merger =
            SegmentMerger::new(Arc::clone(&storage), "_1", vec![reader], tuning());
        let mut info = merger.merge().unwrap();
        let standalone = merger.create_compound_file(&mut info).unwrap();

        assert!(info.use_compound);
        assert!(storage.file_exists("_1.cfs"));
        assert!(standalone.contains(&"_1.tis".to_string()));

        // Standalone files removed, the segment still reads fine.
        for name in &standalone {
            storage.delete_file(name).unwrap();
        }
        let merged = SegmentReader::open(Arc::clone(&storage), &info, false).unwrap();
        assert_eq!(merged.num_docs(), 1);
        assert_eq!(merged.doc_freq(&Term::new("body", "alpha")).unwrap(), 1);
    }
}
