//! The reader over a committed index: open, reopen, and staleness-checked
//! mutations.
//!
//! A [`DirectoryReader`] binds to one commit point and composes a
//! [`SegmentReader`] per segment behind the usual prefix-sum document
//! dispatch. `reopen` builds a new reader against the latest commit while
//! reusing every unchanged sub-reader by reference instead of reloading it,
//! so the cost is proportional to what actually changed. Mutations
//! (delete, undelete, set-norm) require the index-wide write lock and fail
//! with a staleness error if the index advanced past this reader's commit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::error::{KopisError, Result};
use crate::index::DocId;
use crate::index::composite::reader_index;
use crate::index::deleter::IndexFileDeleter;
use crate::index::deletion_policy::KeepOnlyLastCommitPolicy;
use crate::index::filenames;
use crate::index::multi_reader::MultiReader;
use crate::index::reader::{
    FieldSelector, IndexReader, ReaderOptions, TermDocs, TermEnum, TermPositions,
};
use crate::index::segment_info::{SegmentInfo, SegmentInfos};
use crate::index::segment_reader::SegmentReader;
use crate::index::stored_fields::StoredDocument;
use crate::index::term::Term;
use crate::index::term_vectors::TermVector;
use crate::storage::traits::{Storage, StorageLock};

/// A point-in-time reader over the latest committed snapshot of an index.
pub struct DirectoryReader {
    storage: Arc<dyn Storage>,
    options: ReaderOptions,
    infos: RwLock<SegmentInfos>,
    subs: Vec<Arc<SegmentReader>>,
    multi: MultiReader,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    closed: AtomicBool,
}

impl DirectoryReader {
    /// Open a reader over the latest commit, with default options.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Arc<Self>> {
        Self::open_with(storage, ReaderOptions::default())
    }

    /// Open a reader over the latest commit.
    pub fn open_with(storage: Arc<dyn Storage>, options: ReaderOptions) -> Result<Arc<Self>> {
        let infos = SegmentInfos::read_latest(storage.as_ref())?;
        let mut subs = Vec::with_capacity(infos.len());
        for info in infos.iter() {
            subs.push(Arc::new(SegmentReader::open(
                Arc::clone(&storage),
                info,
                options.synthesize_missing_norms,
            )?));
        }
        Ok(Arc::new(Self::assemble(storage, options, infos, subs)))
    }

    fn assemble(
        storage: Arc<dyn Storage>,
        options: ReaderOptions,
        infos: SegmentInfos,
        subs: Vec<Arc<SegmentReader>>,
    ) -> Self {
        let multi = MultiReader::new(
            subs.iter()
                .map(|s| Arc::clone(s) as Arc<dyn IndexReader>)
                .collect(),
        );
        DirectoryReader {
            storage,
            options,
            infos: RwLock::new(infos),
            subs,
            multi,
            write_lock: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The commit generation this reader observes.
    pub fn generation(&self) -> u64 {
        self.infos.read().generation
    }

    /// The snapshot version this reader observes.
    pub fn version(&self) -> u64 {
        self.infos.read().version
    }

    /// The per-segment sub-readers, in document order.
    pub fn sub_readers(&self) -> &[Arc<SegmentReader>] {
        &self.subs
    }

    /// True when the index is fully merged: one segment, no deletions.
    pub fn is_optimized(&self) -> bool {
        self.subs.len() == 1 && !self.has_deletions()
    }

    /// True if no commit happened since this reader was opened.
    pub fn is_current(&self) -> Result<bool> {
        let latest = SegmentInfos::latest_generation(self.storage.as_ref())?;
        Ok(latest == Some(self.infos.read().generation))
    }

    /// A reader over the latest commit.
    ///
    /// Returns this very reader when nothing changed. Otherwise a new
    /// reader is assembled, reusing (by reference) every sub-reader whose
    /// segment is unchanged; only new or changed segments are freshly
    /// opened.
    pub fn reopen(self: &Arc<Self>) -> Result<Arc<Self>> {
        if self.is_current()? {
            return Ok(Arc::clone(self));
        }

        let infos = SegmentInfos::read_latest(self.storage.as_ref())?;
        let mut subs = Vec::with_capacity(infos.len());
        let mut reused = 0usize;
        for info in infos.iter() {
            match self.reusable_sub(info) {
                Some(sub) => {
                    sub.inc_ref();
                    subs.push(sub);
                    reused += 1;
                }
                None => subs.push(Arc::new(SegmentReader::open(
                    Arc::clone(&self.storage),
                    info,
                    self.options.synthesize_missing_norms,
                )?)),
            }
        }
        debug!(
            "reopened at generation {}: {} segments, {reused} shared",
            infos.generation,
            infos.len()
        );
        Ok(Arc::new(Self::assemble(
            Arc::clone(&self.storage),
            self.options.clone(),
            infos,
            subs,
        )))
    }

    fn reusable_sub(&self, info: &SegmentInfo) -> Option<Arc<SegmentReader>> {
        self.subs
            .iter()
            .find(|sub| {
                let current = sub.segment_info();
                current.name == info.name
                    && current.doc_count == info.doc_count
                    && current.del_gen == info.del_gen
                    && current.norm_gen == info.norm_gen
                    && current.use_compound == info.use_compound
                    && !sub.has_pending_changes()
            })
            .cloned()
    }

    /// Mark one document deleted.
    ///
    /// Requires the write lock; fails with a staleness error if the index
    /// advanced past this reader's commit.
    pub fn delete_document(&self, doc: DocId) -> Result<()> {
        self.ensure_write_lock()?;
        let (index, local) = self.locate(doc)?;
        self.subs[index].delete_document(local)
    }

    /// Delete every document containing the term. Returns the number of
    /// documents newly deleted.
    pub fn delete_documents(&self, term: &Term) -> Result<u32> {
        self.ensure_write_lock()?;
        let mut deleted = 0;
        for sub in &self.subs {
            let mut docs = sub.term_docs(term)?;
            while docs.next()? {
                sub.delete_document(docs.doc())?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Drop every deletion mark in every segment.
    pub fn undelete_all(&self) -> Result<()> {
        self.ensure_write_lock()?;
        for sub in &self.subs {
            sub.undelete_all();
        }
        Ok(())
    }

    /// Overwrite one norm byte.
    pub fn set_norm(&self, doc: DocId, field: &str, value: u8) -> Result<()> {
        self.ensure_write_lock()?;
        let (index, local) = self.locate(doc)?;
        self.subs[index].set_norm(local, field, value)
    }

    /// Write pending deletion/norm changes as a new commit.
    ///
    /// A no-op when nothing is pending. The superseded files and the prior
    /// commit point are retired through the reference-counting deleter.
    pub fn commit(&self) -> Result<()> {
        if !self.subs.iter().any(|s| s.has_pending_changes()) {
            return Ok(());
        }

        let mut infos = self.infos.write();
        for sub in &self.subs {
            if let Some(updated) = sub.commit_pending()? {
                if let Some(entry) = infos.by_name_mut(&updated.name) {
                    *entry = updated;
                }
            }
        }

        let generation = infos.next_generation();
        infos.version += 1;
        infos.write_pending(self.storage.as_ref(), generation)?;
        SegmentInfos::publish_pending(self.storage.as_ref(), generation)?;
        infos.generation = generation;
        debug!("reader committed generation {generation}");

        // Retire the previous commit and any files it alone referenced.
        IndexFileDeleter::new(
            Arc::clone(&self.storage),
            Box::new(KeepOnlyLastCommitPolicy),
            &infos,
        )?;

        drop(infos);
        self.release_write_lock();
        Ok(())
    }

    /// Commit pending changes and release all resources. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.commit();
        for sub in &self.subs {
            sub.dec_ref();
        }
        self.release_write_lock();
        result
    }

    fn locate(&self, doc: DocId) -> Result<(usize, DocId)> {
        if doc >= self.multi.max_doc() {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.multi.max_doc()
            )));
        }
        let starts = self.multi.starts();
        let index = reader_index(starts, doc);
        Ok((index, doc - starts[index]))
    }

    /// Acquire the index-wide write lock once, verifying this reader still
    /// observes the latest commit.
    fn ensure_write_lock(&self) -> Result<()> {
        let mut guard = self.write_lock.lock();
        if guard.is_some() {
            return Ok(());
        }

        let mut lock = self.storage.lock_manager().acquire_lock(
            filenames::WRITE_LOCK_NAME,
            Duration::from_millis(self.options.lock_timeout_ms),
        )?;

        let latest = SegmentInfos::latest_generation(self.storage.as_ref())?;
        let observed = self.infos.read().generation;
        if latest != Some(observed) {
            let _ = lock.release();
            return Err(KopisError::stale(format!(
                "index advanced to generation {latest:?}, reader observes {observed}"
            )));
        }

        *guard = Some(lock);
        Ok(())
    }

    fn release_write_lock(&self) {
        if let Some(mut lock) = self.write_lock.lock().take()
            && let Err(e) = lock.release()
        {
            debug!("failed to release write lock: {e}");
        }
    }
}

impl IndexReader for DirectoryReader {
    fn max_doc(&self) -> u32 {
        self.multi.max_doc()
    }

    fn num_docs(&self) -> u32 {
        self.multi.num_docs()
    }

    fn has_deletions(&self) -> bool {
        self.multi.has_deletions()
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        self.multi.is_deleted(doc)
    }

    fn document(&self, doc: DocId, selector: &dyn FieldSelector) -> Result<StoredDocument> {
        self.multi.document(doc, selector)
    }

    fn terms(&self) -> Result<Box<dyn TermEnum>> {
        self.multi.terms()
    }

    fn terms_from(&self, from: &Term) -> Result<Box<dyn TermEnum>> {
        self.multi.terms_from(from)
    }

    fn doc_freq(&self, term: &Term) -> Result<u32> {
        self.multi.doc_freq(term)
    }

    fn term_docs(&self, term: &Term) -> Result<Box<dyn TermDocs>> {
        self.multi.term_docs(term)
    }

    fn term_positions(&self, term: &Term) -> Result<Box<dyn TermPositions>> {
        self.multi.term_positions(term)
    }

    fn norms(&self, field: &str) -> Result<Option<Vec<u8>>> {
        self.multi.norms(field)
    }

    fn term_vectors(&self, doc: DocId) -> Result<Option<Vec<TermVector>>> {
        self.multi.term_vectors(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::buffer::DocumentsBuffer;
    use crate::index::document::{Document, Field};
    use crate::index::terms::TermDictTuning;
    use crate::storage::{MemoryStorage, Storage};

    fn tuning() -> TermDictTuning {
        TermDictTuning {
            index_interval: 16,
            skip_interval: 16,
            max_skip_levels: 10,
        }
    }

    fn flush_segment(storage: &Arc<dyn Storage>, name: &str, tokens: &[&str]) -> SegmentInfo {
        let mut buffer = DocumentsBuffer::new();
        for token in tokens {
            buffer
                .add_document(&Document::new().add(Field::text("body", token)))
                .unwrap();
        }
        buffer.flush(storage.as_ref(), name, tuning()).unwrap()
    }

    fn commit(storage: &Arc<dyn Storage>, infos: &mut SegmentInfos) {
        let generation = infos.next_generation();
        infos.version += 1;
        infos.write_pending(storage.as_ref(), generation).unwrap();
        SegmentInfos::publish_pending(storage.as_ref(), generation).unwrap();
        infos.generation = generation;
    }

    fn committed_index(storage: &Arc<dyn Storage>) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        infos.push(flush_segment(storage, "_0", &["alpha", "beta"]));
        infos.push(flush_segment(storage, "_1", &["gamma"]));
        infos.counter = 2;
        commit(storage, &mut infos);
        infos
    }

    #[test]
    fn test_open_and_read() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        committed_index(&storage);

        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert_eq!(reader.generation(), 1);
        assert_eq!(reader.version(), 1);
        assert_eq!(reader.max_doc(), 3);
        assert_eq!(reader.num_docs(), 3);
        assert!(reader.is_current().unwrap());
        assert!(!reader.is_optimized());
        assert_eq!(reader.doc_freq(&Term::new("body", "gamma")).unwrap(), 1);
        reader.close().unwrap();
    }

    #[test]
    fn test_mutate_and_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        committed_index(&storage);

        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert_eq!(reader.delete_documents(&Term::new("body", "alpha")).unwrap(), 1);
        assert_eq!(reader.num_docs(), 2);

        // A delete is droppable until committed.
        reader.undelete_all().unwrap();
        assert_eq!(reader.num_docs(), 3);
        assert_eq!(reader.delete_documents(&Term::new("body", "alpha")).unwrap(), 1);
        reader.close().unwrap();

        // The commit on close produced a new generation with the deletes.
        let reopened = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert_eq!(reopened.generation(), 2);
        assert_eq!(reopened.num_docs(), 2);
        assert!(reopened.has_deletions());
        assert!(storage.file_exists("_0_1.del"));
        assert!(!storage.file_exists("segments_1"), "old commit retired");
        reopened.close().unwrap();
    }

    #[test]
    fn test_stale_reader_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut infos = committed_index(&storage);

        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();

        // The index advances underneath the open reader.
        commit(&storage, &mut infos);

        let err = reader.delete_document(0).unwrap_err();
        assert!(matches!(err, KopisError::StaleReader(_)));
        assert!(
            !storage.lock_manager().lock_exists(filenames::WRITE_LOCK_NAME),
            "failed acquisition releases the lock"
        );
    }

    #[test]
    fn test_reopen_shares_unchanged_subs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut infos = committed_index(&storage);

        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();

        // Unchanged index: reopen returns the same instance.
        let same = reader.reopen().unwrap();
        assert!(Arc::ptr_eq(&reader, &same));

        // Add a third segment and commit; _0 and _1 are untouched.
        infos.push(flush_segment(&storage, "_2", &["delta"]));
        infos.counter = 3;
        commit(&storage, &mut infos);

        let reopened = reader.reopen().unwrap();
        assert!(!Arc::ptr_eq(&reader, &reopened));
        assert_eq!(reopened.max_doc(), 4);
        assert!(reopened.sub_readers()[0].shares_core_with(&reader.sub_readers()[0]));
        assert!(reopened.sub_readers()[1].shares_core_with(&reader.sub_readers()[1]));
        assert_eq!(reader.sub_readers()[0].ref_count(), 2);

        // The old reader keeps its point-in-time view.
        assert_eq!(reader.max_doc(), 3);
        reopened.close().unwrap();
        reader.close().unwrap();
    }
}
