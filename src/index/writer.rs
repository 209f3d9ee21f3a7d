//! The index writer: the single mutator of an index.
//!
//! One writer instance owns exclusive write access, enforced by the named
//! `write.lock`. Documents and delete terms buffer in memory and flush as
//! immutable segments; the merge policy proposes merges over the segment
//! list, a scheduler runs them in the background, and every structural
//! change funnels through the reference-counting deleter so the on-disk
//! index is always either the pre-operation or the post-operation state.
//!
//! Committing is two-phase: `prepare_commit` flushes, syncs every file the
//! snapshot depends on and writes (without publishing) the next
//! `segments_N` generation; `commit` publishes it with an atomic rename.
//! The phase lives in an explicit [`PendingCommit`] value, never in
//! half-meaningful fields.
//!
//! Concurrency: arbitrary threads may call the mutating API. Structural
//! state sits behind one instance lock; the pooled per-segment readers
//! (shared by the delete-application, merge and near-real-time read paths)
//! have their own lock so a slow reader open never stalls indexing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{KopisError, Result};
use crate::index::bit_vector::BitVector;
use crate::index::buffer::DocumentsBuffer;
use crate::index::config::IndexWriterConfig;
use crate::index::deleter::IndexFileDeleter;
use crate::index::deletion_policy::{DeletionPolicy, KeepOnlyLastCommitPolicy};
use crate::index::document::Document;
use crate::index::filenames;
use crate::index::merge_policy::{
    LogDocMergePolicy, MergePolicy, MergeSpecification, MergeState, OneMerge,
};
use crate::index::merge_scheduler::{ConcurrentMergeScheduler, MergeScheduler};
use crate::index::merger::SegmentMerger;
use crate::index::multi_reader::MultiReader;
use crate::index::reader::{IndexReader, TermDocs};
use crate::index::segment_info::{SegmentInfo, SegmentInfos};
use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;
use crate::index::terms::TermDictTuning;
use crate::storage::traits::{Storage, StorageLock};

/// The two-phase commit state.
enum PendingCommit {
    /// No commit in flight.
    Idle,
    /// `prepare_commit` ran: the snapshot is synced and written as a
    /// pending generation, awaiting publication.
    Prepared {
        infos: SegmentInfos,
        generation: u64,
    },
}

/// Pluggable collaborators for [`IndexWriter::open_with`]; `None` fields
/// fall back to the defaults derived from the configuration.
#[derive(Default)]
pub struct WriterComponents {
    /// Merge selection; defaults to [`LogDocMergePolicy`].
    pub merge_policy: Option<Box<dyn MergePolicy>>,
    /// Merge execution; defaults to a [`ConcurrentMergeScheduler`] sized by
    /// the configuration.
    pub merge_scheduler: Option<Arc<dyn MergeScheduler>>,
    /// Commit retention; defaults to [`KeepOnlyLastCommitPolicy`].
    pub deletion_policy: Option<Box<dyn DeletionPolicy>>,
}

struct WriterState {
    /// The live segment list; mutated by flush, merges and commits.
    infos: SegmentInfos,
    /// The last durably committed snapshot, restored by rollback.
    rollback_infos: SegmentInfos,
    buffer: DocumentsBuffer,
    deleter: IndexFileDeleter,
    pending_commit: PendingCommit,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: Vec<Arc<OneMerge>>,
    /// Sources of every pending or running merge; no two merges may share
    /// a source segment.
    merging_segments: AHashSet<String>,
    /// First failure recorded by a background merge, surfaced to the next
    /// thread that synchronizes on merges.
    merge_error: Option<KopisError>,
}

/// The top-level mutator of one index.
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    merge_policy: Box<dyn MergePolicy>,
    merge_scheduler: Arc<dyn MergeScheduler>,
    state: Mutex<WriterState>,
    /// Signaled whenever a merge leaves the pending/running sets.
    merge_done: Condvar,
    /// Pooled per-segment readers, keyed by segment name.
    pool: Mutex<AHashMap<String, Arc<SegmentReader>>>,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    closed: AtomicBool,
    /// Set on unrecoverable resource exhaustion; afterwards only close and
    /// rollback are permitted.
    poisoned: AtomicBool,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("closed", &self.closed)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl IndexWriter {
    /// Open a writer with default collaborators, creating the index (an
    /// empty first commit) if the storage holds none.
    pub fn open(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Arc<Self>> {
        Self::open_with(storage, config, WriterComponents::default())
    }

    /// Open a writer with explicit collaborators.
    pub fn open_with(
        storage: Arc<dyn Storage>,
        config: IndexWriterConfig,
        components: WriterComponents,
    ) -> Result<Arc<Self>> {
        let mut lock = storage.lock_manager().acquire_lock(
            filenames::WRITE_LOCK_NAME,
            Duration::from_millis(config.lock_timeout_ms),
        )?;

        match Self::init(Arc::clone(&storage), &config, components) {
            Ok((state, merge_policy, merge_scheduler)) => {
                let writer = IndexWriter {
                    storage,
                    config,
                    merge_policy,
                    merge_scheduler,
                    state: Mutex::new(state),
                    merge_done: Condvar::new(),
                    pool: Mutex::new(AHashMap::new()),
                    write_lock: Mutex::new(Some(lock)),
                    closed: AtomicBool::new(false),
                    poisoned: AtomicBool::new(false),
                };
                Ok(Arc::new(writer))
            }
            Err(e) => {
                let _ = lock.release();
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn init(
        storage: Arc<dyn Storage>,
        config: &IndexWriterConfig,
        components: WriterComponents,
    ) -> Result<(WriterState, Box<dyn MergePolicy>, Arc<dyn MergeScheduler>)> {
        let infos = match SegmentInfos::latest_generation(storage.as_ref())? {
            Some(_) => SegmentInfos::read_latest(storage.as_ref())?,
            None => {
                // Virgin directory: publish an empty first generation so
                // readers have a commit point from the start.
                let mut infos = SegmentInfos::new();
                infos.version = 1;
                let generation = infos.next_generation();
                infos.write_pending(storage.as_ref(), generation)?;
                SegmentInfos::publish_pending(storage.as_ref(), generation)?;
                infos.generation = generation;
                info!("created new index at generation {generation}");
                infos
            }
        };

        let deletion_policy = components
            .deletion_policy
            .unwrap_or_else(|| Box::new(KeepOnlyLastCommitPolicy));
        let deleter = IndexFileDeleter::new(Arc::clone(&storage), deletion_policy, &infos)?;

        let merge_policy = components
            .merge_policy
            .unwrap_or_else(|| Box::new(LogDocMergePolicy::default()));
        let merge_scheduler = components.merge_scheduler.unwrap_or_else(|| {
            Arc::new(ConcurrentMergeScheduler::new(config.max_merge_threads))
        });

        let state = WriterState {
            rollback_infos: infos.clone(),
            infos,
            buffer: DocumentsBuffer::new(),
            deleter,
            pending_commit: PendingCommit::Idle,
            pending_merges: VecDeque::new(),
            running_merges: Vec::new(),
            merging_segments: AHashSet::new(),
            merge_error: None,
        };
        Ok((state, merge_policy, merge_scheduler))
    }

    /// The writer's configuration.
    pub fn config(&self) -> &IndexWriterConfig {
        &self.config
    }

    /// The backing storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Buffer one document for addition.
    pub fn add_document(self: &Arc<Self>, doc: &Document) -> Result<()> {
        self.check_mutable()?;
        {
            let mut state = self.state.lock();
            state
                .buffer
                .add_document(doc)
                .inspect_err(|e| self.note_error(e))?;
        }
        self.flush_if_needed()
    }

    /// Atomically replace every document containing `term` with `doc`.
    ///
    /// Readers only ever observe the delete and the add together, never a
    /// dangling delete with the add still pending.
    pub fn update_document(self: &Arc<Self>, term: &Term, doc: &Document) -> Result<()> {
        self.check_mutable()?;
        {
            let mut state = self.state.lock();
            state.buffer.delete_term(term);
            state
                .buffer
                .add_document(doc)
                .inspect_err(|e| self.note_error(e))?;
        }
        self.flush_if_needed()
    }

    /// Buffer a delete of every document containing `term`.
    pub fn delete_documents(self: &Arc<Self>, term: &Term) -> Result<()> {
        self.check_mutable()?;
        {
            let mut state = self.state.lock();
            state.buffer.delete_term(term);
        }
        self.flush_if_needed()
    }

    /// Total documents, deleted ones included, buffered ones counted.
    pub fn max_doc(&self) -> u32 {
        let state = self.state.lock();
        state.infos.total_doc_count() + state.buffer.doc_count()
    }

    /// Live documents across flushed segments plus the buffer. Buffered
    /// delete terms are not counted until they are applied at flush.
    pub fn num_docs(&self) -> Result<u32> {
        let state = self.state.lock();
        let mut total = state.buffer.doc_count();
        for info in state.infos.iter() {
            total += self.reader_for(info)?.num_docs();
        }
        Ok(total)
    }

    /// Number of flushed segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().infos.len()
    }

    /// Flush buffered documents and deletes to a new segment, then give
    /// the merge policy a chance to react.
    pub fn flush(self: &Arc<Self>) -> Result<()> {
        self.check_mutable()?;
        {
            let mut state = self.state.lock();
            self.flush_locked(&mut state)?;
        }
        self.maybe_merge()
    }

    /// Consult the merge policy and hand any accepted merges to the
    /// scheduler.
    pub fn maybe_merge(self: &Arc<Self>) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.state.lock();
            let spec = self.merge_policy.find_merges(&state.infos);
            self.register_merges_locked(&mut state, spec, None);
        }
        self.merge_scheduler.merge(self)
    }

    /// First phase of a two-phase commit: flush, sync every file the new
    /// snapshot depends on, and write (without publishing) the next
    /// generation.
    pub fn prepare_commit(self: &Arc<Self>) -> Result<()> {
        self.prepare_commit_internal(true)
    }

    fn prepare_commit_internal(self: &Arc<Self>, trigger_merges: bool) -> Result<()> {
        self.check_mutable()?;
        if trigger_merges {
            self.flush()?;
        } else {
            // The closing path: merges are already settled and the
            // scheduler is shut down, so flush without consulting it.
            let mut state = self.state.lock();
            self.flush_locked(&mut state)?;
        }

        let mut state = self.state.lock();
        if !matches!(state.pending_commit, PendingCommit::Idle) {
            return Err(KopisError::invalid_operation(
                "a prepared commit is already pending",
            ));
        }

        let mut snapshot = state.infos.clone();
        snapshot.version += 1;
        let generation = snapshot.next_generation();

        // Guard the snapshot's files for the duration of the window.
        state.deleter.inc_ref_infos(&snapshot);

        let result = (|| -> Result<()> {
            // A generation must never be published before everything it
            // names is durable.
            for file in snapshot.files() {
                self.storage.sync_file(&file)?;
            }
            snapshot.write_pending(self.storage.as_ref(), generation)?;
            Ok(())
        })();

        if let Err(e) = result {
            state.deleter.dec_ref_infos(&snapshot);
            state
                .deleter
                .delete_new_files(&[filenames::pending_segments_file_name(generation)]);
            self.note_error(&e);
            return Err(e);
        }

        debug!("prepared commit generation {generation}");
        state.pending_commit = PendingCommit::Prepared {
            infos: snapshot,
            generation,
        };
        Ok(())
    }

    /// Publish the prepared snapshot (running `prepare_commit` first if
    /// none is pending) and checkpoint the deleter.
    pub fn commit(self: &Arc<Self>) -> Result<()> {
        self.commit_internal(true)
    }

    fn commit_internal(self: &Arc<Self>, trigger_merges: bool) -> Result<()> {
        self.check_mutable()?;
        if matches!(self.state.lock().pending_commit, PendingCommit::Idle) {
            self.prepare_commit_internal(trigger_merges)?;
        }

        let mut state = self.state.lock();
        let (mut snapshot, generation) = match &state.pending_commit {
            PendingCommit::Idle => return Ok(()),
            PendingCommit::Prepared { infos, generation } => (infos.clone(), *generation),
        };

        // The prepared state (and its file guard) survives a failed publish
        // so a retry or rollback can still account for it.
        SegmentInfos::publish_pending(self.storage.as_ref(), generation)?;
        state.pending_commit = PendingCommit::Idle;
        snapshot.generation = generation;
        state.infos.generation = generation;
        state.infos.version = snapshot.version;

        state.deleter.checkpoint(&snapshot, true)?;
        // Re-point the transient checkpoint at the live state; merges may
        // have advanced it past the committed snapshot.
        let live = state.infos.clone();
        state.deleter.checkpoint(&live, false)?;
        // Release the prepare-window guard.
        state.deleter.dec_ref_infos(&snapshot);

        state.rollback_infos = snapshot;
        info!("committed generation {generation}");
        Ok(())
    }

    /// Discard every change since the last commit and close the writer.
    pub fn rollback(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.abort_all_merges();
        self.merge_scheduler.close();

        let mut state = self.state.lock();
        state.buffer.reset();

        if let PendingCommit::Prepared { infos, generation } =
            std::mem::replace(&mut state.pending_commit, PendingCommit::Idle)
        {
            state
                .deleter
                .delete_new_files(&[filenames::pending_segments_file_name(generation)]);
            state.deleter.dec_ref_infos(&infos);
        }

        state.infos = state.rollback_infos.clone();
        let restored = state.infos.clone();
        state.deleter.checkpoint(&restored, false)?;
        state.deleter.refresh(None)?;
        state.deleter.close();
        drop(state);

        self.clear_pool();
        self.release_write_lock();
        info!("rolled back to generation {}", restored.generation);
        Ok(())
    }

    /// Flush, settle merges, commit and release the write lock.
    ///
    /// With `wait_for_merges` the call blocks until running and pending
    /// merges finish organically; without it they are aborted and joined.
    pub fn close(self: &Arc<Self>, wait_for_merges: bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.poisoned.load(Ordering::SeqCst) {
            // Buffers cannot be trusted; discard everything uncommitted.
            return self.rollback();
        }

        self.flush()?;

        if wait_for_merges {
            self.wait_for_merges();
        } else {
            self.abort_all_merges();
        }
        self.merge_scheduler.close();

        self.commit_internal(false)?;

        let mut state = self.state.lock();
        if let Some(e) = state.merge_error.take() {
            warn!("merge failure surfaced at close: {e}");
        }
        state.deleter.close();
        drop(state);

        self.clear_pool();
        self.release_write_lock();
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Merge until at most `max_segments` segments remain (and, for a
    /// ceiling of one, no deletions remain). With `wait` the call blocks
    /// until every optimize-tagged merge finished, surfacing the first
    /// merge failure encountered.
    pub fn optimize(self: &Arc<Self>, max_segments: usize, wait: bool) -> Result<()> {
        self.check_mutable()?;
        {
            let mut state = self.state.lock();
            self.flush_locked(&mut state)?;

            // Running and pending merges join the optimize.
            for merge in state
                .pending_merges
                .iter()
                .chain(state.running_merges.iter())
            {
                merge.set_optimize(max_segments);
            }
            let spec = self
                .merge_policy
                .find_merges_for_optimize(&state.infos, max_segments);
            self.register_merges_locked(&mut state, spec, Some(max_segments));
        }
        self.merge_scheduler.merge(self)?;

        if !wait {
            return Ok(());
        }

        loop {
            let mut state = self.state.lock();
            if let Some(e) = state.merge_error.take() {
                return Err(e);
            }

            let optimizing = state
                .pending_merges
                .iter()
                .chain(state.running_merges.iter())
                .any(|m| m.is_optimize());
            if optimizing {
                self.merge_done.wait(&mut state);
                continue;
            }

            // Cascade until the policy is satisfied with the ceiling.
            let spec = self
                .merge_policy
                .find_merges_for_optimize(&state.infos, max_segments);
            if spec.is_empty() {
                return Ok(());
            }
            self.register_merges_locked(&mut state, spec, Some(max_segments));
            drop(state);
            self.merge_scheduler.merge(self)?;
        }
    }

    /// Merge away segments carrying deletions. With `wait` the call blocks
    /// until the registered merges finished.
    pub fn expunge_deletes(self: &Arc<Self>, wait: bool) -> Result<()> {
        self.check_mutable()?;
        let registered = {
            let mut state = self.state.lock();
            self.flush_locked(&mut state)?;
            let spec = self.merge_policy.find_merges_to_expunge_deletes(&state.infos);
            self.register_merges_locked(&mut state, spec, None)
        };
        self.merge_scheduler.merge(self)?;

        if !wait {
            return Ok(());
        }
        let mut state = self.state.lock();
        loop {
            if let Some(e) = state.merge_error.take() {
                return Err(e);
            }
            let outstanding = registered
                .iter()
                .any(|m| matches!(m.state(), MergeState::Pending | MergeState::Running));
            if !outstanding {
                return Ok(());
            }
            self.merge_done.wait(&mut state);
        }
    }

    /// A near-real-time reader over the current state, buffered documents
    /// included (they are flushed first; nothing is committed).
    ///
    /// The reader is a point-in-time snapshot: later writes, deletes and
    /// merges do not show through it.
    pub fn nrt_reader(self: &Arc<Self>) -> Result<MultiReader> {
        self.check_mutable()?;
        let state = {
            let mut state = self.state.lock();
            self.flush_locked(&mut state)?;
            state
        };

        let mut subs: Vec<Arc<dyn IndexReader>> = Vec::with_capacity(state.infos.len());
        for info in state.infos.iter() {
            let pooled = self.reader_for(info)?;
            subs.push(Arc::new(pooled.clone_reader()));
        }
        Ok(MultiReader::new(subs))
    }

    /// Number of registered merges not yet picked up by a worker.
    pub fn pending_merge_count(&self) -> usize {
        self.state.lock().pending_merges.len()
    }

    // ---- scheduler interface -------------------------------------------

    /// Hand the next pending merge to a scheduler worker, marking it
    /// running. Aborted entries are unregistered and skipped.
    pub fn next_pending_merge(&self) -> Option<Arc<OneMerge>> {
        let mut state = self.state.lock();
        while let Some(merge) = state.pending_merges.pop_front() {
            if merge.is_aborted() || !merge.start() {
                for name in merge.segment_names() {
                    state.merging_segments.remove(&name);
                }
                self.merge_done.notify_all();
                continue;
            }
            state.running_merges.push(Arc::clone(&merge));
            return Some(merge);
        }
        None
    }

    /// Execute one merge on the calling (worker) thread.
    ///
    /// Failures are recorded on the writer rather than propagated, so a
    /// worker thread never unwinds with an error; a thread blocking in
    /// `optimize`/`expunge_deletes`/`close` observes them instead. An abort
    /// is an ordinary outcome, not a failure.
    pub fn do_merge(&self, merge: &Arc<OneMerge>) {
        let result = self.execute_merge(merge);
        match &result {
            Ok(()) => merge.finish(MergeState::Done),
            Err(e) if e.is_merge_abort() => {
                debug!("merge of {:?} aborted", merge.segment_names());
                merge.finish(MergeState::Aborted);
            }
            Err(e) => {
                warn!("merge of {:?} failed: {e}", merge.segment_names());
                merge.record_error(KopisError::index(e.to_string()));
                merge.finish(MergeState::Aborted);
            }
        }

        let mut state = self.state.lock();
        if let Err(e) = result
            && !e.is_merge_abort()
            && state.merge_error.is_none()
        {
            state.merge_error = Some(e);
        }
        for name in merge.segment_names() {
            state.merging_segments.remove(&name);
        }
        state.running_merges.retain(|m| !Arc::ptr_eq(m, merge));
        self.merge_done.notify_all();
    }

    // ---- internals -----------------------------------------------------

    fn tuning(&self) -> TermDictTuning {
        TermDictTuning {
            index_interval: self.config.term_index_interval,
            skip_interval: self.config.skip_interval,
            max_skip_levels: self.config.max_skip_levels,
        }
    }

    fn diagnostics(&self, source: &str) -> std::collections::BTreeMap<String, String> {
        let mut map = std::collections::BTreeMap::new();
        map.insert("source".to_string(), source.to_string());
        map.insert("timestamp".to_string(), Utc::now().to_rfc3339());
        map.insert("version".to_string(), crate::VERSION.to_string());
        map
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KopisError::invalid_operation("writer is closed"));
        }
        Ok(())
    }

    fn check_mutable(&self) -> Result<()> {
        self.check_open()?;
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(KopisError::invalid_operation(
                "writer hit an unrecoverable error; only close or rollback are permitted",
            ));
        }
        Ok(())
    }

    /// Poison the writer on resource exhaustion; its in-memory buffers can
    /// no longer be trusted.
    fn note_error(&self, e: &KopisError) {
        if matches!(e, KopisError::ResourceExhausted(_)) {
            warn!("writer poisoned: {e}");
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }

    fn flush_if_needed(self: &Arc<Self>) -> Result<()> {
        let should = {
            let state = self.state.lock();
            state.buffer.doc_count() >= self.config.max_buffered_docs as u32
                || state.buffer.ram_bytes() >= self.config.ram_buffer_size_bytes()
                || state.buffer.delete_term_count() >= self.config.max_buffered_delete_terms
        };
        if should { self.flush() } else { Ok(()) }
    }

    /// Flush buffered documents into a new segment and apply buffered
    /// deletes, all-or-nothing as observed on disk.
    fn flush_locked(&self, state: &mut MutexGuard<'_, WriterState>) -> Result<bool> {
        if state.buffer.is_empty() {
            return Ok(false);
        }

        // 1. Write the new segment's files.
        let mut new_segment: Option<SegmentInfo> = None;
        if state.buffer.doc_count() > 0 {
            let name = state.infos.next_segment_name();
            match state.buffer.flush(self.storage.as_ref(), &name, self.tuning()) {
                Ok(mut segment) => {
                    segment.diagnostics = self.diagnostics("flush");
                    new_segment = Some(segment);
                }
                Err(e) => {
                    let _ = state.deleter.refresh(Some(&name));
                    self.note_error(&e);
                    return Err(e);
                }
            }

            // 2. Optionally pack into a compound container.
            if let Some(segment) = new_segment.as_mut()
                && self.config.use_compound_file
            {
                match package_compound(Arc::clone(&self.storage), segment) {
                    Ok(standalone) => state.deleter.delete_new_files(&standalone),
                    Err(e) => {
                        let _ = state.deleter.refresh(Some(&segment.name));
                        self.note_error(&e);
                        return Err(e);
                    }
                }
            }
        }

        // 3. Apply buffered delete terms through the pooled readers.
        let delete_terms = state.buffer.delete_terms();
        if !delete_terms.is_empty() {
            let existing: Vec<SegmentInfo> = state.infos.iter().cloned().collect();
            for info in &existing {
                let reader = self.reader_for(info)?;
                for (term, _) in &delete_terms {
                    let mut docs = reader.term_docs(term)?;
                    while docs.next()? {
                        reader.delete_document(docs.doc())?;
                    }
                }
            }
            if let Some(segment) = &new_segment {
                // Only documents buffered before the delete are affected;
                // an update's own document survives its delete.
                let reader = self.reader_for(segment)?;
                for (term, limit) in &delete_terms {
                    if *limit == 0 {
                        continue;
                    }
                    let mut docs = reader.term_docs(term)?;
                    while docs.next()? {
                        if docs.doc() >= *limit {
                            break;
                        }
                        reader.delete_document(docs.doc())?;
                    }
                }
            }

            // Persist the new deletion generations and fold the advanced
            // metadata into the live snapshot.
            let names: Vec<String> = existing
                .iter()
                .map(|i| i.name.clone())
                .chain(new_segment.as_ref().map(|s| s.name.clone()))
                .collect();
            for name in names {
                let pooled = self.pool.lock().get(&name).cloned();
                if let Some(reader) = pooled
                    && let Some(updated) = reader.commit_pending()?
                {
                    if let Some(entry) = state.infos.by_name_mut(&updated.name) {
                        *entry = updated;
                    } else if let Some(segment) = new_segment.as_mut()
                        && segment.name == updated.name
                    {
                        *segment = updated;
                    }
                }
            }
        }

        // 4. Install the new segment and checkpoint the reference counts.
        let flushed_docs = new_segment.as_ref().map(|s| s.doc_count).unwrap_or(0);
        if let Some(segment) = new_segment {
            state.infos.push(segment);
        }
        let live = state.infos.clone();
        state.deleter.checkpoint(&live, false)?;
        state.buffer.reset();

        debug!(
            "flushed {flushed_docs} docs, {} delete terms; {} segments live",
            delete_terms.len(),
            state.infos.len()
        );
        Ok(true)
    }

    /// Register the policy's proposals, deferring any merge that shares a
    /// source segment with a pending or running merge (or whose sources
    /// already left the segment list).
    fn register_merges_locked(
        &self,
        state: &mut WriterState,
        spec: MergeSpecification,
        optimize_max: Option<usize>,
    ) -> Vec<Arc<OneMerge>> {
        let mut registered = Vec::new();
        'candidates: for merge in spec.merges {
            for name in merge.segment_names() {
                if state.merging_segments.contains(&name) {
                    debug!("deferring merge: {name} is already merging");
                    continue 'candidates;
                }
                if state.infos.by_name(&name).is_none() {
                    continue 'candidates;
                }
            }
            if let Some(max) = optimize_max {
                merge.set_optimize(max);
            }
            let merge = Arc::new(merge);
            for name in merge.segment_names() {
                state.merging_segments.insert(name);
            }
            state.pending_merges.push_back(Arc::clone(&merge));
            registered.push(merge);
        }
        registered
    }

    fn execute_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        // Snapshot the sources and allocate the target name.
        let (readers, target) = {
            let mut state = self.state.lock();
            if merge.is_aborted() {
                return Err(KopisError::MergeAborted);
            }
            let target = state.infos.next_segment_name();
            let mut readers = Vec::with_capacity(merge.segments().len());
            for name in merge.segment_names() {
                let info = state.infos.by_name(&name).cloned().ok_or_else(|| {
                    KopisError::index(format!("merge source {name} left the segment list"))
                })?;
                readers.push(self.reader_for(&info)?);
            }
            (readers, target)
        };

        // The merge itself runs outside the writer lock.
        let mut merger = SegmentMerger::new(
            Arc::clone(&self.storage),
            &target,
            readers.clone(),
            self.tuning(),
        )
        .with_abort_flag(merge.abort_flag());

        let outcome = merger.merge().and_then(|mut segment| {
            segment.diagnostics = self.diagnostics("merge");
            if self.config.use_compound_file {
                let standalone = merger.create_compound_file(&mut segment)?;
                Ok((segment, Some(standalone)))
            } else {
                Ok((segment, None))
            }
        });

        let (mut segment, standalone) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                // Partial target output must not outlive the failure.
                let mut state = self.state.lock();
                let _ = state.deleter.refresh(Some(&target));
                return Err(e);
            }
        };

        let mut state = self.state.lock();

        // Deletes that landed on the sources while the merge ran apply to
        // the merged segment through the doc maps.
        if let Some(bits) =
            carried_deletes(&readers, merger.deletion_snapshots(), merger.doc_maps(), segment.doc_count)
        {
            segment.advance_del_gen();
            let deletes_file = segment
                .deletes_file()
                .expect("advanced del generation names a file");
            if let Err(e) = bits.write(self.storage.as_ref(), &deletes_file) {
                let _ = state.deleter.refresh(Some(&target));
                return Err(e);
            }
        }

        if let Some(standalone) = standalone {
            state.deleter.delete_new_files(&standalone);
        }

        let sources = merge.segment_names();
        state.infos.replace_with_merged(&sources, segment);
        let live = state.infos.clone();
        state.deleter.checkpoint(&live, false)?;
        self.drop_pooled(&sources);

        // Cascade: completed merges change the segment list, which may
        // unlock the next round. Workers drain whatever this registers.
        let follow = match (merge.is_optimize(), merge.max_segments()) {
            (true, Some(max)) => self
                .merge_policy
                .find_merges_for_optimize(&state.infos, max),
            _ => self.merge_policy.find_merges(&state.infos),
        };
        self.register_merges_locked(
            &mut state,
            follow,
            merge.is_optimize().then(|| merge.max_segments().unwrap_or(1)),
        );

        debug!("installed merge of {sources:?} into {target}");
        Ok(())
    }

    fn abort_all_merges(&self) {
        let mut state = self.state.lock();
        for merge in state.pending_merges.drain(..) {
            merge.abort();
        }
        for merge in &state.running_merges {
            merge.abort();
        }
        let pending_sources: Vec<String> = state
            .merging_segments
            .iter()
            .filter(|name| {
                !state
                    .running_merges
                    .iter()
                    .any(|m| m.segment_names().contains(name))
            })
            .cloned()
            .collect();
        for name in pending_sources {
            state.merging_segments.remove(&name);
        }
        self.merge_done.notify_all();
    }

    fn wait_for_merges(&self) {
        let mut state = self.state.lock();
        while !state.pending_merges.is_empty() || !state.running_merges.is_empty() {
            self.merge_done.wait(&mut state);
        }
    }

    /// The pooled reader for a segment, opened on first use. Pooled
    /// readers are shared by delete application, merging and near-real-time
    /// reads.
    fn reader_for(&self, info: &SegmentInfo) -> Result<Arc<SegmentReader>> {
        let mut pool = self.pool.lock();
        if let Some(existing) = pool.get(&info.name) {
            return Ok(Arc::clone(existing));
        }
        let reader = Arc::new(SegmentReader::open(
            Arc::clone(&self.storage),
            info,
            self.config.synthesize_missing_norms,
        )?);
        pool.insert(info.name.clone(), Arc::clone(&reader));
        Ok(reader)
    }

    fn drop_pooled(&self, names: &[String]) {
        let mut pool = self.pool.lock();
        for name in names {
            if let Some(reader) = pool.remove(name) {
                reader.dec_ref();
            }
        }
    }

    fn clear_pool(&self) {
        let mut pool = self.pool.lock();
        for (_, reader) in pool.drain() {
            reader.dec_ref();
        }
    }

    fn release_write_lock(&self) {
        if let Some(mut lock) = self.write_lock.lock().take()
            && let Err(e) = lock.release()
        {
            warn!("failed to release write lock: {e}");
        }
    }
}

/// Package a freshly flushed segment into a compound container, returning
/// the standalone file names it replaces.
fn package_compound(storage: Arc<dyn Storage>, segment: &mut SegmentInfo) -> Result<Vec<String>> {
    let mut names: Vec<String> = filenames::SEGMENT_CORE_EXTENSIONS
        .iter()
        .map(|ext| filenames::segment_file_name(&segment.name, ext))
        .collect();
    if segment.has_vectors {
        for ext in filenames::VECTOR_EXTENSIONS {
            names.push(filenames::segment_file_name(&segment.name, ext));
        }
    }

    let container = filenames::segment_file_name(&segment.name, filenames::COMPOUND_EXT);
    let mut writer = crate::index::compound::CompoundFileWriter::new(storage, &container);
    for name in &names {
        writer.add_file(name)?;
    }
    writer.finalize()?;
    segment.use_compound = true;
    Ok(names)
}

/// Deletes applied to the sources after the merge snapshot was taken,
/// remapped into the merged segment's numbering.
fn carried_deletes(
    readers: &[Arc<SegmentReader>],
    snapshots: &[Option<Arc<BitVector>>],
    doc_maps: &[Vec<Option<u32>>],
    merged_doc_count: u32,
) -> Option<BitVector> {
    let mut bits: Option<BitVector> = None;
    for ((reader, snapshot), map) in readers.iter().zip(snapshots).zip(doc_maps) {
        let Some(current) = reader.deleted_docs() else {
            continue;
        };
        for (doc, target) in map.iter().enumerate() {
            let Some(new_doc) = target else { continue };
            let was_deleted = snapshot.as_ref().is_some_and(|s| s.get(doc as u32));
            if !was_deleted && current.get(doc as u32) {
                bits.get_or_insert_with(|| BitVector::new(merged_doc_count))
                    .set(*new_doc);
            }
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::directory_reader::DirectoryReader;
    use crate::index::document::Field;
    use crate::index::merge_policy::NoMergePolicy;
    use crate::index::merge_scheduler::SerialMergeScheduler;
    use crate::storage::{MemoryStorage, Storage};

    fn test_config() -> IndexWriterConfig {
        IndexWriterConfig {
            max_buffered_docs: 1000,
            use_compound_file: true,
            lock_timeout_ms: 50,
            ..IndexWriterConfig::default()
        }
    }

    /// Serial scheduler + no automatic merges: tests drive everything.
    fn manual_components() -> WriterComponents {
        WriterComponents {
            merge_policy: Some(Box::new(NoMergePolicy)),
            merge_scheduler: Some(Arc::new(SerialMergeScheduler)),
            deletion_policy: None,
        }
    }

    fn open_writer(storage: &Arc<dyn Storage>) -> Arc<IndexWriter> {
        IndexWriter::open_with(Arc::clone(storage), test_config(), manual_components()).unwrap()
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::new()
            .add(Field::keyword("id", id))
            .add(Field::text("body", body))
    }

    #[test]
    fn test_open_creates_index_and_takes_lock() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);

        assert!(storage.file_exists("segments_1"), "empty first commit");
        assert!(storage.lock_manager().lock_exists(filenames::WRITE_LOCK_NAME));
        assert!(writer.config().use_compound_file);

        // A second writer cannot open the same index.
        let err =
            IndexWriter::open_with(Arc::clone(&storage), test_config(), manual_components())
                .unwrap_err();
        assert!(matches!(err, KopisError::LockFailed(_)));

        writer.close(true).unwrap();
        assert!(!storage.lock_manager().lock_exists(filenames::WRITE_LOCK_NAME));

        // After close the index opens again.
        let writer = open_writer(&storage);
        writer.close(true).unwrap();
    }

    #[test]
    fn test_add_commit_read() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);

        writer.add_document(&doc("a", "alpha")).unwrap();
        writer.add_document(&doc("b", "beta")).unwrap();
        assert_eq!(writer.max_doc(), 2, "buffered docs counted");
        writer.commit().unwrap();
        assert_eq!(writer.num_docs().unwrap(), 2);
        assert_eq!(writer.max_doc(), 2);
        assert_eq!(writer.segment_count(), 1);

        let reader = DirectoryReader::open(Arc::clone(writer.storage())).unwrap();
        assert_eq!(reader.num_docs(), 2);
        assert_eq!(reader.doc_freq(&Term::new("body", "alpha")).unwrap(), 1);
        reader.close().unwrap();

        writer.close(true).unwrap();
    }

    #[test]
    fn test_reader_isolation_across_commits() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);

        writer.add_document(&doc("a", "alpha")).unwrap();
        writer.commit().unwrap();
        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert_eq!(reader.num_docs(), 1);

        writer.add_document(&doc("b", "beta")).unwrap();
        writer.delete_documents(&Term::new("id", "a")).unwrap();
        writer.commit().unwrap();

        // The open reader still sees the old commit.
        assert_eq!(reader.num_docs(), 1);
        assert!(!reader.has_deletions());
        assert_eq!(reader.doc_freq(&Term::new("body", "beta")).unwrap(), 0);

        let reopened = reader.reopen().unwrap();
        assert_eq!(reopened.num_docs(), 1, "one added, one deleted");
        assert_eq!(reopened.doc_freq(&Term::new("body", "beta")).unwrap(), 1);

        reopened.close().unwrap();
        reader.close().unwrap();
        writer.close(true).unwrap();
    }

    #[test]
    fn test_buffered_doc_threshold_flushes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let config = IndexWriterConfig {
            max_buffered_docs: 2,
            lock_timeout_ms: 50,
            ..IndexWriterConfig::default()
        };
        let writer =
            IndexWriter::open_with(Arc::clone(&storage), config, manual_components()).unwrap();

        writer.add_document(&doc("a", "alpha")).unwrap();
        assert_eq!(writer.segment_count(), 0);
        writer.add_document(&doc("b", "beta")).unwrap();
        assert_eq!(writer.segment_count(), 1, "threshold reached");
        writer.add_document(&doc("c", "gamma")).unwrap();
        writer.add_document(&doc("d", "delta")).unwrap();
        assert_eq!(writer.segment_count(), 2);

        writer.close(true).unwrap();
    }

    #[test]
    fn test_update_document_is_atomic() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);

        writer.add_document(&doc("a", "alpha")).unwrap();
        writer.commit().unwrap();

        writer
            .update_document(&Term::new("id", "a"), &doc("a", "ALPHA new"))
            .unwrap();

        // The near-real-time view sees exactly one "a": the replacement.
        let nrt = writer.nrt_reader().unwrap();
        assert_eq!(nrt.num_docs(), 1);
        assert_eq!(nrt.doc_freq(&Term::new("body", "new")).unwrap(), 1);
        let mut docs = nrt.term_docs(&Term::new("id", "a")).unwrap();
        let mut live = Vec::new();
        while docs.next().unwrap() {
            live.push(docs.doc());
        }
        assert_eq!(live.len(), 1);

        writer.close(true).unwrap();
    }

    #[test]
    fn test_nrt_reader_is_point_in_time() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);

        writer.add_document(&doc("a", "alpha")).unwrap();
        let nrt = writer.nrt_reader().unwrap();
        assert_eq!(nrt.num_docs(), 1);

        writer.add_document(&doc("b", "beta")).unwrap();
        writer.delete_documents(&Term::new("id", "a")).unwrap();
        writer.flush().unwrap();

        assert_eq!(nrt.num_docs(), 1, "snapshot unaffected by later writes");
        assert_eq!(nrt.max_doc(), 1);

        writer.close(true).unwrap();
    }

    #[test]
    fn test_optimize_merges_and_drops_deleted_terms() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        // The levelled default policy: optimize needs real merge proposals.
        let components = WriterComponents {
            merge_scheduler: Some(Arc::new(SerialMergeScheduler)),
            ..WriterComponents::default()
        };
        let writer =
            IndexWriter::open_with(Arc::clone(&storage), test_config(), components).unwrap();

        for (id, body) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
            writer.add_document(&doc(id, body)).unwrap();
            writer.flush().unwrap(); // one segment per doc
        }
        assert_eq!(writer.segment_count(), 3);

        writer.delete_documents(&Term::new("id", "a")).unwrap();
        writer.optimize(1, true).unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.segment_count(), 1);
        assert_eq!(writer.num_docs().unwrap(), 2);

        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert!(reader.is_optimized());
        assert_eq!(reader.doc_freq(&Term::new("body", "alpha")).unwrap(), 0);
        assert_eq!(reader.doc_freq(&Term::new("body", "beta")).unwrap(), 1);
        reader.close().unwrap();

        writer.close(true).unwrap();
    }

    #[test]
    fn test_two_phase_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);

        writer.add_document(&doc("a", "alpha")).unwrap();
        writer.prepare_commit().unwrap();
        assert!(storage.file_exists("pending_segments_2"));
        assert_eq!(
            SegmentInfos::latest_generation(storage.as_ref()).unwrap(),
            Some(1),
            "prepared but unpublished"
        );

        // A second prepare without commit is refused.
        assert!(writer.prepare_commit().is_err());

        writer.commit().unwrap();
        assert_eq!(
            SegmentInfos::latest_generation(storage.as_ref()).unwrap(),
            Some(2)
        );
        assert!(!storage.file_exists("pending_segments_2"));

        writer.close(true).unwrap();
    }

    #[test]
    fn test_rollback_restores_last_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);

        writer.add_document(&doc("a", "alpha")).unwrap();
        writer.commit().unwrap();

        writer.add_document(&doc("b", "beta")).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.segment_count(), 2);
        writer.rollback().unwrap();

        let reader = DirectoryReader::open(Arc::clone(&storage)).unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert_eq!(reader.doc_freq(&Term::new("body", "beta")).unwrap(), 0);
        reader.close().unwrap();

        // The uncommitted segment's files were reclaimed.
        assert!(!storage.file_exists("_1.cfs"));
        // The lock was released; a new writer can open.
        let writer = open_writer(&storage);
        writer.close(true).unwrap();
    }

    /// A policy proposing two merges that share a source segment.
    #[derive(Debug)]
    struct OverlappingPolicy;

    impl MergePolicy for OverlappingPolicy {
        fn find_merges(&self, infos: &SegmentInfos) -> MergeSpecification {
            let mut spec = MergeSpecification::default();
            if infos.len() >= 3 {
                let segments: Vec<SegmentInfo> = infos.iter().cloned().collect();
                spec.merges
                    .push(OneMerge::new(segments[0..2].to_vec()));
                spec.merges
                    .push(OneMerge::new(segments[1..3].to_vec()));
            }
            spec
        }

        fn find_merges_for_optimize(
            &self,
            _infos: &SegmentInfos,
            _max: usize,
        ) -> MergeSpecification {
            MergeSpecification::default()
        }

        fn find_merges_to_expunge_deletes(&self, _infos: &SegmentInfos) -> MergeSpecification {
            MergeSpecification::default()
        }
    }

    /// Registers merges without running them.
    #[derive(Debug)]
    struct ParkScheduler;

    impl MergeScheduler for ParkScheduler {
        fn merge(&self, _writer: &Arc<IndexWriter>) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn test_merges_sharing_a_source_are_deferred() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let components = WriterComponents {
            merge_policy: Some(Box::new(OverlappingPolicy)),
            merge_scheduler: Some(Arc::new(ParkScheduler)),
            deletion_policy: None,
        };
        let writer =
            IndexWriter::open_with(Arc::clone(&storage), test_config(), components).unwrap();

        for (id, body) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
            writer.add_document(&doc(id, body)).unwrap();
            writer.flush().unwrap();
        }

        // Of {_0,_1} and {_1,_2} only the first registered; the second was
        // deferred because _1 is already merging.
        assert_eq!(writer.pending_merge_count(), 1);
        let merge = writer.next_pending_merge().unwrap();
        assert_eq!(merge.segment_names(), vec!["_0", "_1"]);
        assert!(writer.next_pending_merge().is_none());

        // Finish it so close() does not wait forever.
        writer.do_merge(&merge);
        assert_eq!(merge.state(), MergeState::Done);
        assert_eq!(writer.segment_count(), 2);

        writer.close(true).unwrap();
    }

    #[test]
    fn test_expunge_deletes_rewrites_deleted_segments() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let components = WriterComponents {
            merge_policy: None, // log-doc: expunge support needed
            merge_scheduler: Some(Arc::new(SerialMergeScheduler)),
            deletion_policy: None,
        };
        let writer =
            IndexWriter::open_with(Arc::clone(&storage), test_config(), components).unwrap();

        writer.add_document(&doc("a", "alpha")).unwrap();
        writer.add_document(&doc("b", "beta")).unwrap();
        writer.flush().unwrap();
        writer.delete_documents(&Term::new("id", "a")).unwrap();
        writer.flush().unwrap();
        assert!(writer.nrt_reader().unwrap().has_deletions());

        writer.expunge_deletes(true).unwrap();
        let nrt = writer.nrt_reader().unwrap();
        assert!(!nrt.has_deletions());
        assert_eq!(nrt.num_docs(), 1);

        writer.close(true).unwrap();
    }

    #[test]
    fn test_closed_writer_refuses_mutations() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let writer = open_writer(&storage);
        writer.close(true).unwrap();

        let err = writer.add_document(&doc("a", "alpha")).unwrap_err();
        assert!(matches!(err, KopisError::InvalidOperation(_)));
        // Closing again is a no-op.
        writer.close(true).unwrap();
    }
}
