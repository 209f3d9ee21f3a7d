//! Merge selection: which segments to combine, and the merge task itself.
//!
//! A [`MergePolicy`] inspects the current segment list and proposes
//! [`OneMerge`] tasks. The writer registers them (refusing any whose
//! sources already participate in another merge) and the scheduler runs
//! them. A task moves pending → running → done/aborted; aborts are
//! signaled cooperatively through a shared flag the merger polls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::KopisError;
use crate::index::segment_info::{SegmentInfo, SegmentInfos};

/// Lifecycle of a merge task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// Registered, waiting for a worker.
    Pending,
    /// A worker is executing it.
    Running,
    /// Completed and folded into the segment list.
    Done,
    /// Cooperatively cancelled; its partial output was discarded.
    Aborted,
}

/// One registered merge: a contiguous run of source segments to combine
/// into a single new segment.
#[derive(Debug)]
pub struct OneMerge {
    segments: Vec<SegmentInfo>,
    optimize: AtomicBool,
    max_segments: Mutex<Option<usize>>,
    state: Mutex<MergeState>,
    abort: Arc<AtomicBool>,
    error: Mutex<Option<KopisError>>,
}

impl OneMerge {
    /// Create a pending merge over the given source segments.
    pub fn new(segments: Vec<SegmentInfo>) -> Self {
        OneMerge {
            segments,
            optimize: AtomicBool::new(false),
            max_segments: Mutex::new(None),
            state: Mutex::new(MergeState::Pending),
            abort: Arc::new(AtomicBool::new(false)),
            error: Mutex::new(None),
        }
    }

    /// The source segments, in index order.
    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    /// The source segment names.
    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name.clone()).collect()
    }

    /// Total documents across the sources, deletions included.
    pub fn total_doc_count(&self) -> u32 {
        self.segments.iter().map(|s| s.doc_count).sum()
    }

    /// Tag this merge as part of an optimize with the given segment-count
    /// ceiling.
    pub fn set_optimize(&self, max_segments: usize) {
        self.optimize.store(true, Ordering::SeqCst);
        *self.max_segments.lock() = Some(max_segments);
    }

    /// True if the merge is tagged as part of an optimize.
    pub fn is_optimize(&self) -> bool {
        self.optimize.load(Ordering::SeqCst)
    }

    /// The optimize segment-count ceiling, if tagged.
    pub fn max_segments(&self) -> Option<usize> {
        *self.max_segments.lock()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> MergeState {
        *self.state.lock()
    }

    /// Mark the merge running. Returns false when it was aborted first.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if *state != MergeState::Pending {
            return false;
        }
        *state = MergeState::Running;
        true
    }

    /// Mark the merge finished.
    pub fn finish(&self, state: MergeState) {
        debug_assert!(matches!(state, MergeState::Done | MergeState::Aborted));
        *self.state.lock() = state;
    }

    /// Request cooperative cancellation.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == MergeState::Pending {
            *state = MergeState::Aborted;
        }
    }

    /// True once an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// The shared abort flag the merger polls while copying.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Record the failure that ended this merge.
    pub fn record_error(&self, error: KopisError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Take the recorded failure, if any.
    pub fn take_error(&self) -> Option<KopisError> {
        self.error.lock().take()
    }
}

/// A batch of proposed merges.
#[derive(Debug, Default)]
pub struct MergeSpecification {
    /// The proposed merges, most urgent first.
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    /// True if nothing was proposed.
    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    fn add(&mut self, segments: Vec<SegmentInfo>) {
        self.merges.push(OneMerge::new(segments));
    }
}

/// Decides which segments to merge and when.
///
/// Only contiguous runs may be proposed; the writer substitutes each
/// completed merge in place of its sources, preserving document order.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Propose merges for the natural (non-optimize) case.
    fn find_merges(&self, infos: &SegmentInfos) -> MergeSpecification;

    /// Propose merges working toward at most `max_segments` segments.
    fn find_merges_for_optimize(
        &self,
        infos: &SegmentInfos,
        max_segments: usize,
    ) -> MergeSpecification;

    /// Propose merges that rewrite segments carrying deletions.
    fn find_merges_to_expunge_deletes(&self, infos: &SegmentInfos) -> MergeSpecification;
}

/// Levelled merging by document count.
///
/// Segments are bucketed into levels by the logarithm (base `merge_factor`)
/// of their document count; whenever `merge_factor` adjacent segments share
/// a level, they merge into one segment of the next level up. Writes cost
/// an amortized logarithmic number of merges per document.
#[derive(Debug, Clone)]
pub struct LogDocMergePolicy {
    /// How many same-level segments trigger a merge, and the fan-in of
    /// every merge.
    pub merge_factor: usize,
    /// Segments below this count all share the bottom level.
    pub min_merge_docs: u32,
    /// Segments above this count are never merged automatically.
    pub max_merge_docs: u32,
}

impl Default for LogDocMergePolicy {
    fn default() -> Self {
        LogDocMergePolicy {
            merge_factor: 10,
            min_merge_docs: 1000,
            max_merge_docs: u32::MAX,
        }
    }
}

impl LogDocMergePolicy {
    fn level(&self, doc_count: u32) -> u32 {
        let clamped = doc_count.max(self.min_merge_docs).max(1) as f64;
        (clamped.ln() / (self.merge_factor.max(2) as f64).ln()).floor() as u32
    }
}

impl MergePolicy for LogDocMergePolicy {
    fn find_merges(&self, infos: &SegmentInfos) -> MergeSpecification {
        let mut spec = MergeSpecification::default();
        let segments: Vec<&SegmentInfo> = infos.iter().collect();

        let mut run_start = 0;
        let mut i = 0;
        while i <= segments.len() {
            let boundary = i == segments.len()
                || segments[i].doc_count > self.max_merge_docs
                || self.level(segments[i].doc_count) != self.level(segments[run_start].doc_count);
            if boundary {
                // Emit full merge-factor windows of the finished run.
                let mut start = run_start;
                while i - start >= self.merge_factor {
                    spec.add(
                        segments[start..start + self.merge_factor]
                            .iter()
                            .map(|s| (*s).clone())
                            .collect(),
                    );
                    start += self.merge_factor;
                }
                // Oversized segments are opaque to merging; skip them.
                if i < segments.len() && segments[i].doc_count > self.max_merge_docs {
                    i += 1;
                }
                run_start = i;
            }
            i += 1;
        }
        spec
    }

    fn find_merges_for_optimize(
        &self,
        infos: &SegmentInfos,
        max_segments: usize,
    ) -> MergeSpecification {
        let mut spec = MergeSpecification::default();
        let max_segments = max_segments.max(1);
        let segments: Vec<&SegmentInfo> = infos.iter().collect();

        if segments.len() > max_segments {
            // Shrink from the tail; the writer cascades until the ceiling
            // holds.
            let take = (segments.len() - max_segments + 1).min(self.merge_factor);
            let start = segments.len() - take;
            spec.add(segments[start..].iter().map(|s| (*s).clone()).collect());
        } else if max_segments == 1
            && segments.len() == 1
            && segments[0].has_deletions()
        {
            // Fully optimized means no deleted documents either; rewrite
            // the lone segment.
            spec.add(vec![segments[0].clone()]);
        }
        spec
    }

    fn find_merges_to_expunge_deletes(&self, infos: &SegmentInfos) -> MergeSpecification {
        let mut spec = MergeSpecification::default();
        let segments: Vec<&SegmentInfo> = infos.iter().collect();

        let mut i = 0;
        while i < segments.len() {
            if !segments[i].has_deletions() {
                i += 1;
                continue;
            }
            let start = i;
            while i < segments.len()
                && segments[i].has_deletions()
                && i - start < self.merge_factor
            {
                i += 1;
            }
            spec.add(segments[start..i].iter().map(|s| (*s).clone()).collect());
        }
        spec
    }
}

/// Never proposes a merge; used by tests that need full control over the
/// segment list.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _infos: &SegmentInfos) -> MergeSpecification {
        MergeSpecification::default()
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
