//! Running registered merges: inline, or on a bounded pool of background
//! threads.
//!
//! The concurrent scheduler owns a fixed number of merge slots. Its entry
//! point pulls pending merges from the writer; when every slot is taken the
//! calling (indexing) thread stalls until a worker finishes. A worker, once
//! spawned, keeps draining further pending merges before exiting, so a
//! burst of merges costs one thread spawn. Worker failures are recorded on
//! the writer, never thrown on the worker thread; a caller blocking in
//! `optimize`/`expunge_deletes`/`close` observes them there.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::writer::IndexWriter;

/// Executes the writer's registered merges.
pub trait MergeScheduler: Send + Sync + std::fmt::Debug {
    /// Run (or arrange to run) every pending merge of the writer.
    fn merge(&self, writer: &Arc<IndexWriter>) -> Result<()>;

    /// Wait for in-flight work and release scheduler resources.
    fn close(&self);
}

/// Runs every merge synchronously on the calling thread.
#[derive(Debug, Clone, Default)]
pub struct SerialMergeScheduler;

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, writer: &Arc<IndexWriter>) -> Result<()> {
        while let Some(merge) = writer.next_pending_merge() {
            writer.do_merge(&merge);
        }
        Ok(())
    }

    fn close(&self) {}
}

/// Runs merges on a bounded set of background worker threads.
#[derive(Debug)]
pub struct ConcurrentMergeScheduler {
    /// A slot must be held while a worker runs; the bounded channel is the
    /// semaphore.
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
}

impl ConcurrentMergeScheduler {
    /// Create a scheduler running at most `max_threads` merges at once.
    pub fn new(max_threads: usize) -> Self {
        let (slot_tx, slot_rx) = bounded(max_threads.max(1));
        ConcurrentMergeScheduler {
            slot_tx,
            slot_rx,
            workers: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Total worker threads spawned over the scheduler's lifetime.
    pub fn threads_spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

/// Returns its merge slot when dropped, even if the worker unwinds.
struct SlotGuard {
    slots: Receiver<()>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.slots.try_recv();
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, writer: &Arc<IndexWriter>) -> Result<()> {
        loop {
            let Some(merge) = writer.next_pending_merge() else {
                break;
            };

            // Take a slot; this is where the issuing thread stalls when the
            // pool is saturated.
            self.slot_tx
                .send(())
                .expect("merge slot channel outlives the scheduler");

            let ordinal = self.spawned.fetch_add(1, Ordering::SeqCst);
            let writer = Arc::clone(writer);
            let guard = SlotGuard {
                slots: self.slot_rx.clone(),
            };
            let worker_writer = Arc::clone(&writer);
            let worker_merge = Arc::clone(&merge);
            let spawned = std::thread::Builder::new()
                .name(format!("kopis-merge-{ordinal}"))
                .spawn(move || {
                    let _guard = guard;
                    worker_writer.do_merge(&worker_merge);
                    // Drain whatever queued up while this merge ran.
                    while let Some(next) = worker_writer.next_pending_merge() {
                        worker_writer.do_merge(&next);
                    }
                    debug!("merge worker {ordinal} idle, exiting");
                });

            match spawned {
                Ok(handle) => {
                    let mut workers = self.workers.lock();
                    workers.retain(|h| !h.is_finished());
                    workers.push(handle);
                }
                Err(e) => {
                    // The slot guard went down with the failed spawn; fall
                    // back to running inline rather than dropping the merge.
                    warn!("failed to spawn merge worker: {e}; merging inline");
                    writer.do_merge(&merge);
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.join() {
                warn!("merge worker panicked: {e:?}");
            }
        }
    }
}
