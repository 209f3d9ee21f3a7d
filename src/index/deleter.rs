//! Reference-counted index file lifecycle.
//!
//! Every file named by a live commit point or by the most recent in-flight
//! checkpoint carries a positive reference count; a file is physically
//! deleted exactly when its count drops to zero. Deletes that fail
//! transiently (a platform holding the file open, say) are queued and
//! retried at the next checkpoint rather than surfaced to the caller.

use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::error::Result;
use crate::index::deletion_policy::{DeletionPolicy, IndexCommit};
use crate::index::filenames;
use crate::index::segment_info::SegmentInfos;
use crate::storage::traits::{Storage, is_not_found};

/// Reference-counts every index file and deletes unreferenced ones.
#[derive(Debug)]
pub struct IndexFileDeleter {
    storage: Arc<dyn Storage>,
    policy: Box<dyn DeletionPolicy>,
    ref_counts: AHashMap<String, u32>,
    /// Live commit points, oldest first.
    commits: Vec<IndexCommit>,
    /// Files referenced by the most recent non-commit checkpoint.
    last_files: Vec<String>,
    /// Files whose deletion failed and will be retried.
    pending: Vec<String>,
}

impl IndexFileDeleter {
    /// Create a deleter for the given storage.
    ///
    /// Scans the directory, loads every discoverable commit point with
    /// generation at or below `segment_infos.generation`, reference-counts
    /// their files, deletes orphans, and gives the policy one `on_init`
    /// pass over the discovered commits.
    pub fn new(
        storage: Arc<dyn Storage>,
        policy: Box<dyn DeletionPolicy>,
        segment_infos: &SegmentInfos,
    ) -> Result<Self> {
        let mut deleter = IndexFileDeleter {
            storage,
            policy,
            ref_counts: AHashMap::new(),
            commits: Vec::new(),
            last_files: Vec::new(),
            pending: Vec::new(),
        };

        let current_gen = segment_infos.generation;
        let mut index_files = Vec::new();

        for name in deleter.storage.list_files()? {
            if !filenames::is_index_file(&name) || name == filenames::SEGMENTS_GEN_NAME {
                continue;
            }
            deleter.ref_counts.entry(name.clone()).or_insert(0);
            index_files.push(name);
        }

        for name in &index_files {
            let Some(generation) = filenames::parse_segments_generation(name) else {
                continue;
            };
            if generation > current_gen {
                continue;
            }
            match SegmentInfos::read_from(deleter.storage.as_ref(), name) {
                Ok(infos) => {
                    let mut files = infos.files();
                    files.push(name.clone());
                    for file in &files {
                        deleter.inc_ref(file);
                    }
                    deleter.commits.push(IndexCommit::new(
                        name.clone(),
                        generation,
                        files,
                        infos.user_data.clone(),
                    ));
                }
                Err(e) => {
                    // An unreadable old commit is treated as garbage; its
                    // files fall out through the orphan pass below.
                    warn!("skipping unreadable commit {name}: {e}");
                }
            }
        }

        deleter.commits.sort_by_key(|c| c.generation());

        // Anything that stayed at zero is orphaned output from a crashed
        // writer or an aborted merge.
        let orphans: Vec<String> = deleter
            .ref_counts
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in orphans {
            debug!("deleting orphaned file {name}");
            deleter.ref_counts.remove(&name);
            deleter.delete_file(&name);
        }

        let mut commits = std::mem::take(&mut deleter.commits);
        deleter.policy.on_init(&mut commits);
        deleter.commits = commits;
        deleter.drop_deleted_commits();

        Ok(deleter)
    }

    /// Current reference count of a file (0 if untracked).
    pub fn ref_count(&self, name: &str) -> u32 {
        self.ref_counts.get(name).copied().unwrap_or(0)
    }

    /// The generations of the live commit points, oldest first.
    pub fn commit_generations(&self) -> Vec<u64> {
        self.commits.iter().map(|c| c.generation()).collect()
    }

    /// Record a new consistent snapshot.
    ///
    /// Increments reference counts for every file the snapshot names. For
    /// a commit, additionally registers a commit point and lets the policy
    /// retire old ones; the in-flight checkpoint is left alone, since the
    /// committed snapshot may lag the live state (a merge finishing inside
    /// a two-phase commit window). For a plain checkpoint, releases the
    /// files of the previous checkpoint, bounding transient disk usage to
    /// roughly one extra generation.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        self.retry_pending();

        let mut files = infos.files();

        if is_commit {
            let segments_file = filenames::segments_file_name(infos.generation);
            files.push(segments_file.clone());
            for file in &files {
                self.inc_ref(file);
            }
            self.commits.push(IndexCommit::new(
                segments_file,
                infos.generation,
                files,
                infos.user_data.clone(),
            ));

            let mut commits = std::mem::take(&mut self.commits);
            self.policy.on_commit(&mut commits);
            self.commits = commits;
            self.drop_deleted_commits();
        } else {
            for file in &files {
                self.inc_ref(file);
            }
            let last = std::mem::replace(&mut self.last_files, files);
            self.dec_ref_all(&last);
        }

        Ok(())
    }

    /// Increment the reference count of one file.
    pub fn inc_ref(&mut self, name: &str) {
        *self.ref_counts.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Increment the reference counts of every file in a snapshot.
    pub fn inc_ref_infos(&mut self, infos: &SegmentInfos) {
        for file in infos.files() {
            self.inc_ref(&file);
        }
    }

    /// Decrement the reference count of one file, deleting it on zero.
    pub fn dec_ref(&mut self, name: &str) {
        let Some(count) = self.ref_counts.get_mut(name) else {
            warn!("dec_ref on untracked file {name}");
            return;
        };
        debug_assert!(*count > 0, "reference count underflow for {name}");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.ref_counts.remove(name);
            self.delete_file(name);
        }
    }

    /// Decrement the counts of a list of files.
    pub fn dec_ref_all(&mut self, names: &[String]) {
        for name in names {
            self.dec_ref(name);
        }
    }

    /// Decrement the counts of every file in a snapshot.
    pub fn dec_ref_infos(&mut self, infos: &SegmentInfos) {
        let files = infos.files();
        self.dec_ref_all(&files);
    }

    /// Re-list the directory and delete recognized index files that are not
    /// reference-counted, optionally only those of one segment.
    ///
    /// Used after an aborted flush or merge to clean up partial output.
    pub fn refresh(&mut self, segment: Option<&str>) -> Result<()> {
        for name in self.storage.list_files()? {
            if !filenames::is_index_file(&name) || name == filenames::SEGMENTS_GEN_NAME {
                continue;
            }
            if let Some(segment) = segment
                && !filenames::belongs_to_segment(&name, segment)
            {
                continue;
            }
            if !self.ref_counts.contains_key(&name) {
                debug!("refresh: deleting unreferenced file {name}");
                self.delete_file(&name);
            }
        }
        Ok(())
    }

    /// Delete only files that carry no reference count yet: genuinely new,
    /// never-committed output. A live file sharing a name is left alone.
    pub fn delete_new_files(&mut self, names: &[String]) {
        for name in names {
            if !self.ref_counts.contains_key(name.as_str()) {
                debug!("deleting new file {name}");
                self.delete_file(name);
            }
        }
    }

    /// Retry previously failed deletions.
    pub fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        for name in pending {
            self.delete_file(&name);
        }
    }

    /// Final retry pass; called when the owning writer closes.
    pub fn close(&mut self) {
        self.retry_pending();
    }

    fn drop_deleted_commits(&mut self) {
        let mut retained = Vec::with_capacity(self.commits.len());
        for commit in std::mem::take(&mut self.commits) {
            if commit.is_deleted() {
                debug!("deleting commit point {}", commit.segments_file());
                let files: Vec<String> = commit.files().to_vec();
                self.dec_ref_all(&files);
            } else {
                retained.push(commit);
            }
        }
        self.commits = retained;
    }

    fn delete_file(&mut self, name: &str) {
        match self.storage.delete_file(name) {
            Ok(()) => debug!("deleted {name}"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                debug!("delete of {name} failed ({e}); will retry");
                self.pending.push(name.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::deletion_policy::{KeepAllCommitsPolicy, KeepOnlyLastCommitPolicy};
    use crate::index::segment_info::SegmentInfo;
    use crate::storage::{MemoryStorage, Storage};
    use std::io::Write;

    fn touch(storage: &dyn Storage, name: &str) {
        let mut out = storage.create_output(name).unwrap();
        out.write_all(b"x").unwrap();
        out.close().unwrap();
    }

    fn storage_with_commit() -> (Arc<dyn Storage>, SegmentInfos) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());

        let mut infos = SegmentInfos::new();
        let mut seg = SegmentInfo::new("_0", 3);
        seg.use_compound = true;
        infos.push(seg);
        infos.counter = 1;

        for file in infos.files() {
            touch(storage.as_ref(), &file);
        }
        infos.write_pending(storage.as_ref(), 1).unwrap();
        SegmentInfos::publish_pending(storage.as_ref(), 1).unwrap();
        let mut infos = infos;
        infos.generation = 1;

        (storage, infos)
    }

    #[test]
    fn test_startup_deletes_orphans() {
        let (storage, infos) = storage_with_commit();
        touch(storage.as_ref(), "_9.cfs"); // orphan: referenced by nothing
        touch(storage.as_ref(), "stray.txt"); // unrecognized: untouched

        let deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Box::new(KeepOnlyLastCommitPolicy),
            &infos,
        )
        .unwrap();

        assert!(!storage.file_exists("_9.cfs"));
        assert!(storage.file_exists("stray.txt"));
        assert!(storage.file_exists("_0.cfs"));
        assert_eq!(deleter.ref_count("_0.cfs"), 1);
        assert_eq!(deleter.commit_generations(), vec![1]);
    }

    #[test]
    fn test_commit_checkpoint_retires_old_commit() {
        let (storage, mut infos) = storage_with_commit();
        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Box::new(KeepOnlyLastCommitPolicy),
            &infos,
        )
        .unwrap();

        // Second commit replaces _0 with _1.
        let mut seg = SegmentInfo::new("_1", 3);
        seg.use_compound = true;
        for file in seg.files() {
            touch(storage.as_ref(), &file);
        }
        infos.remove("_0");
        infos.push(seg);
        infos.write_pending(storage.as_ref(), 2).unwrap();
        SegmentInfos::publish_pending(storage.as_ref(), 2).unwrap();
        infos.generation = 2;

        deleter.checkpoint(&infos, true).unwrap();

        assert!(!storage.file_exists("_0.cfs"), "old segment reclaimed");
        assert!(!storage.file_exists("segments_1"), "old commit reclaimed");
        assert!(storage.file_exists("_1.cfs"));
        assert!(storage.file_exists("segments_2"));
        assert_eq!(deleter.commit_generations(), vec![2]);
    }

    #[test]
    fn test_keep_all_policy_retains_commits() {
        let (storage, mut infos) = storage_with_commit();
        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Box::new(KeepAllCommitsPolicy),
            &infos,
        )
        .unwrap();

        let mut seg = SegmentInfo::new("_1", 3);
        seg.use_compound = true;
        for file in seg.files() {
            touch(storage.as_ref(), &file);
        }
        infos.remove("_0");
        infos.push(seg);
        infos.write_pending(storage.as_ref(), 2).unwrap();
        SegmentInfos::publish_pending(storage.as_ref(), 2).unwrap();
        infos.generation = 2;

        deleter.checkpoint(&infos, true).unwrap();

        assert!(storage.file_exists("_0.cfs"));
        assert!(storage.file_exists("segments_1"));
        assert_eq!(deleter.commit_generations(), vec![1, 2]);
    }

    #[test]
    fn test_non_commit_checkpoint_bounds_transients() {
        let (storage, mut infos) = storage_with_commit();
        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Box::new(KeepOnlyLastCommitPolicy),
            &infos,
        )
        .unwrap();

        // Flush _1 without committing.
        let mut seg1 = SegmentInfo::new("_1", 2);
        seg1.use_compound = true;
        for file in seg1.files() {
            touch(storage.as_ref(), &file);
        }
        infos.push(seg1);
        deleter.checkpoint(&infos, false).unwrap();
        assert_eq!(deleter.ref_count("_1.cfs"), 1);

        // A merge replaces _0 + _1 with _2; old checkpoint released.
        let mut seg2 = SegmentInfo::new("_2", 5);
        seg2.use_compound = true;
        for file in seg2.files() {
            touch(storage.as_ref(), &file);
        }
        infos.replace_with_merged(
            &["_0".to_string(), "_1".to_string()],
            seg2,
        );
        deleter.checkpoint(&infos, false).unwrap();

        // _1 was only held by the superseded checkpoint.
        assert!(!storage.file_exists("_1.cfs"));
        // _0 survives: the commit point still references it.
        assert!(storage.file_exists("_0.cfs"));
        assert_eq!(deleter.ref_count("_2.cfs"), 1);
    }

    #[test]
    fn test_delete_new_files_spares_referenced() {
        let (storage, infos) = storage_with_commit();
        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Box::new(KeepOnlyLastCommitPolicy),
            &infos,
        )
        .unwrap();

        touch(storage.as_ref(), "_7.fnm");
        deleter.delete_new_files(&["_7.fnm".to_string(), "_0.cfs".to_string()]);

        assert!(!storage.file_exists("_7.fnm"));
        assert!(storage.file_exists("_0.cfs"), "referenced file untouched");
    }

    /// Delegates to memory storage but fails deletion of chosen names,
    /// standing in for a platform holding the file open.
    #[derive(Debug)]
    struct StickyStorage {
        inner: MemoryStorage,
        stuck: Arc<parking_lot::Mutex<std::collections::HashSet<String>>>,
    }

    impl Storage for StickyStorage {
        fn open_input(&self, name: &str) -> Result<Box<dyn crate::storage::StorageInput>> {
            self.inner.open_input(name)
        }

        fn create_output(&self, name: &str) -> Result<Box<dyn crate::storage::StorageOutput>> {
            self.inner.create_output(name)
        }

        fn file_exists(&self, name: &str) -> bool {
            self.inner.file_exists(name)
        }

        fn delete_file(&self, name: &str) -> Result<()> {
            if self.stuck.lock().contains(name) {
                return Err(crate::error::KopisError::storage(format!(
                    "file is busy: {name}"
                )));
            }
            self.inner.delete_file(name)
        }

        fn list_files(&self) -> Result<Vec<String>> {
            self.inner.list_files()
        }

        fn file_size(&self, name: &str) -> Result<u64> {
            self.inner.file_size(name)
        }

        fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
            self.inner.rename_file(old_name, new_name)
        }

        fn sync_file(&self, name: &str) -> Result<()> {
            self.inner.sync_file(name)
        }

        fn lock_manager(&self) -> &dyn crate::storage::LockManager {
            self.inner.lock_manager()
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_transient_delete_failure_retried() {
        let stuck = Arc::new(parking_lot::Mutex::new(std::collections::HashSet::new()));
        let storage: Arc<dyn Storage> = Arc::new(StickyStorage {
            inner: MemoryStorage::new_default(),
            stuck: Arc::clone(&stuck),
        });

        let mut infos = SegmentInfos::new();
        let mut seg = SegmentInfo::new("_0", 3);
        seg.use_compound = true;
        infos.push(seg);
        infos.counter = 1;
        for file in infos.files() {
            touch(storage.as_ref(), &file);
        }
        infos.write_pending(storage.as_ref(), 1).unwrap();
        SegmentInfos::publish_pending(storage.as_ref(), 1).unwrap();
        infos.generation = 1;

        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Box::new(KeepOnlyLastCommitPolicy),
            &infos,
        )
        .unwrap();

        // Replace _0 with _1 and commit while _0.cfs refuses deletion.
        stuck.lock().insert("_0.cfs".to_string());
        let mut seg1 = SegmentInfo::new("_1", 3);
        seg1.use_compound = true;
        for file in seg1.files() {
            touch(storage.as_ref(), &file);
        }
        infos.remove("_0");
        infos.push(seg1);
        infos.write_pending(storage.as_ref(), 2).unwrap();
        SegmentInfos::publish_pending(storage.as_ref(), 2).unwrap();
        infos.generation = 2;
        deleter.checkpoint(&infos, true).unwrap();

        assert!(
            storage.file_exists("_0.cfs"),
            "failed delete is queued, not surfaced"
        );
        assert!(!storage.file_exists("_0.nrm"), "other files went normally");

        // Once the file frees up, the next retry pass reclaims it.
        stuck.lock().clear();
        deleter.close();
        assert!(!storage.file_exists("_0.cfs"));
    }

    #[test]
    fn test_refresh_cleans_partial_segment() {
        let (storage, infos) = storage_with_commit();
        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Box::new(KeepOnlyLastCommitPolicy),
            &infos,
        )
        .unwrap();

        touch(storage.as_ref(), "_5.fdt");
        touch(storage.as_ref(), "_5.fdx");
        deleter.refresh(Some("_5")).unwrap();

        assert!(!storage.file_exists("_5.fdt"));
        assert!(!storage.file_exists("_5.fdx"));
        assert!(storage.file_exists("_0.cfs"));
    }
}
