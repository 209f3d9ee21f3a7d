//! Commit points and the policy deciding how long they live.

use std::collections::BTreeMap;

/// An immutable reference to one committed snapshot: the `segments_N` file
/// plus every file that snapshot depends on.
///
/// Commit points are handed to the [`DeletionPolicy`], which may mark them
/// for deletion; the deleter then drops the reference count of every file
/// the commit named.
#[derive(Debug, Clone)]
pub struct IndexCommit {
    segments_file: String,
    generation: u64,
    files: Vec<String>,
    user_data: BTreeMap<String, String>,
    deleted: bool,
}

impl IndexCommit {
    /// Create a commit point. `files` must include the snapshot file
    /// itself.
    pub fn new(
        segments_file: String,
        generation: u64,
        files: Vec<String>,
        user_data: BTreeMap<String, String>,
    ) -> Self {
        IndexCommit {
            segments_file,
            generation,
            files,
            user_data,
            deleted: false,
        }
    }

    /// The `segments_N` file name of this commit.
    pub fn segments_file(&self) -> &str {
        &self.segments_file
    }

    /// The commit generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every file this commit depends on, snapshot file included.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// The user data stored with the commit.
    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    /// Mark this commit for deletion. Idempotent.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    /// True if the policy marked this commit for deletion.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Decides which commit points to retain.
///
/// `on_init` runs once when the deleter starts up and discovers the commits
/// already on disk; `on_commit` runs after every new commit is appended.
/// In both calls the commits are ordered oldest to newest and the newest
/// commit must never be deleted.
pub trait DeletionPolicy: Send + Sync + std::fmt::Debug {
    /// Inspect the commits found on startup.
    fn on_init(&self, commits: &mut [IndexCommit]);

    /// Inspect the commits after a new one was appended.
    fn on_commit(&self, commits: &mut [IndexCommit]);
}

/// The default policy: only the most recent commit survives.
#[derive(Debug, Clone, Default)]
pub struct KeepOnlyLastCommitPolicy;

impl DeletionPolicy for KeepOnlyLastCommitPolicy {
    fn on_init(&self, commits: &mut [IndexCommit]) {
        self.on_commit(commits);
    }

    fn on_commit(&self, commits: &mut [IndexCommit]) {
        if let Some((_, rest)) = commits.split_last_mut() {
            for commit in rest {
                commit.delete();
            }
        }
    }
}

/// Retains every commit; used by tests and snapshot/backup tooling.
#[derive(Debug, Clone, Default)]
pub struct KeepAllCommitsPolicy;

impl DeletionPolicy for KeepAllCommitsPolicy {
    fn on_init(&self, _commits: &mut [IndexCommit]) {}

    fn on_commit(&self, _commits: &mut [IndexCommit]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(generation: u64) -> IndexCommit {
        IndexCommit::new(
            format!("segments_{generation}"),
            generation,
            vec![format!("segments_{generation}"), "_0.cfs".to_string()],
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_keep_only_last() {
        let mut commits = vec![commit(1), commit(2), commit(3)];
        KeepOnlyLastCommitPolicy.on_commit(&mut commits);

        assert!(commits[0].is_deleted());
        assert!(commits[1].is_deleted());
        assert!(!commits[2].is_deleted());
    }

    #[test]
    fn test_keep_all() {
        let mut commits = vec![commit(1), commit(2)];
        KeepAllCommitsPolicy.on_commit(&mut commits);
        assert!(commits.iter().all(|c| !c.is_deleted()));
    }

    #[test]
    fn test_empty_commits() {
        let mut commits: Vec<IndexCommit> = Vec::new();
        KeepOnlyLastCommitPolicy.on_init(&mut commits);
    }
}
