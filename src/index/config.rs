//! Writer configuration.

use serde::{Deserialize, Serialize};

/// Configuration for an [`IndexWriter`].
///
/// [`IndexWriter`]: crate::index::writer::IndexWriter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexWriterConfig {
    /// Flush when this many documents are buffered.
    pub max_buffered_docs: usize,

    /// Flush when the buffered documents exceed this much estimated RAM.
    pub ram_buffer_size_mb: f64,

    /// Flush (applying deletes) when this many delete terms are buffered.
    pub max_buffered_delete_terms: usize,

    /// Every Nth term of the dictionary goes into the in-memory index.
    /// Smaller means faster seeks and more memory.
    pub term_index_interval: u32,

    /// A skip-list entry is recorded every N postings.
    pub skip_interval: u32,

    /// Upper bound on skip-list levels. Together with `skip_interval` this
    /// trades memory for seek speed; both are deliberately configuration,
    /// not constants.
    pub max_skip_levels: u32,

    /// Pack freshly flushed and merged segments into compound files.
    pub use_compound_file: bool,

    /// Maximum number of concurrently running merge threads.
    pub max_merge_threads: usize,

    /// How long to wait for the single-writer lock before failing.
    pub lock_timeout_ms: u64,

    /// When a field stores no norms, `norms()` returns an all-ones array
    /// instead of `None`. Off by default; readers that treat missing norms
    /// as "no length normalization" want the `None`.
    pub synthesize_missing_norms: bool,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            max_buffered_docs: 1000,
            ram_buffer_size_mb: 16.0,
            max_buffered_delete_terms: 1000,
            term_index_interval: 128,
            skip_interval: 16,
            max_skip_levels: 10,
            use_compound_file: true,
            max_merge_threads: default_merge_threads(),
            lock_timeout_ms: 1000,
            synthesize_missing_norms: false,
        }
    }
}

fn default_merge_threads() -> usize {
    (num_cpus::get() / 2).clamp(1, 3)
}

impl IndexWriterConfig {
    /// The RAM flush threshold in bytes.
    pub fn ram_buffer_size_bytes(&self) -> usize {
        (self.ram_buffer_size_mb * 1024.0 * 1024.0) as usize
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
