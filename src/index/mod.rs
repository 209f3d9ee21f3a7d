//! The segment storage and merge core.
//!
//! Documents are buffered in memory by [`IndexWriter`], flushed as immutable
//! segments, merged in the background by a [`MergeScheduler`] driving the
//! [`SegmentMerger`], and read through point-in-time [`IndexReader`]s.
//! Every on-disk file is reference-counted by the [`IndexFileDeleter`] so
//! commits stay crash-safe while obsolete files are reclaimed.
//!
//! [`IndexWriter`]: writer::IndexWriter
//! [`MergeScheduler`]: merge_scheduler::MergeScheduler
//! [`SegmentMerger`]: merger::SegmentMerger
//! [`IndexReader`]: reader::IndexReader
//! [`IndexFileDeleter`]: deleter::IndexFileDeleter

pub mod bit_vector;
pub mod buffer;
pub mod composite;
pub mod compound;
pub mod config;
pub mod deleter;
pub mod deletion_policy;
pub mod directory_reader;
pub mod document;
pub mod field_infos;
pub mod filenames;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod merger;
pub mod multi_reader;
pub mod norms;
pub mod postings;
pub mod reader;
pub mod segment_info;
pub mod segment_reader;
pub mod skip;
pub mod stored_fields;
pub mod term;
pub mod term_vectors;
pub mod terms;
pub mod writer;

pub use compound::{CompoundFileReader, CompoundFileWriter};
pub use config::IndexWriterConfig;
pub use deleter::IndexFileDeleter;
pub use deletion_policy::{
    DeletionPolicy, IndexCommit, KeepAllCommitsPolicy, KeepOnlyLastCommitPolicy,
};
pub use directory_reader::DirectoryReader;
pub use document::{Document, Field, FieldOptions, StoredValue};
pub use merge_policy::{
    LogDocMergePolicy, MergePolicy, MergeSpecification, MergeState, NoMergePolicy, OneMerge,
};
pub use merge_scheduler::{ConcurrentMergeScheduler, MergeScheduler, SerialMergeScheduler};
pub use merger::SegmentMerger;
pub use multi_reader::MultiReader;
pub use reader::{
    FieldSelection, FieldSelector, FilterReader, IndexReader, LoadAll, ReaderOptions, TermDocs,
    TermEnum, TermPositions,
};
pub use segment_info::{SegmentInfo, SegmentInfos};
pub use segment_reader::SegmentReader;
pub use stored_fields::{StoredDocument, StoredFieldValue};
pub use term::Term;
pub use writer::{IndexWriter, WriterComponents};

/// A document number within a segment or an aggregate reader view.
pub type DocId = u32;
