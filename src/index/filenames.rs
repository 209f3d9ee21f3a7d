//! Index file naming.
//!
//! Every file an index owns follows one of three shapes: a per-segment file
//! `_<seg>.<ext>` (optionally with an update generation, `_<seg>_<gen>.<ext>`),
//! a snapshot file `segments_<gen>` (or its in-flight `pending_` form), or
//! one of the fixed names (`segments.gen`, `write.lock`). The deleter's
//! directory scans recognize exactly this grammar and nothing else.

use lazy_static::lazy_static;
use regex::Regex;

/// Prefix of committed snapshot files.
pub const SEGMENTS_PREFIX: &str = "segments_";

/// Prefix of a prepared-but-unpublished snapshot file.
pub const PENDING_SEGMENTS_PREFIX: &str = "pending_segments_";

/// Redundant pointer to the current snapshot generation.
pub const SEGMENTS_GEN_NAME: &str = "segments.gen";

/// The single-writer lock name.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Compound container for a segment's core files.
pub const COMPOUND_EXT: &str = "cfs";
/// Compound container for a shared doc store.
pub const COMPOUND_STORE_EXT: &str = "cfx";
/// Field-info table.
pub const FIELD_INFOS_EXT: &str = "fnm";
/// Stored field values.
pub const FIELDS_EXT: &str = "fdt";
/// Stored field index.
pub const FIELDS_INDEX_EXT: &str = "fdx";
/// Term dictionary.
pub const TERMS_EXT: &str = "tis";
/// Term dictionary index.
pub const TERMS_INDEX_EXT: &str = "tii";
/// Document frequency postings.
pub const FREQ_EXT: &str = "frq";
/// Position postings.
pub const PROX_EXT: &str = "prx";
/// Consolidated norms.
pub const NORMS_EXT: &str = "nrm";
/// Deleted-document bitmap.
pub const DELETES_EXT: &str = "del";
/// Term-vector index.
pub const VECTORS_INDEX_EXT: &str = "tvx";
/// Term-vector document directory.
pub const VECTORS_DOC_EXT: &str = "tvd";
/// Term-vector field data.
pub const VECTORS_FIELDS_EXT: &str = "tvf";

/// Extensions of the files a freshly flushed non-compound segment consists
/// of, in the order the flush writes them.
pub const SEGMENT_CORE_EXTENSIONS: &[&str] = &[
    FIELD_INFOS_EXT,
    FIELDS_EXT,
    FIELDS_INDEX_EXT,
    TERMS_EXT,
    TERMS_INDEX_EXT,
    FREQ_EXT,
    PROX_EXT,
];

/// Extensions of the term-vector files.
pub const VECTOR_EXTENSIONS: &[&str] = &[VECTORS_INDEX_EXT, VECTORS_DOC_EXT, VECTORS_FIELDS_EXT];

/// All extensions a segment file may carry.
pub const ALL_EXTENSIONS: &[&str] = &[
    COMPOUND_EXT,
    COMPOUND_STORE_EXT,
    FIELD_INFOS_EXT,
    FIELDS_EXT,
    FIELDS_INDEX_EXT,
    TERMS_EXT,
    TERMS_INDEX_EXT,
    FREQ_EXT,
    PROX_EXT,
    NORMS_EXT,
    DELETES_EXT,
    VECTORS_INDEX_EXT,
    VECTORS_DOC_EXT,
    VECTORS_FIELDS_EXT,
];

lazy_static! {
    static ref SEGMENT_FILE_RE: Regex = Regex::new(
        r"^_[0-9]+(_[0-9]+)?\.(cfs|cfx|fnm|fdt|fdx|tis|tii|frq|prx|nrm|del|tvx|tvd|tvf)$"
    )
    .unwrap();
    static ref SEGMENTS_FILE_RE: Regex = Regex::new(r"^segments_[0-9]+$").unwrap();
    static ref PENDING_SEGMENTS_FILE_RE: Regex = Regex::new(r"^pending_segments_[0-9]+$").unwrap();
}

/// Build the name of a committed snapshot file for the given generation.
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}{generation}")
}

/// Build the name of an in-flight (prepared) snapshot file.
pub fn pending_segments_file_name(generation: u64) -> String {
    format!("{PENDING_SEGMENTS_PREFIX}{generation}")
}

/// Extract the generation from a `segments_N` file name.
pub fn parse_segments_generation(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENTS_PREFIX)?.parse().ok()
}

/// Build a per-segment file name: `_<seg>.<ext>`.
pub fn segment_file_name(segment: &str, ext: &str) -> String {
    format!("{segment}.{ext}")
}

/// Build a generational per-segment file name: `_<seg>_<gen>.<ext>`.
///
/// Used for files rewritten after the segment was sealed (deletes, norms).
pub fn segment_gen_file_name(segment: &str, ext: &str, generation: u64) -> String {
    if generation == 0 {
        segment_file_name(segment, ext)
    } else {
        format!("{segment}_{generation}.{ext}")
    }
}

/// Build a fresh segment name from a counter value.
pub fn segment_name(counter: u64) -> String {
    format!("_{counter}")
}

/// True if the name belongs to the recognized index-file grammar.
///
/// `write.lock` is deliberately excluded; the deleter must never touch it.
pub fn is_index_file(name: &str) -> bool {
    name == SEGMENTS_GEN_NAME
        || SEGMENTS_FILE_RE.is_match(name)
        || PENDING_SEGMENTS_FILE_RE.is_match(name)
        || SEGMENT_FILE_RE.is_match(name)
}

/// True if the name is a per-segment file of the given segment.
pub fn belongs_to_segment(name: &str, segment: &str) -> bool {
    if !SEGMENT_FILE_RE.is_match(name) {
        return false;
    }
    let stem = match name.rfind('.') {
        Some(dot) => &name[..dot],
        None => return false,
    };
    stem == segment
        || stem
            .strip_prefix(segment)
            .is_some_and(|rest| rest.starts_with('_') && rest[1..].chars().all(|c| c.is_ascii_digit()))
}
