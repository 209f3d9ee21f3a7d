//! Segment metadata and the committed snapshot (`segments_N`) codec.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::error::{KopisError, Result};
use crate::index::filenames;
use crate::storage::traits::{Storage, is_not_found};
use crate::storage::{StructReader, StructWriter};

/// Current `segments_N` format version. Readers reject anything newer.
pub const SEGMENTS_FORMAT_CURRENT: u32 = 1;

const FLAG_COMPOUND: u8 = 0x01;
const FLAG_HAS_PROX: u8 = 0x02;
const FLAG_HAS_NORMS: u8 = 0x04;
const FLAG_HAS_VECTORS: u8 = 0x08;

/// How many times snapshot loading re-lists the directory before giving up
/// on a `segments_N` file that vanished between listing and open.
const OPEN_RETRIES: usize = 5;

/// Metadata for one persisted segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// The segment name, unique within the index (`_0`, `_1`, ...).
    pub name: String,
    /// Number of documents in the segment, deleted ones included.
    pub doc_count: u32,
    /// Generation of the deletes file; 0 means no deletions.
    pub del_gen: u64,
    /// Generation of the norms file; 0 means the base `.nrm` written at
    /// flush (when `has_norms`), a positive value a rewritten one.
    pub norm_gen: u64,
    /// Whether the segment's core files live in a compound container.
    pub use_compound: bool,
    /// Whether the postings carry position data.
    pub has_prox: bool,
    /// Whether any field stores norm bytes.
    pub has_norms: bool,
    /// Whether any field stores term vectors.
    pub has_vectors: bool,
    /// Offset of this segment's documents in a shared doc store, or -1 if
    /// the segment owns its stored-field and vector files.
    pub doc_store_offset: i64,
    /// Name of the segment owning the shared doc store.
    pub doc_store_segment: String,
    /// Whether the shared doc store is packed in a `.cfx` container.
    pub doc_store_compound: bool,
    /// Free-form provenance: who produced this segment and when.
    pub diagnostics: BTreeMap<String, String>,
}

impl SegmentInfo {
    /// Create metadata for a freshly written segment owning its doc store.
    pub fn new(name: &str, doc_count: u32) -> Self {
        SegmentInfo {
            name: name.to_string(),
            doc_count,
            del_gen: 0,
            norm_gen: 0,
            use_compound: false,
            has_prox: true,
            has_norms: true,
            has_vectors: false,
            doc_store_offset: -1,
            doc_store_segment: String::new(),
            doc_store_compound: false,
            diagnostics: BTreeMap::new(),
        }
    }

    /// True if the segment has any deleted documents.
    pub fn has_deletions(&self) -> bool {
        self.del_gen > 0
    }

    /// The deletes file name, if any.
    pub fn deletes_file(&self) -> Option<String> {
        self.has_deletions().then(|| {
            filenames::segment_gen_file_name(&self.name, filenames::DELETES_EXT, self.del_gen)
        })
    }

    /// The norms file name, if any field stores norms.
    pub fn norms_file(&self) -> Option<String> {
        self.has_norms.then(|| {
            filenames::segment_gen_file_name(&self.name, filenames::NORMS_EXT, self.norm_gen)
        })
    }

    /// Advance the deletes generation (called before writing a new
    /// deletes file).
    pub fn advance_del_gen(&mut self) {
        self.del_gen += 1;
    }

    /// Advance the norms generation.
    pub fn advance_norm_gen(&mut self) {
        // Generation 0 is the flush-time file; rewrites start at 1.
        self.norm_gen += 1;
    }

    /// True if this segment shares a doc store with sibling segments.
    pub fn shares_doc_store(&self) -> bool {
        self.doc_store_offset >= 0
    }

    /// Every file this segment depends on.
    pub fn files(&self) -> Vec<String> {
        let mut files = Vec::new();

        if self.use_compound {
            files.push(filenames::segment_file_name(
                &self.name,
                filenames::COMPOUND_EXT,
            ));
        } else {
            for ext in [
                filenames::FIELD_INFOS_EXT,
                filenames::TERMS_EXT,
                filenames::TERMS_INDEX_EXT,
                filenames::FREQ_EXT,
                filenames::PROX_EXT,
            ] {
                files.push(filenames::segment_file_name(&self.name, ext));
            }
        }

        // Stored fields and vectors: either shared, or part of the core.
        if self.shares_doc_store() {
            if self.doc_store_compound {
                files.push(filenames::segment_file_name(
                    &self.doc_store_segment,
                    filenames::COMPOUND_STORE_EXT,
                ));
            } else {
                files.push(filenames::segment_file_name(
                    &self.doc_store_segment,
                    filenames::FIELDS_EXT,
                ));
                files.push(filenames::segment_file_name(
                    &self.doc_store_segment,
                    filenames::FIELDS_INDEX_EXT,
                ));
                if self.has_vectors {
                    for ext in filenames::VECTOR_EXTENSIONS {
                        files.push(filenames::segment_file_name(&self.doc_store_segment, ext));
                    }
                }
            }
        } else if !self.use_compound {
            files.push(filenames::segment_file_name(
                &self.name,
                filenames::FIELDS_EXT,
            ));
            files.push(filenames::segment_file_name(
                &self.name,
                filenames::FIELDS_INDEX_EXT,
            ));
            if self.has_vectors {
                for ext in filenames::VECTOR_EXTENSIONS {
                    files.push(filenames::segment_file_name(&self.name, ext));
                }
            }
        }

        if let Some(name) = self.norms_file() {
            files.push(name);
        }
        if let Some(name) = self.deletes_file() {
            files.push(name);
        }

        files
    }

    fn flags(&self) -> u8 {
        let mut bits = 0;
        if self.use_compound {
            bits |= FLAG_COMPOUND;
        }
        if self.has_prox {
            bits |= FLAG_HAS_PROX;
        }
        if self.has_norms {
            bits |= FLAG_HAS_NORMS;
        }
        if self.has_vectors {
            bits |= FLAG_HAS_VECTORS;
        }
        bits
    }
}

/// An ordered snapshot of all live segments plus index-wide counters.
#[derive(Debug, Clone, Default)]
pub struct SegmentInfos {
    /// The segments, in document order.
    segments: Vec<SegmentInfo>,
    /// Monotonically increasing change counter, bumped on every commit.
    pub version: u64,
    /// Generation of the `segments_N` file this snapshot was read from or
    /// last written to; 0 before the first commit.
    pub generation: u64,
    /// Counter used to allocate fresh segment names.
    pub counter: u64,
    /// Free-form user data carried with every commit.
    pub user_data: BTreeMap<String, String>,
}

impl SegmentInfos {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        SegmentInfos::default()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True if there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iterate the segments in order.
    pub fn iter(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.segments.iter()
    }

    /// Get a segment by position.
    pub fn get(&self, index: usize) -> Option<&SegmentInfo> {
        self.segments.get(index)
    }

    /// Get a segment by name.
    pub fn by_name(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Mutable access to a segment by name.
    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut SegmentInfo> {
        self.segments.iter_mut().find(|s| s.name == name)
    }

    /// Append a segment.
    pub fn push(&mut self, info: SegmentInfo) {
        self.segments.push(info);
    }

    /// Remove a segment by name.
    pub fn remove(&mut self, name: &str) {
        self.segments.retain(|s| s.name != name);
    }

    /// Replace the contiguous run of `source_names` with `merged`.
    ///
    /// The sources must appear in order; the merged segment takes the place
    /// of the first one.
    pub fn replace_with_merged(&mut self, source_names: &[String], merged: SegmentInfo) {
        if let Some(first) = self
            .segments
            .iter()
            .position(|s| source_names.contains(&s.name))
        {
            self.segments.retain(|s| !source_names.contains(&s.name));
            self.segments.insert(first, merged);
        } else {
            self.segments.push(merged);
        }
    }

    /// Allocate a fresh segment name.
    pub fn next_segment_name(&mut self) -> String {
        let name = filenames::segment_name(self.counter);
        self.counter += 1;
        name
    }

    /// Total document count across segments, deletions included.
    pub fn total_doc_count(&self) -> u32 {
        self.segments.iter().map(|s| s.doc_count).sum()
    }

    /// The set of files this snapshot depends on (excluding the
    /// `segments_N` file itself).
    pub fn files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for segment in &self.segments {
            for file in segment.files() {
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
        files
    }

    /// The generation the next commit will write.
    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    /// Write this snapshot as a pending (unpublished) snapshot file for the
    /// given generation. Returns the pending file name.
    pub fn write_pending(&self, storage: &dyn Storage, generation: u64) -> Result<String> {
        let name = filenames::pending_segments_file_name(generation);
        let output = storage.create_output(&name)?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(SEGMENTS_FORMAT_CURRENT)?;
        writer.write_u64(self.version)?;
        writer.write_u64(self.counter)?;
        writer.write_vint(self.segments.len() as u32)?;

        for segment in &self.segments {
            writer.write_string(&segment.name)?;
            writer.write_vint(segment.doc_count)?;
            writer.write_vlong(segment.del_gen)?;
            writer.write_vlong(segment.norm_gen)?;
            writer.write_u8(segment.flags())?;
            if segment.shares_doc_store() {
                writer.write_vlong(segment.doc_store_offset as u64 + 1)?;
                writer.write_string(&segment.doc_store_segment)?;
                writer.write_u8(segment.doc_store_compound as u8)?;
            } else {
                writer.write_vlong(0)?;
            }
            writer.write_string_map(&segment.diagnostics)?;
        }

        writer.write_string_map(&self.user_data)?;
        writer.finish_checksum()?;
        writer.flush_and_sync()?;
        writer.close()?;
        Ok(name)
    }

    /// Publish a previously written pending snapshot file: rename it to its
    /// final name and update the redundant `segments.gen` pointer.
    pub fn publish_pending(storage: &dyn Storage, generation: u64) -> Result<String> {
        let pending = filenames::pending_segments_file_name(generation);
        let committed = filenames::segments_file_name(generation);
        storage.rename_file(&pending, &committed)?;

        if let Err(e) = write_segments_gen(storage, generation) {
            // The pointer file is an optimization; the directory listing
            // remains the source of truth.
            warn!("failed to update {}: {e}", filenames::SEGMENTS_GEN_NAME);
        }
        Ok(committed)
    }

    /// Read the snapshot stored in the given `segments_N` file.
    pub fn read_from(storage: &dyn Storage, file_name: &str) -> Result<Self> {
        let generation = filenames::parse_segments_generation(file_name).ok_or_else(|| {
            KopisError::corrupt(format!("not a snapshot file name: {file_name}"))
        })?;

        let input = storage.open_input(file_name)?;
        let mut reader = StructReader::new(input)?;

        let format = reader.read_u32()?;
        if format > SEGMENTS_FORMAT_CURRENT {
            return Err(KopisError::corrupt(format!(
                "snapshot format {format} is newer than supported {SEGMENTS_FORMAT_CURRENT}"
            )));
        }

        let version = reader.read_u64()?;
        let counter = reader.read_u64()?;
        let count = reader.read_vint()? as usize;

        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.read_string()?;
            let doc_count = reader.read_vint()?;
            let del_gen = reader.read_vlong()?;
            let norm_gen = reader.read_vlong()?;
            let flags = reader.read_u8()?;
            let doc_store_raw = reader.read_vlong()?;
            let (doc_store_offset, doc_store_segment, doc_store_compound) = if doc_store_raw > 0 {
                let segment = reader.read_string()?;
                let compound = reader.read_u8()? != 0;
                (doc_store_raw as i64 - 1, segment, compound)
            } else {
                (-1, String::new(), false)
            };
            let diagnostics = reader.read_string_map()?;

            segments.push(SegmentInfo {
                name,
                doc_count,
                del_gen,
                norm_gen,
                use_compound: flags & FLAG_COMPOUND != 0,
                has_prox: flags & FLAG_HAS_PROX != 0,
                has_norms: flags & FLAG_HAS_NORMS != 0,
                has_vectors: flags & FLAG_HAS_VECTORS != 0,
                doc_store_offset,
                doc_store_segment,
                doc_store_compound,
                diagnostics,
            });
        }

        let user_data = reader.read_string_map()?;
        reader.verify_checksum()?;

        Ok(SegmentInfos {
            segments,
            version,
            generation,
            counter,
            user_data,
        })
    }

    /// Find the latest committed generation, or `None` on a virgin
    /// directory.
    pub fn latest_generation(storage: &dyn Storage) -> Result<Option<u64>> {
        let mut latest: Option<u64> = None;
        for name in storage.list_files()? {
            if let Some(generation) = filenames::parse_segments_generation(&name) {
                latest = Some(latest.map_or(generation, |g| g.max(generation)));
            }
        }

        // Consult the redundant pointer too; on storage with lagging
        // listings it may know about a newer commit than the scan.
        if let Ok(generation) = read_segments_gen(storage)
            && generation > latest.unwrap_or(0)
        {
            latest = Some(generation);
        }

        Ok(latest)
    }

    /// Read the latest committed snapshot.
    ///
    /// A `segments_N` file that vanishes between directory listing and open
    /// (stale listing on networked storage, or a commit racing a delete) is
    /// retried with a fresh listing rather than surfaced as corruption.
    pub fn read_latest(storage: &dyn Storage) -> Result<Self> {
        let mut last_err: Option<KopisError> = None;

        for attempt in 0..OPEN_RETRIES {
            let Some(generation) = Self::latest_generation(storage)? else {
                return Err(KopisError::index("no snapshot file found in storage"));
            };

            let file_name = filenames::segments_file_name(generation);
            match Self::read_from(storage, &file_name) {
                Ok(infos) => return Ok(infos),
                Err(e) if is_not_found(&e) => {
                    debug!("snapshot {file_name} vanished, retrying (attempt {attempt})");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| KopisError::index("no snapshot file found in storage")))
    }
}

fn write_segments_gen(storage: &dyn Storage, generation: u64) -> Result<()> {
    let output = storage.create_output(filenames::SEGMENTS_GEN_NAME)?;
    let mut writer = StructWriter::new(output);
    // The generation twice; a torn write fails the equality check on read.
    writer.write_u64(generation)?;
    writer.write_u64(generation)?;
    writer.flush_and_sync()?;
    writer.close()
}

fn read_segments_gen(storage: &dyn Storage) -> Result<u64> {
    let input = storage.open_input(filenames::SEGMENTS_GEN_NAME)?;
    let mut reader = StructReader::new(input)?;
    let first = reader.read_u64()?;
    let second = reader.read_u64()?;
    if first != second {
        return Err(KopisError::corrupt("torn segments.gen file"));
    }
    Ok(first)
}
