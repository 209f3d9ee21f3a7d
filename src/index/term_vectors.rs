//! Per-document term vectors (`.tvx`, `.tvd`, `.tvf`).
//!
//! The index file holds one 8-byte pointer per document into the document
//! directory (`.tvd`), which lists the vectorized fields of the document and
//! where each field's data lives in `.tvf`. The field data carries the
//! field's terms (prefix-compressed, in term order) with frequencies and,
//! per the field's flags, positions and character offsets.

use std::io::SeekFrom;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KopisError, Result};
use crate::index::DocId;
use crate::index::field_infos::FieldInfos;
use crate::index::filenames;
use crate::storage::traits::{Storage, StorageInput, StorageOutput};
use crate::storage::{StructReader, StructWriter};

const STORE_POSITIONS: u8 = 0x01;
const STORE_OFFSETS: u8 = 0x02;

/// One term of a stored vector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TermVectorEntry {
    /// The term text.
    pub text: String,
    /// Occurrence count within the document.
    pub freq: u32,
    /// Positions, when the field stores them; one per occurrence.
    pub positions: Vec<u32>,
    /// Character offsets, when the field stores them; one per occurrence.
    pub offsets: Vec<(u32, u32)>,
}

/// The stored vector of one field of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermVector {
    /// The field name.
    pub field: String,
    /// The field's terms, in term order.
    pub entries: Vec<TermVectorEntry>,
}

/// A field's vector data, numbered and flagged for writing.
#[derive(Debug, Clone)]
pub struct TermVectorFieldData {
    /// The field number in the segment's field table.
    pub field_number: u32,
    /// Store per-occurrence positions.
    pub store_positions: bool,
    /// Store per-occurrence character offsets.
    pub store_offsets: bool,
    /// The terms, in term order.
    pub entries: Vec<TermVectorEntry>,
}

/// Writes the term-vector files for a segment.
pub struct TermVectorsWriter {
    tvx: StructWriter<Box<dyn StorageOutput>>,
    tvd: StructWriter<Box<dyn StorageOutput>>,
    tvf: StructWriter<Box<dyn StorageOutput>>,
    doc_count: u32,
}

impl TermVectorsWriter {
    /// Create the vector outputs for a segment.
    pub fn new(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let tvx = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::VECTORS_INDEX_EXT,
        ))?;
        let tvd = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::VECTORS_DOC_EXT,
        ))?;
        let tvf = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::VECTORS_FIELDS_EXT,
        ))?;
        Ok(TermVectorsWriter {
            tvx: StructWriter::new(tvx),
            tvd: StructWriter::new(tvd),
            tvf: StructWriter::new(tvf),
            doc_count: 0,
        })
    }

    /// Append one document's vectors. Fields must be in field-number order;
    /// a document without vectorized fields writes an empty directory entry.
    pub fn add_document(&mut self, fields: &[TermVectorFieldData]) -> Result<()> {
        self.tvx.write_u64(self.tvd.position())?;
        self.tvd.write_vint(fields.len() as u32)?;
        for field in fields {
            self.tvd.write_vint(field.field_number)?;
            self.tvd.write_vlong(self.tvf.position())?;
            self.write_field(field)?;
        }
        self.doc_count += 1;
        Ok(())
    }

    fn write_field(&mut self, field: &TermVectorFieldData) -> Result<()> {
        let mut flags = 0u8;
        if field.store_positions {
            flags |= STORE_POSITIONS;
        }
        if field.store_offsets {
            flags |= STORE_OFFSETS;
        }
        self.tvf.write_u8(flags)?;
        self.tvf.write_vint(field.entries.len() as u32)?;

        let mut last_text: &[u8] = &[];
        for entry in &field.entries {
            let text = entry.text.as_bytes();
            let prefix = last_text
                .iter()
                .zip(text)
                .take_while(|(a, b)| a == b)
                .count();
            self.tvf.write_vint(prefix as u32)?;
            self.tvf.write_bytes(&text[prefix..])?;
            self.tvf.write_vint(entry.freq)?;

            if field.store_positions {
                debug_assert_eq!(entry.positions.len(), entry.freq as usize);
                let mut last = 0u32;
                for &position in &entry.positions {
                    self.tvf.write_vint(position - last)?;
                    last = position;
                }
            }
            if field.store_offsets {
                debug_assert_eq!(entry.offsets.len(), entry.freq as usize);
                let mut last_start = 0u32;
                for &(start, end) in &entry.offsets {
                    self.tvf.write_vint(start - last_start)?;
                    self.tvf.write_vint(end - start)?;
                    last_start = start;
                }
            }
            last_text = text;
        }
        Ok(())
    }

    /// Number of documents written so far.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Close all three files.
    pub fn close(self) -> Result<()> {
        self.tvx.close()?;
        self.tvd.close()?;
        self.tvf.close()
    }
}

/// Reads the term vectors of one segment.
pub struct TermVectorsReader {
    tvx: Mutex<Box<dyn StorageInput>>,
    tvd: Mutex<Box<dyn StorageInput>>,
    tvf: Mutex<Box<dyn StorageInput>>,
    field_infos: Arc<FieldInfos>,
    doc_count: u32,
}

impl TermVectorsReader {
    /// Open the vector files of a segment.
    pub fn open(
        source: Arc<dyn Storage>,
        segment: &str,
        field_infos: Arc<FieldInfos>,
    ) -> Result<Self> {
        let tvx = source.open_input(&filenames::segment_file_name(
            segment,
            filenames::VECTORS_INDEX_EXT,
        ))?;
        let tvd = source.open_input(&filenames::segment_file_name(
            segment,
            filenames::VECTORS_DOC_EXT,
        ))?;
        let tvf = source.open_input(&filenames::segment_file_name(
            segment,
            filenames::VECTORS_FIELDS_EXT,
        ))?;
        let doc_count = (tvx.size()? / 8) as u32;
        Ok(TermVectorsReader {
            tvx: Mutex::new(tvx),
            tvd: Mutex::new(tvd),
            tvf: Mutex::new(tvf),
            field_infos,
            doc_count,
        })
    }

    /// Number of documents covered by the vector files.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Retrieve one document's vectors, in field-number order.
    pub fn get(&self, doc: DocId) -> Result<Vec<TermVector>> {
        if doc >= self.doc_count {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.doc_count
            )));
        }

        let tvd_offset = {
            let mut tvx = self.tvx.lock();
            tvx.seek(SeekFrom::Start(doc as u64 * 8))?;
            let mut slot = [0u8; 8];
            std::io::Read::read_exact(&mut **tvx, &mut slot)?;
            u64::from_le_bytes(slot)
        };

        let mut tvd = StructReader::new(self.tvd.lock().clone_input()?)?;
        tvd.seek_to(tvd_offset)?;
        let field_count = tvd.read_vint()? as usize;
        let mut directory = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let field_number = tvd.read_vint()?;
            let tvf_offset = tvd.read_vlong()?;
            directory.push((field_number, tvf_offset));
        }

        let mut tvf = StructReader::new(self.tvf.lock().clone_input()?)?;
        let mut vectors = Vec::with_capacity(field_count);
        for (field_number, tvf_offset) in directory {
            let field = self
                .field_infos
                .by_number(field_number)
                .map(|f| f.name.clone())
                .ok_or_else(|| {
                    KopisError::corrupt(format!(
                        "term vector references unknown field {field_number}"
                    ))
                })?;
            tvf.seek_to(tvf_offset)?;
            vectors.push(TermVector {
                field,
                entries: read_field_entries(&mut tvf)?,
            });
        }
        Ok(vectors)
    }
}

fn read_field_entries(
    tvf: &mut StructReader<Box<dyn StorageInput>>,
) -> Result<Vec<TermVectorEntry>> {
    let flags = tvf.read_u8()?;
    let has_positions = flags & STORE_POSITIONS != 0;
    let has_offsets = flags & STORE_OFFSETS != 0;
    let term_count = tvf.read_vint()? as usize;

    let mut entries = Vec::with_capacity(term_count);
    let mut last_text: Vec<u8> = Vec::new();
    for _ in 0..term_count {
        let prefix = tvf.read_vint()? as usize;
        let suffix = tvf.read_bytes()?;
        if prefix > last_text.len() {
            return Err(KopisError::corrupt(
                "vector term prefix longer than previous term",
            ));
        }
        let mut text = last_text[..prefix].to_vec();
        text.extend_from_slice(&suffix);
        let freq = tvf.read_vint()?;

        let mut positions = Vec::new();
        if has_positions {
            let mut last = 0u32;
            for _ in 0..freq {
                last += tvf.read_vint()?;
                positions.push(last);
            }
        }
        let mut offsets = Vec::new();
        if has_offsets {
            let mut last_start = 0u32;
            for _ in 0..freq {
                let start = last_start + tvf.read_vint()?;
                let end = start + tvf.read_vint()?;
                offsets.push((start, end));
                last_start = start;
            }
        }

        entries.push(TermVectorEntry {
            text: String::from_utf8(text.clone())
                .map_err(|e| KopisError::corrupt(format!("invalid vector term text: {e}")))?,
            freq,
            positions,
            offsets,
        });
        last_text = text;
    }
    Ok(entries)
}
