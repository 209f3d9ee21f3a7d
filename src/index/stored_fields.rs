//! Stored field values (`.fdt`) and the per-document offset index (`.fdx`).
//!
//! The index file is a flat array of 8-byte offsets, one per document, so a
//! document's record is found with a single seek. A record holds the stored
//! fields in field-number order: a count, then per field the number, a flag
//! byte and the length-prefixed value bytes.
//!
//! Retrieval honors a [`FieldSelector`] so callers can pay only for the
//! fields they need: fully decoded, raw for merging, lazily deferred,
//! size-only, or skipped.

use std::io::SeekFrom;

use parking_lot::Mutex;

use crate::error::{KopisError, Result};
use crate::index::DocId;
use crate::index::document::StoredValue;
use crate::index::field_infos::FieldInfos;
use crate::index::filenames;
use crate::index::reader::{FieldSelection, FieldSelector};
use crate::storage::traits::{Storage, StorageInput, StorageOutput};
use crate::storage::{StructReader, StructWriter};

const FIELD_IS_BINARY: u8 = 0x01;

/// One stored field, encoded and ready to write.
#[derive(Debug, Clone)]
pub struct StoredFieldEntry {
    /// The field number in the segment's field table.
    pub field_number: u32,
    /// True for opaque bytes, false for UTF-8 text.
    pub binary: bool,
    /// The value bytes.
    pub bytes: Vec<u8>,
}

/// Writes the `.fdt` and `.fdx` files for a segment.
pub struct FieldsWriter {
    fdt: StructWriter<Box<dyn StorageOutput>>,
    fdx: StructWriter<Box<dyn StorageOutput>>,
    doc_count: u32,
}

impl FieldsWriter {
    /// Create the stored-field outputs for a segment.
    pub fn new(storage: &dyn Storage, segment: &str) -> Result<Self> {
        let fdt = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::FIELDS_EXT,
        ))?;
        let fdx = storage.create_output(&filenames::segment_file_name(
            segment,
            filenames::FIELDS_INDEX_EXT,
        ))?;
        Ok(FieldsWriter {
            fdt: StructWriter::new(fdt),
            fdx: StructWriter::new(fdx),
            doc_count: 0,
        })
    }

    /// Append one document's stored fields. Fields must be in field-number
    /// order; a document without stored fields writes an empty record.
    pub fn add_document(&mut self, fields: &[StoredFieldEntry]) -> Result<()> {
        self.fdx.write_u64(self.fdt.position())?;
        self.fdt.write_vint(fields.len() as u32)?;
        for field in fields {
            self.fdt.write_vint(field.field_number)?;
            self.fdt
                .write_u8(if field.binary { FIELD_IS_BINARY } else { 0 })?;
            self.fdt.write_bytes(&field.bytes)?;
        }
        self.doc_count += 1;
        Ok(())
    }

    /// Number of documents written so far.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Close both files.
    pub fn close(self) -> Result<()> {
        self.fdt.close()?;
        self.fdx.close()
    }
}

/// A stored field value materialized per the caller's selector.
pub enum StoredFieldValue {
    /// Fully decoded.
    Full(StoredValue),
    /// The raw stored bytes, undecoded; produced for merging.
    Raw {
        /// The on-disk binary flag, carried through the merge.
        binary: bool,
        /// The value bytes exactly as stored.
        bytes: Vec<u8>,
    },
    /// Decoding deferred until first access.
    Lazy(LazyField),
    /// Only the value's size in bytes.
    Size(u32),
}

impl StoredFieldValue {
    /// The text form, decoding a lazy value if necessary.
    pub fn text(&self) -> Result<Option<String>> {
        match self {
            StoredFieldValue::Full(StoredValue::Text(s)) => Ok(Some(s.clone())),
            StoredFieldValue::Lazy(lazy) => match lazy.load()? {
                StoredValue::Text(s) => Ok(Some(s)),
                StoredValue::Binary(_) => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Decode into a [`StoredValue`]; size-only values cannot be decoded.
    pub fn load(&self) -> Result<StoredValue> {
        match self {
            StoredFieldValue::Full(value) => Ok(value.clone()),
            StoredFieldValue::Raw { binary, bytes } => decode_value(*binary, bytes.clone()),
            StoredFieldValue::Lazy(lazy) => lazy.load(),
            StoredFieldValue::Size(_) => Err(KopisError::invalid_operation(
                "field was loaded size-only",
            )),
        }
    }

    /// The value's size in bytes, without decoding.
    pub fn byte_len(&self) -> u32 {
        match self {
            StoredFieldValue::Full(value) => value.byte_len() as u32,
            StoredFieldValue::Raw { bytes, .. } => bytes.len() as u32,
            StoredFieldValue::Lazy(lazy) => lazy.length,
            StoredFieldValue::Size(size) => *size,
        }
    }
}

impl std::fmt::Debug for StoredFieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredFieldValue::Full(value) => f.debug_tuple("Full").field(value).finish(),
            StoredFieldValue::Raw { binary, bytes } => f
                .debug_struct("Raw")
                .field("binary", binary)
                .field("len", &bytes.len())
                .finish(),
            StoredFieldValue::Lazy(lazy) => f
                .debug_struct("Lazy")
                .field("offset", &lazy.offset)
                .field("len", &lazy.length)
                .finish(),
            StoredFieldValue::Size(size) => f.debug_tuple("Size").field(size).finish(),
        }
    }
}

/// A stored value whose decoding was deferred.
///
/// The handle carries its own clone of the data stream, so it stays valid
/// after the reader that produced it moves on (or is dropped).
pub struct LazyField {
    input: Mutex<Box<dyn StorageInput>>,
    offset: u64,
    length: u32,
    binary: bool,
}

impl LazyField {
    /// Read and decode the value.
    pub fn load(&self) -> Result<StoredValue> {
        let mut input = self.input.lock();
        input.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = vec![0u8; self.length as usize];
        std::io::Read::read_exact(&mut *input, &mut bytes)?;
        decode_value(self.binary, bytes)
    }
}

/// One retrieved stored field.
#[derive(Debug)]
pub struct StoredField {
    /// The field name.
    pub name: String,
    /// The materialized value.
    pub value: StoredFieldValue,
}

/// The stored fields of one document, as retrieved by a reader.
#[derive(Debug, Default)]
pub struct StoredDocument {
    /// The fields, in stored order. Skipped fields are absent.
    pub fields: Vec<StoredField>,
}

impl StoredDocument {
    /// The first value stored under the given name.
    pub fn get(&self, name: &str) -> Option<&StoredFieldValue> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    /// Convenience: the text of the named field, decoding lazies.
    pub fn text(&self, name: &str) -> Result<Option<String>> {
        match self.get(name) {
            Some(value) => value.text(),
            None => Ok(None),
        }
    }
}

fn decode_value(binary: bool, bytes: Vec<u8>) -> Result<StoredValue> {
    if binary {
        Ok(StoredValue::Binary(bytes))
    } else {
        String::from_utf8(bytes)
            .map(StoredValue::Text)
            .map_err(|e| KopisError::corrupt(format!("invalid stored text: {e}")))
    }
}

/// Reads the stored fields of one segment.
///
/// Both files are opened once; retrievals and lazy values read through
/// private clones of the held handles.
pub struct FieldsReader {
    fdt: Mutex<Box<dyn StorageInput>>,
    fdx: Mutex<Box<dyn StorageInput>>,
    field_infos: std::sync::Arc<FieldInfos>,
    doc_count: u32,
}

impl FieldsReader {
    /// Open the stored-field files of a segment.
    pub fn open(
        source: std::sync::Arc<dyn Storage>,
        segment: &str,
        field_infos: std::sync::Arc<FieldInfos>,
    ) -> Result<Self> {
        let fdt_name = filenames::segment_file_name(segment, filenames::FIELDS_EXT);
        let fdx_name = filenames::segment_file_name(segment, filenames::FIELDS_INDEX_EXT);
        let fdt = source.open_input(&fdt_name)?;
        let fdx = source.open_input(&fdx_name)?;
        let doc_count = (fdx.size()? / 8) as u32;
        Ok(FieldsReader {
            fdt: Mutex::new(fdt),
            fdx: Mutex::new(fdx),
            field_infos,
            doc_count,
        })
    }

    /// Number of documents with a stored-field record.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Retrieve one document's stored fields per the selector.
    pub fn get(&self, doc: DocId, selector: &dyn FieldSelector) -> Result<StoredDocument> {
        if doc >= self.doc_count {
            return Err(KopisError::invalid_operation(format!(
                "document {doc} out of range (doc count {})",
                self.doc_count
            )));
        }

        let offset = {
            let mut fdx = self.fdx.lock();
            fdx.seek(SeekFrom::Start(doc as u64 * 8))?;
            let mut slot = [0u8; 8];
            std::io::Read::read_exact(&mut **fdx, &mut slot)?;
            u64::from_le_bytes(slot)
        };

        // Read through a private clone so concurrent retrievals never fight
        // over one stream position.
        let mut reader = StructReader::new(self.fdt.lock().clone_input()?)?;
        reader.seek_to(offset)?;

        let count = reader.read_vint()? as usize;
        let mut document = StoredDocument::default();
        for _ in 0..count {
            let field_number = reader.read_vint()?;
            let flags = reader.read_u8()?;
            let binary = flags & FIELD_IS_BINARY != 0;
            let name = self
                .field_infos
                .by_number(field_number)
                .map(|f| f.name.clone())
                .ok_or_else(|| {
                    KopisError::corrupt(format!(
                        "stored field references unknown field {field_number}"
                    ))
                })?;

            let value = match selector.select(&name) {
                FieldSelection::Load => {
                    let bytes = reader.read_bytes()?;
                    StoredFieldValue::Full(decode_value(binary, bytes)?)
                }
                FieldSelection::LoadForMerge => {
                    let bytes = reader.read_bytes()?;
                    StoredFieldValue::Raw { binary, bytes }
                }
                FieldSelection::Lazy => {
                    let length = reader.read_vint()?;
                    let value_offset = reader.position();
                    reader.seek_to(value_offset + length as u64)?;
                    let input = self.fdt.lock().clone_input()?;
                    StoredFieldValue::Lazy(LazyField {
                        input: Mutex::new(input),
                        offset: value_offset,
                        length,
                        binary,
                    })
                }
                FieldSelection::SizeOnly => {
                    let length = reader.read_vint()?;
                    reader.seek_to(reader.position() + length as u64)?;
                    StoredFieldValue::Size(length)
                }
                FieldSelection::Skip => {
                    let length = reader.read_vint()?;
                    reader.seek_to(reader.position() + length as u64)?;
                    continue;
                }
            };
            document.fields.push(StoredField { name, value });
        }
        Ok(document)
    }
}
