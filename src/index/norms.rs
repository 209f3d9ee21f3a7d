//! Length-normalization bytes and the consolidated `.nrm` codec.
//!
//! Each indexed field stores one byte per document encoding
//! `boost / sqrt(token_count)` in a 3-bit-mantissa, 5-bit-exponent float
//! format. The decode table has 256 entries and is precomputed once.

use lazy_static::lazy_static;

use crate::error::{KopisError, Result};
use crate::storage::{StructReader, StructWriter};
use crate::storage::traits::{Storage, StorageInput};

const NORMS_MAGIC: &[u8; 3] = b"NRM";
const NORMS_FORMAT: u8 = 1;

lazy_static! {
    static ref NORM_TABLE: [f32; 256] = {
        let mut table = [0f32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = byte_to_float(i as u8);
        }
        table
    };
}

fn byte_to_float(b: u8) -> f32 {
    if b == 0 {
        return 0.0;
    }
    let mantissa = (b & 0x07) as u32;
    let exponent = (b >> 3) as u32;
    let bits = (mantissa << 21) | ((exponent + 48) << 24);
    f32::from_bits(bits)
}

/// Encode a float into the single norm byte.
pub fn encode_norm(value: f32) -> u8 {
    if value <= 0.0 {
        return 0;
    }
    let bits = value.to_bits();
    let mut mantissa = (bits >> 21) & 0x07;
    let mut exponent = (bits >> 24) as i32 - 48;
    if exponent > 31 {
        exponent = 31;
        mantissa = 7;
    }
    if exponent < 0 {
        // Underflows to the smallest positive norm rather than zero.
        exponent = 0;
        mantissa = 1;
    }
    ((exponent as u32) << 3 | mantissa) as u8
}

/// Decode a norm byte back into a float.
pub fn decode_norm(b: u8) -> f32 {
    NORM_TABLE[b as usize]
}

/// Compute the norm byte for a field occurrence.
pub fn field_norm(boost: f32, token_count: usize) -> u8 {
    if token_count == 0 {
        return encode_norm(boost);
    }
    encode_norm(boost / (token_count as f32).sqrt())
}

/// Per-field norm byte arrays for one segment, in field-number order.
#[derive(Debug, Clone, Default)]
pub struct Norms {
    /// `(field_number, one byte per document)` pairs.
    entries: Vec<(u32, Vec<u8>)>,
}

impl Norms {
    /// Create an empty norms set.
    pub fn new() -> Self {
        Norms::default()
    }

    /// Add a field's norm bytes. Fields must be added in number order.
    pub fn push(&mut self, field_number: u32, bytes: Vec<u8>) {
        self.entries.push((field_number, bytes));
    }

    /// Get the norm bytes for a field number.
    pub fn get(&self, field_number: u32) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| *n == field_number)
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Replace the norm bytes for a field number.
    pub fn replace(&mut self, field_number: u32, bytes: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == field_number) {
            entry.1 = bytes;
        } else {
            self.entries.push((field_number, bytes));
            self.entries.sort_by_key(|(n, _)| *n);
        }
    }

    /// Write the consolidated norms file.
    ///
    /// Layout: magic, format byte, vint field count, then per field the
    /// field number (vint) followed by `doc_count` raw bytes.
    pub fn write(&self, storage: &dyn Storage, name: &str, doc_count: u32) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_raw(NORMS_MAGIC)?;
        writer.write_u8(NORMS_FORMAT)?;
        writer.write_vint(self.entries.len() as u32)?;
        for (number, bytes) in &self.entries {
            debug_assert_eq!(bytes.len(), doc_count as usize);
            writer.write_vint(*number)?;
            writer.write_raw(bytes)?;
        }
        writer.close()
    }

    /// Read a consolidated norms file.
    pub fn read(input: Box<dyn StorageInput>, doc_count: u32) -> Result<Self> {
        let mut reader = StructReader::new(input)?;
        let magic = reader.read_raw(3)?;
        if magic != NORMS_MAGIC {
            return Err(KopisError::corrupt("not a norms file"));
        }
        let format = reader.read_u8()?;
        if format > NORMS_FORMAT {
            return Err(KopisError::corrupt(format!(
                "norms format {format} is newer than supported {NORMS_FORMAT}"
            )));
        }
        let count = reader.read_vint()? as usize;
        let mut norms = Norms::new();
        for _ in 0..count {
            let number = reader.read_vint()?;
            let bytes = reader.read_raw(doc_count as usize)?;
            norms.push(number, bytes);
        }
        Ok(norms)
    }

    /// Synthesize an all-ones array for a field that stores no norms.
    ///
    /// Behind `synthesize_missing_norms` in the writer configuration;
    /// callers that want "no norms" as `None` leave the flag off.
    pub fn synthetic(doc_count: u32) -> Vec<u8> {
        vec![encode_norm(1.0); doc_count as usize]
    }
}
