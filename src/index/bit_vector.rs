//! A persistable bitmap used for per-segment deleted-document tracking.

use bit_vec::BitVec;

use crate::error::{KopisError, Result};
use crate::storage::{StructReader, StructWriter};
use crate::storage::traits::{Storage, StorageInput};

/// A fixed-size bitmap with a maintained set-bit count and a `.del` codec.
#[derive(Debug, Clone)]
pub struct BitVector {
    bits: BitVec,
    count: u32,
}

impl BitVector {
    /// Create a bitmap of `size` cleared bits.
    pub fn new(size: u32) -> Self {
        BitVector {
            bits: BitVec::from_elem(size as usize, false),
            count: 0,
        }
    }

    /// Number of bits in the map.
    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    /// True if the map holds no bits at all.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Get a bit.
    pub fn get(&self, index: u32) -> bool {
        self.bits.get(index as usize).unwrap_or(false)
    }

    /// Set a bit. Returns true if the bit was previously clear.
    pub fn set(&mut self, index: u32) -> bool {
        if self.get(index) {
            return false;
        }
        self.bits.set(index as usize, true);
        self.count += 1;
        true
    }

    /// Clear a bit. Returns true if the bit was previously set.
    pub fn clear(&mut self, index: u32) -> bool {
        if !self.get(index) {
            return false;
        }
        self.bits.set(index as usize, false);
        self.count -= 1;
        true
    }

    /// Write the bitmap to storage.
    pub fn write(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_vint(self.len())?;
        writer.write_vint(self.count)?;
        writer.write_raw(&self.bits.to_bytes())?;
        writer.close()
    }

    /// Read a bitmap from storage.
    pub fn read(input: Box<dyn StorageInput>) -> Result<Self> {
        let mut reader = StructReader::new(input)?;
        let size = reader.read_vint()?;
        let count = reader.read_vint()?;
        let byte_len = size.div_ceil(8) as usize;
        let bytes = reader.read_raw(byte_len)?;

        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(size as usize);

        let actual = bits.iter().filter(|b| *b).count() as u32;
        if actual != count {
            return Err(KopisError::corrupt(format!(
                "bitmap count mismatch: header says {count}, bitmap has {actual}"
            )));
        }

        Ok(BitVector { bits, count })
    }
}
