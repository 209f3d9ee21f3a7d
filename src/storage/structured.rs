//! Structured file I/O for the binary index formats.
//!
//! [`StructWriter`] and [`StructReader`] layer the primitive encodings every
//! index file is built from over raw storage streams: fixed-width
//! little-endian integers, vint/vlong variable-length integers,
//! length-prefixed UTF-8 strings, string maps, and raw byte runs. A running
//! CRC32 covers everything written/read so far; the snapshot codec uses it
//! to detect torn or corrupted commit files.

use std::collections::BTreeMap;
use std::io::SeekFrom;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{KopisError, Result};
use crate::storage::traits::{StorageInput, StorageOutput};

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    checksum: Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            checksum: Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.checksum.update(&[value]);
        self.position += 1;
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write an i32 value (little-endian).
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.writer.write_i32::<LittleEndian>(value)?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write a 32-bit variable-length integer.
    pub fn write_vint(&mut self, value: u32) -> Result<()> {
        let encoded = crate::util::varint::encode_u32(value);
        self.writer.write_all(&encoded)?;
        self.checksum.update(&encoded);
        self.position += encoded.len() as u64;
        Ok(())
    }

    /// Write a 64-bit variable-length integer.
    pub fn write_vlong(&mut self, value: u64) -> Result<()> {
        let encoded = crate::util::varint::encode_u64(value);
        self.writer.write_all(&encoded)?;
        self.checksum.update(&encoded);
        self.position += encoded.len() as u64;
        Ok(())
    }

    /// Write a string with vint length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        self.write_vint(bytes.len() as u32)?;
        self.writer.write_all(bytes)?;
        self.checksum.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Write raw bytes with vint length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_vint(value.len() as u32)?;
        self.writer.write_all(value)?;
        self.checksum.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.checksum.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write a string-to-string map, keys in sorted order.
    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_vint(map.len() as u32)?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reposition the underlying output.
    ///
    /// Used to patch previously reserved placeholder slots. Invalidates the
    /// running checksum; codecs that finish with [`finish_checksum`] must
    /// not seek.
    ///
    /// [`finish_checksum`]: StructWriter::finish_checksum
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.writer.seek(SeekFrom::Start(pos))?;
        self.position = pos;
        Ok(())
    }

    /// Write the accumulated CRC32 at the current position.
    pub fn finish_checksum(&mut self) -> Result<()> {
        let digest = self.checksum.clone().finalize();
        self.writer.write_u32::<LittleEndian>(digest)?;
        self.position += 4;
        Ok(())
    }

    /// Flush and sync without closing.
    pub fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush_and_sync()
    }

    /// Flush and close the writer.
    pub fn close(mut self) -> Result<()> {
        self.writer.close()
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    checksum: Hasher,
    position: u64,
    file_size: u64,
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        Ok(StructReader {
            reader,
            checksum: Hasher::new(),
            position: 0,
            file_size,
        })
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.checksum.update(&[value]);
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 4;
        Ok(value)
    }

    /// Read an i32 value (little-endian).
    pub fn read_i32(&mut self) -> Result<i32> {
        let value = self.reader.read_i32::<LittleEndian>()?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.checksum.update(&value.to_le_bytes());
        self.position += 8;
        Ok(value)
    }

    /// Read a 32-bit variable-length integer.
    pub fn read_vint(&mut self) -> Result<u32> {
        let mut result = 0u32;
        let mut shift = 0;
        loop {
            let byte = self.reader.read_u8()?;
            self.checksum.update(&[byte]);
            self.position += 1;

            if shift >= 32 {
                return Err(KopisError::corrupt("vint overflow"));
            }
            result |= ((byte & 0x7F) as u32) << shift;
            if (byte & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a 64-bit variable-length integer.
    pub fn read_vlong(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.reader.read_u8()?;
            self.checksum.update(&[byte]);
            self.position += 1;

            if shift >= 64 {
                return Err(KopisError::corrupt("vlong overflow"));
            }
            result |= ((byte & 0x7F) as u64) << shift;
            if (byte & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a string with vint length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let length = self.read_vint()? as usize;
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes)?;
        self.checksum.update(&bytes);
        self.position += length as u64;

        String::from_utf8(bytes).map_err(|e| KopisError::corrupt(format!("invalid UTF-8: {e}")))
    }

    /// Read bytes with vint length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_vint()? as usize;
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes)?;
        self.checksum.update(&bytes);
        self.position += length as u64;
        Ok(bytes)
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes)?;
        self.checksum.update(&bytes);
        self.position += length as u64;
        Ok(bytes)
    }

    /// Read a string-to-string map.
    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let length = self.read_vint()? as usize;
        let mut map = BTreeMap::new();
        for _ in 0..length {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Reposition the reader. Invalidates the running checksum.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(pos))?;
        self.position = pos;
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get file size.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Verify the trailing CRC32 against everything read so far.
    pub fn verify_checksum(&mut self) -> Result<()> {
        let expected = self.checksum.clone().finalize();
        let stored = self.reader.read_u32::<LittleEndian>()?;
        self.position += 4;
        if stored != expected {
            return Err(KopisError::corrupt(format!(
                "checksum mismatch: stored {stored:#010x}, computed {expected:#010x}"
            )));
        }
        Ok(())
    }

    /// Close the reader.
    pub fn close(mut self) -> Result<()> {
        self.reader.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};

    #[test]
    fn test_struct_writer_reader() {
        let storage = MemoryStorage::new_default();

        {
            let output = storage.create_output("test.struct").unwrap();
            let mut writer = StructWriter::new(output);

            writer.write_u8(42).unwrap();
            writer.write_u32(5678).unwrap();
            writer.write_i32(-9).unwrap();
            writer.write_u64(9876543210).unwrap();
            writer.write_vint(12345).unwrap();
            writer.write_vlong(1 << 40).unwrap();
            writer.write_string("Hello, World!").unwrap();
            writer.write_bytes(b"binary data").unwrap();
            writer.close().unwrap();
        }

        {
            let input = storage.open_input("test.struct").unwrap();
            let mut reader = StructReader::new(input).unwrap();

            assert_eq!(reader.read_u8().unwrap(), 42);
            assert_eq!(reader.read_u32().unwrap(), 5678);
            assert_eq!(reader.read_i32().unwrap(), -9);
            assert_eq!(reader.read_u64().unwrap(), 9876543210);
            assert_eq!(reader.read_vint().unwrap(), 12345);
            assert_eq!(reader.read_vlong().unwrap(), 1 << 40);
            assert_eq!(reader.read_string().unwrap(), "Hello, World!");
            assert_eq!(reader.read_bytes().unwrap(), b"binary data");
        }
    }

    #[test]
    fn test_checksum_round_trip() {
        let storage = MemoryStorage::new_default();

        {
            let output = storage.create_output("test.ck").unwrap();
            let mut writer = StructWriter::new(output);
            writer.write_string("checksummed payload").unwrap();
            writer.write_u64(77).unwrap();
            writer.finish_checksum().unwrap();
            writer.close().unwrap();
        }

        {
            let input = storage.open_input("test.ck").unwrap();
            let mut reader = StructReader::new(input).unwrap();
            assert_eq!(reader.read_string().unwrap(), "checksummed payload");
            assert_eq!(reader.read_u64().unwrap(), 77);
            reader.verify_checksum().unwrap();
        }
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let storage = MemoryStorage::new_default();

        {
            let output = storage.create_output("test.ck").unwrap();
            let mut writer = StructWriter::new(output);
            writer.write_string("payload").unwrap();
            writer.finish_checksum().unwrap();
            writer.close().unwrap();
        }

        // Flip a byte in place.
        {
            let mut input = storage.open_input("test.ck").unwrap();
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut input, &mut data).unwrap();
            data[2] ^= 0xFF;
            let mut output = storage.create_output("test.ck").unwrap();
            std::io::Write::write_all(&mut output, &data).unwrap();
            output.close().unwrap();
        }

        let input = storage.open_input("test.ck").unwrap();
        let mut reader = StructReader::new(input).unwrap();
        let _ = reader.read_string();
        assert!(reader.verify_checksum().is_err());
    }

    #[test]
    fn test_string_map() {
        let storage = MemoryStorage::new_default();

        let mut original = BTreeMap::new();
        original.insert("source".to_string(), "flush".to_string());
        original.insert("version".to_string(), "0.1.0".to_string());

        {
            let output = storage.create_output("test.map").unwrap();
            let mut writer = StructWriter::new(output);
            writer.write_string_map(&original).unwrap();
            writer.close().unwrap();
        }

        {
            let input = storage.open_input("test.map").unwrap();
            let mut reader = StructReader::new(input).unwrap();
            assert_eq!(reader.read_string_map().unwrap(), original);
        }
    }

    #[test]
    fn test_seek_and_patch() {
        let storage = MemoryStorage::new_default();

        {
            let output = storage.create_output("test.patch").unwrap();
            let mut writer = StructWriter::new(output);
            writer.write_u64(0).unwrap(); // placeholder
            writer.write_string("entry").unwrap();
            let end = writer.position();
            writer.seek_to(0).unwrap();
            writer.write_u64(end).unwrap();
            writer.close().unwrap();
        }

        {
            let input = storage.open_input("test.patch").unwrap();
            let mut reader = StructReader::new(input).unwrap();
            let patched = reader.read_u64().unwrap();
            assert_eq!(reader.read_string().unwrap(), "entry");
            assert_eq!(patched, reader.position());
        }
    }
}
