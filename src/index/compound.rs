//! Compound file container.
//!
//! Packs many small per-segment files into one container to keep the open
//! file-handle count proportional to segments, not files. Layout: a vint
//! entry count, then per entry an 8-byte offset slot followed by the entry
//! name, then the concatenated payloads. The offset slots are written as
//! placeholders and patched once the payload positions are known.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KopisError, Result};
use crate::storage::traits::{
    LockManager, Storage, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// Writes a compound container from a set of source files.
pub struct CompoundFileWriter {
    storage: Arc<dyn Storage>,
    container: String,
    entries: Vec<String>,
    finalized: bool,
}

impl CompoundFileWriter {
    /// Create a writer for the given container file name.
    pub fn new(storage: Arc<dyn Storage>, container: &str) -> Self {
        CompoundFileWriter {
            storage,
            container: container.to_string(),
            entries: Vec::new(),
            finalized: false,
        }
    }

    /// Add a source file to the container.
    ///
    /// Each name may be added exactly once, and only before finalization.
    pub fn add_file(&mut self, name: &str) -> Result<()> {
        if self.finalized {
            return Err(KopisError::invalid_operation(
                "cannot add files after the container was finalized",
            ));
        }
        if self.entries.iter().any(|e| e == name) {
            return Err(KopisError::invalid_operation(format!(
                "file {name} was already added to the container"
            )));
        }
        self.entries.push(name.to_string());
        Ok(())
    }

    /// Write the container.
    ///
    /// On any error the partially written container must not be kept; the
    /// caller deletes it (the deleter's delete-new-files path).
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(KopisError::invalid_operation(
                "container was already finalized",
            ));
        }
        if self.entries.is_empty() {
            return Err(KopisError::invalid_operation(
                "cannot write an empty container",
            ));
        }
        self.finalized = true;

        let sizes: Vec<u64> = self
            .entries
            .iter()
            .map(|name| self.storage.file_size(name))
            .collect::<Result<_>>()?;

        let mut output = self.storage.create_output(&self.container)?;

        // Directory: entry count, then per entry a placeholder offset slot
        // and the entry name.
        let mut header = Vec::new();
        crate::util::varint::write_u32(&mut header, self.entries.len() as u32)?;
        let mut slot_offsets = Vec::with_capacity(self.entries.len());
        for name in &self.entries {
            slot_offsets.push(header.len() as u64);
            header.extend_from_slice(&0u64.to_le_bytes());
            crate::util::varint::write_u32(&mut header, name.len() as u32)?;
            header.extend_from_slice(name.as_bytes());
        }
        output.write_all(&header)?;

        let data_start = header.len() as u64;
        let total_len = data_start + sizes.iter().sum::<u64>();

        // Pre-extend to the final length: surfaces out-of-space now instead
        // of halfway through the copy, and keeps the copy appending into
        // already-allocated space.
        if total_len > data_start {
            output.seek(SeekFrom::Start(total_len - 1))?;
            output.write_all(&[0])?;
            output.seek(SeekFrom::Start(data_start))?;
        }

        let mut offsets = Vec::with_capacity(self.entries.len());
        let mut position = data_start;
        let mut buf = vec![0u8; 64 * 1024];
        for (name, &size) in self.entries.iter().zip(&sizes) {
            offsets.push(position);
            let mut input = self.storage.open_input(name)?;
            let mut remaining = size;
            while remaining > 0 {
                let chunk = remaining.min(buf.len() as u64) as usize;
                input.read_exact(&mut buf[..chunk])?;
                output.write_all(&buf[..chunk])?;
                remaining -= chunk as u64;
            }
            // The source must be exactly as long as its directory entry
            // claims; extra bytes would corrupt the neighbors.
            let mut probe = [0u8; 1];
            if input.read(&mut probe)? != 0 {
                return Err(KopisError::index(format!(
                    "source file {name} grew while packing"
                )));
            }
            position += size;
        }

        // Patch the placeholder slots with the real offsets.
        for (&slot, &offset) in slot_offsets.iter().zip(&offsets) {
            output.seek(SeekFrom::Start(slot))?;
            output.write_all(&offset.to_le_bytes())?;
        }

        output.close()?;
        Ok(())
    }
}

/// Reads a compound container, exposing each entry as a bounded input.
///
/// Implements [`Storage`] read-only so segment readers can open files the
/// same way whether or not the segment is packed. The container is opened
/// once; entry inputs are clones of that handle, so the reader keeps
/// serving its point-in-time view even after the container file itself was
/// deleted from the directory.
#[derive(Debug)]
pub struct CompoundFileReader {
    input: Mutex<Box<dyn StorageInput>>,
    /// Entry name to (offset, length).
    entries: BTreeMap<String, (u64, u64)>,
    lock_manager: DenyAllLockManager,
}

impl CompoundFileReader {
    /// Open a compound container and load its directory.
    pub fn open(storage: Arc<dyn Storage>, container: &str) -> Result<Self> {
        let mut input = storage.open_input(container)?;
        let total_len = input.size()?;

        let count = crate::util::varint::read_u32(&mut input)?;
        let mut raw = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut slot = [0u8; 8];
            input.read_exact(&mut slot)?;
            let offset = u64::from_le_bytes(slot);
            let name_len = crate::util::varint::read_u32(&mut input)? as usize;
            let mut name_bytes = vec![0u8; name_len];
            input.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|e| KopisError::corrupt(format!("invalid entry name: {e}")))?;
            raw.push((name, offset));
        }

        // Lengths are implied by the next entry's offset (entries are laid
        // out in directory order).
        let mut entries = BTreeMap::new();
        for (i, (name, offset)) in raw.iter().enumerate() {
            let end = raw.get(i + 1).map(|(_, o)| *o).unwrap_or(total_len);
            if end < *offset || *offset > total_len {
                return Err(KopisError::corrupt(format!(
                    "container entry {name} has offset {offset} beyond end {end}"
                )));
            }
            entries.insert(name.clone(), (*offset, end - *offset));
        }

        Ok(CompoundFileReader {
            input: Mutex::new(input),
            entries,
            lock_manager: DenyAllLockManager,
        })
    }

    /// Entry names in the container.
    pub fn entry_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl Storage for CompoundFileReader {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let &(offset, length) = self
            .entries
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        let mut base = self.input.lock().clone_input()?;
        base.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(SliceInput {
            base,
            start: offset,
            length,
            position: 0,
        }))
    }

    fn create_output(&self, _name: &str) -> Result<Box<dyn StorageOutput>> {
        Err(KopisError::invalid_operation(
            "compound containers are read-only",
        ))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn delete_file(&self, _name: &str) -> Result<()> {
        Err(KopisError::invalid_operation(
            "compound containers are read-only",
        ))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.entry_names())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.entries
            .get(name)
            .map(|&(_, length)| length)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    fn rename_file(&self, _old_name: &str, _new_name: &str) -> Result<()> {
        Err(KopisError::invalid_operation(
            "compound containers are read-only",
        ))
    }

    fn sync_file(&self, _name: &str) -> Result<()> {
        Err(KopisError::invalid_operation(
            "compound containers are read-only",
        ))
    }

    fn lock_manager(&self) -> &dyn LockManager {
        &self.lock_manager
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Lock manager for read-only views; never grants a lock.
#[derive(Debug)]
struct DenyAllLockManager;

impl LockManager for DenyAllLockManager {
    fn try_acquire_lock(&self, _name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        Err(KopisError::invalid_operation(
            "compound containers do not support locking",
        ))
    }

    fn lock_exists(&self, _name: &str) -> bool {
        false
    }
}

/// A bounded window over the container file.
#[derive(Debug)]
struct SliceInput {
    base: Box<dyn StorageInput>,
    start: u64,
    length: u64,
    position: u64,
}

impl Read for SliceInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.length.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(0);
        }
        let limit = buf.len().min(remaining as usize);
        let n = self.base.read(&mut buf[..limit])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for SliceInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.length as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid seek position",
            ));
        }
        self.position = new_pos as u64;
        self.base.seek(SeekFrom::Start(self.start + self.position))?;
        Ok(self.position)
    }
}

impl StorageInput for SliceInput {
    fn size(&self) -> Result<u64> {
        Ok(self.length)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        let mut base = self.base.clone_input()?;
        base.seek(SeekFrom::Start(self.start))?;
        Ok(Box::new(SliceInput {
            base,
            start: self.start,
            length: self.length,
            position: 0,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.base.close()
    }
}
