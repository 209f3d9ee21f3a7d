//! File-based storage implementation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{KopisError, Result};
use crate::storage::traits::{
    LockManager, Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// A file-based storage implementation over a single flat directory.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: StorageConfig,
    /// Lock manager for coordinating access.
    lock_manager: FileLockManager,
    /// Whether the storage is closed.
    closed: bool,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| KopisError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(KopisError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        let lock_manager = FileLockManager::new(directory.clone());

        Ok(FileStorage {
            directory,
            config,
            lock_manager,
            closed: false,
        })
    }

    /// Get the full path for a file name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    fn map_open_err(name: &str, e: std::io::Error) -> KopisError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::FileNotFound(name.to_string()).into()
        } else {
            StorageError::IoError(e.to_string()).into()
        }
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| Self::map_open_err(name, e))?;

        if self.config.use_mmap {
            let mmap =
                unsafe { Mmap::map(&file) }.map_err(|e| StorageError::IoError(e.to_string()))?;
            Ok(Box::new(MmapInput::new(Arc::new(mmap))))
        } else {
            Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
        }
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Box::new(FileOutput::new(file, self.config.buffer_size)))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed {
            return false;
        }
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        let path = self.file_path(name);
        std::fs::remove_file(&path).map_err(|e| Self::map_open_err(name, e))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            if entry.path().is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let path = self.file_path(name);
        let meta = std::fs::metadata(&path).map_err(|e| Self::map_open_err(name, e))?;
        Ok(meta.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| Self::map_open_err(old_name, e))
    }

    fn sync_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| Self::map_open_err(name, e))?;
        file.sync_all()
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        Ok(())
    }

    fn lock_manager(&self) -> &dyn LockManager {
        &self.lock_manager
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A buffered file input.
///
/// Clones share one open descriptor (each read seeks under a lock before
/// reading) but keep a private position and read-ahead buffer, so cursors
/// never disturb each other and the handle stays usable even after the
/// file was deleted from the directory.
#[derive(Debug)]
pub struct FileInput {
    file: Arc<Mutex<File>>,
    size: u64,
    position: u64,
    buffer: Vec<u8>,
    /// File offset of `buffer[0]`; the buffer is empty when stale.
    buffer_start: u64,
    buffer_size: usize,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| StorageError::IoError(e.to_string()))?
            .len();
        Ok(FileInput {
            file: Arc::new(Mutex::new(file)),
            size,
            position: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_size: buffer_size.max(1),
        })
    }

    fn refill(&mut self) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.position))?;
        let want = self
            .buffer_size
            .min(self.size.saturating_sub(self.position) as usize);
        self.buffer.resize(want, 0);
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut self.buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.buffer.truncate(filled);
        self.buffer_start = self.position;
        Ok(())
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        let in_buffer = self.position >= self.buffer_start
            && self.position < self.buffer_start + self.buffer.len() as u64;
        if !in_buffer {
            self.refill()?;
            if self.buffer.is_empty() {
                return Ok(0);
            }
        }
        let offset = (self.position - self.buffer_start) as usize;
        let n = buf.len().min(self.buffer.len() - offset);
        buf[..n].copy_from_slice(&self.buffer[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.size as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid seek position",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(FileInput {
            file: Arc::clone(&self.file),
            size: self.size,
            position: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_size: self.buffer_size,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.buffer = Vec::new();
        Ok(())
    }
}

/// A memory-mapped file input. Clones share the underlying mapping.
#[derive(Debug)]
pub struct MmapInput {
    mmap: Arc<Mmap>,
    position: u64,
}

impl MmapInput {
    fn new(mmap: Arc<Mmap>) -> Self {
        MmapInput { mmap, position: 0 }
    }
}

impl Read for MmapInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data: &[u8] = &self.mmap;
        let pos = self.position as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for MmapInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.mmap.len() as i64;
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid seek position",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl StorageInput for MmapInput {
    fn size(&self) -> Result<u64> {
        Ok(self.mmap.len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MmapInput::new(Arc::clone(&self.mmap))))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A buffered file output.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    position: u64,
    closed: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            position: 0,
            closed: false,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        let n = self.writer.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        // BufWriter flushes its buffer before seeking the inner file.
        self.position = self.writer.seek(pos)?;
        Ok(self.position)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| StorageError::IoError(e.to_string()))?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.writer
                .flush()
                .map_err(|e| StorageError::IoError(e.to_string()))?;
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for FileOutput {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.writer.flush();
        }
    }
}

/// A lock manager backed by lock files carrying an ownership token.
///
/// Acquisition creates the lock file exclusively and writes a fresh UUID
/// into it; validity is checked by re-reading the token, which catches the
/// case of another process having broken and re-taken the lock.
#[derive(Debug)]
pub struct FileLockManager {
    directory: PathBuf,
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl FileLockManager {
    fn new(directory: PathBuf) -> Self {
        FileLockManager {
            directory,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

impl LockManager for FileLockManager {
    fn try_acquire_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        let path = self.lock_path(name);
        let token = Uuid::new_v4().to_string();

        let result = OpenOptions::new().write(true).create_new(true).open(&path);

        match result {
            Ok(mut file) => {
                file.write_all(token.as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|e| StorageError::IoError(e.to_string()))?;
                self.held.lock().insert(name.to_string(), token.clone());
                Ok(Some(Box::new(FileLock {
                    name: name.to_string(),
                    path,
                    token,
                    held: Arc::clone(&self.held),
                    released: false,
                })))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(StorageError::IoError(e.to_string()).into()),
        }
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.lock_path(name).exists()
    }
}

/// A held file lock.
#[derive(Debug)]
pub struct FileLock {
    name: String,
    path: PathBuf,
    token: String,
    held: Arc<Mutex<HashMap<String, String>>>,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.held.lock().remove(&self.name);

        // Only delete the lock file if it still carries our token.
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents == self.token => {
                std::fs::remove_file(&self.path)
                    .map_err(|e| StorageError::IoError(e.to_string()))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn is_valid(&self) -> bool {
        if self.released {
            return false;
        }
        matches!(std::fs::read_to_string(&self.path), Ok(contents) if contents == self.token)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
