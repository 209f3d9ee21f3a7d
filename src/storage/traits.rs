//! Storage abstraction trait and common types.

use std::io::{Read, Seek, Write};
use std::time::Duration;

use crate::error::{KopisError, Result};

/// A trait for storage backends that can store and retrieve index files.
///
/// This provides a pluggable interface for different storage implementations
/// like file system or memory. All names are flat; the index never uses
/// subdirectories.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file of that name.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file.
    ///
    /// Returns [`StorageError::FileNotFound`] if the file does not exist;
    /// callers that treat a missing file as already deleted must check for
    /// that case themselves.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file. Replaces the destination if it exists.
    ///
    /// On the file-system backend this is the atomic-publish primitive the
    /// commit path relies on.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Ensure a previously written and closed file is durable.
    fn sync_file(&self, name: &str) -> Result<()>;

    /// The lock manager coordinating access to this storage.
    fn lock_manager(&self) -> &dyn LockManager;

    /// Close the storage and release resources.
    fn close(&mut self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Clone this input stream into an independently positioned reader.
    fn clone_input(&self) -> Result<Box<dyn StorageInput>>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
///
/// Outputs are seekable so codecs can reserve placeholder slots and patch
/// them once the real value is known (compound-file offsets, term counts).
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        self.as_ref().clone_input()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// A lock manager for coordinating access to storage.
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Try to acquire a lock with the given name, returning `None` if it is
    /// currently held.
    fn try_acquire_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>>;

    /// Acquire a lock with the given name, polling until `timeout` elapses.
    fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn StorageLock>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(lock) = self.try_acquire_lock(name)? {
                return Ok(lock);
            }
            if std::time::Instant::now() >= deadline {
                return Err(KopisError::lock(format!(
                    "timed out waiting for lock: {name}"
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Check if a lock with the given name is currently held.
    fn lock_exists(&self, name: &str) -> bool;
}

/// A held lock on a resource in storage.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still valid (held by this instance).
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StorageConfig {
    /// Whether to use memory-mapped files for reads (if supported).
    pub use_mmap: bool,

    /// Buffer size for I/O operations.
    pub buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            use_mmap: false,
            buffer_size: 65536, // 64KB buffer for better I/O performance
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// Storage is closed.
    StorageClosed,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for KopisError {
    fn from(err: StorageError) -> Self {
        KopisError::storage(err.to_string())
    }
}

/// True if the error represents a missing file rather than an I/O failure.
///
/// The deleter uses this to treat deleting an already-absent file as a
/// success while queueing genuine failures for retry.
pub fn is_not_found(err: &KopisError) -> bool {
    match err {
        KopisError::Storage(msg) => msg.starts_with("File not found"),
        KopisError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}
