//! Storage abstraction for index files.
//!
//! The index core treats its backing store as a capability-based file
//! system: open-for-read, create-for-write, delete, rename, list, per-file
//! sync, and named advisory locks. Two backends ship with the crate: a
//! buffered [`FileStorage`] and an in-memory [`MemoryStorage`] used by
//! tests and ephemeral indexes.

pub mod file;
pub mod memory;
pub mod structured;
pub mod traits;

pub use file::{FileLockManager, FileStorage};
pub use memory::MemoryStorage;
pub use structured::{StructReader, StructWriter};
pub use traits::{
    LockManager, Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};
