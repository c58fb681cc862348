//! Storage port for Grove.
//!
//! This crate defines the persistence interfaces the consensus engine and
//! the publish queue depend on, plus the backends that implement them:
//!
//! - [`MemoryStore`]: in-memory, for tests and ephemeral nodes
//! - [`FileStore`]: one JSON file per record, written atomically
//! - `RocksDbStore`: column-family backed store (feature `rocksdb-backend`)

mod error;
mod file;
#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb;
mod traits;

pub use error::{Result, StorageError};
pub use file::FileStore;
#[cfg(feature = "memory")]
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb::{RocksDbConfig, RocksDbStore};
pub use traits::{BlockStore, GroupStore, QueueStore};
