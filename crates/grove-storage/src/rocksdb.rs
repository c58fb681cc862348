//! RocksDB persistent storage backend.
//!
//! Uses three column families: `blocks` (key: group id, NUL, big-endian
//! height), `groups` (key: group id) and `pubqueue` (key: group id, NUL,
//! entry id). Big-endian heights keep a chain's blocks ordered so the head is
//! found with one reverse seek.

use crate::traits::{check_append, decode_group, BlockStore, GroupStore, QueueStore};
use crate::{Result, StorageError};
use grove_types::{BlockId, CommittedBlock, GroupId, GroupItem};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// RocksDB storage configuration.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,

    /// Enable LZ4 compression.
    pub compression_enabled: bool,

    /// Sync the WAL on every block append.
    pub sync_appends: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/rocksdb"),
            write_buffer_size: 16 * 1024 * 1024, // 16 MB
            compression_enabled: true,
            sync_appends: true,
        }
    }
}

const CF_BLOCKS: &str = "blocks";
const CF_GROUPS: &str = "groups";
const CF_PUBQUEUE: &str = "pubqueue";
const KEY_SEP: u8 = 0;

/// RocksDB-backed implementation of every storage port.
pub struct RocksDbStore {
    db: DB,
    config: RocksDbConfig,
    append_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbStore")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbStore {
    /// Opens or creates a RocksDB database.
    pub fn open(config: RocksDbConfig) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(config.write_buffer_size);
        if config.compression_enabled {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, opts.clone()),
            ColumnFamilyDescriptor::new(CF_GROUPS, opts.clone()),
            ColumnFamilyDescriptor::new(CF_PUBQUEUE, opts.clone()),
        ];

        let db = DB::open_cf_descriptors(&opts, &config.path, cfs).map_err(backend)?;
        debug!(path = %config.path.display(), "Opened RocksDB store");

        Ok(Self {
            db,
            config,
            append_lock: Mutex::new(()),
        })
    }

    /// Opens with default configuration.
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(RocksDbConfig {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Backend(format!("missing column family {}", name)))
    }

    /// Flushes memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(backend)
    }
}

fn backend(e: rocksdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn prefix(group_id: &GroupId) -> Vec<u8> {
    let mut key = group_id.as_str().as_bytes().to_vec();
    key.push(KEY_SEP);
    key
}

fn block_key(group_id: &GroupId, height: u64) -> Vec<u8> {
    let mut key = prefix(group_id);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn entry_key(group_id: &GroupId, entry_id: &str) -> Vec<u8> {
    let mut key = prefix(group_id);
    key.extend_from_slice(entry_id.as_bytes());
    key
}

impl BlockStore for RocksDbStore {
    fn get_highest_block(&self, group_id: &GroupId) -> Result<Option<(u64, BlockId)>> {
        let cf = self.cf(CF_BLOCKS)?;
        let group_prefix = prefix(group_id);
        let upper = block_key(group_id, u64::MAX);

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(upper.as_slice(), Direction::Reverse));
        let Some(item) = iter.next() else {
            return Ok(None);
        };
        let (key, value) = item.map_err(backend)?;
        if !key.starts_with(&group_prefix) || key.len() != group_prefix.len() + 8 {
            return Ok(None);
        }

        let block: CommittedBlock = serde_json::from_slice(&value).map_err(|e| {
            StorageError::Corruption(format!("head block of group {}: {}", group_id, e))
        })?;
        Ok(Some((block.height(), block.id())))
    }

    fn append_block(&self, group_id: &GroupId, block: &CommittedBlock) -> Result<()> {
        let _guard = self.append_lock.lock();
        let head = self.get_highest_block(group_id)?;
        check_append(group_id, head, block)?;

        let data = serde_json::to_vec(block)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_appends);
        self.db
            .put_cf_opt(
                self.cf(CF_BLOCKS)?,
                block_key(group_id, block.height()),
                data,
                &write_opts,
            )
            .map_err(backend)
    }

    fn get_block(&self, group_id: &GroupId, height: u64) -> Result<Option<CommittedBlock>> {
        match self
            .db
            .get_cf(self.cf(CF_BLOCKS)?, block_key(group_id, height))
            .map_err(backend)?
        {
            Some(data) => serde_json::from_slice(&data).map(Some).map_err(|e| {
                StorageError::Corruption(format!("block {} of group {}: {}", height, group_id, e))
            }),
            None => Ok(None),
        }
    }

    fn remove_group(&self, group_id: &GroupId) -> Result<()> {
        let _guard = self.append_lock.lock();
        let cf = self.cf(CF_BLOCKS)?;
        let group_prefix = prefix(group_id);

        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(group_prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(backend)?;
            if !key.starts_with(&group_prefix) {
                break;
            }
            batch.delete_cf(cf, key);
        }
        self.db.write(batch).map_err(backend)
    }
}

impl GroupStore for RocksDbStore {
    fn group_ids(&self) -> Result<Vec<GroupId>> {
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_GROUPS)?, IteratorMode::Start) {
            let (key, _) = item.map_err(backend)?;
            ids.push(GroupId::new(String::from_utf8_lossy(&key).to_string()));
        }
        Ok(ids)
    }

    fn load_group(&self, group_id: &GroupId) -> Result<Option<GroupItem>> {
        match self
            .db
            .get_cf(self.cf(CF_GROUPS)?, group_id.as_str().as_bytes())
            .map_err(backend)?
        {
            Some(data) => decode_group(group_id, &data).map(Some),
            None => Ok(None),
        }
    }

    fn save_group(&self, item: &GroupItem) -> Result<()> {
        let data = serde_json::to_vec(item)?;
        self.db
            .put_cf(self.cf(CF_GROUPS)?, item.group_id.as_str().as_bytes(), data)
            .map_err(backend)
    }

    fn delete_group(&self, group_id: &GroupId) -> Result<bool> {
        let cf = self.cf(CF_GROUPS)?;
        let key = group_id.as_str().as_bytes();
        let existed = self.db.get_pinned_cf(cf, key).map_err(backend)?.is_some();
        self.db.delete_cf(cf, key).map_err(backend)?;
        Ok(existed)
    }
}

impl QueueStore for RocksDbStore {
    fn put_entry(&self, group_id: &GroupId, entry_id: &str, data: &[u8]) -> Result<()> {
        self.db
            .put_cf(self.cf(CF_PUBQUEUE)?, entry_key(group_id, entry_id), data)
            .map_err(backend)
    }

    fn remove_entry(&self, group_id: &GroupId, entry_id: &str) -> Result<bool> {
        let cf = self.cf(CF_PUBQUEUE)?;
        let key = entry_key(group_id, entry_id);
        let existed = self.db.get_pinned_cf(cf, &key).map_err(backend)?.is_some();
        self.db.delete_cf(cf, &key).map_err(backend)?;
        Ok(existed)
    }

    fn load_entries(&self, group_id: &GroupId) -> Result<Vec<Vec<u8>>> {
        let group_prefix = prefix(group_id);
        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_PUBQUEUE)?,
            IteratorMode::From(group_prefix.as_slice(), Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(&group_prefix) {
                break;
            }
            entries.push(value.to_vec());
        }
        Ok(entries)
    }

    fn entry_groups(&self) -> Result<Vec<GroupId>> {
        let mut groups = BTreeSet::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_PUBQUEUE)?, IteratorMode::Start)
        {
            let (key, _) = item.map_err(backend)?;
            if let Some(pos) = key.iter().position(|b| *b == KEY_SEP) {
                groups.insert(String::from_utf8_lossy(&key[..pos]).to_string());
            }
        }
        Ok(groups.into_iter().map(GroupId::new).collect())
    }
}
