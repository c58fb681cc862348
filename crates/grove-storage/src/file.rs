//! File-backed storage.
//!
//! Layout under the root directory:
//!
//! ```text
//! blocks/<hex(group_id)>/<height, 20 digits>.json
//! groups/<hex(group_id)>.json
//! pubqueue/<hex(group_id)>/<hex(entry_id)>.json
//! ```
//!
//! Every record is written to a temporary file, synced and renamed into
//! place, so a crash leaves either the old or the new record.

use crate::traits::{check_append, decode_group, BlockStore, GroupStore, QueueStore};
use crate::{Result, StorageError};
use grove_types::{BlockId, CommittedBlock, GroupId, GroupItem};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BLOCKS_DIR: &str = "blocks";
const GROUPS_DIR: &str = "groups";
const QUEUE_DIR: &str = "pubqueue";
const RECORD_EXT: &str = "json";

/// Durable store keeping one JSON file per record.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Cached chain heads, filled lazily from disk.
    heads: RwLock<HashMap<GroupId, Option<(u64, BlockId)>>>,
    /// Serializes appends.
    append_lock: Mutex<()>,
}

impl FileStore {
    /// Opens or creates a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [BLOCKS_DIR, GROUPS_DIR, QUEUE_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        debug!(path = %root.display(), "Opened file store");
        Ok(Self {
            root,
            heads: RwLock::new(HashMap::new()),
            append_lock: Mutex::new(()),
        })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chain_dir(&self, group_id: &GroupId) -> PathBuf {
        self.root.join(BLOCKS_DIR).join(encode_name(group_id.as_str()))
    }

    fn block_path(&self, group_id: &GroupId, height: u64) -> PathBuf {
        self.chain_dir(group_id)
            .join(format!("{:020}.{}", height, RECORD_EXT))
    }

    fn group_path(&self, group_id: &GroupId) -> PathBuf {
        self.root
            .join(GROUPS_DIR)
            .join(format!("{}.{}", encode_name(group_id.as_str()), RECORD_EXT))
    }

    fn queue_dir(&self, group_id: &GroupId) -> PathBuf {
        self.root.join(QUEUE_DIR).join(encode_name(group_id.as_str()))
    }

    fn entry_path(&self, group_id: &GroupId, entry_id: &str) -> PathBuf {
        self.queue_dir(group_id)
            .join(format!("{}.{}", encode_name(entry_id), RECORD_EXT))
    }

    /// Scans the chain directory for the highest stored block.
    fn scan_head(&self, group_id: &GroupId) -> Result<Option<(u64, BlockId)>> {
        let dir = self.chain_dir(group_id);
        if !dir.exists() {
            return Ok(None);
        }

        let mut highest: Option<u64> = None;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(height) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                warn!(path = %path.display(), "Ignoring unexpected file in chain directory");
                continue;
            };
            highest = Some(highest.map_or(height, |h| h.max(height)));
        }

        match highest {
            Some(height) => {
                let block = self.get_block(group_id, height)?.ok_or_else(|| {
                    StorageError::NotFound(format!("block {} of group {}", height, group_id))
                })?;
                Ok(Some((height, block.id())))
            }
            None => Ok(None),
        }
    }

    fn cached_head(&self, group_id: &GroupId) -> Result<Option<(u64, BlockId)>> {
        if let Some(head) = self.heads.read().get(group_id) {
            return Ok(*head);
        }
        let head = self.scan_head(group_id)?;
        self.heads.write().insert(group_id.clone(), head);
        Ok(head)
    }
}

impl BlockStore for FileStore {
    fn get_highest_block(&self, group_id: &GroupId) -> Result<Option<(u64, BlockId)>> {
        self.cached_head(group_id)
    }

    fn append_block(&self, group_id: &GroupId, block: &CommittedBlock) -> Result<()> {
        let _guard = self.append_lock.lock();
        let head = self.cached_head(group_id)?;
        check_append(group_id, head, block)?;

        fs::create_dir_all(self.chain_dir(group_id))?;
        let data = serde_json::to_vec(block)?;
        write_atomic(&self.block_path(group_id, block.height()), &data)?;

        self.heads
            .write()
            .insert(group_id.clone(), Some((block.height(), block.id())));
        debug!(
            group_id = %group_id,
            height = block.height(),
            block_id = %block.id().short(),
            "Appended block"
        );
        Ok(())
    }

    fn get_block(&self, group_id: &GroupId, height: u64) -> Result<Option<CommittedBlock>> {
        let path = self.block_path(group_id, height);
        let Some(data) = read_optional(&path)? else {
            return Ok(None);
        };
        let block = serde_json::from_slice(&data).map_err(|e| {
            StorageError::Corruption(format!("block {} of group {}: {}", height, group_id, e))
        })?;
        Ok(Some(block))
    }

    fn remove_group(&self, group_id: &GroupId) -> Result<()> {
        let _guard = self.append_lock.lock();
        let dir = self.chain_dir(group_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        self.heads.write().remove(group_id);
        Ok(())
    }
}

impl GroupStore for FileStore {
    fn group_ids(&self) -> Result<Vec<GroupId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(GROUPS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_name)
            {
                Some(name) => ids.push(GroupId::new(name)),
                None => warn!(path = %path.display(), "Ignoring unexpected group file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_group(&self, group_id: &GroupId) -> Result<Option<GroupItem>> {
        match read_optional(&self.group_path(group_id))? {
            Some(data) => decode_group(group_id, &data).map(Some),
            None => Ok(None),
        }
    }

    fn save_group(&self, item: &GroupItem) -> Result<()> {
        let data = serde_json::to_vec_pretty(item)?;
        write_atomic(&self.group_path(&item.group_id), &data)
    }

    fn delete_group(&self, group_id: &GroupId) -> Result<bool> {
        match fs::remove_file(self.group_path(group_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl QueueStore for FileStore {
    fn put_entry(&self, group_id: &GroupId, entry_id: &str, data: &[u8]) -> Result<()> {
        fs::create_dir_all(self.queue_dir(group_id))?;
        write_atomic(&self.entry_path(group_id, entry_id), data)
    }

    fn remove_entry(&self, group_id: &GroupId, entry_id: &str) -> Result<bool> {
        match fs::remove_file(self.entry_path(group_id, entry_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn load_entries(&self, group_id: &GroupId) -> Result<Vec<Vec<u8>>> {
        let dir = self.queue_dir(group_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT))
            .collect();
        paths.sort();

        paths
            .iter()
            .map(|path| fs::read(path).map_err(StorageError::from))
            .collect()
    }

    fn entry_groups(&self) -> Result<Vec<GroupId>> {
        let mut groups = Vec::new();
        for entry in fs::read_dir(self.root.join(QUEUE_DIR))? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let has_entries = fs::read_dir(&path)?.next().is_some();
            if let (true, Some(name)) = (
                has_entries,
                path.file_name().and_then(|s| s.to_str()).and_then(decode_name),
            ) {
                groups.push(GroupId::new(name));
            }
        }
        groups.sort();
        Ok(groups)
    }
}

/// Hex-encodes a name so any group or entry id is a valid file name.
fn encode_name(name: &str) -> String {
    hex::encode(name.as_bytes())
}

fn decode_name(encoded: &str) -> Option<String> {
    hex::decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
