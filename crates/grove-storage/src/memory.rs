//! In-memory storage backend.

use crate::traits::{check_append, decode_group, BlockStore, GroupStore, QueueStore};
use crate::Result;
use grove_types::{BlockId, CommittedBlock, GroupId, GroupItem};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Thread-safe in-memory store implementing every storage port.
///
/// Group records are kept encoded so that decoding behaves exactly like the
/// durable backends.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<GroupId, BTreeMap<u64, CommittedBlock>>>,
    groups: RwLock<BTreeMap<GroupId, Vec<u8>>>,
    entries: RwLock<HashMap<GroupId, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw bytes as a group record, bypassing encoding.
    pub fn put_raw_group(&self, group_id: &GroupId, data: Vec<u8>) {
        self.groups.write().insert(group_id.clone(), data);
    }

    /// Returns the number of blocks stored for a group.
    pub fn block_count(&self, group_id: &GroupId) -> usize {
        self.blocks
            .read()
            .get(group_id)
            .map(|chain| chain.len())
            .unwrap_or(0)
    }
}

impl BlockStore for MemoryStore {
    fn get_highest_block(&self, group_id: &GroupId) -> Result<Option<(u64, BlockId)>> {
        Ok(self
            .blocks
            .read()
            .get(group_id)
            .and_then(|chain| chain.last_key_value())
            .map(|(height, block)| (*height, block.id())))
    }

    fn append_block(&self, group_id: &GroupId, block: &CommittedBlock) -> Result<()> {
        let mut blocks = self.blocks.write();
        let chain = blocks.entry(group_id.clone()).or_default();
        let head = chain
            .last_key_value()
            .map(|(height, block)| (*height, block.id()));
        check_append(group_id, head, block)?;
        chain.insert(block.height(), block.clone());
        Ok(())
    }

    fn get_block(&self, group_id: &GroupId, height: u64) -> Result<Option<CommittedBlock>> {
        Ok(self
            .blocks
            .read()
            .get(group_id)
            .and_then(|chain| chain.get(&height))
            .cloned())
    }

    fn remove_group(&self, group_id: &GroupId) -> Result<()> {
        self.blocks.write().remove(group_id);
        Ok(())
    }
}

impl GroupStore for MemoryStore {
    fn group_ids(&self) -> Result<Vec<GroupId>> {
        Ok(self.groups.read().keys().cloned().collect())
    }

    fn load_group(&self, group_id: &GroupId) -> Result<Option<GroupItem>> {
        match self.groups.read().get(group_id) {
            Some(data) => decode_group(group_id, data).map(Some),
            None => Ok(None),
        }
    }

    fn save_group(&self, item: &GroupItem) -> Result<()> {
        let data = serde_json::to_vec(item)?;
        self.groups.write().insert(item.group_id.clone(), data);
        Ok(())
    }

    fn delete_group(&self, group_id: &GroupId) -> Result<bool> {
        Ok(self.groups.write().remove(group_id).is_some())
    }
}

impl QueueStore for MemoryStore {
    fn put_entry(&self, group_id: &GroupId, entry_id: &str, data: &[u8]) -> Result<()> {
        self.entries
            .write()
            .entry(group_id.clone())
            .or_default()
            .insert(entry_id.to_string(), data.to_vec());
        Ok(())
    }

    fn remove_entry(&self, group_id: &GroupId, entry_id: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        let Some(group) = entries.get_mut(group_id) else {
            return Ok(false);
        };
        let removed = group.remove(entry_id).is_some();
        if group.is_empty() {
            entries.remove(group_id);
        }
        Ok(removed)
    }

    fn load_entries(&self, group_id: &GroupId) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .get(group_id)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default())
    }

    fn entry_groups(&self) -> Result<Vec<GroupId>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}
