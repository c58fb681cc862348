//! Storage port traits.
//!
//! The consensus and queue layers only see these traits. Backends are
//! in-memory, file based and (optionally) RocksDB.

use crate::{Result, StorageError};
use grove_types::{BlockId, CommittedBlock, GroupId, GroupItem};
use std::sync::Arc;

/// Append-only committed block store, one chain per group.
pub trait BlockStore: Send + Sync {
    /// Returns the highest stored height and its block id, if any block is stored.
    fn get_highest_block(&self, group_id: &GroupId) -> Result<Option<(u64, BlockId)>>;

    /// Appends the next block of a group.
    ///
    /// The block must sit exactly one above the current head (or be the
    /// genesis block of an empty chain) and link to the head's id.
    fn append_block(&self, group_id: &GroupId, block: &CommittedBlock) -> Result<()>;

    /// Reads a committed block by height.
    fn get_block(&self, group_id: &GroupId, height: u64) -> Result<Option<CommittedBlock>>;

    /// Removes every block of a group.
    fn remove_group(&self, group_id: &GroupId) -> Result<()>;
}

/// Persisted group metadata.
pub trait GroupStore: Send + Sync {
    /// Lists the ids of every persisted group.
    fn group_ids(&self) -> Result<Vec<GroupId>>;

    /// Loads a group record. Undecodable records yield [`StorageError::Corruption`].
    fn load_group(&self, group_id: &GroupId) -> Result<Option<GroupItem>>;

    /// Inserts or replaces a group record.
    fn save_group(&self, item: &GroupItem) -> Result<()>;

    /// Deletes a group record.
    fn delete_group(&self, group_id: &GroupId) -> Result<bool>;
}

/// Durable publish-queue records, stored as opaque encoded entries.
pub trait QueueStore: Send + Sync {
    /// Inserts or replaces an entry.
    fn put_entry(&self, group_id: &GroupId, entry_id: &str, data: &[u8]) -> Result<()>;

    /// Removes an entry.
    fn remove_entry(&self, group_id: &GroupId, entry_id: &str) -> Result<bool>;

    /// Loads every entry of a group.
    fn load_entries(&self, group_id: &GroupId) -> Result<Vec<Vec<u8>>>;

    /// Lists groups that have at least one entry.
    fn entry_groups(&self) -> Result<Vec<GroupId>>;
}

/// Checks that `block` may be appended on top of `head`.
pub(crate) fn check_append(
    group_id: &GroupId,
    head: Option<(u64, BlockId)>,
    block: &CommittedBlock,
) -> Result<()> {
    if block.block.header.group_id != *group_id {
        return Err(StorageError::Conflict(format!(
            "block belongs to group {}, not {}",
            block.block.header.group_id, group_id
        )));
    }

    match head {
        None if block.height() == 0 => Ok(()),
        None => Err(StorageError::Conflict(format!(
            "group {} has no genesis, cannot append height {}",
            group_id,
            block.height()
        ))),
        Some((height, _)) if block.height() <= height => Err(StorageError::Conflict(format!(
            "height {} already stored for group {}",
            block.height(),
            group_id
        ))),
        Some((height, _)) if block.height() != height + 1 => {
            Err(StorageError::Conflict(format!(
                "non-contiguous append for group {}: head {}, block {}",
                group_id,
                height,
                block.height()
            )))
        }
        Some((_, head_id)) if block.block.header.prev_block_id != head_id => {
            Err(StorageError::Conflict(format!(
                "block {} does not extend head {} of group {}",
                block.id().short(),
                head_id.short(),
                group_id
            )))
        }
        Some(_) => Ok(()),
    }
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn get_highest_block(&self, group_id: &GroupId) -> Result<Option<(u64, BlockId)>> {
        (**self).get_highest_block(group_id)
    }

    fn append_block(&self, group_id: &GroupId, block: &CommittedBlock) -> Result<()> {
        (**self).append_block(group_id, block)
    }

    fn get_block(&self, group_id: &GroupId, height: u64) -> Result<Option<CommittedBlock>> {
        (**self).get_block(group_id, height)
    }

    fn remove_group(&self, group_id: &GroupId) -> Result<()> {
        (**self).remove_group(group_id)
    }
}

impl<T: GroupStore + ?Sized> GroupStore for Arc<T> {
    fn group_ids(&self) -> Result<Vec<GroupId>> {
        (**self).group_ids()
    }

    fn load_group(&self, group_id: &GroupId) -> Result<Option<GroupItem>> {
        (**self).load_group(group_id)
    }

    fn save_group(&self, item: &GroupItem) -> Result<()> {
        (**self).save_group(item)
    }

    fn delete_group(&self, group_id: &GroupId) -> Result<bool> {
        (**self).delete_group(group_id)
    }
}

impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    fn put_entry(&self, group_id: &GroupId, entry_id: &str, data: &[u8]) -> Result<()> {
        (**self).put_entry(group_id, entry_id, data)
    }

    fn remove_entry(&self, group_id: &GroupId, entry_id: &str) -> Result<bool> {
        (**self).remove_entry(group_id, entry_id)
    }

    fn load_entries(&self, group_id: &GroupId) -> Result<Vec<Vec<u8>>> {
        (**self).load_entries(group_id)
    }

    fn entry_groups(&self) -> Result<Vec<GroupId>> {
        (**self).entry_groups()
    }
}

/// Decodes a group record, mapping decode failures to corruption.
pub(crate) fn decode_group(group_id: &GroupId, data: &[u8]) -> Result<GroupItem> {
    let item: GroupItem = serde_json::from_slice(data).map_err(|e| {
        StorageError::Corruption(format!("group {} record unreadable: {}", group_id, e))
    })?;
    item.validate().map_err(|e| {
        StorageError::Corruption(format!("group {} record invalid: {}", group_id, e))
    })?;
    Ok(item)
}
