//! Group metadata and seeds.
//!
//! A [`GroupItem`] is the persisted description of one group. It changes
//! only when a block commits: the head snapshot advances on every commit, the
//! producer set on governance blocks. A [`GroupSeed`] is the shareable form
//! used to join a group: the item plus its genesis block.

use crate::block::Block;
use crate::error::{Result, TypesError};
use crate::id::{BlockId, GroupId, NodeId};
use crate::producer::{Producer, ProducerSet};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Consensus / encryption mode of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    /// Payloads are readable by every member.
    #[default]
    Public,
    /// Payloads are encrypted for the producer set.
    Private,
}

/// Persisted metadata of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupItem {
    /// Stable group identifier.
    pub group_id: GroupId,

    /// Human-readable name.
    pub group_name: String,

    /// Group creator.
    pub owner: NodeId,

    /// Id of the genesis block.
    pub genesis_block_id: BlockId,

    /// Consensus / encryption mode.
    #[serde(default)]
    pub mode: ConsensusMode,

    /// Current producer set.
    pub producers: ProducerSet,

    /// Highest committed height.
    pub highest_height: u64,

    /// Id of the highest committed block.
    pub highest_block_id: BlockId,
}

impl GroupItem {
    /// Returns a copy with the head snapshot replaced.
    pub fn with_head(mut self, height: u64, block_id: BlockId) -> Self {
        self.highest_height = height;
        self.highest_block_id = block_id;
        self
    }

    /// Checks the record is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.group_id.as_str().is_empty() {
            return Err(TypesError::InvalidGroup("group_id is empty".into()));
        }
        if self.owner.to_key().is_none() {
            return Err(TypesError::InvalidGroup(format!(
                "owner {} is not a valid key",
                self.owner
            )));
        }
        ProducerSet::new(self.producers.producers().to_vec())?;
        Ok(())
    }
}

/// Shareable group seed: metadata plus genesis block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSeed {
    /// Group metadata at genesis.
    pub group_item: GroupItem,

    /// The genesis block.
    pub genesis_block: Block,
}

impl GroupSeed {
    /// Creates a seed for a new group owned by `owner`.
    pub fn create(
        group_id: GroupId,
        group_name: impl Into<String>,
        owner: NodeId,
        producers: Vec<Producer>,
        mode: ConsensusMode,
        timestamp_ms: u64,
    ) -> Result<Self> {
        let producers = ProducerSet::new(producers)?;
        let genesis_block = Block::genesis(group_id.clone(), owner.clone(), timestamp_ms);
        let genesis_block_id = genesis_block.id();

        let seed = Self {
            group_item: GroupItem {
                group_id,
                group_name: group_name.into(),
                owner,
                genesis_block_id,
                mode,
                producers,
                highest_height: 0,
                highest_block_id: genesis_block_id,
            },
            genesis_block,
        };
        seed.validate()?;
        Ok(seed)
    }

    /// Returns the group id.
    pub fn group_id(&self) -> &GroupId {
        &self.group_item.group_id
    }

    /// Validates the seed.
    pub fn validate(&self) -> Result<()> {
        self.group_item.validate()?;

        let header = &self.genesis_block.header;
        if header.height != 0 {
            return Err(TypesError::InvalidGroup(format!(
                "genesis block has height {}",
                header.height
            )));
        }
        if header.group_id != self.group_item.group_id {
            return Err(TypesError::InvalidGroup(
                "genesis block belongs to another group".into(),
            ));
        }
        if self.genesis_block.id() != self.group_item.genesis_block_id {
            return Err(TypesError::InvalidGroup(
                "genesis block id does not match group item".into(),
            ));
        }
        if self.group_item.highest_height != 0 {
            return Err(TypesError::InvalidGroup(
                "seed must describe the group at genesis".into(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a seed from JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        let seed: GroupSeed = serde_json::from_str(content)?;
        seed.validate()?;
        Ok(seed)
    }

    /// Loads a seed from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TypesError::InvalidGroup(format!("failed to read seed: {}", e)))?;
        Self::from_json(&content)
    }

    /// Saves the seed as pretty JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| TypesError::InvalidGroup(format!("failed to write seed: {}", e)))?;
        Ok(())
    }
}
