//! Block structure.
//!
//! Blocks contain ordered transactions and are the unit of consensus. A
//! committed block additionally carries the quorum certificate (signed votes)
//! that justified its commit, so any node can re-verify it.

use crate::id::{BlockId, GroupId, NodeId, TrxId};
use crate::message::HbMsg;
use crate::trx::Trx;
use serde::{Deserialize, Serialize};

/// A block header containing metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// Group this block belongs to.
    pub group_id: GroupId,

    /// Block height (0 = genesis).
    pub height: u64,

    /// Id of the previous committed block.
    pub prev_block_id: BlockId,

    /// Producer that built the block.
    pub producer: NodeId,

    /// Timestamp (unix milliseconds).
    pub timestamp_ms: u64,

    /// Merkle root of transaction ids.
    pub trx_root: [u8; 32],
}

impl BlockHeader {
    /// Computes the block id from the header.
    pub fn id(&self) -> BlockId {
        // serializing an in-memory struct of plain data cannot fail
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        BlockId::hash_parts(&[b"BLOCK:".as_slice(), &bytes])
    }
}

/// A full block containing header and transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,

    /// Ordered transactions.
    pub trxs: Vec<Trx>,
}

impl Block {
    /// Creates a new block.
    pub fn new(
        group_id: GroupId,
        height: u64,
        prev_block_id: BlockId,
        producer: NodeId,
        timestamp_ms: u64,
        trxs: Vec<Trx>,
    ) -> Self {
        let trx_root = Self::compute_trx_root(&trxs);
        Self {
            header: BlockHeader {
                group_id,
                height,
                prev_block_id,
                producer,
                timestamp_ms,
                trx_root,
            },
            trxs,
        }
    }

    /// Creates the genesis block of a group.
    pub fn genesis(group_id: GroupId, owner: NodeId, timestamp_ms: u64) -> Self {
        Self::new(group_id, 0, BlockId::ZERO, owner, timestamp_ms, vec![])
    }

    /// Returns the block id.
    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    /// Returns the block height.
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Returns the number of transactions.
    pub fn trx_count(&self) -> usize {
        self.trxs.len()
    }

    /// Returns the ids of the contained transactions.
    pub fn trx_ids(&self) -> impl Iterator<Item = TrxId> + '_ {
        self.trxs.iter().map(|trx| trx.id)
    }

    /// Verifies the transaction root matches the body.
    pub fn verify_trx_root(&self) -> bool {
        Self::compute_trx_root(&self.trxs) == self.header.trx_root
    }

    /// Computes the Merkle root of transaction ids.
    fn compute_trx_root(trxs: &[Trx]) -> [u8; 32] {
        if trxs.is_empty() {
            return [0u8; 32];
        }

        let mut hashes: Vec<[u8; 32]> = trxs.iter().map(|trx| *trx.id.as_bytes()).collect();

        while hashes.len() > 1 {
            hashes = hashes
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    *BlockId::hash_parts(&[pair[0].as_slice(), right.as_slice()]).as_bytes()
                })
                .collect();
        }

        hashes[0]
    }
}

/// A block together with the votes that committed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommittedBlock {
    /// The block.
    pub block: Block,

    /// Round in which the block was committed.
    pub round: u64,

    /// Signed VOTE messages forming the quorum certificate.
    pub votes: Vec<HbMsg>,
}

impl CommittedBlock {
    /// Creates a committed block.
    pub fn new(block: Block, round: u64, votes: Vec<HbMsg>) -> Self {
        Self { block, round, votes }
    }

    /// Wraps the genesis block, which needs no certificate.
    pub fn genesis(block: Block) -> Self {
        Self::new(block, 0, vec![])
    }

    /// Returns the block id.
    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    /// Returns the block height.
    pub fn height(&self) -> u64 {
        self.block.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trx::TrxBody;

    fn producer() -> NodeId {
        NodeId::from_hex("aa")
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(GroupId::new("g"), producer(), 0);
        assert_eq!(genesis.height(), 0);
        assert_eq!(genesis.header.prev_block_id, BlockId::ZERO);
        assert_eq!(genesis.trx_count(), 0);
        assert!(genesis.verify_trx_root());
    }

    #[test]
    fn test_trx_root_detects_tampering() {
        let group = GroupId::new("g");
        let trxs: Vec<_> = (0..3)
            .map(|i| Trx::new(&group, i.to_string(), TrxBody::App(vec![i as u8])))
            .collect();
        let mut block = Block::new(group.clone(), 1, BlockId::ZERO, producer(), 1, trxs);
        assert!(block.verify_trx_root());

        block.trxs.pop();
        assert!(!block.verify_trx_root());
    }

    #[test]
    fn test_block_id_depends_on_height() {
        let group = GroupId::new("g");
        let a = Block::new(group.clone(), 1, BlockId::ZERO, producer(), 5, vec![]);
        let b = Block::new(group, 2, BlockId::ZERO, producer(), 5, vec![]);
        assert_ne!(a.id(), b.id());
    }
}
