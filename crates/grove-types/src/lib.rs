//! Grove Types
//!
//! Shared types for Grove, a node that hosts many independently replicated
//! groups. Every other Grove crate builds on these definitions:
//!
//! - [`GroupId`], [`NodeId`], [`BlockId`], [`TrxId`]: identifiers
//! - [`ProducerSet`]: ordered, weighted producer set with quorum accounting
//! - [`GroupItem`] / [`GroupSeed`]: persisted group metadata and join seeds
//! - [`Trx`], [`Block`], [`CommittedBlock`]: chain content
//! - [`HbMsg`]: signed consensus protocol messages
//! - [`Identity`]: the signing port, with an Ed25519 implementation

mod block;
mod error;
mod group;
mod id;
mod identity;
mod message;
mod producer;
mod trx;

pub use block::{Block, BlockHeader, CommittedBlock};
pub use error::{Result, TypesError};
pub use group::{ConsensusMode, GroupItem, GroupSeed};
pub use id::{BlockId, Digest32, GroupId, NodeId, Signature, TrxId};
pub use identity::{verify_signature, Ed25519Identity, Identity};
pub use message::{HbMsg, HbPayload, Phase};
pub use producer::{Producer, ProducerSet, MAX_TOTAL_WEIGHT};
pub use trx::{ProducerUpdate, Trx, TrxBody};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
