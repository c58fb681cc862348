//! Node error types.

use grove_consensus::ConsensusError;
use grove_pubqueue::QueueError;
use grove_storage::StorageError;
use grove_types::{GroupId, TypesError};
use thiserror::Error;

/// Errors raised by the node and its group manager.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The Storage Port failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A consensus engine could not be built or reached.
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// The publish queue failed.
    #[error("publish queue error: {0}")]
    Queue(#[from] QueueError),

    /// A seed, key or group record is malformed.
    #[error("invalid data: {0}")]
    Types(#[from] TypesError),

    /// No group with this id is registered.
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    /// The group is already registered.
    #[error("group already joined: {0}")]
    GroupExists(GroupId),

    /// The local node is not a producer of the group.
    #[error("not a producer of group {0}")]
    NotProducer(GroupId),

    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
