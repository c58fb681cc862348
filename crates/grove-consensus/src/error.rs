//! Consensus error types.

use grove_storage::StorageError;
use grove_types::GroupId;
use thiserror::Error;

/// Errors that can occur during consensus operations.
///
/// None of these are fatal to the process: a faulty message is dropped, a
/// storage fault forces the group into recovery, a quorum timeout starts a
/// new round.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Malformed or unauthorized protocol message.
    #[error("validation fault: {0}")]
    Validation(String),

    /// Persistence failed after retries.
    #[error("storage fault: {0}")]
    Storage(#[from] StorageError),

    /// The round deadline passed without a quorum.
    #[error("quorum timeout at height {height} round {round}")]
    QuorumTimeout {
        /// Height being agreed on.
        height: u64,
        /// Round that timed out.
        round: u64,
    },

    /// No engine is registered for the group.
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    /// The engine task is no longer running.
    #[error("engine stopped")]
    Stopped,

    /// The engine mailbox is full.
    #[error("engine mailbox full")]
    MailboxFull,

    /// A message could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The transport refused a message.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConsensusError {
    /// Short label used as the `reason` of dropped-message metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ConsensusError::Validation(_) => "validation",
            ConsensusError::Storage(_) => "storage",
            ConsensusError::QuorumTimeout { .. } => "quorum_timeout",
            ConsensusError::UnknownGroup(_) => "unknown_group",
            ConsensusError::Stopped => "stopped",
            ConsensusError::MailboxFull => "mailbox_full",
            ConsensusError::Encoding(_) => "encoding",
            ConsensusError::Transport(_) => "transport",
        }
    }
}

impl From<grove_types::TypesError> for ConsensusError {
    fn from(e: grove_types::TypesError) -> Self {
        ConsensusError::Encoding(e.to_string())
    }
}

/// A specialized Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
