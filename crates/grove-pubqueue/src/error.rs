//! Publish queue error types.

use crate::entry::EntryId;
use grove_storage::StorageError;
use thiserror::Error;

/// Errors that can occur in the publish queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The durable store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An entry could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No entry with this id is known.
    #[error("entry not found: {0}")]
    EntryNotFound(EntryId),

    /// The sink refused a dispatch.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The entry hit the retry ceiling and was marked FAILED.
    #[error("entry {entry_id} exhausted after {attempts} attempts")]
    Exhausted {
        /// The failed entry.
        entry_id: EntryId,
        /// Attempts made.
        attempts: u32,
        /// Last dispatch error, if any.
        last_error: Option<String>,
    },
}

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
