//! Error types for Grove common types.

use thiserror::Error;

/// Errors raised while building or checking the shared types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// The producer set is empty or otherwise unusable.
    #[error("invalid producer set: {0}")]
    InvalidProducerSet(String),

    /// A group record or seed is malformed.
    #[error("invalid group: {0}")]
    InvalidGroup(String),

    /// A key could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for type-level operations.
pub type Result<T> = std::result::Result<T, TypesError>;
