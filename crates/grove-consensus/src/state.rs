//! Engine state and health.

use serde::{Deserialize, Serialize};

/// Phase of the engine within the current height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Waiting for work or for a proposal.
    Idle,
    /// The local node proposed a block and collects votes.
    Proposing,
    /// The local node voted for a peer's proposal.
    Voting,
    /// A quorum was reached and the block is being persisted.
    Committing,
    /// The round timed out or persisting failed.
    Recovering,
}

impl EngineState {
    /// Returns the state as a string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Proposing => "proposing",
            EngineState::Voting => "voting",
            EngineState::Committing => "committing",
            EngineState::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health signal of one group's engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Committing normally.
    Healthy,
    /// A round timed out; the engine is recovering.
    Recovering,
    /// Persisting a committed block failed after all retries.
    StorageFault,
}

impl HealthStatus {
    /// Returns true for [`HealthStatus::Healthy`].
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Recovering => write!(f, "recovering"),
            HealthStatus::StorageFault => write!(f, "storage_fault"),
        }
    }
}
