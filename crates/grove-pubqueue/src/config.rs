//! Publish queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Publish queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishQueueConfig {
    /// How often each group's PENDING entries are dispatched.
    #[serde(with = "millis")]
    pub dispatch_interval: Duration,

    /// How long a SENT entry waits for its commit before it is retried.
    #[serde(with = "millis")]
    pub ack_timeout: Duration,

    /// Dispatch attempts before an entry becomes FAILED.
    pub max_attempts: u32,

    /// Acknowledge entries as soon as they are dispatched.
    pub auto_ack: bool,

    /// Maximum entries handed to the engine per dispatch.
    pub batch_size: usize,
}

impl Default for PublishQueueConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(30),
            max_attempts: 5,
            auto_ack: false,
            batch_size: 100,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
