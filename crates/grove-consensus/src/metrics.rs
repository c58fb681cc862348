//! Consensus metrics.
//!
//! The families are created unregistered so every engine of a node can share
//! one clone; the node registers them once in its registry.

use grove_types::GroupId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Per-group labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GroupLabels {
    /// Group identifier.
    pub group: String,
}

impl GroupLabels {
    /// Labels for a group.
    pub fn new(group_id: &GroupId) -> Self {
        Self {
            group: group_id.as_str().to_string(),
        }
    }
}

/// Dropped message labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    /// Why the message was dropped.
    pub reason: String,
}

/// Reason labels used for `grove_messages_dropped`.
pub mod drop_reason {
    /// No engine is registered for the group.
    pub const UNKNOWN_GROUP: &str = "unknown_group";
    /// The message failed validation.
    pub const VALIDATION: &str = "validation";
    /// The message refers to an already committed height.
    pub const STALE: &str = "stale";
    /// The engine was stopped.
    pub const STOPPED: &str = "stopped";
    /// The future-message buffer was full.
    pub const BUFFER_FULL: &str = "buffer_full";
    /// The engine mailbox was full.
    pub const MAILBOX_FULL: &str = "mailbox_full";
}

/// Metric families shared by all consensus engines of a node.
#[derive(Clone, Debug, Default)]
pub struct ConsensusMetrics {
    /// Blocks committed per group.
    pub blocks_committed: Family<GroupLabels, Counter>,
    /// Round timeouts per group.
    pub round_timeouts: Family<GroupLabels, Counter>,
    /// Exhausted storage retries per group.
    pub storage_faults: Family<GroupLabels, Counter>,
    /// Dropped protocol messages by reason.
    pub messages_dropped: Family<DropLabels, Counter>,
}

impl ConsensusMetrics {
    /// Creates unregistered metric families.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every family in `registry`.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "grove_blocks_committed",
            "Blocks committed per group",
            self.blocks_committed.clone(),
        );
        registry.register(
            "grove_round_timeouts",
            "Consensus round timeouts per group",
            self.round_timeouts.clone(),
        );
        registry.register(
            "grove_storage_faults",
            "Block appends that failed after all retries",
            self.storage_faults.clone(),
        );
        registry.register(
            "grove_messages_dropped",
            "Protocol messages dropped before reaching a round",
            self.messages_dropped.clone(),
        );
    }

    /// Counts a dropped message.
    pub fn dropped(&self, reason: &str) {
        self.messages_dropped
            .get_or_create(&DropLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Number of messages dropped for `reason`.
    pub fn dropped_count(&self, reason: &str) -> u64 {
        self.messages_dropped
            .get_or_create(&DropLabels {
                reason: reason.to_string(),
            })
            .get()
    }

    /// Number of blocks committed for a group.
    pub fn committed_count(&self, group_id: &GroupId) -> u64 {
        self.blocks_committed
            .get_or_create(&GroupLabels::new(group_id))
            .get()
    }

    /// Number of round timeouts for a group.
    pub fn timeout_count(&self, group_id: &GroupId) -> u64 {
        self.round_timeouts
            .get_or_create(&GroupLabels::new(group_id))
            .get()
    }

    /// Number of storage faults for a group.
    pub fn storage_fault_count(&self, group_id: &GroupId) -> u64 {
        self.storage_faults
            .get_or_create(&GroupLabels::new(group_id))
            .get()
    }
}
