//! Publish queue metrics.

use crate::entry::EntryStatus;
use grove_consensus::GroupLabels;
use grove_types::GroupId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels of the entry gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EntryLabels {
    /// Group identifier.
    pub group: String,
    /// Entry status.
    pub status: String,
}

/// Metric families of the publish queue.
#[derive(Clone, Debug, Default)]
pub struct QueueMetrics {
    /// Entries per group and status.
    pub entries: Family<EntryLabels, Gauge>,
    /// Entries that hit the retry ceiling.
    pub failed: Family<GroupLabels, Counter>,
}

impl QueueMetrics {
    /// Creates unregistered metric families.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the families.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "grove_pubqueue_entries",
            "Publish queue entries by status",
            self.entries.clone(),
        );
        registry.register(
            "grove_pubqueue_failed",
            "Publish queue entries that exhausted their retries",
            self.failed.clone(),
        );
    }

    pub(crate) fn set_count(&self, group_id: &GroupId, status: EntryStatus, count: usize) {
        self.entries
            .get_or_create(&EntryLabels {
                group: group_id.as_str().to_string(),
                status: status.as_str().to_string(),
            })
            .set(count as i64);
    }

    /// Current gauge value for a group and status.
    pub fn count(&self, group_id: &GroupId, status: EntryStatus) -> i64 {
        self.entries
            .get_or_create(&EntryLabels {
                group: group_id.as_str().to_string(),
                status: status.as_str().to_string(),
            })
            .get()
    }

    /// Failed entries counted for a group.
    pub fn failed_count(&self, group_id: &GroupId) -> u64 {
        self.failed.get_or_create(&GroupLabels::new(group_id)).get()
    }
}
