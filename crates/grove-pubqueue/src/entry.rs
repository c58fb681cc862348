//! Queue entries.

use crate::error::QueueError;
use grove_types::{now_millis, GroupId, Trx, TrxBody, TrxId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifier of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its hyphenated form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Delivery status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be dispatched
    Pending,
    /// Handed to the engine, waiting for its commit
    Sent,
    /// Committed (or dispatched, in auto-ack mode)
    Acked,
    /// Gave up after the retry ceiling
    Failed,
}

impl EntryStatus {
    /// All statuses, for metrics.
    pub const ALL: [EntryStatus; 4] = [
        EntryStatus::Pending,
        EntryStatus::Sent,
        EntryStatus::Acked,
        EntryStatus::Failed,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Sent => "sent",
            EntryStatus::Acked => "acked",
            EntryStatus::Failed => "failed",
        }
    }

    /// Check if this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Acked | EntryStatus::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally submitted payload on its way into a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishQueueEntry {
    /// Unique id, also the transaction nonce
    pub entry_id: EntryId,
    /// Target group
    pub group_id: GroupId,
    /// Opaque application payload
    pub payload: Vec<u8>,
    /// Id of the transaction carrying the payload
    pub trx_id: TrxId,
    /// Current status
    pub status: EntryStatus,
    /// Dispatch attempts so far
    pub attempts: u32,
    /// Enqueue order within the queue
    pub seq: u64,
    /// When the entry was enqueued (unix millis)
    pub created_at_ms: u64,
    /// When the entry was last dispatched (unix millis)
    pub last_attempt_ms: Option<u64>,
    /// Last dispatch error
    pub last_error: Option<String>,
    /// When the entry was marked SENT; not persisted
    #[serde(skip)]
    pub(crate) sent_at: Option<Instant>,
}

impl PublishQueueEntry {
    /// Creates a PENDING entry.
    pub fn new(group_id: GroupId, payload: Vec<u8>, seq: u64) -> Self {
        let entry_id = EntryId::new();
        let trx_id = Trx::new(&group_id, entry_id.to_string(), TrxBody::App(payload.clone())).id;
        Self {
            entry_id,
            group_id,
            payload,
            trx_id,
            status: EntryStatus::Pending,
            attempts: 0,
            seq,
            created_at_ms: now_millis(),
            last_attempt_ms: None,
            last_error: None,
            sent_at: None,
        }
    }

    /// The transaction that carries the payload.
    ///
    /// The nonce is the entry id, so every dispatch of the same entry yields
    /// the same transaction id and the pool deduplicates retries.
    pub fn trx(&self) -> Trx {
        Trx::new(
            &self.group_id,
            self.entry_id.to_string(),
            TrxBody::App(self.payload.clone()),
        )
    }

    /// The error reported for a FAILED entry.
    pub fn exhausted(&self) -> QueueError {
        QueueError::Exhausted {
            entry_id: self.entry_id,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trx_id_is_stable() {
        let entry = PublishQueueEntry::new(GroupId::new("g"), b"hello".to_vec(), 0);
        assert_eq!(entry.trx().id, entry.trx_id);
        assert_eq!(entry.trx().id, entry.trx().id);
        assert!(entry.trx().verify_id(&GroupId::new("g")));
    }

    #[test]
    fn test_sent_at_is_not_persisted() {
        let mut entry = PublishQueueEntry::new(GroupId::new("g"), vec![1], 3);
        entry.status = EntryStatus::Sent;
        entry.sent_at = Some(Instant::now());

        let decoded: PublishQueueEntry =
            serde_json::from_slice(&serde_json::to_vec(&entry).unwrap()).unwrap();
        assert_eq!(decoded.status, EntryStatus::Sent);
        assert!(decoded.sent_at.is_none());
        assert_eq!(decoded.entry_id, entry.entry_id);
    }

    #[test]
    fn test_entry_id_parse() {
        let id = EntryId::new();
        assert_eq!(EntryId::parse(&id.to_string()), Some(id));
        assert_eq!(EntryId::parse("nope"), None);
    }
}
