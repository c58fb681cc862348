//! Vote and timeout-notice accumulation.
//!
//! Both sets are keyed by sender, so replaying a message never changes the
//! accumulated weight.

use grove_types::{BlockId, HbMsg, HbPayload, NodeId, ProducerSet};
use std::collections::{BTreeMap, HashMap};

/// Result of inserting a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote from this sender in the round.
    Added,
    /// The sender already voted for the same block.
    Duplicate,
    /// The sender already voted for a different block.
    Equivocation,
}

/// Votes of one round, at most one per sender.
#[derive(Debug, Clone, Default)]
pub struct VoteSet {
    votes: BTreeMap<NodeId, HbMsg>,
}

impl VoteSet {
    /// Creates an empty vote set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a VOTE message. Messages without a block id are ignored as duplicates.
    pub fn insert(&mut self, vote: HbMsg) -> VoteOutcome {
        let Some(block_id) = vote.block_id() else {
            return VoteOutcome::Duplicate;
        };
        match self.votes.get(&vote.sender) {
            Some(existing) if existing.block_id() == Some(block_id) => VoteOutcome::Duplicate,
            Some(_) => VoteOutcome::Equivocation,
            None => {
                self.votes.insert(vote.sender.clone(), vote);
                VoteOutcome::Added
            }
        }
    }

    /// Returns true if `node` has voted.
    pub fn has_voted(&self, node: &NodeId) -> bool {
        self.votes.contains_key(node)
    }

    /// Summed weight of the votes for `block_id`.
    pub fn weight_for(&self, block_id: &BlockId, producers: &ProducerSet) -> u64 {
        producers.signed_weight(
            self.votes
                .values()
                .filter(|v| v.block_id().as_ref() == Some(block_id))
                .map(|v| &v.sender),
        )
    }

    /// Votes for `block_id`, ordered by sender.
    pub fn votes_for(&self, block_id: &BlockId) -> Vec<HbMsg> {
        self.votes
            .values()
            .filter(|v| v.block_id().as_ref() == Some(block_id))
            .cloned()
            .collect()
    }

    /// Number of distinct voters.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Returns true if nobody voted.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// TIMEOUT-NOTIFY messages of one round, at most one per sender.
#[derive(Debug, Clone, Default)]
pub struct TimeoutSet {
    notices: HashMap<NodeId, HbMsg>,
}

impl TimeoutSet {
    /// Inserts a notice. Returns false if the sender already sent one.
    pub fn insert(&mut self, notice: HbMsg) -> bool {
        if self.notices.contains_key(&notice.sender) {
            return false;
        }
        self.notices.insert(notice.sender.clone(), notice);
        true
    }

    /// Summed weight of the senders.
    pub fn weight(&self, producers: &ProducerSet) -> u64 {
        producers.signed_weight(self.notices.keys())
    }

    /// Returns true if `node` sent a notice.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.notices.contains_key(node)
    }

    /// The notices, ordered by sender.
    pub fn notices(&self) -> Vec<HbMsg> {
        let mut notices: Vec<HbMsg> = self.notices.values().cloned().collect();
        notices.sort_by(|a, b| a.sender.cmp(&b.sender));
        notices
    }

    /// Number of notices.
    pub fn len(&self) -> usize {
        self.notices.len()
    }

    /// Returns true if no notice was received.
    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }
}

/// Lock reported by a TIMEOUT-NOTIFY: the proposal the sender last voted for.
pub fn reported_lock(notice: &HbMsg) -> Option<&HbMsg> {
    match &notice.payload {
        HbPayload::TimeoutNotify { lock } => lock.as_deref(),
        _ => None,
    }
}
