//! State of one consensus round.

use crate::vote_set::{VoteOutcome, VoteSet};
use grove_types::{BlockId, HbMsg, NodeId, ProducerSet};
use tokio::time::Instant;

/// Result of recording a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// The round had no proposal yet.
    Accepted,
    /// The same block was already proposed.
    Duplicate,
    /// A different block was already proposed in this round.
    Conflict,
}

/// Mutable agreement state for one (height, round).
///
/// A round is never repaired in place: recovery replaces it with a fresh one.
#[derive(Debug, Clone)]
pub struct ConsensusRound {
    height: u64,
    round: u64,

    /// The PROPOSE message of this round.
    proposal: Option<HbMsg>,

    /// Votes keyed by sender.
    votes: VoteSet,

    /// Whether the local node voted in this round.
    voted: bool,

    /// The local node's TIMEOUT-NOTIFY, once sent.
    own_timeout: Option<HbMsg>,

    /// When the round times out, once armed.
    deadline: Option<Instant>,
}

impl ConsensusRound {
    /// Creates an empty round.
    pub fn new(height: u64, round: u64) -> Self {
        Self {
            height,
            round,
            proposal: None,
            votes: VoteSet::new(),
            voted: false,
            own_timeout: None,
            deadline: None,
        }
    }

    /// Height of the round.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Round number within the height.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// The proposal, if one was accepted.
    pub fn proposal(&self) -> Option<&HbMsg> {
        self.proposal.as_ref()
    }

    /// Id of the proposed block.
    pub fn proposed_block_id(&self) -> Option<BlockId> {
        self.proposal.as_ref().and_then(|p| p.block_id())
    }

    /// Records a proposal.
    pub fn set_proposal(&mut self, proposal: HbMsg) -> ProposalOutcome {
        match self.proposed_block_id() {
            Some(existing) if Some(existing) == proposal.block_id() => ProposalOutcome::Duplicate,
            Some(_) => ProposalOutcome::Conflict,
            None => {
                self.proposal = Some(proposal);
                ProposalOutcome::Accepted
            }
        }
    }

    /// Records a vote.
    pub fn add_vote(&mut self, vote: HbMsg) -> VoteOutcome {
        self.votes.insert(vote)
    }

    /// The round's votes.
    pub fn votes(&self) -> &VoteSet {
        &self.votes
    }

    /// Whether `node` voted in this round.
    pub fn has_vote_from(&self, node: &NodeId) -> bool {
        self.votes.has_voted(node)
    }

    /// Returns the proposed block id when its votes reach quorum.
    pub fn quorum_block(&self, producers: &ProducerSet) -> Option<BlockId> {
        let block_id = self.proposed_block_id()?;
        (self.votes.weight_for(&block_id, producers) >= producers.quorum_weight())
            .then_some(block_id)
    }

    /// Whether the local node voted.
    pub fn voted(&self) -> bool {
        self.voted
    }

    /// Marks the local vote as cast.
    pub fn mark_voted(&mut self) {
        self.voted = true;
    }

    /// The local TIMEOUT-NOTIFY, if sent.
    pub fn own_timeout(&self) -> Option<&HbMsg> {
        self.own_timeout.as_ref()
    }

    /// Whether the local node gave up on this round.
    pub fn timeout_sent(&self) -> bool {
        self.own_timeout.is_some()
    }

    /// Records the local TIMEOUT-NOTIFY.
    pub fn set_own_timeout(&mut self, notice: HbMsg) {
        self.own_timeout = Some(notice);
    }

    /// The round deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arms the deadline unless it is armed already.
    pub fn arm(&mut self, deadline: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(deadline);
        }
    }

    /// Moves the deadline, armed or not.
    pub fn rearm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Returns true if anything happened in the round.
    pub fn has_activity(&self) -> bool {
        self.proposal.is_some() || !self.votes.is_empty() || self.own_timeout.is_some()
    }
}
