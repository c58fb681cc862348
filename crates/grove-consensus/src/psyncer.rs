//! PSyncer: the consensus state machine of one group.
//!
//! A height is agreed on in one or more rounds. In each round the eligible
//! proposer (`producers[(height + round) mod n]`) broadcasts a PROPOSE and its
//! own VOTE; producers vote at most once per round and commit once the votes
//! for the proposed block reach quorum. A round that does not reach quorum
//! before its deadline is abandoned through TIMEOUT-NOTIFY messages; a quorum
//! of notices moves every node to the next round, where the new proposer
//! justifies its proposal with those notices.
//!
//! The only state carried from one round to the next is the vote lock: the
//! proposal the node last voted for at this height. A locked node votes for a
//! different block only when the proposal's justification proves the locked
//! block cannot have been committed.
//!
//! All methods run on the engine task that owns the PSyncer, so no round
//! state is ever shared between threads.

use crate::config::EngineConfig;
use crate::error::{ConsensusError, Result};
use crate::metrics::{drop_reason, ConsensusMetrics, GroupLabels};
use crate::pool::{AddOutcome, TrxPool};
use crate::roles::Roles;
use crate::round::{ConsensusRound, ProposalOutcome};
use crate::state::{EngineState, HealthStatus};
use crate::transport::Transport;
use crate::vote_set::{reported_lock, TimeoutSet, VoteOutcome};
use grove_storage::{BlockStore, GroupStore, StorageError};
use grove_types::{
    now_millis, Block, BlockId, CommittedBlock, GroupId, GroupItem, HbMsg, HbPayload, Identity,
    NodeId, Phase, Producer, ProducerSet, Trx, TrxBody, TrxId,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Collaborators of a consensus engine.
#[derive(Clone)]
pub struct ConsensusIface {
    /// Committed block store.
    pub blocks: Arc<dyn BlockStore>,
    /// Group metadata store.
    pub groups: Arc<dyn GroupStore>,
    /// Outbound transport.
    pub transport: Arc<dyn Transport>,
    /// Local signing identity.
    pub identity: Arc<dyn Identity>,
    /// Engine configuration.
    pub config: EngineConfig,
    /// Shared metric families.
    pub metrics: ConsensusMetrics,
}

/// Notification emitted after a block is committed and persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    /// Group of the block.
    pub group_id: GroupId,
    /// Committed height.
    pub height: u64,
    /// Committed block id.
    pub block_id: BlockId,
    /// Ids of the committed transactions, in block order.
    pub trx_ids: Vec<TrxId>,
}

/// Snapshot of an engine, published after every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// Height being agreed on (highest committed + 1).
    pub height: u64,
    /// Current round.
    pub round: u64,
    /// Current state.
    pub state: EngineState,
    /// Local roles.
    pub roles: Roles,
    /// Health signal.
    pub health: HealthStatus,
    /// Id of the highest committed block.
    pub head_id: BlockId,
    /// Number of pending transactions.
    pub pending_trxs: usize,
}

/// Outcome of submitting transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Transactions now pending in the pool.
    pub pending: Vec<TrxId>,
    /// Transactions that were already committed.
    pub committed: Vec<TrxId>,
}

/// Outcome of withdrawing transactions from the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WithdrawReceipt {
    /// Transactions no longer pending anywhere on this node.
    pub withdrawn: Vec<TrxId>,
    /// Transactions that were already committed.
    pub committed: Vec<TrxId>,
    /// Transactions inside this height's proposal or vote lock. They may
    /// still commit and were left in place.
    pub in_flight: Vec<TrxId>,
}

/// The consensus engine of one group.
pub struct PSyncer {
    group: GroupItem,
    node_name: String,
    node_id: NodeId,
    iface: ConsensusIface,
    labels: GroupLabels,

    roles: Roles,
    state: EngineState,
    health: HealthStatus,

    /// Height being agreed on.
    height: u64,
    /// Id of the block at `height - 1`.
    head_id: BlockId,

    round: ConsensusRound,

    /// Stripped PROPOSE of the block this node last voted for at this height.
    lock: Option<HbMsg>,

    /// TIMEOUT-NOTIFY messages of this height, by round.
    timeouts: BTreeMap<u64, TimeoutSet>,

    /// Messages for later heights.
    future: BTreeMap<u64, Vec<HbMsg>>,
    /// Votes for later rounds of this height.
    round_buffer: Vec<HbMsg>,
    /// Buffered messages that became current.
    replay: VecDeque<HbMsg>,

    pool: TrxPool,
    last_sync: Option<(u64, Instant)>,

    commits: broadcast::Sender<CommitEvent>,
    status: watch::Sender<EngineStatus>,
}

impl std::fmt::Debug for PSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PSyncer")
            .field("group_id", &self.group.group_id)
            .field("node", &self.node_name)
            .field("height", &self.height)
            .field("round", &self.round.round())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PSyncer {
    /// Creates the engine of a group.
    ///
    /// The engine starts IDLE at round 0 of the height above the highest
    /// stored block. If the block store is ahead of the group record (a crash
    /// between appending a block and saving the record), the record is
    /// re-derived from the stored blocks.
    pub fn new(group: GroupItem, node_name: impl Into<String>, iface: ConsensusIface) -> Result<Self> {
        let group_id = group.group_id.clone();
        let (head_height, head_id) = iface
            .blocks
            .get_highest_block(&group_id)?
            .ok_or_else(|| StorageError::NotFound(format!("no blocks stored for group {}", group_id)))?;

        let group = if head_height > group.highest_height {
            let group = rederive_group(group, iface.blocks.as_ref(), head_height)?;
            iface.groups.save_group(&group)?;
            group
        } else {
            if head_height < group.highest_height {
                warn!(
                    group_id = %group_id,
                    stored = head_height,
                    recorded = group.highest_height,
                    "Group record is ahead of the block store, using the block store"
                );
            }
            group.with_head(head_height, head_id)
        };

        let node_id = iface.identity.node_id();
        let roles = Roles::derive(&node_id, &group.producers, &group);
        let height = head_height + 1;
        let labels = GroupLabels::new(&group_id);
        let pool = TrxPool::new(iface.config.committed_memory);
        let (commits, _) = broadcast::channel(iface.config.commit_channel_size.max(1));
        let (status, _) = watch::channel(EngineStatus {
            height,
            round: 0,
            state: EngineState::Idle,
            roles,
            health: HealthStatus::Healthy,
            head_id,
            pending_trxs: 0,
        });

        let node_name = node_name.into();
        info!(
            group_id = %group_id,
            node = %node_name,
            height,
            roles = %roles,
            producers = group.producers.len(),
            "Created consensus engine"
        );

        Ok(Self {
            group,
            node_name,
            node_id,
            iface,
            labels,
            roles,
            state: EngineState::Idle,
            health: HealthStatus::Healthy,
            height,
            head_id,
            round: ConsensusRound::new(height, 0),
            lock: None,
            timeouts: BTreeMap::new(),
            future: BTreeMap::new(),
            round_buffer: Vec::new(),
            replay: VecDeque::new(),
            pool,
            last_sync: None,
            commits,
            status,
        })
    }

    /// The group id.
    pub fn group_id(&self) -> &GroupId {
        &self.group.group_id
    }

    /// The current group record.
    pub fn group(&self) -> &GroupItem {
        &self.group
    }

    /// The local node name.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The local node identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.iface.config
    }

    /// Shared metric families.
    pub fn metrics(&self) -> &ConsensusMetrics {
        &self.iface.metrics
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Height being agreed on.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Current round within the height.
    pub fn round(&self) -> u64 {
        self.round.round()
    }

    /// The active round.
    pub fn current_round(&self) -> &ConsensusRound {
        &self.round
    }

    /// Local roles.
    pub fn role(&self) -> Roles {
        self.roles
    }

    /// Current producer set.
    pub fn producers(&self) -> &ProducerSet {
        &self.group.producers
    }

    /// Health signal.
    pub fn health(&self) -> HealthStatus {
        self.health
    }

    /// Highest committed height and block id.
    pub fn head(&self) -> (u64, BlockId) {
        (self.height - 1, self.head_id)
    }

    /// Number of pending transactions.
    pub fn pending_trxs(&self) -> usize {
        self.pool.len()
    }

    /// Block the node is locked on at this height.
    pub fn locked_block(&self) -> Option<BlockId> {
        self.lock.as_ref().and_then(|lock| lock.block_id())
    }

    /// When the current round times out, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.round.deadline()
    }

    /// Subscribes to commit notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitEvent> {
        self.commits.subscribe()
    }

    /// Sender side of the commit notifications.
    pub fn commit_sender(&self) -> broadcast::Sender<CommitEvent> {
        self.commits.clone()
    }

    /// Watches the engine status.
    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Current status snapshot.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            height: self.height,
            round: self.round.round(),
            state: self.state,
            roles: self.roles,
            health: self.health,
            head_id: self.head_id,
            pending_trxs: self.pool.len(),
        }
    }

    /// Adds transactions to the pool.
    ///
    /// Fails without side effects if the node is not a producer or a
    /// transaction id does not match its content.
    pub fn submit_trxs(&mut self, trxs: Vec<Trx>) -> Result<SubmitReceipt> {
        if !self.roles.producer {
            return Err(ConsensusError::Validation(format!(
                "node {} is not a producer of group {}",
                self.node_id.short(),
                self.group.group_id
            )));
        }
        if let Some(bad) = trxs.iter().find(|trx| !trx.verify_id(&self.group.group_id)) {
            return Err(ConsensusError::Validation(format!(
                "transaction {} does not match its content",
                bad.id.short()
            )));
        }
        if let Some(bad) = trxs
            .iter()
            .find(|trx| !trx.is_authorized(&self.group.group_id, &self.group.owner))
        {
            return Err(ConsensusError::Validation(format!(
                "producer update {} is not signed by the group owner",
                bad.id.short()
            )));
        }

        let mut receipt = SubmitReceipt::default();
        for trx in trxs {
            let id = trx.id;
            match self.pool.add(trx) {
                AddOutcome::Added | AddOutcome::Pending => receipt.pending.push(id),
                AddOutcome::Committed => receipt.committed.push(id),
            }
        }

        debug!(
            group_id = %self.group.group_id,
            pending = receipt.pending.len(),
            committed = receipt.committed.len(),
            pool = self.pool.len(),
            "Submitted transactions"
        );

        if !self.pool.is_empty() {
            self.arm_deadline();
        }
        self.publish_status();
        Ok(receipt)
    }

    /// Takes transactions out of the pool so they are never proposed.
    ///
    /// Transactions already committed, or carried by the current proposal
    /// or the vote lock, are reported instead of withdrawn.
    pub fn withdraw_trxs(&mut self, ids: &[TrxId]) -> WithdrawReceipt {
        let proposed: HashSet<TrxId> = [self.round.proposal(), self.lock.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|msg| msg.proposed_block())
            .flat_map(|block| block.trx_ids())
            .collect();

        let mut receipt = WithdrawReceipt::default();
        for id in ids {
            if self.pool.is_committed(id) {
                receipt.committed.push(*id);
            } else if proposed.contains(id) {
                receipt.in_flight.push(*id);
            } else {
                self.pool.remove(id);
                receipt.withdrawn.push(*id);
            }
        }

        debug!(
            group_id = %self.group.group_id,
            withdrawn = receipt.withdrawn.len(),
            committed = receipt.committed.len(),
            in_flight = receipt.in_flight.len(),
            "Withdrew transactions"
        );
        self.publish_status();
        receipt
    }

    /// Proposes a block if this node is the eligible proposer, the engine is
    /// IDLE and there is something to propose. Returns whether a proposal was
    /// broadcast.
    pub async fn try_propose(&mut self) -> Result<bool> {
        let result = self.propose_if_eligible().await;
        self.drain_replay().await;
        self.publish_status();
        result
    }

    /// Processes one inbound protocol message.
    ///
    /// Validation faults are counted and returned; the message is dropped.
    /// Buffered messages that become current are replayed before returning.
    pub async fn handle_hb_msg(&mut self, msg: HbMsg) -> Result<()> {
        let result = self.process(msg).await;
        if let Err(e) = &result {
            self.record_fault(e);
        }
        self.drain_replay().await;
        self.publish_status();
        result
    }

    /// Abandons the current round and starts the next one at the same
    /// height. Only the vote lock survives.
    pub async fn recreate_bft(&mut self) -> Result<()> {
        let next = self.round.round() + 1;
        info!(
            group_id = %self.group.group_id,
            height = self.height,
            round = next,
            "Recreating BFT round"
        );
        self.enter_round(next);
        if self.has_work() {
            self.arm_deadline();
        }
        let result = self.propose_if_eligible().await.map(|_| ());
        self.drain_replay().await;
        self.publish_status();
        result
    }

    /// Handles expiry of the round deadline.
    ///
    /// Retries a commit whose persistence failed; otherwise enters
    /// RECOVERING, announces the timeout and returns
    /// [`ConsensusError::QuorumTimeout`].
    pub async fn on_deadline(&mut self) -> Result<()> {
        let result = self.handle_deadline().await;
        self.drain_replay().await;
        self.publish_status();
        result
    }

    async fn process(&mut self, msg: HbMsg) -> Result<()> {
        if msg.group_id != self.group.group_id {
            return Err(ConsensusError::Validation(format!(
                "message for group {} delivered to {}",
                msg.group_id, self.group.group_id
            )));
        }
        if msg.sender == self.node_id {
            return Ok(());
        }
        if !self.verify(&msg) {
            return Err(ConsensusError::Validation(format!(
                "invalid {} signature from {}",
                msg.phase(),
                msg.sender.short()
            )));
        }

        if msg.phase() == Phase::SyncRequest {
            return self.on_sync_request(&msg);
        }

        match msg.height.cmp(&self.height) {
            Ordering::Less => {
                trace!(
                    group_id = %self.group.group_id,
                    phase = %msg.phase(),
                    height = msg.height,
                    "Ignoring message for committed height"
                );
                self.iface.metrics.dropped(drop_reason::STALE);
                Ok(())
            }
            Ordering::Greater => {
                self.buffer_future(msg);
                Ok(())
            }
            Ordering::Equal => match msg.phase() {
                Phase::Commit => self.on_commit(msg).await,
                phase => {
                    if !self.group.producers.contains(&msg.sender) {
                        return Err(ConsensusError::Validation(format!(
                            "{} from non-producer {}",
                            phase,
                            msg.sender.short()
                        )));
                    }
                    match phase {
                        Phase::Propose => self.on_propose(msg).await,
                        Phase::Vote => self.on_vote(msg).await,
                        Phase::TimeoutNotify => self.on_timeout_notify(msg).await,
                        Phase::Commit | Phase::SyncRequest => Ok(()),
                    }
                }
            },
        }
    }

    async fn drain_replay(&mut self) {
        while let Some(msg) = self.replay.pop_front() {
            if let Err(e) = self.process(msg).await {
                self.record_fault(&e);
                debug!(group_id = %self.group.group_id, error = %e, "Buffered message rejected");
            }
        }
    }

    fn record_fault(&self, e: &ConsensusError) {
        if let ConsensusError::Validation(reason) = e {
            self.iface.metrics.dropped(drop_reason::VALIDATION);
            debug!(group_id = %self.group.group_id, reason = %reason, "Dropped invalid message");
        }
    }

    fn on_sync_request(&self, msg: &HbMsg) -> Result<()> {
        if msg.height >= self.height {
            return Ok(());
        }
        let Some(certificate) = self.iface.blocks.get_block(&self.group.group_id, msg.height)? else {
            return Ok(());
        };
        debug!(
            group_id = %self.group.group_id,
            height = msg.height,
            peer = %msg.sender.short(),
            "Answering sync request"
        );
        let reply = self.sign(msg.height, certificate.round, HbPayload::Commit { certificate });
        self.broadcast(reply);
        Ok(())
    }

    async fn on_propose(&mut self, msg: HbMsg) -> Result<()> {
        let current = self.round.round();
        if msg.round < current {
            trace!(group_id = %self.group.group_id, round = msg.round, "Ignoring proposal for past round");
            return Ok(());
        }

        let eligible = self
            .group
            .producers
            .proposer_for(self.height, msg.round)
            .map(|p| &p.node_id);
        if eligible != Some(&msg.sender) {
            return Err(ConsensusError::Validation(format!(
                "proposal from {} but it is not the proposer of height {} round {}",
                msg.sender.short(),
                self.height,
                msg.round
            )));
        }

        let HbPayload::Propose { block, justify } = &msg.payload else {
            return Ok(());
        };
        match msg.round {
            0 if !justify.is_empty() => {
                return Err(ConsensusError::Validation(
                    "round 0 proposal carries a justification".into(),
                ));
            }
            0 => {}
            round => self.verify_justification(justify, round - 1)?,
        }
        self.validate_block(block)?;

        if msg.round > current {
            info!(
                group_id = %self.group.group_id,
                height = self.height,
                from = current,
                to = msg.round,
                "Justified proposal for a later round, fast-forwarding"
            );
            self.enter_round(msg.round);
        }
        for notice in justify {
            self.timeouts
                .entry(notice.round)
                .or_default()
                .insert(notice.clone());
        }

        match self.round.set_proposal(msg.clone()) {
            ProposalOutcome::Accepted => {}
            ProposalOutcome::Duplicate => return Ok(()),
            ProposalOutcome::Conflict => {
                warn!(
                    group_id = %self.group.group_id,
                    height = self.height,
                    round = msg.round,
                    proposer = %msg.sender.short(),
                    "Proposer equivocated"
                );
                return Err(ConsensusError::Validation(format!(
                    "conflicting proposal from {} at height {} round {}",
                    msg.sender.short(),
                    self.height,
                    msg.round
                )));
            }
        }
        self.arm_deadline();

        let block_id = block.id();
        debug!(
            group_id = %self.group.group_id,
            height = self.height,
            round = msg.round,
            block_id = %block_id.short(),
            trxs = block.trx_count(),
            "Received proposal"
        );

        if self.roles.producer && !self.round.voted() && !self.round.timeout_sent() {
            if self.can_vote_for(&block_id, justify, msg.round) {
                let vote = self.cast_vote(&msg);
                self.set_state(EngineState::Voting);
                self.broadcast(vote);
            } else {
                warn!(
                    group_id = %self.group.group_id,
                    height = self.height,
                    round = msg.round,
                    block_id = %block_id.short(),
                    "Locked on another block, not voting"
                );
            }
        }

        self.try_commit().await
    }

    async fn on_vote(&mut self, msg: HbMsg) -> Result<()> {
        let current = self.round.round();
        if msg.round < current {
            return Ok(());
        }
        if msg.round > current {
            self.buffer_round(msg);
            return Ok(());
        }

        let sender = msg.sender.clone();
        match self.round.add_vote(msg) {
            VoteOutcome::Added => {
                trace!(group_id = %self.group.group_id, sender = %sender.short(), "Recorded vote");
            }
            VoteOutcome::Duplicate => return Ok(()),
            VoteOutcome::Equivocation => {
                warn!(
                    group_id = %self.group.group_id,
                    height = self.height,
                    round = current,
                    sender = %sender.short(),
                    "Equivocating vote"
                );
                return Err(ConsensusError::Validation(format!(
                    "equivocating vote from {}",
                    sender.short()
                )));
            }
        }

        self.arm_deadline();
        self.try_commit().await
    }

    async fn on_timeout_notify(&mut self, msg: HbMsg) -> Result<()> {
        if msg.round + 1 < self.round.round() {
            return Ok(());
        }
        if let Some(lock) = reported_lock(&msg) {
            self.validate_lock(lock, msg.round)?;
        }

        let round = msg.round;
        if !self.timeouts.entry(round).or_default().insert(msg) {
            return Ok(());
        }
        self.arm_deadline();
        self.check_timeouts().await
    }

    async fn on_commit(&mut self, msg: HbMsg) -> Result<()> {
        if !self.roles.user {
            return Ok(());
        }
        let HbPayload::Commit { certificate } = msg.payload else {
            return Ok(());
        };
        self.verify_certificate(&certificate)?;

        self.set_state(EngineState::Committing);
        self.persist(&certificate).await?;
        debug!(
            group_id = %self.group.group_id,
            height = certificate.height(),
            from = %msg.sender.short(),
            "Applied commit certificate"
        );
        self.apply_committed(certificate, false);
        Ok(())
    }

    async fn propose_if_eligible(&mut self) -> Result<bool> {
        if !self.roles.producer || self.state != EngineState::Idle {
            return Ok(false);
        }
        if self.round.proposal().is_some() || self.round.voted() || self.round.timeout_sent() {
            return Ok(false);
        }
        let round = self.round.round();
        let eligible = self
            .group
            .producers
            .proposer_for(self.height, round)
            .map(|p| &p.node_id);
        if eligible != Some(&self.node_id) {
            return Ok(false);
        }

        let (block, justify) = if round == 0 {
            if self.pool.is_empty() {
                return Ok(false);
            }
            (self.build_block(), Vec::new())
        } else {
            let Some(justify) = self.justification_for(round - 1) else {
                return Ok(false);
            };
            match self.choose_reproposal(&justify) {
                Some(block) => (block, justify),
                None if self.pool.is_empty() => return Ok(false),
                None => (self.build_block(), justify),
            }
        };

        let block_id = block.id();
        let trxs = block.trx_count();
        let proposal = self.sign(self.height, round, HbPayload::Propose { block, justify });
        self.round.set_proposal(proposal.clone());
        let vote = self.cast_vote(&proposal);
        self.set_state(EngineState::Proposing);

        info!(
            group_id = %self.group.group_id,
            height = self.height,
            round,
            block_id = %block_id.short(),
            trxs,
            "Proposing block"
        );
        self.broadcast(proposal);
        self.broadcast(vote);
        self.arm_deadline();

        self.try_commit().await?;
        Ok(true)
    }

    fn build_block(&self) -> Block {
        Block::new(
            self.group.group_id.clone(),
            self.height,
            self.head_id,
            self.node_id.clone(),
            now_millis(),
            self.pool.take_for_proposal(self.iface.config.max_trxs_per_block),
        )
    }

    /// Signs a vote for `proposal`, records it and locks on the proposal.
    fn cast_vote(&mut self, proposal: &HbMsg) -> HbMsg {
        let block_id = proposal.block_id().unwrap_or(BlockId::ZERO);
        let vote = self.sign(self.height, proposal.round, HbPayload::Vote { block_id });
        self.lock = Some(proposal.without_justification());
        self.round.mark_voted();
        self.round.add_vote(vote.clone());
        vote
    }

    /// Notices for `round` if their weight reaches quorum.
    fn justification_for(&self, round: u64) -> Option<Vec<HbMsg>> {
        let set = self.timeouts.get(&round)?;
        (set.weight(&self.group.producers) >= self.group.producers.quorum_weight())
            .then(|| set.notices())
    }

    /// Picks the block a proposer must re-propose, if any.
    ///
    /// Among the locks reported in the justification the heaviest wins, then
    /// the most recent lock round, then the smaller block id. The proposer's
    /// own lock takes precedence when the justification cannot release it.
    fn choose_reproposal(&self, justify: &[HbMsg]) -> Option<Block> {
        let producers = &self.group.producers;
        let mut candidates: HashMap<BlockId, (u64, u64, &HbMsg)> = HashMap::new();
        for notice in justify {
            let Some(lock) = reported_lock(notice) else {
                continue;
            };
            let Some(id) = lock.block_id() else {
                continue;
            };
            let entry = candidates.entry(id).or_insert((0, lock.round, lock));
            entry.0 = entry.0.saturating_add(producers.weight_of(&notice.sender));
            if lock.round > entry.1 {
                entry.1 = lock.round;
                entry.2 = lock;
            }
        }

        let chosen = candidates
            .into_iter()
            .max_by(|(a_id, a), (b_id, b)| {
                a.0.cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, (_, _, lock))| (id, lock));

        if let Some(own) = &self.lock {
            if let Some(own_id) = own.block_id() {
                let differs = chosen.map(|(id, _)| id) != Some(own_id);
                if differs && !self.can_unlock(&own_id, justify) {
                    return own.proposed_block().cloned();
                }
            }
        }
        chosen.and_then(|(_, lock)| lock.proposed_block().cloned())
    }

    fn can_vote_for(&self, block_id: &BlockId, justify: &[HbMsg], round: u64) -> bool {
        match self.lock.as_ref().and_then(|lock| lock.block_id()) {
            None => true,
            Some(locked) if locked == *block_id => true,
            Some(locked) => round > 0 && self.can_unlock(&locked, justify),
        }
    }

    /// Whether the justification proves `locked` cannot have been committed.
    ///
    /// Every honest voter of a committed block stays locked on it, so its
    /// notices report it. The weight that may have voted for `locked` is the
    /// senders reporting it, plus faulty senders reporting something else,
    /// plus everyone who sent no notice. Below quorum, `locked` is free.
    fn can_unlock(&self, locked: &BlockId, justify: &[HbMsg]) -> bool {
        let producers = &self.group.producers;
        let justified = producers.signed_weight(justify.iter().map(|n| &n.sender));
        let reporting = producers.signed_weight(
            justify
                .iter()
                .filter(|n| reported_lock(n).and_then(|l| l.block_id()).as_ref() == Some(locked))
                .map(|n| &n.sender),
        );
        let total = producers.total_weight();
        let bound = reporting
            .saturating_add(producers.max_faulty_weight().min(justified.saturating_sub(reporting)))
            .saturating_add(total.saturating_sub(justified));
        bound < producers.quorum_weight()
    }

    async fn handle_deadline(&mut self) -> Result<()> {
        if self.round.quorum_block(&self.group.producers).is_some() {
            debug!(
                group_id = %self.group.group_id,
                height = self.height,
                "Retrying commit after deadline"
            );
            let retry_at = Instant::now() + self.timeout_duration();
            self.round.rearm(retry_at);
            return self.try_commit().await;
        }

        let (height, round) = (self.height, self.round.round());
        warn!(
            group_id = %self.group.group_id,
            height,
            round,
            state = %self.state,
            votes = self.round.votes().len(),
            "Round timed out"
        );
        self.set_state(EngineState::Recovering);
        if self.health != HealthStatus::StorageFault {
            self.set_health(HealthStatus::Recovering);
        }
        self.iface
            .metrics
            .round_timeouts
            .get_or_create(&self.labels)
            .inc();

        if self.roles.producer {
            match self.round.own_timeout().cloned() {
                Some(notice) => self.broadcast(notice),
                None => self.send_timeout(),
            }
        }
        self.request_sync(true);
        let retry_at = Instant::now() + self.timeout_duration();
        self.round.rearm(retry_at);

        self.check_timeouts().await?;
        Err(ConsensusError::QuorumTimeout { height, round })
    }

    /// Broadcasts this node's TIMEOUT-NOTIFY for the current round.
    fn send_timeout(&mut self) {
        let round = self.round.round();
        let notice = self.sign(
            self.height,
            round,
            HbPayload::TimeoutNotify {
                lock: self.lock.clone().map(Box::new),
            },
        );
        self.round.set_own_timeout(notice.clone());
        self.timeouts.entry(round).or_default().insert(notice.clone());
        self.broadcast(notice);
    }

    /// Moves to a later round on a quorum of notices, or joins the timeout
    /// once enough notices prove an honest producer gave up.
    async fn check_timeouts(&mut self) -> Result<()> {
        loop {
            let producers = &self.group.producers;
            let current = self.round.round();
            let quorum_round = self
                .timeouts
                .range(current..)
                .rev()
                .find(|(_, set)| set.weight(producers) >= producers.quorum_weight())
                .map(|(round, _)| *round);

            if let Some(round) = quorum_round {
                info!(
                    group_id = %self.group.group_id,
                    height = self.height,
                    round = round + 1,
                    "Timeout quorum reached, starting next round"
                );
                self.enter_round(round + 1);
                self.arm_deadline();
                self.propose_if_eligible().await?;
                return Ok(());
            }

            let weight = self
                .timeouts
                .get(&current)
                .map(|set| set.weight(producers))
                .unwrap_or(0);
            if weight >= producers.honest_weight()
                && self.roles.producer
                && !self.round.timeout_sent()
            {
                debug!(group_id = %self.group.group_id, round = current, "Joining round timeout");
                self.send_timeout();
                continue;
            }
            return Ok(());
        }
    }

    /// Replaces the round; buffered votes for it are queued for replay.
    fn enter_round(&mut self, round: u64) {
        self.round = ConsensusRound::new(self.height, round);
        self.set_state(EngineState::Idle);
        self.timeouts = self.timeouts.split_off(&round.saturating_sub(1));

        let (ready, later): (Vec<HbMsg>, Vec<HbMsg>) = std::mem::take(&mut self.round_buffer)
            .into_iter()
            .filter(|msg| msg.round >= round)
            .partition(|msg| msg.round == round);
        self.round_buffer = later;
        self.replay.extend(ready);
    }

    fn timeout_duration(&self) -> Duration {
        self.iface.config.timeout_for_round(self.round.round())
    }

    fn arm_deadline(&mut self) {
        let deadline = Instant::now() + self.timeout_duration();
        self.round.arm(deadline);
    }

    fn has_work(&self) -> bool {
        (self.roles.producer && !self.pool.is_empty())
            || self.round.has_activity()
            || !self.timeouts.is_empty()
    }

    async fn try_commit(&mut self) -> Result<()> {
        let Some(block_id) = self.round.quorum_block(&self.group.producers) else {
            return Ok(());
        };
        let Some(block) = self
            .round
            .proposal()
            .and_then(|p| p.proposed_block())
            .cloned()
        else {
            return Ok(());
        };

        self.set_state(EngineState::Committing);
        let votes = self.round.votes().votes_for(&block_id);
        let committed = CommittedBlock::new(block, self.round.round(), votes);
        self.persist(&committed).await?;
        self.apply_committed(committed, self.roles.producer);
        Ok(())
    }

    /// Appends a block with retries. Exhausted retries force RECOVERING.
    async fn persist(&mut self, committed: &CommittedBlock) -> Result<()> {
        let blocks = Arc::clone(&self.iface.blocks);
        let group_id = self.group.group_id.clone();
        let policy = self.iface.config.storage_retry.clone();

        let result = policy
            .execute(|| {
                let outcome = blocks.append_block(&group_id, committed);
                async move { outcome }
            })
            .await;

        let Err(e) = result else {
            return Ok(());
        };
        // the append may have landed before the error surfaced
        if let Ok(Some((height, id))) = blocks.get_highest_block(&group_id) {
            if height == committed.height() && id == committed.id() {
                return Ok(());
            }
        }

        error!(
            group_id = %group_id,
            height = committed.height(),
            error = %e,
            "Failed to persist committed block"
        );
        self.iface
            .metrics
            .storage_faults
            .get_or_create(&self.labels)
            .inc();
        self.set_state(EngineState::Recovering);
        self.set_health(HealthStatus::StorageFault);
        let retry_at = Instant::now() + self.timeout_duration();
        self.round.rearm(retry_at);
        Err(ConsensusError::Storage(e))
    }

    /// Applies a persisted block and moves to the next height.
    fn apply_committed(&mut self, committed: CommittedBlock, announce: bool) {
        let height = committed.height();
        let block_id = committed.id();
        let trx_ids: Vec<TrxId> = committed.block.trx_ids().collect();

        self.pool.mark_committed(&trx_ids);
        if let Some(list) = governance_update(&self.group, &committed.block) {
            match ProducerSet::new(list) {
                Ok(producers) => {
                    info!(
                        group_id = %self.group.group_id,
                        height,
                        producers = producers.len(),
                        "Producer set updated"
                    );
                    self.group.producers = producers;
                }
                Err(e) => warn!(group_id = %self.group.group_id, error = %e, "Ignoring invalid producer update"),
            }
        }

        self.group.highest_height = height;
        self.group.highest_block_id = block_id;
        if let Err(e) = self.iface.groups.save_group(&self.group) {
            // the block store stays authoritative; the record is re-derived on restart
            warn!(group_id = %self.group.group_id, error = %e, "Failed to save group record");
        }

        let roles = Roles::derive(&self.node_id, &self.group.producers, &self.group);
        if roles != self.roles {
            info!(group_id = %self.group.group_id, from = %self.roles, to = %roles, "Roles changed");
            self.roles = roles;
        }

        self.iface
            .metrics
            .blocks_committed
            .get_or_create(&self.labels)
            .inc();
        info!(
            group_id = %self.group.group_id,
            height,
            round = committed.round,
            block_id = %block_id.short(),
            trxs = trx_ids.len(),
            "Committed block"
        );
        let _ = self.commits.send(CommitEvent {
            group_id: self.group.group_id.clone(),
            height,
            block_id,
            trx_ids,
        });

        if announce {
            let notice = self.sign(height, committed.round, HbPayload::Commit { certificate: committed });
            self.broadcast(notice);
        }

        self.height = height + 1;
        self.head_id = block_id;
        self.round = ConsensusRound::new(self.height, 0);
        self.lock = None;
        self.timeouts.clear();
        self.round_buffer.clear();
        self.set_state(EngineState::Idle);
        self.set_health(HealthStatus::Healthy);

        let ready = self.future.remove(&self.height).unwrap_or_default();
        self.future = self.future.split_off(&self.height);
        self.replay.extend(ready);
        if !self.future.is_empty() {
            self.request_sync(false);
        }
        if self.has_work() {
            self.arm_deadline();
        }
    }

    fn verify(&self, msg: &HbMsg) -> bool {
        self.iface
            .identity
            .verify(&msg.sender, &msg.signing_data(), &msg.signature)
    }

    fn validate_block(&self, block: &Block) -> Result<()> {
        let header = &block.header;
        let invalid = |reason: String| Err(ConsensusError::Validation(reason));

        if header.group_id != self.group.group_id || header.height != self.height {
            return invalid(format!(
                "block for {} height {} while agreeing on height {}",
                header.group_id, header.height, self.height
            ));
        }
        if header.prev_block_id != self.head_id {
            return invalid(format!(
                "block {} does not extend head {}",
                block.id().short(),
                self.head_id.short()
            ));
        }
        if !self.group.producers.contains(&header.producer) {
            return invalid(format!("block built by non-producer {}", header.producer.short()));
        }
        if !block.verify_trx_root() {
            return invalid("transaction root mismatch".into());
        }
        if block.trx_count() > self.iface.config.max_trxs_per_block {
            return invalid(format!("block carries {} transactions", block.trx_count()));
        }

        let mut seen = HashSet::new();
        for trx in &block.trxs {
            if !trx.verify_id(&self.group.group_id) {
                return invalid(format!("transaction {} does not match its content", trx.id.short()));
            }
            if !seen.insert(trx.id) {
                return invalid(format!("transaction {} included twice", trx.id.short()));
            }
            if self.pool.is_committed(&trx.id) {
                return invalid(format!("transaction {} already committed", trx.id.short()));
            }
            if !trx.is_authorized(&self.group.group_id, &self.group.owner) {
                return invalid(format!(
                    "producer update {} is not signed by the group owner",
                    trx.id.short()
                ));
            }
            if let TrxBody::UpdateProducers(update) = &trx.body {
                if let Err(e) = ProducerSet::new(update.producers.clone()) {
                    return invalid(format!("invalid producer update: {}", e));
                }
            }
        }
        Ok(())
    }

    /// Checks a justification: signed notices of `round` with quorum weight.
    fn verify_justification(&self, justify: &[HbMsg], round: u64) -> Result<()> {
        let producers = &self.group.producers;
        let mut senders = HashSet::new();
        for notice in justify {
            let HbPayload::TimeoutNotify { lock } = &notice.payload else {
                return Err(ConsensusError::Validation("justification carries a non-timeout message".into()));
            };
            if notice.group_id != self.group.group_id
                || notice.height != self.height
                || notice.round != round
            {
                return Err(ConsensusError::Validation(format!(
                    "justification notice for height {} round {}",
                    notice.height, notice.round
                )));
            }
            if !producers.contains(&notice.sender) || !self.verify(notice) {
                return Err(ConsensusError::Validation(format!(
                    "unverifiable justification notice from {}",
                    notice.sender.short()
                )));
            }
            if let Some(lock) = lock {
                self.validate_lock(lock, round)?;
            }
            senders.insert(&notice.sender);
        }

        if producers.signed_weight(senders) < producers.quorum_weight() {
            return Err(ConsensusError::Validation(format!(
                "justification for round {} below quorum",
                round
            )));
        }
        Ok(())
    }

    /// Checks a lock reported in a notice for `max_round`.
    fn validate_lock(&self, lock: &HbMsg, max_round: u64) -> Result<()> {
        let Some(block) = lock.proposed_block() else {
            return Err(ConsensusError::Validation("reported lock is not a proposal".into()));
        };
        if lock.group_id != self.group.group_id
            || lock.height != self.height
            || lock.round > max_round
        {
            return Err(ConsensusError::Validation(format!(
                "reported lock for height {} round {}",
                lock.height, lock.round
            )));
        }
        let eligible = self
            .group
            .producers
            .proposer_for(self.height, lock.round)
            .map(|p| &p.node_id);
        if eligible != Some(&lock.sender) || !self.verify(lock) {
            return Err(ConsensusError::Validation(format!(
                "reported lock not signed by the proposer of round {}",
                lock.round
            )));
        }
        if block.height() != self.height || block.header.prev_block_id != self.head_id {
            return Err(ConsensusError::Validation("reported lock does not extend the head".into()));
        }
        Ok(())
    }

    fn verify_certificate(&self, certificate: &CommittedBlock) -> Result<()> {
        let block = &certificate.block;
        let block_id = certificate.id();
        if block.header.group_id != self.group.group_id
            || block.height() != self.height
            || block.header.prev_block_id != self.head_id
        {
            return Err(ConsensusError::Validation(format!(
                "certificate for height {} does not extend the head",
                block.height()
            )));
        }
        if !block.verify_trx_root() {
            return Err(ConsensusError::Validation("certificate block has a bad transaction root".into()));
        }

        let producers = &self.group.producers;
        let mut signers = HashSet::new();
        for vote in &certificate.votes {
            let votes_block = matches!(&vote.payload, HbPayload::Vote { block_id: id } if *id == block_id);
            if !votes_block
                || vote.round != certificate.round
                || vote.height != self.height
                || vote.group_id != self.group.group_id
            {
                return Err(ConsensusError::Validation("certificate carries a foreign vote".into()));
            }
            if !producers.contains(&vote.sender) || !self.verify(vote) {
                return Err(ConsensusError::Validation(format!(
                    "certificate vote from {} is not verifiable",
                    vote.sender.short()
                )));
            }
            if !signers.insert(&vote.sender) {
                return Err(ConsensusError::Validation("certificate repeats a signer".into()));
            }
        }
        if producers.signed_weight(signers) < producers.quorum_weight() {
            return Err(ConsensusError::Validation("certificate below quorum".into()));
        }
        Ok(())
    }

    fn buffered_len(&self) -> usize {
        self.future.values().map(Vec::len).sum::<usize>() + self.round_buffer.len()
    }

    fn buffer_future(&mut self, msg: HbMsg) {
        if self.buffered_len() >= self.iface.config.future_buffer_limit {
            self.iface.metrics.dropped(drop_reason::BUFFER_FULL);
            return;
        }
        trace!(
            group_id = %self.group.group_id,
            height = msg.height,
            phase = %msg.phase(),
            "Buffering message for a later height"
        );
        self.future.entry(msg.height).or_default().push(msg);
        self.request_sync(false);
    }

    fn buffer_round(&mut self, msg: HbMsg) {
        if self.buffered_len() >= self.iface.config.future_buffer_limit {
            self.iface.metrics.dropped(drop_reason::BUFFER_FULL);
            return;
        }
        self.round_buffer.push(msg);
    }

    /// Asks peers for the commit of the current height, at most once per
    /// base timeout unless forced.
    fn request_sync(&mut self, force: bool) {
        let now = Instant::now();
        if let Some((height, at)) = self.last_sync {
            if !force && height == self.height && now.duration_since(at) < self.iface.config.base_timeout {
                return;
            }
        }
        self.last_sync = Some((self.height, now));
        debug!(group_id = %self.group.group_id, height = self.height, "Requesting sync");
        let request = self.sign(self.height, self.round.round(), HbPayload::SyncRequest);
        self.broadcast(request);
    }

    fn sign(&self, height: u64, round: u64, payload: HbPayload) -> HbMsg {
        HbMsg::unsigned(
            self.group.group_id.clone(),
            self.node_id.clone(),
            height,
            round,
            payload,
        )
        .signed(self.iface.identity.as_ref())
    }

    fn broadcast(&self, msg: HbMsg) {
        let phase = msg.phase();
        if let Err(e) = self.iface.transport.broadcast(&self.group.group_id, msg) {
            warn!(group_id = %self.group.group_id, phase = %phase, error = %e, "Broadcast failed");
        }
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!(
                group_id = %self.group.group_id,
                height = self.height,
                round = self.round.round(),
                from = %self.state,
                to = %state,
                "State transition"
            );
            self.state = state;
        }
    }

    fn set_health(&mut self, health: HealthStatus) {
        if self.health == health {
            return;
        }
        match health {
            HealthStatus::Healthy => info!(group_id = %self.group.group_id, "Group healthy"),
            _ => warn!(group_id = %self.group.group_id, health = %health, "Group unhealthy"),
        }
        self.health = health;
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// The producer list of the last owner-signed governance transaction in a block.
fn governance_update(group: &GroupItem, block: &Block) -> Option<Vec<Producer>> {
    block.trxs.iter().rev().find_map(|trx| match &trx.body {
        TrxBody::UpdateProducers(update) if trx.is_authorized(&group.group_id, &group.owner) => {
            Some(update.producers.clone())
        }
        TrxBody::UpdateProducers(_) | TrxBody::App(_) => None,
    })
}

/// Rebuilds a group record from stored blocks up to `head_height`.
fn rederive_group(mut group: GroupItem, blocks: &dyn BlockStore, head_height: u64) -> Result<GroupItem> {
    let group_id = group.group_id.clone();
    for height in (group.highest_height + 1)..=head_height {
        let committed = blocks.get_block(&group_id, height)?.ok_or_else(|| {
            StorageError::NotFound(format!("block {} of group {}", height, group_id))
        })?;
        if let Some(list) = governance_update(&group, &committed.block) {
            if let Ok(producers) = ProducerSet::new(list) {
                group.producers = producers;
            }
        }
        group.highest_height = height;
        group.highest_block_id = committed.id();
    }
    info!(group_id = %group_id, height = head_height, "Re-derived group record from stored blocks");
    Ok(group)
}
