//! Test harness: a cluster of PSyncers whose messages are delivered by hand.

#![allow(dead_code)]

use grove_consensus::{
    CommitEvent, ConsensusIface, ConsensusMetrics, EngineConfig, PSyncer, RecordingTransport,
    RetryPolicy,
};
use grove_storage::{BlockStore, GroupStore, MemoryStore};
use grove_types::{
    BlockId, CommittedBlock, ConsensusMode, Ed25519Identity, GroupId, GroupSeed, HbMsg, Identity,
    Producer, Trx, TrxBody,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Deterministic identity number `i`.
pub fn identity(i: usize) -> Arc<Ed25519Identity> {
    Arc::new(Ed25519Identity::from_secret_bytes([i as u8 + 1; 32]))
}

/// Engine configuration with short timeouts and fast retries.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        base_timeout: Duration::from_millis(100),
        storage_retry: RetryPolicy::new(3, Duration::from_millis(10)),
        ..Default::default()
    }
}

/// An application transaction with a unique nonce.
pub fn app_trx(group_id: &GroupId, nonce: &str) -> Trx {
    Trx::new(group_id, nonce, TrxBody::App(nonce.as_bytes().to_vec()))
}

/// Seed of a public group whose producers are identities `0..producers`.
pub fn seed(name: &str, producers: usize) -> GroupSeed {
    let list = (0..producers)
        .map(|i| Producer::new(identity(i).node_id(), format!("p{}", i), 1))
        .collect();
    GroupSeed::create(
        GroupId::new(name),
        name,
        identity(0).node_id(),
        list,
        ConsensusMode::Public,
        1,
    )
    .unwrap()
}

/// A store holding the seed's genesis block and group record.
pub fn seeded_store(seed: &GroupSeed) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .append_block(seed.group_id(), &CommittedBlock::genesis(seed.genesis_block.clone()))
        .unwrap();
    store.save_group(&seed.group_item).unwrap();
    store
}

pub struct TestNode {
    pub psyncer: PSyncer,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<MemoryStore>,
    pub identity: Arc<Ed25519Identity>,
    pub commits: broadcast::Receiver<CommitEvent>,
    pub metrics: ConsensusMetrics,
}

impl TestNode {
    pub fn new(seed: &GroupSeed, index: usize, config: EngineConfig) -> Self {
        let identity = identity(index);
        let store = seeded_store(seed);
        let transport = Arc::new(RecordingTransport::new());
        let metrics = ConsensusMetrics::new();
        let iface = ConsensusIface {
            blocks: store.clone(),
            groups: store.clone(),
            transport: transport.clone(),
            identity: identity.clone(),
            config,
            metrics: metrics.clone(),
        };
        let psyncer = PSyncer::new(seed.group_item.clone(), format!("n{}", index), iface).unwrap();
        let commits = psyncer.subscribe();
        Self {
            psyncer,
            transport,
            store,
            identity,
            commits,
            metrics,
        }
    }

    /// Every commit event received so far.
    pub fn drain_commits(&mut self) -> Vec<CommitEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.commits.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn block_id_at(&self, height: u64) -> Option<BlockId> {
        self.store
            .get_block(self.psyncer.group_id(), height)
            .unwrap()
            .map(|cb| cb.id())
    }
}

/// Nodes `0..producers` are producers, the rest observers.
pub struct Cluster {
    pub seed: GroupSeed,
    pub nodes: Vec<TestNode>,
    pub in_flight: VecDeque<(usize, HbMsg)>,
    pub muted: HashSet<usize>,
}

impl Cluster {
    pub fn new(producers: usize, observers: usize) -> Self {
        let seed = seed("cluster", producers);
        let nodes = (0..producers + observers)
            .map(|i| TestNode::new(&seed, i, test_config()))
            .collect();
        Self {
            seed,
            nodes,
            in_flight: VecDeque::new(),
            muted: HashSet::new(),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.seed.group_id().clone()
    }

    /// Moves every recorded outbound message into the in-flight queue.
    pub fn collect(&mut self) {
        for (from, node) in self.nodes.iter().enumerate() {
            for msg in node.transport.take() {
                for to in 0..self.nodes.len() {
                    if to != from {
                        self.in_flight.push_back((to, msg.clone()));
                    }
                }
            }
        }
    }

    /// Delivers the oldest in-flight message. Returns false when nothing is left.
    pub async fn deliver_next(&mut self) -> bool {
        self.collect();
        let Some((to, msg)) = self.in_flight.pop_front() else {
            return false;
        };
        if !self.muted.contains(&to) {
            let _ = self.nodes[to].psyncer.handle_hb_msg(msg).await;
        }
        true
    }

    pub async fn run_until_quiet(&mut self) {
        while self.deliver_next().await {}
    }

    /// Index of the node that proposes at `(height, round)`.
    pub fn proposer_index(&self, height: u64, round: u64) -> usize {
        let proposer = self.nodes[0]
            .psyncer
            .producers()
            .proposer_for(height, round)
            .unwrap()
            .node_id
            .clone();
        self.nodes
            .iter()
            .position(|n| *n.psyncer.node_id() == proposer)
            .unwrap()
    }

    /// Commits one block carrying `trx` through the round-0 proposer.
    pub async fn commit_next(&mut self, trx: Trx) -> BlockId {
        let height = self.nodes[0].psyncer.height();
        let proposer = self.proposer_index(height, 0);
        self.nodes[proposer].psyncer.submit_trxs(vec![trx]).unwrap();
        assert!(self.nodes[proposer].psyncer.try_propose().await.unwrap());
        self.run_until_quiet().await;
        self.nodes[proposer].block_id_at(height).unwrap()
    }
}
