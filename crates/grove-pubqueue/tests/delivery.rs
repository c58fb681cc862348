//! End-to-end delivery of queue entries through a real consensus engine.

use async_trait::async_trait;
use grove_consensus::{
    spawn_engine, CommitEvent, ConsensusIface, ConsensusMetrics, EngineConfig, EngineHandle,
    PSyncer, RecordingTransport, SubmitReceipt, WithdrawReceipt,
};
use grove_pubqueue::{
    DispatchSink, EntryId, EntryStatus, PublishQueue, PublishQueueConfig, QueueError, QueueMetrics,
};
use grove_storage::{BlockStore, FileStore, GroupStore, MemoryStore, QueueStore};
use grove_types::{
    CommittedBlock, ConsensusMode, Ed25519Identity, GroupId, GroupSeed, Identity, Producer, Trx,
    TrxId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn seed() -> (GroupSeed, Arc<Ed25519Identity>) {
    let identity = Arc::new(Ed25519Identity::from_secret_bytes([9; 32]));
    let seed = GroupSeed::create(
        GroupId::new("queue-test"),
        "queue-test",
        identity.node_id(),
        vec![Producer::new(identity.node_id(), "solo", 1)],
        ConsensusMode::Public,
        1,
    )
    .unwrap();
    (seed, identity)
}

fn install<S: BlockStore + GroupStore>(store: &S, seed: &GroupSeed) {
    store
        .append_block(seed.group_id(), &CommittedBlock::genesis(seed.genesis_block.clone()))
        .unwrap();
    store.save_group(&seed.group_item).unwrap();
}

/// Spawns a single-producer engine that commits every submission at once.
fn engine<S>(store: Arc<S>, seed: &GroupSeed, identity: Arc<Ed25519Identity>) -> EngineHandle
where
    S: BlockStore + GroupStore + 'static,
{
    let iface = ConsensusIface {
        blocks: store.clone(),
        groups: store,
        transport: Arc::new(RecordingTransport::new()),
        identity,
        config: EngineConfig::default(),
        metrics: ConsensusMetrics::new(),
    };
    spawn_engine(PSyncer::new(seed.group_item.clone(), "solo", iface).unwrap())
}

/// Occurrences of a transaction across the committed chain.
fn occurrences(store: &dyn BlockStore, group_id: &GroupId, trx_id: &TrxId) -> usize {
    let (head, _) = store.get_highest_block(group_id).unwrap().unwrap();
    (1..=head)
        .filter_map(|h| store.get_block(group_id, h).unwrap())
        .map(|b| b.block.trx_ids().filter(|id| id == trx_id).count())
        .sum()
}

async fn wait_for_status(queue: &PublishQueue, id: &EntryId, status: EntryStatus) {
    for _ in 0..1000 {
        if queue.entry(id).map(|e| e.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("entry {} never reached {}: {:?}", id, status, queue.entry(id));
}

fn fast_config() -> PublishQueueConfig {
    PublishQueueConfig {
        dispatch_interval: Duration::from_millis(100),
        ack_timeout: Duration::from_secs(2),
        max_attempts: 3,
        ..Default::default()
    }
}

/// How a wrapped sink misbehaves on its first calls.
#[derive(Clone, Copy)]
enum Fault {
    /// Refuses the dispatch.
    Refuse,
    /// Forwards the dispatch but reports failure.
    LoseAck,
}

struct FaultySink {
    engine: EngineHandle,
    fault: Fault,
    faults_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FaultySink {
    fn new(engine: EngineHandle, fault: Fault, count: usize) -> Arc<Self> {
        Arc::new(Self {
            engine,
            fault,
            faults_left: AtomicUsize::new(count),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DispatchSink for FaultySink {
    async fn dispatch(&self, trxs: Vec<Trx>) -> grove_pubqueue::Result<SubmitReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let faulty = self
            .faults_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !faulty {
            return self.engine.dispatch(trxs).await;
        }
        match self.fault {
            Fault::Refuse => Err(QueueError::Dispatch("injected".into())),
            Fault::LoseAck => {
                self.engine.dispatch(trxs).await?;
                Err(QueueError::Dispatch("acknowledgment lost".into()))
            }
        }
    }

    async fn withdraw(&self, trx_ids: Vec<TrxId>) -> grove_pubqueue::Result<WithdrawReceipt> {
        DispatchSink::withdraw(&self.engine, trx_ids).await
    }

    fn commits(&self) -> broadcast::Receiver<CommitEvent> {
        self.engine.subscribe()
    }
}

/// Accepts everything and never commits.
struct BlackHole {
    commits: broadcast::Sender<CommitEvent>,
    dispatched: Mutex<Vec<TrxId>>,
}

#[async_trait]
impl DispatchSink for BlackHole {
    async fn dispatch(&self, trxs: Vec<Trx>) -> grove_pubqueue::Result<SubmitReceipt> {
        let ids: Vec<TrxId> = trxs.iter().map(|t| t.id).collect();
        self.dispatched.lock().extend(ids.iter().copied());
        Ok(SubmitReceipt {
            pending: ids,
            committed: vec![],
        })
    }

    fn commits(&self) -> broadcast::Receiver<CommitEvent> {
        self.commits.subscribe()
    }
}

#[tokio::test(start_paused = true)]
async fn test_refused_dispatch_is_retried_and_committed_once() {
    let (seed, identity) = seed();
    let group_id = seed.group_id().clone();
    let store = Arc::new(MemoryStore::new());
    install(store.as_ref(), &seed);
    let handle = engine(store.clone(), &seed, identity);

    let queue = PublishQueue::open(store.clone(), fast_config(), QueueMetrics::new()).unwrap();
    let sink = FaultySink::new(handle.clone(), Fault::Refuse, 1);
    queue.bind(group_id.clone(), sink.clone());

    let id = queue.enqueue(&group_id, b"payload".to_vec()).unwrap();
    wait_for_status(&queue, &id, EntryStatus::Acked).await;

    let entry = queue.entry(&id).unwrap();
    assert_eq!(entry.attempts, 2);
    assert!(entry.last_error.is_none());
    assert_eq!(occurrences(store.as_ref(), &group_id, &entry.trx_id), 1);
    assert!(store.load_entries(&group_id).unwrap().is_empty());

    queue.shutdown().await;
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_acknowledgment_does_not_duplicate() {
    let (seed, identity) = seed();
    let group_id = seed.group_id().clone();
    let store = Arc::new(MemoryStore::new());
    install(store.as_ref(), &seed);
    let handle = engine(store.clone(), &seed, identity);

    let queue = PublishQueue::open(store.clone(), fast_config(), QueueMetrics::new()).unwrap();
    queue.bind(group_id.clone(), FaultySink::new(handle.clone(), Fault::LoseAck, 1));

    let ids: Vec<EntryId> = (0..3u8)
        .map(|i| queue.enqueue(&group_id, vec![i]).unwrap())
        .collect();
    for id in &ids {
        wait_for_status(&queue, id, EntryStatus::Acked).await;
    }

    // let any further dispatch rounds run
    tokio::time::sleep(Duration::from_secs(5)).await;
    for id in &ids {
        let entry = queue.entry(id).unwrap();
        assert_eq!(entry.status, EntryStatus::Acked);
        assert_eq!(occurrences(store.as_ref(), &group_id, &entry.trx_id), 1);
    }

    queue.shutdown().await;
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_ack_acknowledges_on_dispatch() {
    let sink = Arc::new(BlackHole {
        commits: broadcast::channel(8).0,
        dispatched: Mutex::new(vec![]),
    });
    let group_id = GroupId::new("g");
    let config = PublishQueueConfig {
        auto_ack: true,
        ..fast_config()
    };
    let queue = PublishQueue::open(Arc::new(MemoryStore::new()), config, QueueMetrics::new()).unwrap();
    queue.bind(group_id.clone(), sink.clone());

    let id = queue.enqueue(&group_id, b"x".to_vec()).unwrap();
    wait_for_status(&queue, &id, EntryStatus::Acked).await;
    assert_eq!(sink.dispatched.lock().len(), 1);
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_marks_failed() {
    let (seed, identity) = seed();
    let group_id = seed.group_id().clone();
    let store = Arc::new(MemoryStore::new());
    install(store.as_ref(), &seed);
    let handle = engine(store.clone(), &seed, identity);

    let metrics = QueueMetrics::new();
    let queue = PublishQueue::open(store.clone(), fast_config(), metrics.clone()).unwrap();
    let mut failures = queue.subscribe_failures();
    let sink = FaultySink::new(handle.clone(), Fault::Refuse, usize::MAX);
    queue.bind(group_id.clone(), sink.clone());

    let id = queue.enqueue(&group_id, b"doomed".to_vec()).unwrap();
    let failed = failures.recv().await.unwrap();
    assert_eq!(failed.entry_id, id);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.last_error.as_deref(), Some("dispatch failed: injected"));
    assert!(matches!(failed.exhausted(), QueueError::Exhausted { attempts: 3, .. }));

    // no further dispatches once failed
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.failed_count(&group_id), 1);
    assert_eq!(metrics.count(&group_id, EntryStatus::Failed), 1);

    let taken = queue.take_failed(&group_id);
    assert_eq!(taken.len(), 1);
    assert!(queue.entries(&group_id).is_empty());
    assert!(store.load_entries(&group_id).unwrap().is_empty());

    queue.shutdown().await;
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_ack_at_retry_ceiling_is_acknowledged() {
    let (seed, identity) = seed();
    let group_id = seed.group_id().clone();
    let store = Arc::new(MemoryStore::new());
    install(store.as_ref(), &seed);
    let handle = engine(store.clone(), &seed, identity);

    let config = PublishQueueConfig {
        max_attempts: 1,
        ..fast_config()
    };
    let queue = PublishQueue::open(store.clone(), config, QueueMetrics::new()).unwrap();
    let mut failures = queue.subscribe_failures();
    queue.bind(group_id.clone(), FaultySink::new(handle.clone(), Fault::LoseAck, 1));

    let id = queue.enqueue(&group_id, b"applied".to_vec()).unwrap();
    wait_for_status(&queue, &id, EntryStatus::Acked).await;

    let entry = queue.entry(&id).unwrap();
    assert_eq!(entry.attempts, 1);
    assert_eq!(occurrences(store.as_ref(), &group_id, &entry.trx_id), 1);
    assert!(failures.try_recv().is_err());
    assert!(queue.take_failed(&group_id).is_empty());

    queue.shutdown().await;
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_entry_is_withdrawn_from_engine_pool() {
    // two producers, the other one never shows up: nothing can commit and
    // the local node is not the proposer of height 1 round 0
    let identity = Arc::new(Ed25519Identity::from_secret_bytes([9; 32]));
    let absent = Ed25519Identity::from_secret_bytes([10; 32]);
    let seed = GroupSeed::create(
        GroupId::new("stalled"),
        "stalled",
        identity.node_id(),
        vec![
            Producer::new(identity.node_id(), "local", 1),
            Producer::new(absent.node_id(), "absent", 1),
        ],
        ConsensusMode::Public,
        1,
    )
    .unwrap();
    let group_id = seed.group_id().clone();
    let store = Arc::new(MemoryStore::new());
    install(store.as_ref(), &seed);
    let handle = engine(store.clone(), &seed, identity);

    let config = PublishQueueConfig {
        max_attempts: 1,
        ..fast_config()
    };
    let queue = PublishQueue::open(store.clone(), config, QueueMetrics::new()).unwrap();
    queue.bind(group_id.clone(), Arc::new(handle.clone()));

    let id = queue.enqueue(&group_id, b"stuck".to_vec()).unwrap();
    wait_for_status(&queue, &id, EntryStatus::Sent).await;
    assert_eq!(handle.status().pending_trxs, 1);

    wait_for_status(&queue, &id, EntryStatus::Failed).await;
    assert_eq!(handle.status().pending_trxs, 0);
    assert_eq!(
        queue.entry(&id).unwrap().last_error.as_deref(),
        Some("not committed before the acknowledgment timeout")
    );

    queue.shutdown().await;
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_redispatches_same_transaction() {
    let sink = Arc::new(BlackHole {
        commits: broadcast::channel(8).0,
        dispatched: Mutex::new(vec![]),
    });
    let group_id = GroupId::new("g");
    let config = PublishQueueConfig {
        max_attempts: 2,
        ..fast_config()
    };
    let queue = PublishQueue::open(Arc::new(MemoryStore::new()), config, QueueMetrics::new()).unwrap();
    queue.bind(group_id.clone(), sink.clone());

    let id = queue.enqueue(&group_id, b"x".to_vec()).unwrap();
    wait_for_status(&queue, &id, EntryStatus::Sent).await;
    wait_for_status(&queue, &id, EntryStatus::Failed).await;

    let dispatched = sink.dispatched.lock().clone();
    assert_eq!(dispatched.len(), 2);
    assert_eq!(dispatched[0], dispatched[1]);
    assert_eq!(queue.entry(&id).unwrap().attempts, 2);
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (seed, identity) = seed();
    let group_id = seed.group_id().clone();

    let ids: Vec<EntryId> = {
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        install(store.as_ref(), &seed);
        let queue = PublishQueue::open(store, fast_config(), QueueMetrics::new()).unwrap();
        (0..2u8)
            .map(|i| queue.enqueue(&group_id, vec![i]).unwrap())
            .collect()
    };

    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let queue = PublishQueue::open(store.clone(), fast_config(), QueueMetrics::new()).unwrap();
    let reloaded: Vec<EntryId> = queue.entries(&group_id).iter().map(|e| e.entry_id).collect();
    assert_eq!(reloaded, ids);

    let handle = engine(store.clone(), &seed, identity);
    queue.bind(group_id.clone(), Arc::new(handle.clone()));
    for id in &ids {
        wait_for_status(&queue, id, EntryStatus::Acked).await;
    }
    assert!(store.load_entries(&group_id).unwrap().is_empty());

    assert!(queue.is_bound(&group_id));
    assert!(queue.unbind(&group_id).await);
    assert!(!queue.is_bound(&group_id));
    assert!(!queue.unbind(&group_id).await);
    handle.stop().await;
}
