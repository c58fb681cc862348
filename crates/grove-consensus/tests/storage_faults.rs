//! Storage failure injection.

mod common;

use common::{app_trx, identity, seed, seeded_store};
use grove_consensus::{
    ConsensusError, ConsensusIface, ConsensusMetrics, EngineConfig, EngineState, HealthStatus,
    PSyncer, RecordingTransport, RetryPolicy,
};
use grove_storage::{BlockStore, MemoryStore, StorageError};
use grove_types::{BlockId, CommittedBlock, GroupId};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Block store whose appends can be made to fail.
struct FailableBlockStore {
    inner: Arc<MemoryStore>,
    fail_appends: AtomicBool,
    failures_left: AtomicU32,
    append_attempts: AtomicU32,
    /// Persist the block but report failure, like a lost acknowledgement.
    lose_ack: AtomicBool,
}

impl FailableBlockStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            failures_left: AtomicU32::new(0),
            append_attempts: AtomicU32::new(0),
            lose_ack: AtomicBool::new(false),
        }
    }

    fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    fn set_failing(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

impl BlockStore for FailableBlockStore {
    fn get_highest_block(&self, group_id: &GroupId) -> grove_storage::Result<Option<(u64, BlockId)>> {
        self.inner.get_highest_block(group_id)
    }

    fn append_block(&self, group_id: &GroupId, block: &CommittedBlock) -> grove_storage::Result<()> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        if self.lose_ack.swap(false, Ordering::SeqCst) {
            self.inner.append_block(group_id, block)?;
            return Err(StorageError::Backend("acknowledgement lost".into()));
        }
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("simulated disk failure".into()));
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Backend("simulated transient failure".into()));
        }
        self.inner.append_block(group_id, block)
    }

    fn get_block(&self, group_id: &GroupId, height: u64) -> grove_storage::Result<Option<CommittedBlock>> {
        self.inner.get_block(group_id, height)
    }

    fn remove_group(&self, group_id: &GroupId) -> grove_storage::Result<()> {
        self.inner.remove_group(group_id)
    }
}

fn solo_engine() -> (PSyncer, Arc<FailableBlockStore>, ConsensusMetrics) {
    let seed = seed("faulty", 1);
    let memory = seeded_store(&seed);
    let blocks = Arc::new(FailableBlockStore::new(memory.clone()));
    let metrics = ConsensusMetrics::new();
    let iface = ConsensusIface {
        blocks: blocks.clone(),
        groups: memory,
        transport: Arc::new(RecordingTransport::new()),
        identity: identity(0),
        config: EngineConfig {
            base_timeout: Duration::from_millis(100),
            storage_retry: RetryPolicy::new(3, Duration::from_millis(10)),
            ..Default::default()
        },
        metrics: metrics.clone(),
    };
    let psyncer = PSyncer::new(seed.group_item.clone(), "solo", iface).unwrap();
    (psyncer, blocks, metrics)
}

#[tokio::test(start_paused = true)]
async fn test_transient_append_failure_is_retried() {
    let (mut psyncer, blocks, metrics) = solo_engine();
    let group = psyncer.group_id().clone();
    blocks.fail_next(2);

    psyncer.submit_trxs(vec![app_trx(&group, "a")]).unwrap();
    assert!(psyncer.try_propose().await.unwrap());

    assert_eq!(psyncer.height(), 2);
    assert_eq!(blocks.append_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.storage_fault_count(&group), 0);
    assert_eq!(psyncer.health(), HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_force_recovery() {
    let (mut psyncer, blocks, metrics) = solo_engine();
    let group = psyncer.group_id().clone();
    blocks.set_failing(true);

    psyncer.submit_trxs(vec![app_trx(&group, "a")]).unwrap();
    let err = psyncer.try_propose().await.unwrap_err();
    assert!(matches!(err, ConsensusError::Storage(_)));
    assert_eq!(psyncer.state(), EngineState::Recovering);
    assert_eq!(psyncer.health(), HealthStatus::StorageFault);
    assert_eq!(psyncer.height(), 1);
    assert_eq!(metrics.storage_fault_count(&group), 1);
    assert!(psyncer.deadline().is_some());

    // the round keeps its quorum; the next deadline retries the append
    blocks.set_failing(false);
    psyncer.on_deadline().await.unwrap();
    assert_eq!(psyncer.height(), 2);
    assert_eq!(psyncer.state(), EngineState::Idle);
    assert_eq!(psyncer.health(), HealthStatus::Healthy);
    assert_eq!(metrics.committed_count(&group), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_acknowledgement_counts_as_success() {
    let (mut psyncer, blocks, metrics) = solo_engine();
    let group = psyncer.group_id().clone();
    blocks.lose_ack.store(true, Ordering::SeqCst);

    psyncer.submit_trxs(vec![app_trx(&group, "a")]).unwrap();
    assert!(psyncer.try_propose().await.unwrap());

    // the retry hits a height conflict, but the block is already the head
    assert_eq!(psyncer.height(), 2);
    assert_eq!(blocks.get_highest_block(&group).unwrap().unwrap().0, 1);
    assert_eq!(metrics.storage_fault_count(&group), 0);
}
