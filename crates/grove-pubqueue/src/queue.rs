//! The publish queue.

use crate::config::PublishQueueConfig;
use crate::entry::{EntryId, EntryStatus, PublishQueueEntry};
use crate::error::Result;
use crate::metrics::QueueMetrics;
use crate::sink::DispatchSink;
use grove_consensus::{CommitEvent, GroupLabels, SubmitReceipt, WithdrawReceipt};
use grove_storage::QueueStore;
use grove_types::{now_millis, GroupId, Trx, TrxId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Acknowledged entries kept in memory for status lookups.
const ACKED_RETENTION: usize = 1024;

/// Capacity of the failure notification channel.
const FAILURE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<EntryId, PublishQueueEntry>,
    by_trx: HashMap<TrxId, EntryId>,
    acked: VecDeque<EntryId>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, entry: PublishQueueEntry) {
        self.by_trx.insert(entry.trx_id, entry.entry_id);
        self.entries.insert(entry.entry_id, entry);
    }

    fn remove(&mut self, id: &EntryId) -> Option<PublishQueueEntry> {
        let entry = self.entries.remove(id)?;
        self.by_trx.remove(&entry.trx_id);
        Some(entry)
    }

    fn group_entries(&self, group_id: &GroupId) -> Vec<&PublishQueueEntry> {
        let mut entries: Vec<&PublishQueueEntry> = self
            .entries
            .values()
            .filter(|e| &e.group_id == group_id)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }
}

struct Dispatcher {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn QueueStore>,
    config: PublishQueueConfig,
    metrics: QueueMetrics,
    state: Mutex<QueueState>,
    failures: broadcast::Sender<PublishQueueEntry>,
    dispatchers: Mutex<HashMap<GroupId, Dispatcher>>,
}

/// Durable, ordered, at-least-once delivery of payloads into blocks.
///
/// Entries are persisted before `enqueue` returns. Each bound group gets a
/// dispatcher task that hands PENDING entries to the group's sink and
/// acknowledges them from the sink's commit notifications.
#[derive(Clone)]
pub struct PublishQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PublishQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishQueue")
            .field("entries", &self.inner.state.lock().entries.len())
            .field("bound", &self.inner.dispatchers.lock().len())
            .finish()
    }
}

impl PublishQueue {
    /// Opens the queue, reloading persisted entries.
    ///
    /// Entries that were SENT when the process stopped go back to PENDING.
    /// Undecodable records are skipped with a warning.
    pub fn open(
        store: Arc<dyn QueueStore>,
        config: PublishQueueConfig,
        metrics: QueueMetrics,
    ) -> Result<Self> {
        let mut state = QueueState::default();
        let mut reverted = 0usize;
        let groups = store.entry_groups()?;

        for group_id in &groups {
            for data in store.load_entries(group_id)? {
                let mut entry: PublishQueueEntry = match serde_json::from_slice(&data) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(group_id = %group_id, error = %e, "Skipping undecodable queue entry");
                        continue;
                    }
                };
                if entry.status == EntryStatus::Sent {
                    entry.status = EntryStatus::Pending;
                    store.put_entry(group_id, &entry.entry_id.to_string(), &serde_json::to_vec(&entry)?)?;
                    reverted += 1;
                }
                state.next_seq = state.next_seq.max(entry.seq + 1);
                state.insert(entry);
            }
        }

        info!(
            groups = groups.len(),
            entries = state.entries.len(),
            reverted,
            auto_ack = config.auto_ack,
            "Opened publish queue"
        );

        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_SIZE);
        let queue = Self {
            inner: Arc::new(Inner {
                store,
                config,
                metrics,
                state: Mutex::new(state),
                failures,
                dispatchers: Mutex::new(HashMap::new()),
            }),
        };
        {
            let state = queue.inner.state.lock();
            for group_id in &groups {
                queue.refresh_gauges(group_id, &state);
            }
        }
        Ok(queue)
    }

    /// The queue configuration.
    pub fn config(&self) -> &PublishQueueConfig {
        &self.inner.config
    }

    /// Appends a PENDING entry and returns its id without waiting for
    /// delivery. Fails only if the entry cannot be persisted.
    pub fn enqueue(&self, group_id: &GroupId, payload: Vec<u8>) -> Result<EntryId> {
        let entry_id = {
            let mut state = self.inner.state.lock();
            let entry = PublishQueueEntry::new(group_id.clone(), payload, state.next_seq);
            self.persist(&entry)?;
            state.next_seq += 1;
            let entry_id = entry.entry_id;
            state.insert(entry);
            self.refresh_gauges(group_id, &state);
            entry_id
        };

        debug!(group_id = %group_id, entry_id = %entry_id, "Enqueued entry");
        if let Some(dispatcher) = self.inner.dispatchers.lock().get(group_id) {
            dispatcher.wake.notify_one();
        }
        Ok(entry_id)
    }

    /// Looks up an entry. Acknowledged entries are retained for a while.
    pub fn entry(&self, entry_id: &EntryId) -> Option<PublishQueueEntry> {
        self.inner.state.lock().entries.get(entry_id).cloned()
    }

    /// Every known entry of a group, in enqueue order.
    pub fn entries(&self, group_id: &GroupId) -> Vec<PublishQueueEntry> {
        self.inner
            .state
            .lock()
            .group_entries(group_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Removes and returns a group's FAILED entries.
    pub fn take_failed(&self, group_id: &GroupId) -> Vec<PublishQueueEntry> {
        let mut state = self.inner.state.lock();
        let ids: Vec<EntryId> = state
            .group_entries(group_id)
            .into_iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .map(|e| e.entry_id)
            .collect();

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = state.remove(&id) {
                self.unpersist(&entry);
                failed.push(entry);
            }
        }
        self.refresh_gauges(group_id, &state);
        failed
    }

    /// Subscribes to entries that become FAILED.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PublishQueueEntry> {
        self.inner.failures.subscribe()
    }

    /// Attaches a sink to a group and starts its dispatcher. Rebinding
    /// replaces the previous dispatcher.
    pub fn bind(&self, group_id: GroupId, sink: Arc<dyn DispatchSink>) {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(self.clone().run_dispatcher(
            group_id.clone(),
            sink,
            cancel.clone(),
            wake.clone(),
        ));

        let previous = self
            .inner
            .dispatchers
            .lock()
            .insert(group_id.clone(), Dispatcher { cancel, wake, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        info!(group_id = %group_id, "Bound publish queue dispatcher");
    }

    /// Stops a group's dispatcher. Returns false if none was running.
    pub async fn unbind(&self, group_id: &GroupId) -> bool {
        let dispatcher = self.inner.dispatchers.lock().remove(group_id);
        let Some(dispatcher) = dispatcher else {
            return false;
        };
        dispatcher.cancel.cancel();
        if let Err(e) = dispatcher.task.await {
            warn!(group_id = %group_id, error = %e, "Dispatcher ended abnormally");
        }
        info!(group_id = %group_id, "Unbound publish queue dispatcher");
        true
    }

    /// Returns true if a dispatcher runs for the group.
    pub fn is_bound(&self, group_id: &GroupId) -> bool {
        self.inner.dispatchers.lock().contains_key(group_id)
    }

    /// Stops every dispatcher.
    pub async fn shutdown(&self) {
        let groups: Vec<GroupId> = self.inner.dispatchers.lock().keys().cloned().collect();
        for group_id in groups {
            self.unbind(&group_id).await;
        }
    }

    /// Stops the group's dispatcher and deletes all of its entries.
    pub async fn purge_group(&self, group_id: &GroupId) -> Result<usize> {
        self.unbind(group_id).await;
        let mut state = self.inner.state.lock();
        let ids: Vec<EntryId> = state
            .group_entries(group_id)
            .into_iter()
            .map(|e| e.entry_id)
            .collect();
        for id in &ids {
            if let Some(entry) = state.remove(id) {
                if entry.status != EntryStatus::Acked {
                    self.inner.store.remove_entry(group_id, &id.to_string())?;
                }
            }
        }
        state.acked.retain(|id| !ids.contains(id));
        self.refresh_gauges(group_id, &state);
        Ok(ids.len())
    }

    async fn run_dispatcher(
        self,
        group_id: GroupId,
        sink: Arc<dyn DispatchSink>,
        cancel: CancellationToken,
        wake: Arc<Notify>,
    ) {
        let mut commits = sink.commits();
        let mut commits_open = true;
        let mut ticker = tokio::time::interval(self.inner.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.dispatch(&group_id, sink.as_ref()).await,
                _ = wake.notified() => self.dispatch(&group_id, sink.as_ref()).await,
                event = commits.recv(), if commits_open => match event {
                    Ok(event) => self.acknowledge(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        // missed entries are retried after the ack timeout
                        warn!(group_id = %group_id, skipped, "Commit notifications lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!(group_id = %group_id, "Commit notifications closed");
                        commits_open = false;
                    }
                },
            }
        }
        debug!(group_id = %group_id, "Dispatcher stopped");
    }

    /// Expires stale SENT entries, then hands PENDING ones to the sink.
    async fn dispatch(&self, group_id: &GroupId, sink: &dyn DispatchSink) {
        self.expire_sent(group_id, sink).await;

        let batch: Vec<(EntryId, Trx)> = {
            let state = self.inner.state.lock();
            state
                .group_entries(group_id)
                .into_iter()
                .filter(|e| e.status == EntryStatus::Pending)
                .take(self.inner.config.batch_size)
                .map(|e| (e.entry_id, e.trx()))
                .collect()
        };
        if batch.is_empty() {
            return;
        }

        let outcome = sink.dispatch(batch.iter().map(|(_, trx)| trx.clone()).collect()).await;
        let exhausted = self.record_outcome(group_id, &batch, outcome);
        self.retire(group_id, sink, exhausted).await;
    }

    /// Applies a dispatch outcome to the batch. Returns the entries that hit
    /// the retry ceiling.
    fn record_outcome(
        &self,
        group_id: &GroupId,
        batch: &[(EntryId, Trx)],
        outcome: Result<SubmitReceipt>,
    ) -> Vec<EntryId> {
        let mut exhausted = Vec::new();
        let mut state = self.inner.state.lock();
        match outcome {
            Ok(receipt) => {
                let committed: HashSet<TrxId> = receipt.committed.into_iter().collect();
                for (id, trx) in batch {
                    let Some(entry) = state.entries.get_mut(id) else {
                        continue;
                    };
                    if entry.status != EntryStatus::Pending {
                        continue;
                    }
                    entry.attempts += 1;
                    entry.last_attempt_ms = Some(now_millis());
                    entry.last_error = None;

                    if self.inner.config.auto_ack || committed.contains(&trx.id) {
                        self.mark_acked(&mut state, id);
                    } else {
                        entry.status = EntryStatus::Sent;
                        entry.sent_at = Some(Instant::now());
                        let entry = entry.clone();
                        self.persist_logged(&entry);
                    }
                }
                debug!(group_id = %group_id, count = batch.len(), "Dispatched entries");
            }
            Err(e) => {
                warn!(group_id = %group_id, count = batch.len(), error = %e, "Dispatch failed, will retry");
                for (id, _) in batch {
                    let Some(entry) = state.entries.get_mut(id) else {
                        continue;
                    };
                    if entry.status != EntryStatus::Pending {
                        continue;
                    }
                    entry.attempts += 1;
                    entry.last_attempt_ms = Some(now_millis());
                    entry.last_error = Some(e.to_string());
                    if entry.attempts >= self.inner.config.max_attempts {
                        exhausted.push(*id);
                    }
                    let entry = entry.clone();
                    self.persist_logged(&entry);
                }
            }
        }
        self.refresh_gauges(group_id, &state);
        exhausted
    }

    /// Sends SENT entries whose commit never arrived back to PENDING, or
    /// retires them at the retry ceiling.
    async fn expire_sent(&self, group_id: &GroupId, sink: &dyn DispatchSink) {
        let exhausted = {
            let mut state = self.inner.state.lock();
            let timeout = self.inner.config.ack_timeout;
            let expired: Vec<(EntryId, bool)> = state
                .group_entries(group_id)
                .into_iter()
                .filter(|e| e.status == EntryStatus::Sent)
                .filter(|e| e.sent_at.map_or(true, |at| at.elapsed() >= timeout))
                .map(|e| (e.entry_id, e.attempts >= self.inner.config.max_attempts))
                .collect();

            let mut exhausted = Vec::new();
            for (id, at_ceiling) in expired {
                let Some(entry) = state.entries.get_mut(&id) else {
                    continue;
                };
                if at_ceiling {
                    entry.last_error = Some("not committed before the acknowledgment timeout".into());
                    exhausted.push(id);
                } else {
                    debug!(entry_id = %id, attempts = entry.attempts, "Acknowledgment timed out, retrying");
                    entry.status = EntryStatus::Pending;
                    entry.sent_at = None;
                    let entry = entry.clone();
                    self.persist_logged(&entry);
                }
            }
            exhausted
        };
        self.retire(group_id, sink, exhausted).await;
    }

    /// Settles entries at the retry ceiling.
    ///
    /// Their transactions are withdrawn from the sink first, so a FAILED
    /// entry can never commit later. Transactions found committed are
    /// acknowledged instead. Transactions inside an open proposal stay SENT
    /// for another acknowledgment timeout.
    async fn retire(&self, group_id: &GroupId, sink: &dyn DispatchSink, ids: Vec<EntryId>) {
        if ids.is_empty() {
            return;
        }
        let trx_ids: Vec<TrxId> = {
            let state = self.inner.state.lock();
            ids.iter()
                .filter_map(|id| state.entries.get(id))
                .map(|e| e.trx_id)
                .collect()
        };

        let receipt = match sink.withdraw(trx_ids.clone()).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // a sink that cannot be reached holds no pool to propose from
                warn!(group_id = %group_id, error = %e, "Failed to withdraw exhausted entries");
                WithdrawReceipt {
                    withdrawn: trx_ids,
                    ..Default::default()
                }
            }
        };
        let committed: HashSet<TrxId> = receipt.committed.into_iter().collect();
        let in_flight: HashSet<TrxId> = receipt.in_flight.into_iter().collect();

        let mut state = self.inner.state.lock();
        for id in &ids {
            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };
            if entry.status.is_terminal() {
                continue;
            }
            if committed.contains(&entry.trx_id) {
                self.mark_acked(&mut state, id);
            } else if in_flight.contains(&entry.trx_id) {
                debug!(entry_id = %id, "Entry is part of an open proposal, waiting for its commit");
                entry.status = EntryStatus::Sent;
                entry.sent_at = Some(Instant::now());
                let entry = entry.clone();
                self.persist_logged(&entry);
            } else {
                self.mark_failed(&mut state, id);
            }
        }
        self.refresh_gauges(group_id, &state);
    }

    /// Acknowledges entries whose transactions were committed.
    fn acknowledge(&self, event: &CommitEvent) {
        let mut state = self.inner.state.lock();
        let mut acked = 0usize;
        for trx_id in &event.trx_ids {
            let Some(id) = state.by_trx.get(trx_id).copied() else {
                continue;
            };
            let open = state
                .entries
                .get(&id)
                .is_some_and(|e| !e.status.is_terminal());
            if open {
                self.mark_acked(&mut state, &id);
                acked += 1;
            }
        }
        if acked > 0 {
            debug!(group_id = %event.group_id, height = event.height, acked, "Acknowledged entries");
            self.refresh_gauges(&event.group_id, &state);
        }
    }

    fn mark_acked(&self, state: &mut QueueState, id: &EntryId) {
        let Some(entry) = state.entries.get_mut(id) else {
            return;
        };
        entry.status = EntryStatus::Acked;
        entry.sent_at = None;
        let group_id = entry.group_id.clone();
        let trx_id = entry.trx_id;

        if let Err(e) = self.inner.store.remove_entry(&group_id, &id.to_string()) {
            warn!(group_id = %group_id, entry_id = %id, error = %e, "Failed to remove acknowledged entry");
        }
        state.by_trx.remove(&trx_id);
        state.acked.push_back(*id);
        while state.acked.len() > ACKED_RETENTION {
            if let Some(old) = state.acked.pop_front() {
                state.entries.remove(&old);
            }
        }
    }

    fn mark_failed(&self, state: &mut QueueState, id: &EntryId) {
        let Some(entry) = state.entries.get_mut(id) else {
            return;
        };
        entry.status = EntryStatus::Failed;
        entry.sent_at = None;
        let entry = entry.clone();

        warn!(
            group_id = %entry.group_id,
            entry_id = %entry.entry_id,
            attempts = entry.attempts,
            error = entry.last_error.as_deref().unwrap_or(""),
            "Entry exhausted its retries"
        );
        self.persist_logged(&entry);
        self.inner
            .metrics
            .failed
            .get_or_create(&GroupLabels::new(&entry.group_id))
            .inc();
        let _ = self.inner.failures.send(entry);
    }

    fn persist(&self, entry: &PublishQueueEntry) -> Result<()> {
        let data = serde_json::to_vec(entry)?;
        self.inner
            .store
            .put_entry(&entry.group_id, &entry.entry_id.to_string(), &data)?;
        Ok(())
    }

    fn persist_logged(&self, entry: &PublishQueueEntry) {
        if let Err(e) = self.persist(entry) {
            warn!(group_id = %entry.group_id, entry_id = %entry.entry_id, error = %e, "Failed to persist entry");
        }
    }

    fn unpersist(&self, entry: &PublishQueueEntry) {
        if let Err(e) = self
            .inner
            .store
            .remove_entry(&entry.group_id, &entry.entry_id.to_string())
        {
            warn!(group_id = %entry.group_id, entry_id = %entry.entry_id, error = %e, "Failed to remove entry");
        }
    }

    fn refresh_gauges(&self, group_id: &GroupId, state: &QueueState) {
        let mut counts: HashMap<EntryStatus, usize> = HashMap::new();
        for entry in state.entries.values().filter(|e| &e.group_id == group_id) {
            *counts.entry(entry.status).or_default() += 1;
        }
        for status in EntryStatus::ALL {
            self.inner
                .metrics
                .set_count(group_id, status, counts.get(&status).copied().unwrap_or(0));
        }
    }
}
