//! Engine task.
//!
//! Each group runs one task that owns its [`PSyncer`]. Inbound messages,
//! submissions and deadline expiries are serialized through that task, so a
//! slow or stalled group never blocks another.

use crate::error::{ConsensusError, Result};
use crate::metrics::{drop_reason, ConsensusMetrics};
use crate::psyncer::{CommitEvent, EngineStatus, PSyncer, SubmitReceipt, WithdrawReceipt};
use crate::state::HealthStatus;
use grove_types::{GroupId, HbMsg, Trx, TrxId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Inputs of an engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// An inbound protocol message.
    Message(HbMsg),
    /// Transactions to add to the pool.
    Submit {
        /// The transactions.
        trxs: Vec<Trx>,
        /// Receives the outcome.
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
    /// Transactions to take back out of the pool.
    Withdraw {
        /// The transaction ids.
        trx_ids: Vec<TrxId>,
        /// Receives the outcome.
        reply: oneshot::Sender<WithdrawReceipt>,
    },
    /// Propose if eligible.
    TryPropose,
    /// Abandon the current round.
    Recreate,
    /// Stop the task.
    Stop,
}

/// Handle to a running engine task.
#[derive(Clone)]
pub struct EngineHandle {
    group_id: GroupId,
    commands: mpsc::Sender<EngineCommand>,
    commits: broadcast::Sender<CommitEvent>,
    status: watch::Receiver<EngineStatus>,
    metrics: ConsensusMetrics,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("group_id", &self.group_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EngineHandle {
    /// The group this engine serves.
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Queues an inbound message without waiting.
    pub fn route(&self, msg: HbMsg) -> Result<()> {
        match self.commands.try_send(EngineCommand::Message(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.dropped(drop_reason::MAILBOX_FULL);
                Err(ConsensusError::MailboxFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.dropped(drop_reason::STOPPED);
                Err(ConsensusError::Stopped)
            }
        }
    }

    /// Submits transactions and waits for the pool's answer.
    pub async fn submit(&self, trxs: Vec<Trx>) -> Result<SubmitReceipt> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Submit { trxs, reply })
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        rx.await.map_err(|_| ConsensusError::Stopped)?
    }

    /// Withdraws pending transactions that should no longer be proposed.
    pub async fn withdraw(&self, trx_ids: Vec<TrxId>) -> Result<WithdrawReceipt> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Withdraw { trx_ids, reply })
            .await
            .map_err(|_| ConsensusError::Stopped)?;
        rx.await.map_err(|_| ConsensusError::Stopped)
    }

    /// Asks the engine to propose if it is eligible.
    pub async fn try_propose(&self) -> Result<()> {
        self.send(EngineCommand::TryPropose).await
    }

    /// Asks the engine to abandon its current round.
    pub async fn recreate(&self) -> Result<()> {
        self.send(EngineCommand::Recreate).await
    }

    /// Subscribes to commit notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitEvent> {
        self.commits.subscribe()
    }

    /// Latest status snapshot.
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Watches the status.
    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    /// Latest health signal.
    pub fn health(&self) -> HealthStatus {
        self.status.borrow().health
    }

    /// Returns true while the task accepts commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stops the task and waits for it to finish. Idempotent.
    pub async fn stop(&self) {
        let _ = self.commands.send(EngineCommand::Stop).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(group_id = %self.group_id, error = %e, "Engine task ended abnormally");
            }
        }
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConsensusError::Stopped)
    }
}

/// Spawns the task of an engine on the current runtime.
pub fn spawn_engine(psyncer: PSyncer) -> EngineHandle {
    let (commands, rx) = mpsc::channel(psyncer.config().mailbox_size.max(1));
    let handle = EngineHandle {
        group_id: psyncer.group_id().clone(),
        commands,
        commits: psyncer.commit_sender(),
        status: psyncer.watch_status(),
        metrics: psyncer.metrics().clone(),
        task: Arc::new(Mutex::new(None)),
    };

    let task = tokio::spawn(run(psyncer, rx));
    *handle.task.lock() = Some(task);
    handle
}

async fn run(mut psyncer: PSyncer, mut commands: mpsc::Receiver<EngineCommand>) {
    info!(group_id = %psyncer.group_id(), height = psyncer.height(), "Engine started");

    loop {
        let deadline = psyncer.deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(EngineCommand::Message(msg)) => {
                    if let Err(e) = psyncer.handle_hb_msg(msg).await {
                        report(&psyncer, &e);
                    }
                    propose(&mut psyncer).await;
                }
                Some(EngineCommand::Submit { trxs, reply }) => {
                    let result = psyncer.submit_trxs(trxs);
                    let accepted = result.is_ok();
                    let _ = reply.send(result);
                    if accepted {
                        propose(&mut psyncer).await;
                    }
                }
                Some(EngineCommand::Withdraw { trx_ids, reply }) => {
                    let _ = reply.send(psyncer.withdraw_trxs(&trx_ids));
                }
                Some(EngineCommand::TryPropose) => propose(&mut psyncer).await,
                Some(EngineCommand::Recreate) => {
                    if let Err(e) = psyncer.recreate_bft().await {
                        report(&psyncer, &e);
                    }
                }
                Some(EngineCommand::Stop) | None => break,
            },
            _ = wait_deadline(deadline) => {
                if let Err(e) = psyncer.on_deadline().await {
                    report(&psyncer, &e);
                }
                propose(&mut psyncer).await;
            }
        }
    }

    info!(group_id = %psyncer.group_id(), height = psyncer.height(), "Engine stopped");
}

async fn propose(psyncer: &mut PSyncer) {
    if let Err(e) = psyncer.try_propose().await {
        report(psyncer, &e);
    }
}

fn report(psyncer: &PSyncer, e: &ConsensusError) {
    match e {
        ConsensusError::Validation(_) | ConsensusError::QuorumTimeout { .. } => {
            debug!(group_id = %psyncer.group_id(), error = %e, "Engine input rejected");
        }
        _ => warn!(group_id = %psyncer.group_id(), error = %e, "Engine error"),
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
