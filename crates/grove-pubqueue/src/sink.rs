//! Where dispatched transactions go.

use crate::error::{QueueError, Result};
use async_trait::async_trait;
use grove_consensus::{CommitEvent, EngineHandle, SubmitReceipt, WithdrawReceipt};
use grove_types::{Trx, TrxId};
use tokio::sync::broadcast;

/// Destination of a group's dispatched transactions.
///
/// In a node this is the group's consensus engine: transactions go into its
/// pool, and its commit notifications acknowledge them.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Hands transactions over for inclusion in a block.
    async fn dispatch(&self, trxs: Vec<Trx>) -> Result<SubmitReceipt>;

    /// Takes back transactions the queue is about to give up on.
    ///
    /// Sinks without a pool of their own have nothing to withdraw.
    async fn withdraw(&self, trx_ids: Vec<TrxId>) -> Result<WithdrawReceipt> {
        Ok(WithdrawReceipt {
            withdrawn: trx_ids,
            ..Default::default()
        })
    }

    /// Subscribes to the commits that acknowledge dispatched transactions.
    fn commits(&self) -> broadcast::Receiver<CommitEvent>;
}

#[async_trait]
impl DispatchSink for EngineHandle {
    async fn dispatch(&self, trxs: Vec<Trx>) -> Result<SubmitReceipt> {
        self.submit(trxs)
            .await
            .map_err(|e| QueueError::Dispatch(e.to_string()))
    }

    async fn withdraw(&self, trx_ids: Vec<TrxId>) -> Result<WithdrawReceipt> {
        EngineHandle::withdraw(self, trx_ids)
            .await
            .map_err(|e| QueueError::Dispatch(e.to_string()))
    }

    fn commits(&self) -> broadcast::Receiver<CommitEvent> {
        self.subscribe()
    }
}
