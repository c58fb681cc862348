//! Transport port and an in-process implementation.
//!
//! The engine only needs a non-blocking `broadcast`; inbound delivery is a
//! per-node stream of `(GroupId, HbMsg)` that the node demultiplexes.
//! [`LocalNetwork`] connects any number of nodes inside one process and can
//! drop messages, partition node pairs and isolate nodes.

use crate::error::{ConsensusError, Result};
use grove_types::{GroupId, HbMsg, NodeId};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound message stream of one node.
pub type Inbound = mpsc::UnboundedReceiver<(GroupId, HbMsg)>;

/// Outbound side of the P2P layer.
pub trait Transport: Send + Sync {
    /// Hands a message to every peer of the group. Must not block.
    fn broadcast(&self, group_id: &GroupId, msg: HbMsg) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn broadcast(&self, group_id: &GroupId, msg: HbMsg) -> Result<()> {
        (**self).broadcast(group_id, msg)
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: BTreeMap<NodeId, mpsc::UnboundedSender<(GroupId, HbMsg)>>,
    /// Directed links that drop every message: (from, to).
    partitions: HashSet<(NodeId, NodeId)>,
    /// Probability of dropping any single delivery.
    loss_rate: f64,
    /// Number of deliveries that will be dropped before normal delivery resumes.
    drop_next: usize,
    delivered: u64,
    dropped: u64,
}

/// In-process network hub.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a node, returning its transport endpoint and inbound stream.
    ///
    /// Registering the same node again replaces its inbound stream.
    pub fn register(&self, node: NodeId) -> (LocalEndpoint, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().nodes.insert(node.clone(), tx);
        let endpoint = LocalEndpoint {
            node,
            network: self.clone(),
        };
        (endpoint, rx)
    }

    /// Disconnects a node.
    pub fn unregister(&self, node: &NodeId) {
        self.state.lock().nodes.remove(node);
    }

    /// Drops every message from `from` to `to`.
    pub fn partition(&self, from: &NodeId, to: &NodeId) {
        self.state
            .lock()
            .partitions
            .insert((from.clone(), to.clone()));
    }

    /// Cuts a node off from every other registered node, both directions.
    pub fn isolate(&self, node: &NodeId) {
        let mut state = self.state.lock();
        let others: Vec<NodeId> = state.nodes.keys().filter(|n| *n != node).cloned().collect();
        for other in others {
            state.partitions.insert((node.clone(), other.clone()));
            state.partitions.insert((other, node.clone()));
        }
    }

    /// Removes every partition and resets packet loss.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.partitions.clear();
        state.loss_rate = 0.0;
        state.drop_next = 0;
    }

    /// Sets the probability (0.0 to 1.0) of dropping any single delivery.
    pub fn set_loss_rate(&self, rate: f64) {
        self.state.lock().loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Drops the next `count` deliveries.
    pub fn drop_next(&self, count: usize) {
        self.state.lock().drop_next = count;
    }

    /// Number of delivered messages.
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    /// Number of dropped messages.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    fn deliver(&self, from: &NodeId, group_id: &GroupId, msg: HbMsg) {
        let mut state = self.state.lock();
        let targets: Vec<(NodeId, mpsc::UnboundedSender<(GroupId, HbMsg)>)> = state
            .nodes
            .iter()
            .filter(|(node, _)| *node != from)
            .map(|(node, tx)| (node.clone(), tx.clone()))
            .collect();

        let mut rng = rand::thread_rng();
        for (to, tx) in targets {
            if state.partitions.contains(&(from.clone(), to.clone())) {
                state.dropped += 1;
                continue;
            }
            if state.drop_next > 0 {
                state.drop_next -= 1;
                state.dropped += 1;
                continue;
            }
            if state.loss_rate > 0.0 && rng.gen::<f64>() < state.loss_rate {
                state.dropped += 1;
                continue;
            }
            if tx.send((group_id.clone(), msg.clone())).is_ok() {
                state.delivered += 1;
            } else {
                state.dropped += 1;
            }
        }
    }
}

/// One node's connection to a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    node: NodeId,
    network: LocalNetwork,
}

impl LocalEndpoint {
    /// The node this endpoint sends for.
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

impl Transport for LocalEndpoint {
    fn broadcast(&self, group_id: &GroupId, msg: HbMsg) -> Result<()> {
        tracing::trace!(
            group_id = %group_id,
            from = %self.node.short(),
            phase = %msg.phase(),
            height = msg.height,
            round = msg.round,
            "local broadcast"
        );
        self.network.deliver(&self.node, group_id, msg);
        Ok(())
    }
}

/// Transport that records outgoing messages instead of sending them.
///
/// Used to drive engines by hand in tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(GroupId, HbMsg)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingTransport {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every recorded message.
    pub fn take(&self) -> Vec<HbMsg> {
        std::mem::take(&mut *self.sent.lock())
            .into_iter()
            .map(|(_, msg)| msg)
            .collect()
    }

    /// Number of recorded messages.
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    /// Makes every broadcast fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Transport for RecordingTransport {
    fn broadcast(&self, group_id: &GroupId, msg: HbMsg) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ConsensusError::Transport("broadcast disabled".into()));
        }
        self.sent.lock().push((group_id.clone(), msg));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_types::HbPayload;

    fn msg(sender: &NodeId) -> HbMsg {
        HbMsg::unsigned(GroupId::new("g"), sender.clone(), 1, 0, HbPayload::SyncRequest)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_but_sender() {
        let net = LocalNetwork::new();
        let (a, b, c) = (NodeId::from_hex("0a"), NodeId::from_hex("0b"), NodeId::from_hex("0c"));
        let (ea, mut ra) = net.register(a.clone());
        let (_eb, mut rb) = net.register(b.clone());
        let (_ec, mut rc) = net.register(c.clone());

        ea.broadcast(&GroupId::new("g"), msg(&a)).unwrap();

        assert_eq!(rb.recv().await.unwrap().1.sender, a);
        assert_eq!(rc.recv().await.unwrap().1.sender, a);
        assert!(ra.try_recv().is_err());
        assert_eq!(net.delivered(), 2);
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let net = LocalNetwork::new();
        let (a, b) = (NodeId::from_hex("0a"), NodeId::from_hex("0b"));
        let (ea, _ra) = net.register(a.clone());
        let (_eb, mut rb) = net.register(b.clone());

        net.isolate(&a);
        ea.broadcast(&GroupId::new("g"), msg(&a)).unwrap();
        assert!(rb.try_recv().is_err());
        assert_eq!(net.dropped(), 1);

        net.heal();
        ea.broadcast(&GroupId::new("g"), msg(&a)).unwrap();
        assert!(rb.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_drop_next() {
        let net = LocalNetwork::new();
        let (a, b) = (NodeId::from_hex("0a"), NodeId::from_hex("0b"));
        let (ea, _ra) = net.register(a.clone());
        let (_eb, mut rb) = net.register(b);

        net.drop_next(1);
        ea.broadcast(&GroupId::new("g"), msg(&a)).unwrap();
        ea.broadcast(&GroupId::new("g"), msg(&a)).unwrap();
        assert!(rb.recv().await.is_some());
        assert!(rb.try_recv().is_err());
        assert_eq!(net.dropped(), 1);
    }

    #[tokio::test]
    async fn test_full_loss_drops_everything_until_healed() {
        let net = LocalNetwork::new();
        let (a, b) = (NodeId::from_hex("0a"), NodeId::from_hex("0b"));
        let (ea, _ra) = net.register(a.clone());
        let (_eb, mut rb) = net.register(b);

        net.set_loss_rate(2.0);
        for _ in 0..3 {
            ea.broadcast(&GroupId::new("g"), msg(&a)).unwrap();
        }
        assert!(rb.try_recv().is_err());
        assert_eq!(net.dropped(), 3);

        net.heal();
        ea.broadcast(&GroupId::new("g"), msg(&a)).unwrap();
        assert!(rb.recv().await.is_some());
    }

    #[test]
    fn test_recording_transport() {
        let transport = RecordingTransport::new();
        let node = NodeId::from_hex("0a");
        transport.broadcast(&GroupId::new("g"), msg(&node)).unwrap();
        assert_eq!(transport.len(), 1);
        assert_eq!(transport.take().len(), 1);
        assert!(transport.is_empty());

        transport.set_failing(true);
        assert!(transport.broadcast(&GroupId::new("g"), msg(&node)).is_err());
    }
}
