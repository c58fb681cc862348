//! Pending transaction pool.
//!
//! Holds transactions submitted locally that are not yet committed. Committed
//! ids are remembered (bounded) so a retried submission is never proposed or
//! accepted a second time.

use grove_types::{Trx, TrxId};
use std::collections::{HashMap, HashSet, VecDeque};

/// Result of adding a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Added to the pool.
    Added,
    /// Already pending.
    Pending,
    /// Already committed.
    Committed,
}

/// FIFO transaction pool with committed-id memory.
#[derive(Debug)]
pub struct TrxPool {
    /// Pending transactions indexed by id.
    pending: HashMap<TrxId, Trx>,

    /// Arrival order, for FIFO proposals.
    order: VecDeque<TrxId>,

    /// Recently committed ids.
    committed: HashSet<TrxId>,

    /// Insertion order of `committed`, oldest first.
    committed_order: VecDeque<TrxId>,

    /// Maximum number of remembered committed ids.
    committed_memory: usize,
}

impl TrxPool {
    /// Creates an empty pool remembering up to `committed_memory` committed ids.
    pub fn new(committed_memory: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            committed: HashSet::new(),
            committed_order: VecDeque::new(),
            committed_memory: committed_memory.max(1),
        }
    }

    /// Adds a transaction unless it is pending or committed already.
    pub fn add(&mut self, trx: Trx) -> AddOutcome {
        if self.committed.contains(&trx.id) {
            return AddOutcome::Committed;
        }
        if self.pending.contains_key(&trx.id) {
            return AddOutcome::Pending;
        }

        tracing::trace!(trx_id = %trx.id.short(), "added transaction to pool");
        self.order.push_back(trx.id);
        self.pending.insert(trx.id, trx);
        AddOutcome::Added
    }

    /// Returns true if the transaction is pending.
    pub fn contains(&self, id: &TrxId) -> bool {
        self.pending.contains_key(id)
    }

    /// Returns true if the transaction was committed recently.
    pub fn is_committed(&self, id: &TrxId) -> bool {
        self.committed.contains(id)
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Up to `max` pending transactions in arrival order. They stay pending
    /// until committed.
    pub fn take_for_proposal(&self, max: usize) -> Vec<Trx> {
        self.order
            .iter()
            .filter_map(|id| self.pending.get(id))
            .take(max)
            .cloned()
            .collect()
    }

    /// Removes a pending transaction. Returns false if it was not pending.
    pub fn remove(&mut self, id: &TrxId) -> bool {
        if self.pending.remove(id).is_none() {
            return false;
        }
        self.order.retain(|pending| pending != id);
        true
    }

    /// Marks transactions as committed, removing them from the pending set.
    pub fn mark_committed(&mut self, ids: &[TrxId]) {
        for id in ids {
            self.pending.remove(id);
            if self.committed.insert(*id) {
                self.committed_order.push_back(*id);
            }
        }
        self.order.retain(|id| self.pending.contains_key(id));

        while self.committed_order.len() > self.committed_memory {
            if let Some(old) = self.committed_order.pop_front() {
                self.committed.remove(&old);
            }
        }

        tracing::debug!(
            count = ids.len(),
            pending = self.pending.len(),
            "removed committed transactions from pool"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_types::{GroupId, TrxBody};

    fn trx(n: u8) -> Trx {
        Trx::new(&GroupId::new("g"), format!("n{}", n), TrxBody::App(vec![n]))
    }

    #[test]
    fn test_pool_fifo_and_dedup() {
        let mut pool = TrxPool::new(16);
        assert_eq!(pool.add(trx(1)), AddOutcome::Added);
        assert_eq!(pool.add(trx(2)), AddOutcome::Added);
        assert_eq!(pool.add(trx(1)), AddOutcome::Pending);
        assert_eq!(pool.add(trx(3)), AddOutcome::Added);

        let proposal = pool.take_for_proposal(2);
        assert_eq!(proposal, vec![trx(1), trx(2)]);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_committed_ids_are_remembered() {
        let mut pool = TrxPool::new(16);
        pool.add(trx(1));
        pool.add(trx(2));
        pool.mark_committed(&[trx(1).id]);

        assert!(!pool.contains(&trx(1).id));
        assert!(pool.is_committed(&trx(1).id));
        assert_eq!(pool.add(trx(1)), AddOutcome::Committed);
        assert_eq!(pool.take_for_proposal(10), vec![trx(2)]);
    }

    #[test]
    fn test_remove_drops_from_proposals() {
        let mut pool = TrxPool::new(16);
        pool.add(trx(1));
        pool.add(trx(2));

        assert!(pool.remove(&trx(1).id));
        assert!(!pool.remove(&trx(1).id));
        assert_eq!(pool.take_for_proposal(10), vec![trx(2)]);
        // a removed transaction may be submitted again
        assert_eq!(pool.add(trx(1)), AddOutcome::Added);
    }

    #[test]
    fn test_committed_memory_is_bounded() {
        let mut pool = TrxPool::new(2);
        pool.mark_committed(&[trx(1).id, trx(2).id, trx(3).id]);

        assert!(!pool.is_committed(&trx(1).id));
        assert!(pool.is_committed(&trx(3).id));
        assert!(pool.is_empty());
    }
}
