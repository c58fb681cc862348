//! Producer set management.
//!
//! Producers are the nodes allowed to propose and vote on blocks for a group.
//! The set is ordered; proposer rotation and quorum accounting are pure
//! functions of that order and the producers' weights.

use crate::error::{Result, TypesError};
use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on the summed weight of a producer set.
pub const MAX_TOTAL_WEIGHT: u64 = u64::MAX / 3;

/// A producer of a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Producer {
    /// Producer identity.
    pub node_id: NodeId,

    /// Human-readable name.
    pub name: String,

    /// Voting weight.
    pub weight: u64,
}

impl Producer {
    /// Creates a new producer.
    pub fn new(node_id: NodeId, name: impl Into<String>, weight: u64) -> Self {
        Self {
            node_id,
            name: name.into(),
            weight,
        }
    }
}

/// The ordered producer set of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Producer>", into = "Vec<Producer>")]
pub struct ProducerSet {
    producers: Vec<Producer>,

    /// Index for fast lookup by node id.
    index: HashMap<NodeId, usize>,
}

impl PartialEq for ProducerSet {
    fn eq(&self, other: &Self) -> bool {
        self.producers == other.producers
    }
}

impl Eq for ProducerSet {}

impl From<Vec<Producer>> for ProducerSet {
    fn from(producers: Vec<Producer>) -> Self {
        let index = producers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.node_id.clone(), i))
            .collect();
        Self { producers, index }
    }
}

impl From<ProducerSet> for Vec<Producer> {
    fn from(set: ProducerSet) -> Self {
        set.producers
    }
}

impl ProducerSet {
    /// Creates a producer set, rejecting empty sets, zero weights and duplicates.
    pub fn new(producers: Vec<Producer>) -> Result<Self> {
        if producers.is_empty() {
            return Err(TypesError::InvalidProducerSet(
                "at least one producer is required".into(),
            ));
        }
        if let Some(p) = producers.iter().find(|p| p.weight == 0) {
            return Err(TypesError::InvalidProducerSet(format!(
                "producer {} has zero weight",
                p.name
            )));
        }

        let total = producers
            .iter()
            .try_fold(0u64, |acc, p| acc.checked_add(p.weight))
            .filter(|total| *total <= MAX_TOTAL_WEIGHT);
        if total.is_none() {
            return Err(TypesError::InvalidProducerSet(format!(
                "total weight exceeds {}",
                MAX_TOTAL_WEIGHT
            )));
        }

        let set = Self::from(producers);
        if set.index.len() != set.producers.len() {
            return Err(TypesError::InvalidProducerSet(
                "duplicate producer identity".into(),
            ));
        }
        Ok(set)
    }

    /// Returns all producers in rotation order.
    pub fn producers(&self) -> &[Producer] {
        &self.producers
    }

    /// Returns the number of producers.
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Returns true if there are no producers.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Gets a producer by identity.
    pub fn get(&self, node_id: &NodeId) -> Option<&Producer> {
        self.index.get(node_id).and_then(|&i| self.producers.get(i))
    }

    /// Checks whether an identity belongs to the set.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.index.contains_key(node_id)
    }

    /// Returns the weight of a producer, zero for non-members.
    pub fn weight_of(&self, node_id: &NodeId) -> u64 {
        self.get(node_id).map(|p| p.weight).unwrap_or(0)
    }

    /// Returns the total voting weight, saturating for sets that bypassed
    /// [`ProducerSet::new`].
    pub fn total_weight(&self) -> u64 {
        self.producers
            .iter()
            .fold(0u64, |acc, p| acc.saturating_add(p.weight))
    }

    /// Weight required to commit: strictly more than two thirds of the total.
    pub fn quorum_weight(&self) -> u64 {
        let two_thirds = u128::from(self.total_weight()) * 2 / 3;
        (two_thirds as u64).saturating_add(1)
    }

    /// Maximum faulty weight the set tolerates: floor((W - 1) / 3).
    pub fn max_faulty_weight(&self) -> u64 {
        self.total_weight().saturating_sub(1) / 3
    }

    /// Weight required to prove at least one honest producer took part.
    pub fn honest_weight(&self) -> u64 {
        self.max_faulty_weight() + 1
    }

    /// The eligible proposer for a height and round (round-robin by index).
    pub fn proposer_for(&self, height: u64, round: u64) -> Option<&Producer> {
        if self.producers.is_empty() {
            return None;
        }
        let n = self.producers.len() as u64;
        let idx = (height.wrapping_add(round) % n) as usize;
        self.producers.get(idx)
    }

    /// Sums the weight of the distinct members among `signers`.
    pub fn signed_weight<'a>(&self, signers: impl IntoIterator<Item = &'a NodeId>) -> u64 {
        let mut seen = std::collections::HashSet::new();
        signers
            .into_iter()
            .filter(|id| seen.insert(*id))
            .fold(0u64, |acc, id| acc.saturating_add(self.weight_of(id)))
    }

    /// Checks if a set of signers meets quorum.
    pub fn has_quorum<'a>(&self, signers: impl IntoIterator<Item = &'a NodeId>) -> bool {
        self.signed_weight(signers) >= self.quorum_weight()
    }
}
