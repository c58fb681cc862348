//! Producer and User roles.
//!
//! Roles are capability flags over one group record. They are derived from
//! the local identity, the current producer set and the group's mode, and are
//! recomputed whenever the producer set changes.

use grove_types::{ConsensusMode, GroupItem, NodeId, ProducerSet};
use serde::{Deserialize, Serialize};

/// Capabilities of the local node within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roles {
    /// May propose blocks, vote and receive publish-queue entries.
    pub producer: bool,
    /// Validates and applies COMMIT notifications.
    pub user: bool,
}

impl Roles {
    /// Derives the roles of `node` in a group.
    ///
    /// Producers always hold the User role too. In private groups only
    /// producers and the owner apply commits.
    pub fn derive(node: &NodeId, producers: &ProducerSet, group: &GroupItem) -> Self {
        let producer = producers.contains(node);
        let user = match group.mode {
            ConsensusMode::Public => true,
            ConsensusMode::Private => producer || *node == group.owner,
        };
        Self { producer, user }
    }

    /// Roles of a node that holds neither capability.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns true if neither role is held.
    pub fn is_none(&self) -> bool {
        !self.producer && !self.user
    }
}

impl std::fmt::Display for Roles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.producer, self.user) {
            (true, true) => write!(f, "producer+user"),
            (true, false) => write!(f, "producer"),
            (false, true) => write!(f, "user"),
            (false, false) => write!(f, "none"),
        }
    }
}
