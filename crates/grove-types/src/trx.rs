//! Group transactions.
//!
//! Application payloads are opaque bytes. The only transaction the consensus
//! layer interprets is the governance update that replaces the producer set.
//! Updates carry the group owner's signature; producers cannot forge them.

use crate::id::{GroupId, NodeId, Signature, TrxId};
use crate::identity::{verify_signature, Identity};
use crate::producer::Producer;
use serde::{Deserialize, Serialize};

/// Body of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrxBody {
    /// Opaque application payload.
    App(Vec<u8>),

    /// Governance: replace the producer set from the next height on.
    UpdateProducers(ProducerUpdate),
}

/// A new producer list signed by the group owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerUpdate {
    /// The replacement producer set, in rotation order.
    pub producers: Vec<Producer>,

    /// Owner signature over group id, nonce and list.
    pub signature: Signature,
}

impl ProducerUpdate {
    fn signing_bytes(group_id: &GroupId, nonce: &str, producers: &[Producer]) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 + producers.len() * 80);
        data.extend_from_slice(b"UPDATE_PRODUCERS:");
        data.extend_from_slice(group_id.as_str().as_bytes());
        data.push(b':');
        data.extend_from_slice(nonce.as_bytes());
        for producer in producers {
            data.push(b':');
            data.extend_from_slice(producer.node_id.as_hex().as_bytes());
            data.push(b'/');
            data.extend_from_slice(&producer.weight.to_le_bytes());
        }
        data
    }
}

impl TrxBody {
    /// Returns the body kind as a string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            TrxBody::App(_) => "app",
            TrxBody::UpdateProducers(_) => "update_producers",
        }
    }
}

/// A transaction submitted to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trx {
    /// Content identifier.
    pub id: TrxId,

    /// Submitter-chosen nonce keeping identical payloads distinct.
    pub nonce: String,

    /// Transaction body.
    pub body: TrxBody,
}

impl Trx {
    /// Creates a transaction.
    pub fn new(group_id: &GroupId, nonce: impl Into<String>, body: TrxBody) -> Self {
        let nonce = nonce.into();
        let id = Self::compute_id(group_id, &nonce, &body);
        Self { id, nonce, body }
    }

    /// Builds a producer-set update signed by the group owner.
    pub fn update_producers(
        group_id: &GroupId,
        nonce: impl Into<String>,
        producers: Vec<Producer>,
        owner: &dyn Identity,
    ) -> Self {
        let nonce = nonce.into();
        let signature = owner.sign(&ProducerUpdate::signing_bytes(group_id, &nonce, &producers));
        Self::new(
            group_id,
            nonce,
            TrxBody::UpdateProducers(ProducerUpdate { producers, signature }),
        )
    }

    /// Checks that a governance transaction is signed by `owner`.
    /// Application payloads need no authorization.
    pub fn is_authorized(&self, group_id: &GroupId, owner: &NodeId) -> bool {
        match &self.body {
            TrxBody::App(_) => true,
            TrxBody::UpdateProducers(update) => verify_signature(
                owner,
                &ProducerUpdate::signing_bytes(group_id, &self.nonce, &update.producers),
                &update.signature,
            ),
        }
    }

    /// Recomputes the id and checks it against the stored one.
    pub fn verify_id(&self, group_id: &GroupId) -> bool {
        Self::compute_id(group_id, &self.nonce, &self.body) == self.id
    }

    fn compute_id(group_id: &GroupId, nonce: &str, body: &TrxBody) -> TrxId {
        // serializing an in-memory enum of plain data cannot fail
        let encoded = serde_json::to_vec(body).unwrap_or_default();
        TrxId::hash_parts(&[
            b"TRX:".as_slice(),
            group_id.as_str().as_bytes(),
            b":".as_slice(),
            nonce.as_bytes(),
            b":".as_slice(),
            &encoded,
        ])
    }

    /// Returns the application payload, if any.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.body {
            TrxBody::App(bytes) => Some(bytes),
            TrxBody::UpdateProducers(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Ed25519Identity;

    #[test]
    fn test_trx_id_depends_on_nonce_and_group() {
        let group = GroupId::new("g1");
        let a = Trx::new(&group, "n1", TrxBody::App(b"hello".to_vec()));
        let b = Trx::new(&group, "n2", TrxBody::App(b"hello".to_vec()));
        let c = Trx::new(&GroupId::new("g2"), "n1", TrxBody::App(b"hello".to_vec()));

        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(a.verify_id(&group));
        assert!(!a.verify_id(&GroupId::new("g2")));
        assert_eq!(a.payload(), Some(b"hello".as_slice()));
    }

    #[test]
    fn test_producer_update_requires_owner_signature() {
        let group = GroupId::new("g1");
        let owner = Ed25519Identity::from_secret_bytes([1; 32]);
        let intruder = Ed25519Identity::from_secret_bytes([2; 32]);
        let list = vec![Producer::new(intruder.node_id(), "intruder", 1)];

        let signed = Trx::update_producers(&group, "gov-1", list.clone(), &owner);
        assert!(signed.verify_id(&group));
        assert!(signed.is_authorized(&group, &owner.node_id()));
        assert!(!signed.is_authorized(&GroupId::new("g2"), &owner.node_id()));

        let forged = Trx::update_producers(&group, "gov-1", list, &intruder);
        assert!(!forged.is_authorized(&group, &owner.node_id()));

        // replaying the owner's signature under a new nonce breaks it
        let mut replayed = signed.clone();
        replayed.nonce = "gov-2".into();
        assert!(!replayed.is_authorized(&group, &owner.node_id()));

        assert!(Trx::new(&group, "n", TrxBody::App(vec![])).is_authorized(&group, &intruder.node_id()));
    }
}
