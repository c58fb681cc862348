//! Identity and signing port.
//!
//! Consensus code only talks to the [`Identity`] trait. [`Ed25519Identity`]
//! is the in-process implementation backed by `ed25519-consensus`; a keystore
//! or remote signer can be plugged in behind the same trait.

use crate::error::{Result, TypesError};
use crate::id::{NodeId, Signature};
use crate::message::HbMsg;
use ed25519_consensus::SigningKey;
use rand::rngs::OsRng;

/// Signs on behalf of the local node and verifies peers.
pub trait Identity: Send + Sync {
    /// The local node identity.
    fn node_id(&self) -> NodeId;

    /// Signs arbitrary data.
    fn sign(&self, data: &[u8]) -> Signature;

    /// Verifies a signature from `signer` over `data`.
    fn verify(&self, signer: &NodeId, data: &[u8], signature: &Signature) -> bool {
        verify_signature(signer, data, signature)
    }
}

/// Verifies an Ed25519 signature against a hex node id.
pub fn verify_signature(signer: &NodeId, data: &[u8], signature: &Signature) -> bool {
    let Some(key) = signer.to_key() else {
        return false;
    };
    let Some(sig) = signature.to_signature() else {
        return false;
    };
    key.verify(&sig, data).is_ok()
}

/// Ed25519 identity holding the node's signing key.
#[derive(Clone)]
pub struct Ed25519Identity {
    signing_key: SigningKey,
    node_id: NodeId,
}

impl Ed25519Identity {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::new(OsRng))
    }

    /// Restores an identity from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from(bytes))
    }

    /// Restores an identity from a hex-encoded secret.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str.trim(), &mut bytes)
            .map_err(|e| TypesError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Hex-encoded secret, as stored in a key file.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let node_id = NodeId::from_key(&signing_key.verification_key());
        Self {
            signing_key,
            node_id,
        }
    }
}

impl std::fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl Identity for Ed25519Identity {
    fn node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn sign(&self, data: &[u8]) -> Signature {
        Signature::from_signature(&self.signing_key.sign(data))
    }
}

impl HbMsg {
    /// Signs the message with the given identity, replacing any signature.
    pub fn signed(mut self, identity: &dyn Identity) -> Self {
        self.signature = identity.sign(&self.signing_data());
        self
    }

    /// Checks the signature against the sender's key.
    pub fn verify_signature(&self) -> bool {
        verify_signature(&self.sender, &self.signing_data(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{BlockId, GroupId};
    use crate::message::HbPayload;

    #[test]
    fn test_sign_and_verify() {
        let identity = Ed25519Identity::generate();
        let sig = identity.sign(b"hello");
        assert!(identity.verify(&identity.node_id(), b"hello", &sig));
        assert!(!identity.verify(&identity.node_id(), b"other", &sig));

        let other = Ed25519Identity::generate();
        assert!(!verify_signature(&other.node_id(), b"hello", &sig));
    }

    #[test]
    fn test_secret_roundtrip() {
        let identity = Ed25519Identity::generate();
        let restored = Ed25519Identity::from_secret_hex(&identity.secret_hex()).unwrap();
        assert_eq!(identity.node_id(), restored.node_id());
        assert!(Ed25519Identity::from_secret_hex("abc").is_err());
    }

    #[test]
    fn test_signed_message() {
        let identity = Ed25519Identity::generate();
        let msg = HbMsg::unsigned(
            GroupId::new("g"),
            identity.node_id(),
            1,
            0,
            HbPayload::Vote {
                block_id: BlockId::ZERO,
            },
        );
        assert!(!msg.verify_signature());

        let signed = msg.signed(&identity);
        assert!(signed.is_signed());
        assert!(signed.verify_signature());

        let mut forged = signed.clone();
        forged.height = 2;
        assert!(!forged.verify_signature());
    }
}
