//! Identifier types shared by every Grove crate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identifier of a group (an independently replicated chain).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    /// Creates a group id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Node identity (hex-encoded Ed25519 verification key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Creates from a hex string.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Creates from an Ed25519 verification key.
    pub fn from_key(key: &ed25519_consensus::VerificationKey) -> Self {
        Self(hex::encode(key.to_bytes()))
    }

    /// Converts back to an Ed25519 verification key.
    pub fn to_key(&self) -> Option<ed25519_consensus::VerificationKey> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&self.0, &mut bytes).ok()?;
        ed25519_consensus::VerificationKey::try_from(bytes).ok()
    }

    /// Returns the hex string.
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex-encoded Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub String);

impl Signature {
    /// Creates from an Ed25519 signature.
    pub fn from_signature(sig: &ed25519_consensus::Signature) -> Self {
        Self(hex::encode(sig.to_bytes()))
    }

    /// Converts to an Ed25519 signature.
    pub fn to_signature(&self) -> Option<ed25519_consensus::Signature> {
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(&self.0, &mut bytes).ok()?;
        Some(ed25519_consensus::Signature::from(bytes))
    }

    /// An empty placeholder, replaced when the message is signed.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Returns true if no signature has been attached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A SHA-256 digest used for block and transaction identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest32([u8; 32]);

impl Digest32 {
    /// All-zero digest.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Creates a digest from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hashes the given byte chunks in order.
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a digest from a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Default for Digest32 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::fmt::Display for Digest32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Block identifier (SHA-256 of the block header).
pub type BlockId = Digest32;

/// Transaction identifier.
pub type TrxId = Digest32;
