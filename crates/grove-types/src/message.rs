//! Consensus protocol messages ("HB messages").
//!
//! Every message is a signed envelope bound to one group, height and round.
//! Signing data is domain separated per phase and covers only fixed-size
//! fields (block ids, lock summaries); nested messages carry their own
//! signatures. That lets a justification or a lock be stripped of nested
//! payloads without invalidating the outer signature.

use crate::block::{Block, CommittedBlock};
use crate::id::{BlockId, GroupId, NodeId, Signature};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Phase tag of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Block proposal from the eligible proposer.
    Propose,
    /// Vote for a proposed block.
    Vote,
    /// Commit notification carrying the quorum certificate.
    Commit,
    /// Round timed out at the sender.
    TimeoutNotify,
    /// Request for a committed block the sender is missing.
    SyncRequest,
}

impl Phase {
    /// Returns the phase as a string for logging and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Propose => "propose",
            Phase::Vote => "vote",
            Phase::Commit => "commit",
            Phase::TimeoutNotify => "timeout_notify",
            Phase::SyncRequest => "sync_request",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HbPayload {
    /// Candidate block. Rounds after the first carry a justification: a
    /// quorum of TIMEOUT-NOTIFY messages for the previous round.
    Propose {
        /// The candidate block.
        block: Block,
        /// Timeout notices justifying the round.
        justify: Vec<HbMsg>,
    },

    /// Vote for a block id.
    Vote {
        /// Block being voted for.
        block_id: BlockId,
    },

    /// Commit notification.
    Commit {
        /// The committed block and its certificate.
        certificate: CommittedBlock,
    },

    /// Round timeout notice.
    TimeoutNotify {
        /// The proposal the sender is locked on at this height, if any,
        /// with its justification stripped.
        lock: Option<Box<HbMsg>>,
    },

    /// Ask peers to re-send the commit for `height`.
    SyncRequest,
}

impl HbPayload {
    /// Returns the phase tag.
    pub fn phase(&self) -> Phase {
        match self {
            HbPayload::Propose { .. } => Phase::Propose,
            HbPayload::Vote { .. } => Phase::Vote,
            HbPayload::Commit { .. } => Phase::Commit,
            HbPayload::TimeoutNotify { .. } => Phase::TimeoutNotify,
            HbPayload::SyncRequest => Phase::SyncRequest,
        }
    }
}

/// Signed protocol message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HbMsg {
    /// Target group.
    pub group_id: GroupId,

    /// Sending node.
    pub sender: NodeId,

    /// Height the message refers to.
    pub height: u64,

    /// Round within the height.
    pub round: u64,

    /// Phase-specific content.
    pub payload: HbPayload,

    /// Sender's signature over [`HbMsg::signing_data`].
    pub signature: Signature,
}

impl HbMsg {
    /// Creates an unsigned message.
    pub fn unsigned(
        group_id: GroupId,
        sender: NodeId,
        height: u64,
        round: u64,
        payload: HbPayload,
    ) -> Self {
        Self {
            group_id,
            sender,
            height,
            round,
            payload,
            signature: Signature::empty(),
        }
    }

    /// Returns the phase tag.
    pub fn phase(&self) -> Phase {
        self.payload.phase()
    }

    /// Encodes the message for the wire.
    pub fn encode(&self) -> crate::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a message from wire bytes.
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Returns true when a signature has been attached.
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Returns the block id a PROPOSE, VOTE or COMMIT refers to.
    pub fn block_id(&self) -> Option<BlockId> {
        match &self.payload {
            HbPayload::Propose { block, .. } => Some(block.id()),
            HbPayload::Vote { block_id } => Some(*block_id),
            HbPayload::Commit { certificate } => Some(certificate.id()),
            HbPayload::TimeoutNotify { .. } | HbPayload::SyncRequest => None,
        }
    }

    /// Returns the proposed block for PROPOSE messages.
    pub fn proposed_block(&self) -> Option<&Block> {
        match &self.payload {
            HbPayload::Propose { block, .. } => Some(block),
            _ => None,
        }
    }

    /// Returns a copy of a PROPOSE with its justification removed.
    ///
    /// The signature stays valid because justifications are not signed over.
    pub fn without_justification(&self) -> Self {
        let mut msg = self.clone();
        if let HbPayload::Propose { justify, .. } = &mut msg.payload {
            justify.clear();
        }
        msg
    }

    /// Returns the data that is signed for this message.
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(self.phase().as_str().to_uppercase().as_bytes());
        data.push(b':');
        data.extend_from_slice(self.group_id.as_str().as_bytes());
        data.push(b':');
        data.extend_from_slice(self.sender.as_hex().as_bytes());
        data.push(b':');
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.round.to_le_bytes());

        match &self.payload {
            HbPayload::Propose { block, .. } => {
                data.extend_from_slice(block.id().as_bytes());
            }
            HbPayload::Vote { block_id } => {
                data.extend_from_slice(block_id.as_bytes());
            }
            HbPayload::Commit { certificate } => {
                data.extend_from_slice(certificate.id().as_bytes());
            }
            HbPayload::TimeoutNotify { lock } => match lock {
                Some(lock) => {
                    data.extend_from_slice(&lock.round.to_le_bytes());
                    if let Some(id) = lock.block_id() {
                        data.extend_from_slice(id.as_bytes());
                    }
                }
                None => data.extend_from_slice(b"NOLOCK"),
            },
            HbPayload::SyncRequest => {}
        }

        data
    }
}
