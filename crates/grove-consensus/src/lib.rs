//! Grove Consensus Engine
//!
//! Per-group BFT agreement for Grove. Every group a node belongs to runs its
//! own engine with its own producer set, so groups commit independently and
//! a stalled group never blocks another.
//!
//! # Protocol
//!
//! Each height is agreed on in rounds. The proposer of round `r` at height `h`
//! is `producers[(h + r) mod n]`.
//!
//! - **Propose**: the proposer broadcasts a block built from its pool (or the
//!   block it must re-propose) together with its own vote.
//! - **Vote**: producers vote at most once per round and lock on the proposal
//!   they voted for.
//! - **Commit**: once votes for the proposed block weigh more than two thirds
//!   of the producer weight, the block is persisted and announced with its
//!   votes as a certificate.
//! - **Timeout**: a round without quorum is abandoned with TIMEOUT-NOTIFY
//!   messages carrying each sender's lock. A quorum of notices starts the next
//!   round and justifies its proposal.
//!
//! Safety holds with up to `f < n/3` faulty producers (by weight). Liveness
//! needs a quorum of producers that can reach each other.
//!
//! # Components
//!
//! - [`PSyncer`]: the state machine of one group
//! - [`spawn_engine`] / [`EngineHandle`]: the task that owns a PSyncer
//! - [`TrxPool`]: pending transactions with committed-id memory
//! - [`Transport`]: outbound port, with [`LocalNetwork`] for in-process nodes
//!
//! # Transaction Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ PublishQueue │────▶│ EngineHandle │────▶│   TrxPool    │
//! │  (dispatch)  │     │   (submit)   │     │  (pending)   │
//! └──────────────┘     └──────────────┘     └──────┬───────┘
//!                                                   │
//!                      ┌────────────────────────────┘
//!                      ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ CommitEvent  │◀────│  BlockStore  │◀────│   Quorum     │
//! │  (ack queue) │     │   (append)   │     │   of Votes   │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod psyncer;
pub mod roles;
pub mod round;
pub mod state;
pub mod transport;
pub mod vote_set;

pub use config::{EngineConfig, RetryPolicy};
pub use engine::{spawn_engine, EngineCommand, EngineHandle};
pub use error::{ConsensusError, Result};
pub use metrics::{drop_reason, ConsensusMetrics, DropLabels, GroupLabels};
pub use pool::{AddOutcome, TrxPool};
pub use psyncer::{CommitEvent, ConsensusIface, EngineStatus, PSyncer, SubmitReceipt, WithdrawReceipt};
pub use roles::Roles;
pub use round::{ConsensusRound, ProposalOutcome};
pub use state::{EngineState, HealthStatus};
pub use transport::{Inbound, LocalEndpoint, LocalNetwork, RecordingTransport, Transport};
pub use vote_set::{reported_lock, TimeoutSet, VoteOutcome, VoteSet};
