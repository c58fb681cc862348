//! Grove Publish Queue
//!
//! Durable, per-group delivery of locally submitted payloads into blocks.
//!
//! `enqueue` persists an entry and returns its id immediately. A dispatcher
//! task per bound group wraps PENDING entries into transactions and hands
//! them to the group's [`DispatchSink`] (its consensus engine). An entry is
//! acknowledged once a block containing its transaction is committed, or
//! right after dispatch when `auto_ack` is set.
//!
//! # Entry Lifecycle
//!
//! ```text
//!             dispatch ok             commit seen
//!  PENDING ───────────────▶ SENT ─────────────────▶ ACKED
//!     ▲  │                    │
//!     │  │ retry ceiling      │ ack timeout
//!     │  ▼                    │
//!     │ FAILED ◀──────────────┤ (at the ceiling)
//!     └───────────────────────┘ (otherwise)
//! ```
//!
//! Delivery is at-least-once. The transaction nonce is the entry id, so a
//! retried entry always produces the same transaction id and the engine's
//! pool never lets it into a second block.

pub mod config;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod sink;

pub use config::PublishQueueConfig;
pub use entry::{EntryId, EntryStatus, PublishQueueEntry};
pub use error::{QueueError, Result};
pub use metrics::{EntryLabels, QueueMetrics};
pub use queue::PublishQueue;
pub use sink::DispatchSink;
