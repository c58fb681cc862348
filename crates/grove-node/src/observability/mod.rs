//! # Observability Module
//!
//! - **Structured Logging**: pretty or JSON `tracing` output
//! - **Prometheus Metrics**: one registry per node holding the consensus and
//!   publish-queue families
//!
//! ## Usage
//!
//! ```rust,ignore
//! use grove_node::observability::{init_logging, NodeMetrics};
//!
//! init_logging("grove=info", false);
//! let metrics = NodeMetrics::new();
//! ```

mod logging;
mod metrics;

pub use logging::init_logging;
pub use metrics::NodeMetrics;
