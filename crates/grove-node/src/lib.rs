//! # Grove Node
//!
//! A Grove node hosts many independent groups. Each group is a chain with
//! its own producer set, replicated by its own BFT consensus engine, and fed
//! by the node's durable publish queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Grove Node                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  Transport inbound ──▶ GroupManager::route_message          │
//! │                              │                              │
//! │          ┌───────────────────┼───────────────────┐          │
//! │          ▼                   ▼                   ▼          │
//! │   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐   │
//! │   │ engine  g1  │     │ engine  g2  │     │ engine  gN  │   │
//! │   │ dispatcher  │     │ dispatcher  │     │ dispatcher  │   │
//! │   └─────────────┘     └─────────────┘     └─────────────┘   │
//! │          │                   │                   │          │
//! │          └────────── Storage Port (blocks, groups, queue) ──│
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`group_manager`] - Registry and lifecycle of every group
//! - [`config`] - Node configuration (YAML file plus flags)
//! - [`observability`] - Logging and the metrics registry
//! - [`keys`] - Node key file

pub mod config;
pub mod error;
pub mod group_manager;
pub mod keys;
pub mod observability;

pub use config::{Cli, EngineSettings, NodeConfig, StorageBackend};
pub use error::{NodeError, Result};
pub use group_manager::{GroupInfo, GroupManager, NodeContext};
pub use observability::{init_logging, NodeMetrics};
