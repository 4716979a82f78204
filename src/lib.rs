// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Logistics Replication
//!
//! Broker-based mesh replication for independently deployed replicas of a
//! small logistics service (warehouses, shipments).
//!
//! ## Architecture
//!
//! Each node keeps its own SQLite store. A committed local write is fanned
//! out, one message per peer, over a shared RabbitMQ topic exchange; each
//! peer replays it against its own HTTP API:
//!
//! ```text
//! ┌──────────────────────────── node A ─────────────────────────────┐
//! │  client ─► api ─► LoopGuard ─► service ─► store (commit)         │
//! │                                   │                              │
//! │                                   └─► EventPublisher ─┐          │
//! └───────────────────────────────────────────────────────│──────────┘
//!                        "A.B" / "A.C" / "A.D"             ▼
//!                                  ┌──────────── topic exchange ───────────┐
//!                                  │ queue B  (bound "A.B","C.B"..)        │
//!                                  └──────────────────┬────────────────────┘
//! ┌──────────────────────────── node B ───────────────│─────────────┐
//! │  ReplicationConsumer ◄────────────────────────────┘              │
//! │      │ validate source ∈ peers, target == B                      │
//! │      └─► HTTP replay (X-Replicated-From: A) ─► api ─► LoopGuard   │
//! │                                     replicated: no re-broadcast  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Semantics
//!
//! - **Single hop**: the origin publishes to every peer directly; receivers
//!   never forward.
//! - **At most once**: publish failures are logged and dropped, replay
//!   failures are acknowledged anyway. There is no outbox, retry or
//!   dead-letter queue.
//! - **No dedup**: a broker redelivery replays the same mutation twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use logistics_replication::{NodeConfig, ReplicaNode};
//!
//! #[tokio::main]
//! async fn main() -> logistics_replication::Result<()> {
//!     let config = NodeConfig::for_testing("A", &["B", "C", "D"]);
//!     let node = ReplicaNode::new(config)?;
//!
//!     // Serves HTTP and consumes the inbound queue until Ctrl-C
//!     node.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod guard;
pub mod metrics;
pub mod node;
pub mod publisher;
pub mod resources;
pub mod service;
pub mod store;
pub mod topology;

// Re-exports for convenience
pub use broker::{Broker, BrokerRole, InMemoryBroker, InMemoryExchange, Outcome};
pub use config::{BrokerConfig, NodeConfig, ReplayConfig, StoreConfig};
pub use consumer::{Disposition, HttpReplayer, Replayer, ReplicationConsumer};
pub use error::{ReplicationError, Result};
pub use event::{EventType, HttpMethod, Lifecycle, MutationEvent, ResourceKind};
pub use guard::ReplicationContext;
pub use node::{HealthCheck, NodeMode, NodeState, ReplicaNode};
pub use publisher::{EventPublisher, PublishReport, ResourceSnapshot};
pub use service::LogisticsService;
pub use store::LogisticsStore;
pub use topology::Topology;
