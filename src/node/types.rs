// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node state types.
//!
//! Defines the state machine for the replica node lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (never started)              ├── store failed ──→ Failed
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←─── Running
//!                    shutdown()
//! ```
//!
//! An unreachable broker does not fail the start: the node runs and the
//! publisher connects lazily on the first mutation.

use crate::broker::Broker;
use crate::topology::Topology;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// State of a replica node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// Constructed, nothing opened.
    Created,
    /// Opening the store and broker connections.
    Starting,
    /// Serving and/or consuming.
    Running,
    /// Draining the consumer worker.
    ShuttingDown,
    /// Shut down cleanly.
    Stopped,
    /// The store could not be opened.
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "Created"),
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
            NodeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Which halves of the node to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// HTTP API, publisher and consumer worker.
    Serve,
    /// Consumer worker only; replays go to an API served elsewhere.
    ConsumeOnly,
}

/// Health snapshot served on `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub node_id: String,
    pub state: NodeState,
    /// Running (broker connectivity does not affect it).
    pub healthy: bool,
    pub publisher_connected: bool,
    pub consumer_running: bool,
    pub peers: Vec<String>,
}

/// Cheap, cloneable view of node liveness for the HTTP layer.
///
/// Performs no network I/O.
#[derive(Clone)]
pub struct HealthProbe {
    topology: Arc<Topology>,
    state_rx: watch::Receiver<NodeState>,
    publisher: Arc<dyn Broker>,
    consumer_running: Arc<AtomicBool>,
}

impl HealthProbe {
    pub fn new(
        topology: Arc<Topology>,
        state_rx: watch::Receiver<NodeState>,
        publisher: Arc<dyn Broker>,
        consumer_running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            topology,
            state_rx,
            publisher,
            consumer_running,
        }
    }

    pub async fn check(&self) -> HealthCheck {
        let state = *self.state_rx.borrow();
        HealthCheck {
            node_id: self.topology.node_id().to_string(),
            state,
            healthy: state == NodeState::Running,
            publisher_connected: self.publisher.is_connected().await,
            consumer_running: self.consumer_running.load(Ordering::Acquire),
            peers: self.topology.peers().map(str::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Created.to_string(), "Created");
        assert_eq!(NodeState::Starting.to_string(), "Starting");
        assert_eq!(NodeState::Running.to_string(), "Running");
        assert_eq!(NodeState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(NodeState::Stopped.to_string(), "Stopped");
        assert_eq!(NodeState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_node_state_serializes_as_name() {
        assert_eq!(serde_json::to_string(&NodeState::Running).unwrap(), "\"Running\"");
    }
}
