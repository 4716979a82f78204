// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Static replication topology of one node.
//!
//! Built once from [`NodeConfig`] at startup and shared read-only (behind an
//! `Arc`) by the broker connections, the publisher and the consumer.
//!
//! # Routing
//!
//! Every replication hop is a directed edge `source → target` with routing
//! key `"{source}.{target}"`. Each node owns one durable inbound queue and
//! binds it once per allowed peer with the pattern `"{peer}.{self}"`:
//!
//! ```text
//!   A publishes "A.B" ──► exchange ──► queue of B  (bound with "A.B", "C.B", "D.B")
//!   A publishes "A.C" ──► exchange ──► queue of C  (bound with "A.C", "B.C", "D.C")
//! ```
//!
//! Node ids therefore must not contain `.`, `*` or `#`.

use crate::config::NodeConfig;
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Characters with meaning in topic routing keys and binding patterns.
const RESERVED_ID_CHARS: [char; 3] = ['.', '*', '#'];

/// Build the routing key of the directed edge `source → target`.
pub fn routing_key(source: &str, target: &str) -> String {
    format!("{}.{}", source, target)
}

/// Validated, immutable topology of one node.
#[derive(Debug, Clone)]
pub struct Topology {
    node_id: String,
    peers: BTreeSet<String>,
    endpoints: HashMap<String, String>,
    self_endpoint: String,
    exchange: String,
    queue_name: String,
}

impl Topology {
    /// Validate the config and derive the topology.
    ///
    /// Self is dropped from the peer set with a warning; malformed ids and
    /// endpoint URLs are configuration errors.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let node_id = config.node.id.trim().to_string();
        validate_node_id(&node_id)?;

        let mut peers = BTreeSet::new();
        for peer in &config.peers {
            let peer = peer.trim();
            if peer == node_id {
                warn!(node_id = %node_id, "Ignoring self in peer list");
                continue;
            }
            validate_node_id(peer)?;
            peers.insert(peer.to_string());
        }

        for (id, url) in &config.endpoints {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ReplicationError::Config(format!(
                    "Endpoint for node {} must be an http(s) URL, got {:?}",
                    id, url
                )));
            }
        }

        let self_endpoint = config
            .endpoints
            .get(&node_id)
            .cloned()
            .unwrap_or_else(|| config.node.default_endpoint());

        Ok(Self {
            queue_name: format!("{}{}", config.broker.queue_prefix, node_id),
            exchange: config.broker.exchange.clone(),
            node_id,
            peers,
            endpoints: config.endpoints.clone(),
            self_endpoint: self_endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Peer ids in stable order. Never contains self.
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(String::as_str)
    }

    /// Number of peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether `node_id` is an allowed replication source.
    pub fn is_peer(&self, node_id: &str) -> bool {
        self.peers.contains(node_id)
    }

    /// Name of the shared topic exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Name of this node's durable inbound queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Binding patterns of this node's queue: `"{peer}.{self}"` per peer.
    pub fn binding_patterns(&self) -> Vec<String> {
        self.peers()
            .map(|peer| routing_key(peer, &self.node_id))
            .collect()
    }

    /// Routing keys this node publishes with: `"{self}.{peer}"` per peer.
    pub fn outbound_routing_keys(&self) -> Vec<String> {
        self.peers()
            .map(|peer| routing_key(&self.node_id, peer))
            .collect()
    }

    /// Base URL of this node's own API (replay target), without trailing slash.
    pub fn self_endpoint(&self) -> &str {
        &self.self_endpoint
    }

    /// Base URL configured for any node, if present.
    pub fn endpoint_for(&self, node_id: &str) -> Option<&str> {
        if node_id == self.node_id {
            return Some(&self.self_endpoint);
        }
        self.endpoints.get(node_id).map(String::as_str)
    }
}

fn validate_node_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ReplicationError::Config("Node id must not be empty".to_string()));
    }
    if let Some(c) = id.chars().find(|c| RESERVED_ID_CHARS.contains(c) || c.is_whitespace()) {
        return Err(ReplicationError::Config(format!(
            "Node id {:?} contains reserved character {:?}",
            id, c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(id: &str, peers: &[&str]) -> Topology {
        Topology::from_config(&NodeConfig::for_testing(id, peers)).unwrap()
    }

    #[test]
    fn test_routing_key_format() {
        assert_eq!(routing_key("A", "B"), "A.B");
    }

    #[test]
    fn test_peers_sorted_and_self_filtered() {
        let topo = topology("A", &["D", "B", "A", "C"]);
        let peers: Vec<_> = topo.peers().collect();
        assert_eq!(peers, vec!["B", "C", "D"]);
        assert!(!topo.is_peer("A"));
        assert_eq!(topo.peer_count(), 3);
    }

    #[test]
    fn test_duplicate_peers_collapse() {
        let topo = topology("A", &["B", "B", " B "]);
        assert_eq!(topo.peer_count(), 1);
    }

    #[test]
    fn test_binding_patterns_target_self() {
        let topo = topology("B", &["A", "C", "D"]);
        assert_eq!(topo.binding_patterns(), vec!["A.B", "C.B", "D.B"]);
        assert_eq!(topo.outbound_routing_keys(), vec!["B.A", "B.C", "B.D"]);
    }

    #[test]
    fn test_queue_and_exchange_names() {
        let topo = topology("C", &["A"]);
        assert_eq!(topo.queue_name(), "C");
        assert_eq!(topo.exchange(), "logistic_events");
    }

    #[test]
    fn test_queue_prefix_is_prepended() {
        let mut config = NodeConfig::for_testing("C", &["A"]);
        config.broker.queue_prefix = "replica.".to_string();
        let topo = Topology::from_config(&config).unwrap();
        assert_eq!(topo.queue_name(), "replica.C");
    }

    #[test]
    fn test_self_endpoint_defaults_to_bind_address() {
        let topo = topology("B", &["A"]);
        assert_eq!(topo.self_endpoint(), "http://127.0.0.1:8001");
        assert_eq!(topo.endpoint_for("B"), Some("http://127.0.0.1:8001"));
        assert_eq!(topo.endpoint_for("A"), None);
    }

    #[test]
    fn test_self_endpoint_from_map_trims_slash() {
        let mut config = NodeConfig::for_testing("B", &["A"]);
        config
            .endpoints
            .insert("B".to_string(), "http://node-b:8001/".to_string());
        config
            .endpoints
            .insert("A".to_string(), "http://node-a:8000".to_string());
        let topo = Topology::from_config(&config).unwrap();
        assert_eq!(topo.self_endpoint(), "http://node-b:8001");
        assert_eq!(topo.endpoint_for("A"), Some("http://node-a:8000"));
    }

    #[test]
    fn test_rejects_reserved_characters() {
        for bad in ["a.b", "a*", "#", "", "a b"] {
            let config = NodeConfig::for_testing(bad, &[]);
            assert!(
                matches!(Topology::from_config(&config), Err(ReplicationError::Config(_))),
                "node id {:?} should be rejected",
                bad
            );
        }

        let config = NodeConfig::for_testing("A", &["B.C"]);
        assert!(Topology::from_config(&config).is_err());
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        let mut config = NodeConfig::for_testing("A", &["B"]);
        config
            .endpoints
            .insert("B".to_string(), "amqp://node-b".to_string());
        assert!(matches!(
            Topology::from_config(&config),
            Err(ReplicationError::Config(_))
        ));
    }
}
