// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::RecordingReplayer;
use logistics_replication::broker::{topic_matches, MessageHeaders};
use logistics_replication::config::parse_peer_list;
use logistics_replication::publisher::ResourceSnapshot;
use logistics_replication::{
    BrokerRole, Disposition, EventPublisher, EventType, InMemoryBroker, InMemoryExchange,
    Lifecycle, MutationEvent, NodeConfig, ReplicationConsumer, ResourceKind, Topology,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Node ids as they appear in deployments: short, no dots or wildcards.
fn node_id() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9_-]{0,7}"
}

/// A node id plus a set of distinct peers that never includes it.
fn node_and_peers() -> impl Strategy<Value = (String, Vec<String>)> {
    (node_id(), prop::collection::btree_set(node_id(), 0..8)).prop_map(|(id, peers)| {
        let peers = peers.into_iter().filter(|p| *p != id).collect();
        (id, peers)
    })
}

fn topology(id: &str, peers: &[String]) -> Arc<Topology> {
    let peers: Vec<&str> = peers.iter().map(String::as_str).collect();
    Arc::new(Topology::from_config(&NodeConfig::for_testing(id, &peers)).unwrap())
}

fn shipment_snapshot(id: i64) -> ResourceSnapshot {
    let fields = json!({
        "id": id,
        "tracking_number": "TRK-1",
        "origin": "NY",
        "destination": "LA",
        "weight": 3.5,
        "status": "pending",
        "warehouse_id": 1,
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:00Z",
    });
    ResourceSnapshot {
        id,
        fields: fields.as_object().cloned().unwrap(),
    }
}

const SHIPMENT_UPDATABLE: [&str; 5] = ["origin", "destination", "weight", "status", "warehouse_id"];

// =============================================================================
// Topic Matching Properties
// =============================================================================

proptest! {
    /// A literal pattern matches exactly its own key
    #[test]
    fn literal_pattern_matches_itself(source in node_id(), target in node_id()) {
        let key = format!("{}.{}", source, target);
        prop_assert!(topic_matches(&key, &key));
    }

    /// "{peer}.{self}" never matches the reverse edge
    #[test]
    fn binding_does_not_match_reverse_edge(a in node_id(), b in node_id()) {
        prop_assume!(a != b);
        let binding = format!("{}.{}", a, b);
        let reverse = format!("{}.{}", b, a);
        prop_assert!(!topic_matches(&binding, &reverse));
    }

    /// `*` matches exactly one word
    #[test]
    fn star_matches_one_word(source in node_id(), target in node_id(), extra in node_id()) {
        let pattern = format!("*.{}", target);
        let one_word = format!("{}.{}", source, target);
        let two_words = format!("{}.{}.{}", extra, source, target);
        prop_assert!(topic_matches(&pattern, &one_word));
        prop_assert!(!topic_matches(&pattern, &two_words));
    }

    /// `#` matches any key
    #[test]
    fn hash_matches_anything(words in prop::collection::vec(node_id(), 0..5)) {
        let key = words.join(".");
        prop_assert!(topic_matches("#", &key));
    }
}

// =============================================================================
// Topology Properties
// =============================================================================

proptest! {
    /// Outbound keys and inbound bindings are mirror images per peer
    #[test]
    fn outbound_and_inbound_keys_mirror((id, peers) in node_and_peers()) {
        let topo = topology(&id, &peers);
        let outbound = topo.outbound_routing_keys();
        let bindings = topo.binding_patterns();

        prop_assert_eq!(outbound.len(), peers.len());
        prop_assert_eq!(bindings.len(), peers.len());
        for peer in &peers {
            let outbound_key = format!("{}.{}", id, peer);
            let inbound_key = format!("{}.{}", peer, id);
            prop_assert!(outbound.contains(&outbound_key));
            prop_assert!(bindings.contains(&inbound_key));
        }
        prop_assert!(!topo.is_peer(&id));
    }

    /// Peer lists parse to trimmed, non-empty ids
    #[test]
    fn peer_list_parsing_is_clean(ids in prop::collection::vec(node_id(), 0..6), pad in " {0,2}") {
        let raw = format!("[{}]", ids.iter().map(|i| format!("{}{}{}", pad, i, pad)).collect::<Vec<_>>().join(","));
        let parsed = parse_peer_list(&raw);
        prop_assert_eq!(parsed, ids);
    }
}

// =============================================================================
// Publisher Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// One message per peer, keyed "{self}.{peer}", targeted at that peer
    #[test]
    fn fan_out_publishes_one_message_per_peer((id, peers) in node_and_peers()) {
        let exchange = InMemoryExchange::new();
        let topo = topology(&id, &peers);
        let broker = Arc::new(InMemoryBroker::new(exchange.clone(), topo.clone(), BrokerRole::Publisher));
        let publisher = EventPublisher::new(topo, broker);

        let snapshot = ResourceSnapshot {
            id: 1,
            fields: json!({"id": 1, "name": "Main", "location": "NY"}).as_object().cloned().unwrap(),
        };
        let report = runtime().block_on(publisher.warehouse_created(&snapshot, "op"));

        prop_assert_eq!(report.attempted(), peers.len());
        prop_assert!(report.is_complete());

        let published = exchange.published();
        prop_assert_eq!(published.len(), peers.len());
        let targets: BTreeSet<String> = published
            .iter()
            .map(|m| {
                let event = MutationEvent::from_slice(&m.body).unwrap();
                assert_eq!(m.routing_key, format!("{}.{}", id, event.target_node));
                assert_eq!(event.source_node, id);
                event.target_node
            })
            .collect();
        prop_assert_eq!(targets, peers.iter().cloned().collect::<BTreeSet<_>>());
    }

    /// An update payload carries exactly the fields that were updated
    #[test]
    fn update_payload_is_exactly_the_changed_fields(
        mask in prop::collection::vec(any::<bool>(), SHIPMENT_UPDATABLE.len()),
        id in 1i64..10_000,
    ) {
        let changed: Vec<String> = SHIPMENT_UPDATABLE
            .iter()
            .zip(&mask)
            .filter(|(_, keep)| **keep)
            .map(|(f, _)| f.to_string())
            .collect();

        let exchange = InMemoryExchange::new();
        let topo = topology("A", &["B".to_string()]);
        let broker = Arc::new(InMemoryBroker::new(exchange.clone(), topo.clone(), BrokerRole::Publisher));
        let publisher = EventPublisher::new(topo, broker);

        runtime().block_on(publisher.shipment_updated(&shipment_snapshot(id), &changed, "op"));

        let event = MutationEvent::from_slice(&exchange.published()[0].body).unwrap();
        let keys: BTreeSet<&str> = event.payload.keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = changed.iter().map(String::as_str).collect();
        prop_assert_eq!(keys, expected);
        prop_assert_eq!(event.resource_path, format!("/api/v1/shipments/{}", id));
        prop_assert_eq!(event.resource_id, Some(id));
    }
}

// =============================================================================
// Consumer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Only deliveries from a peer addressed to self are ever replayed
    #[test]
    fn consumer_replays_only_allowed_edges(
        (id, peers) in node_and_peers(),
        source in node_id(),
        target in node_id(),
        stage in prop::sample::select(vec![Lifecycle::Created, Lifecycle::Updated, Lifecycle::Deleted]),
    ) {
        let topo = topology(&id, &peers);
        let exchange = InMemoryExchange::new();
        let broker = Arc::new(InMemoryBroker::new(exchange, topo.clone(), BrokerRole::Consumer));
        let replayer = RecordingReplayer::new(200);
        let consumer = ReplicationConsumer::new(topo, broker, replayer.clone());

        let path = match stage {
            Lifecycle::Created => ResourceKind::Warehouse.collection_path(),
            _ => ResourceKind::Warehouse.item_path(1),
        };
        let event = MutationEvent::new(
            &source,
            &target,
            EventType::new(ResourceKind::Warehouse, stage),
            "op",
            path,
            Map::new(),
            Some(1),
        );
        let disposition = runtime()
            .block_on(consumer.handle_delivery(&event.to_bytes().unwrap(), &MessageHeaders::new()));

        let allowed = peers.contains(&source) && target == id;
        prop_assert_eq!(matches!(disposition, Disposition::Replayed { .. }), allowed);
        prop_assert_eq!(replayer.calls().len(), usize::from(allowed));
    }

    /// Whatever path an allowed peer sends, a replay only ever targets this node
    #[test]
    fn replay_never_leaves_own_endpoint(path in "\\PC{0,40}") {
        let topo = topology("B", &["A".to_string()]);
        let broker = Arc::new(InMemoryBroker::new(InMemoryExchange::new(), topo.clone(), BrokerRole::Consumer));
        let replayer = RecordingReplayer::new(200);
        let consumer = ReplicationConsumer::new(topo.clone(), broker, replayer.clone());

        let event = MutationEvent::new(
            "A",
            "B",
            EventType::new(ResourceKind::Shipment, Lifecycle::Updated),
            "op",
            path,
            Map::new(),
            None,
        );
        runtime().block_on(consumer.handle_delivery(&event.to_bytes().unwrap(), &MessageHeaders::new()));

        let prefix = format!("{}/api/v1/shipments/", topo.self_endpoint());
        for call in replayer.calls() {
            prop_assert!(call.url.starts_with(&prefix));
            let id = &call.url[prefix.len()..];
            prop_assert!(!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    /// Arbitrary bytes never panic the consumer and are never replayed
    #[test]
    fn garbage_is_rejected_without_replay(body in prop::collection::vec(any::<u8>(), 0..256)) {
        let topo = topology("B", &["A".to_string()]);
        let broker = Arc::new(InMemoryBroker::new(InMemoryExchange::new(), topo.clone(), BrokerRole::Consumer));
        let replayer = RecordingReplayer::new(200);
        let consumer = ReplicationConsumer::new(topo, broker, replayer.clone());

        let disposition = runtime().block_on(consumer.handle_delivery(&body, &MessageHeaders::new()));
        if MutationEvent::from_slice(&body).is_err() {
            prop_assert!(matches!(disposition, Disposition::Rejected(_)));
            prop_assert!(replayer.calls().is_empty());
        }
    }

    /// Event type strings either parse back to themselves or fail cleanly
    #[test]
    fn event_type_parse_never_panics(raw in "\\PC{0,24}") {
        if let Ok(parsed) = raw.parse::<EventType>() {
            prop_assert_eq!(parsed.to_string(), raw);
        }
    }
}

#[test]
fn payload_json_values_survive_the_envelope() {
    let payload: Map<String, Value> = json!({"weight": 12.25, "warehouse_id": 7, "status": "lost"})
        .as_object()
        .cloned()
        .unwrap();
    let event = MutationEvent::new(
        "A",
        "B",
        EventType::new(ResourceKind::Shipment, Lifecycle::Updated),
        "op",
        ResourceKind::Shipment.item_path(3),
        payload.clone(),
        Some(3),
    );
    let decoded = MutationEvent::from_slice(&event.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded.payload, payload);
}
