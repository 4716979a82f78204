// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event publisher (outbound half of replication).
//!
//! Turns one committed local mutation into one [`MutationEvent`] per peer and
//! publishes each with routing key `"{self}.{peer}"`.
//!
//! # Fan-out
//!
//! ```text
//!   warehouse created on A (peers B, C, D)
//!        │
//!        ├──► "A.B"  ok
//!        ├──► "A.C"  ok
//!        └──► "A.D"  broker error → logged, counted, skipped
//! ```
//!
//! Publishing is sequential and best-effort. A failure for one peer never
//! stops the others and never propagates to the caller: the local mutation
//! already committed, and the returned [`PublishReport`] is purely
//! informational. There is no outbox and no retry.
//!
//! # Payloads
//!
//! | Stage | Payload |
//! |-------|---------|
//! | created | the create fields of the new record |
//! | updated | only the fields the client actually sent |
//! | deleted | empty |

use crate::broker::Broker;
use crate::error::Result;
use crate::event::{EventType, Lifecycle, MutationEvent, ResourceKind};
use crate::metrics;
use crate::topology::Topology;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State of one record after a mutation, as seen by the publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    /// Id assigned by the local store.
    pub id: i64,
    /// All fields of the record, by name.
    pub fields: Map<String, Value>,
}

/// Result of publishing to one peer.
#[derive(Debug)]
pub struct PeerPublish {
    pub peer: String,
    pub routing_key: String,
    pub result: Result<()>,
}

/// Outcome of one fan-out.
#[derive(Debug)]
pub struct PublishReport {
    pub event_type: EventType,
    pub deliveries: Vec<PeerPublish>,
}

impl PublishReport {
    pub fn attempted(&self) -> usize {
        self.deliveries.len()
    }

    pub fn succeeded(&self) -> usize {
        self.deliveries.iter().filter(|d| d.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }

    /// Whether every peer received the event.
    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }

    /// Peers the event could not be published to.
    pub fn failed_peers(&self) -> Vec<&str> {
        self.deliveries
            .iter()
            .filter(|d| d.result.is_err())
            .map(|d| d.peer.as_str())
            .collect()
    }
}

/// Publishes Mutation Events for local mutations.
pub struct EventPublisher {
    topology: Arc<Topology>,
    broker: Arc<dyn Broker>,
}

impl EventPublisher {
    pub fn new(topology: Arc<Topology>, broker: Arc<dyn Broker>) -> Self {
        Self { topology, broker }
    }

    /// The publisher's broker connection.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish a `{kind}.created` event to every peer.
    pub async fn publish_created(
        &self,
        kind: ResourceKind,
        snapshot: &ResourceSnapshot,
        operation_tag: &str,
    ) -> PublishReport {
        let payload = select_fields(&snapshot.fields, kind.create_fields().iter().copied());
        self.fan_out(
            EventType::new(kind, Lifecycle::Created),
            operation_tag,
            kind.collection_path(),
            payload,
            Some(snapshot.id),
        )
        .await
    }

    /// Publish a `{kind}.updated` event carrying only `updated_fields`.
    pub async fn publish_updated(
        &self,
        kind: ResourceKind,
        snapshot: &ResourceSnapshot,
        updated_fields: &[String],
        operation_tag: &str,
    ) -> PublishReport {
        let payload = select_fields(&snapshot.fields, updated_fields.iter().map(String::as_str));
        self.fan_out(
            EventType::new(kind, Lifecycle::Updated),
            operation_tag,
            kind.item_path(snapshot.id),
            payload,
            Some(snapshot.id),
        )
        .await
    }

    /// Publish a `{kind}.deleted` event with an empty payload.
    pub async fn publish_deleted(
        &self,
        kind: ResourceKind,
        id: i64,
        operation_tag: &str,
    ) -> PublishReport {
        self.fan_out(
            EventType::new(kind, Lifecycle::Deleted),
            operation_tag,
            kind.item_path(id),
            Map::new(),
            Some(id),
        )
        .await
    }

    pub async fn warehouse_created(&self, snapshot: &ResourceSnapshot, tag: &str) -> PublishReport {
        self.publish_created(ResourceKind::Warehouse, snapshot, tag).await
    }

    pub async fn warehouse_updated(
        &self,
        snapshot: &ResourceSnapshot,
        updated_fields: &[String],
        tag: &str,
    ) -> PublishReport {
        self.publish_updated(ResourceKind::Warehouse, snapshot, updated_fields, tag)
            .await
    }

    pub async fn warehouse_deleted(&self, id: i64, tag: &str) -> PublishReport {
        self.publish_deleted(ResourceKind::Warehouse, id, tag).await
    }

    pub async fn shipment_created(&self, snapshot: &ResourceSnapshot, tag: &str) -> PublishReport {
        self.publish_created(ResourceKind::Shipment, snapshot, tag).await
    }

    pub async fn shipment_updated(
        &self,
        snapshot: &ResourceSnapshot,
        updated_fields: &[String],
        tag: &str,
    ) -> PublishReport {
        self.publish_updated(ResourceKind::Shipment, snapshot, updated_fields, tag)
            .await
    }

    pub async fn shipment_deleted(&self, id: i64, tag: &str) -> PublishReport {
        self.publish_deleted(ResourceKind::Shipment, id, tag).await
    }

    async fn fan_out(
        &self,
        event_type: EventType,
        operation_tag: &str,
        resource_path: String,
        payload: Map<String, Value>,
        resource_id: Option<i64>,
    ) -> PublishReport {
        let source = self.topology.node_id();
        let label = event_type.to_string();
        let mut deliveries = Vec::with_capacity(self.topology.peer_count());

        for peer in self.topology.peers() {
            let event = MutationEvent::new(
                source,
                peer,
                event_type,
                operation_tag,
                resource_path.clone(),
                payload.clone(),
                resource_id,
            );
            let result = self.publish_one(&event).await;

            match &result {
                Ok(()) => {
                    debug!(
                        event_type = %label,
                        routing_key = %event.routing_key,
                        operation = %operation_tag,
                        "Published mutation event"
                    );
                }
                Err(e) => {
                    warn!(
                        event_type = %label,
                        routing_key = %event.routing_key,
                        operation = %operation_tag,
                        error = %e,
                        "Failed to publish mutation event, peer will miss this change"
                    );
                    metrics::record_error(e.kind());
                }
            }
            metrics::record_event_published(&label, peer, result.is_ok());

            deliveries.push(PeerPublish {
                peer: peer.to_string(),
                routing_key: event.routing_key,
                result,
            });
        }

        let report = PublishReport {
            event_type,
            deliveries,
        };
        metrics::record_fan_out(&label, report.attempted(), report.failed());
        if report.attempted() > 0 {
            info!(
                event_type = %label,
                operation = %operation_tag,
                published = report.succeeded(),
                failed = report.failed(),
                "Replicated local mutation"
            );
        }
        report
    }

    async fn publish_one(&self, event: &MutationEvent) -> Result<()> {
        let body = event.to_bytes()?;
        self.broker
            .publish(&event.routing_key, body, event.headers())
            .await
    }
}

/// Copy the named fields present in `fields`, in the given order.
fn select_fields<'a>(
    fields: &Map<String, Value>,
    names: impl Iterator<Item = &'a str>,
) -> Map<String, Value> {
    names
        .filter_map(|name| fields.get(name).map(|v| (name.to_string(), v.clone())))
        .collect()
}
