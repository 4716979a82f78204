// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutation Event envelope.
//!
//! A Mutation Event is the normalized description of one committed local
//! write, addressed to exactly one peer, and complete enough to be replayed
//! there as an HTTP call.
//!
//! # Wire Format
//!
//! JSON body, published with the persistent delivery mode:
//!
//! ```json
//! {
//!   "source_node": "A",
//!   "target_node": "B",
//!   "event_type": "warehouse.created",
//!   "operation_tag": "create-main-warehouse",
//!   "http_method": "POST",
//!   "url": "/api/v1/warehouses/",
//!   "payload": {"name": "Main", "location": "NY"},
//!   "resource_id": 1,
//!   "timestamp": "2026-01-01T00:00:00Z",
//!   "routing_key": "A.B"
//! }
//! ```
//!
//! The `operation-name`, `source-server` and `target-server` message headers
//! mirror the envelope for broker-side observability.

use crate::error::{ReplicationError, Result};
use crate::topology::routing_key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Header marking an inbound request as a replay (value: source node id).
pub const HEADER_REPLICATED_FROM: &str = "X-Replicated-From";
/// Header carrying the operation tag of a request or message.
pub const HEADER_OPERATION_NAME: &str = "operation-name";
/// Message header mirroring `source_node`.
pub const HEADER_SOURCE_SERVER: &str = "source-server";
/// Message header mirroring `target_node`.
pub const HEADER_TARGET_SERVER: &str = "target-server";

/// API prefix shared by every replicated route.
pub const API_PREFIX: &str = "/api/v1";

/// Replicated resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Warehouse,
    Shipment,
}

impl ResourceKind {
    /// All kinds, for exhaustive iteration in tests and reports.
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Warehouse, ResourceKind::Shipment];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Warehouse => "warehouse",
            ResourceKind::Shipment => "shipment",
        }
    }

    /// REST collection path, with trailing slash (create target).
    pub fn collection_path(&self) -> String {
        match self {
            ResourceKind::Warehouse => format!("{}/warehouses/", API_PREFIX),
            ResourceKind::Shipment => format!("{}/shipments/", API_PREFIX),
        }
    }

    /// REST item path (update/delete target).
    pub fn item_path(&self, id: i64) -> String {
        format!("{}{}", self.collection_path(), id)
    }

    /// Fields that make up a create payload.
    pub fn create_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Warehouse => &["name", "location"],
            ResourceKind::Shipment => &[
                "tracking_number",
                "origin",
                "destination",
                "weight",
                "warehouse_id",
            ],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle stage of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Created,
    Updated,
    Deleted,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Updated => "updated",
            Lifecycle::Deleted => "deleted",
        }
    }

    /// HTTP method that reproduces this stage.
    pub fn http_method(&self) -> HttpMethod {
        match self {
            Lifecycle::Created => HttpMethod::Post,
            Lifecycle::Updated => HttpMethod::Put,
            Lifecycle::Deleted => HttpMethod::Delete,
        }
    }
}

/// `{kind}.{stage}`, e.g. `"shipment.updated"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType {
    pub kind: ResourceKind,
    pub stage: Lifecycle,
}

impl EventType {
    pub fn new(kind: ResourceKind, stage: Lifecycle) -> Self {
        Self { kind, stage }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.stage.as_str())
    }
}

impl FromStr for EventType {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, stage) = s
            .split_once('.')
            .ok_or_else(|| ReplicationError::Envelope(format!("Invalid event type: {}", s)))?;
        let kind = match kind {
            "warehouse" => ResourceKind::Warehouse,
            "shipment" => ResourceKind::Shipment,
            other => {
                return Err(ReplicationError::Envelope(format!(
                    "Unknown resource kind: {}",
                    other
                )))
            }
        };
        let stage = match stage {
            "created" => Lifecycle::Created,
            "updated" => Lifecycle::Updated,
            "deleted" => Lifecycle::Deleted,
            other => {
                return Err(ReplicationError::Envelope(format!(
                    "Unknown lifecycle stage: {}",
                    other
                )))
            }
        };
        Ok(Self { kind, stage })
    }
}

impl TryFrom<String> for EventType {
    type Error = ReplicationError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.to_string()
    }
}

/// HTTP method recorded in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(value: HttpMethod) -> Self {
        match value {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Message headers as plain strings.
pub type MessageHeaders = BTreeMap<String, String>;

/// One replication hop of one committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub source_node: String,
    pub target_node: String,
    pub event_type: EventType,
    pub operation_tag: String,
    pub http_method: HttpMethod,
    /// REST path relative to the node's base URL.
    #[serde(rename = "url")]
    pub resource_path: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub resource_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub routing_key: String,
}

impl MutationEvent {
    /// Build the event for the edge `source → target`.
    ///
    /// The HTTP method follows the lifecycle stage and the routing key is
    /// derived from the edge, so both invariants hold by construction.
    pub fn new(
        source_node: &str,
        target_node: &str,
        event_type: EventType,
        operation_tag: &str,
        resource_path: String,
        payload: Map<String, Value>,
        resource_id: Option<i64>,
    ) -> Self {
        Self {
            source_node: source_node.to_string(),
            target_node: target_node.to_string(),
            event_type,
            operation_tag: operation_tag.to_string(),
            http_method: event_type.stage.http_method(),
            resource_path,
            payload,
            resource_id,
            timestamp: Utc::now(),
            routing_key: routing_key(source_node, target_node),
        }
    }

    /// Decode a delivery body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| ReplicationError::Envelope(format!("Undecodable envelope: {}", e)))
    }

    /// Encode for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ReplicationError::Envelope(format!("Cannot encode envelope: {}", e)))
    }

    /// Whether the recorded routing key matches the recorded edge.
    pub fn routing_key_consistent(&self) -> bool {
        self.routing_key == routing_key(&self.source_node, &self.target_node)
    }

    /// Whether `url` is a path this event type can produce: the collection
    /// path on create, `{collection}{numeric id}` on update and delete.
    pub fn resource_path_valid(&self) -> bool {
        let collection = self.event_type.kind.collection_path();
        match self.event_type.stage {
            Lifecycle::Created => self.resource_path == collection,
            Lifecycle::Updated | Lifecycle::Deleted => self
                .resource_path
                .strip_prefix(collection.as_str())
                .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())),
        }
    }

    /// Whether `http_method` follows the lifecycle stage.
    pub fn method_consistent(&self) -> bool {
        self.http_method == self.event_type.stage.http_method()
    }

    /// Headers mirrored from the envelope.
    pub fn headers(&self) -> MessageHeaders {
        let mut headers = MessageHeaders::new();
        headers.insert(HEADER_OPERATION_NAME.to_string(), self.operation_tag.clone());
        headers.insert(HEADER_SOURCE_SERVER.to_string(), self.source_node.clone());
        headers.insert(HEADER_TARGET_SERVER.to_string(), self.target_node.clone());
        headers
    }

    /// `operation-name` attached to the replay call.
    pub fn replay_operation_name(&self) -> String {
        format!("replicated-from-{}-{}", self.source_node, self.operation_tag)
    }
}
