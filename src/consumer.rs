// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication consumer (inbound half of replication).
//!
//! Reads this node's inbound queue one delivery at a time and replays each
//! Mutation Event as an HTTP call against the node's own API.
//!
//! # Per-delivery state machine
//!
//! ```text
//!   Received ──parse──► Validated ──replay──► Replayed ──► Ack (2xx)
//!      │                   │                     └──────► Ack (non-2xx / transport error)
//!      │                   └─ disallowed edge / invalid route ──► Reject
//!      └─ undecodable ───────────────────────────────────────► Reject
//! ```
//!
//! Every delivery is settled exactly once. Nothing is requeued, retried or
//! dead-lettered: a failed replay is logged and the event is lost.
//!
//! The replay call carries `X-Replicated-From: {source}`, which the target
//! node's [`loop_guard`](crate::guard::loop_guard) turns into a replicated
//! context so the replayed write is never broadcast again.

use crate::broker::{Broker, BoxFuture, ConsumeStats, DeliveryHandler, MessageHeaders, Outcome};
use crate::config::ReplayConfig;
use crate::error::{ReplicationError, Result};
use crate::event::{HttpMethod, MutationEvent, HEADER_OPERATION_NAME, HEADER_REPLICATED_FROM};
use crate::metrics;
use crate::topology::Topology;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Why a delivery was dropped without replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Body is not a valid Mutation Event.
    Parse(String),
    /// `source_node` is not in the peer set.
    UnknownSource(String),
    /// `target_node` is not this node.
    TargetMismatch { expected: String, actual: String },
    /// Method, path or routing key disagree with the event type and edge.
    InvalidRoute(String),
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Parse(_) => "parse",
            RejectReason::UnknownSource(_) => "unknown_source",
            RejectReason::TargetMismatch { .. } => "target_mismatch",
            RejectReason::InvalidRoute(_) => "invalid_route",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Parse(msg) => write!(f, "undecodable envelope: {}", msg),
            RejectReason::UnknownSource(source) => write!(f, "source {} is not an allowed peer", source),
            RejectReason::TargetMismatch { expected, actual } => {
                write!(f, "target {} is not this node ({})", actual, expected)
            }
            RejectReason::InvalidRoute(msg) => write!(f, "invalid route: {}", msg),
        }
    }
}

/// Terminal state of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Replay returned 2xx.
    Replayed { status: u16 },
    /// Replay was attempted and failed; acknowledged anyway.
    ReplayFailed { reason: String },
    /// Dropped before replay.
    Rejected(RejectReason),
}

impl Disposition {
    /// Broker settlement for this disposition.
    pub fn outcome(&self) -> Outcome {
        match self {
            Disposition::Replayed { .. } | Disposition::ReplayFailed { .. } => Outcome::Ack,
            Disposition::Rejected(_) => Outcome::Reject,
        }
    }

    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Replayed { .. } => "replayed",
            Disposition::ReplayFailed { .. } => "replay_failed",
            Disposition::Rejected(reason) => match reason {
                RejectReason::Parse(_) => "rejected_parse",
                RejectReason::UnknownSource(_) => "rejected_unknown_source",
                RejectReason::TargetMismatch { .. } => "rejected_target_mismatch",
                RejectReason::InvalidRoute(_) => "rejected_invalid_route",
            },
        }
    }
}

/// A fully resolved replay call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayRequest {
    pub method: HttpMethod,
    /// Absolute URL: self endpoint + resource path.
    pub url: String,
    /// Value of `X-Replicated-From`.
    pub replicated_from: String,
    /// Value of `operation-name`.
    pub operation_name: String,
    pub body: Map<String, Value>,
}

impl ReplayRequest {
    pub fn from_event(event: &MutationEvent, self_endpoint: &str) -> Self {
        Self {
            method: event.http_method,
            url: format!("{}{}", self_endpoint, event.resource_path),
            replicated_from: event.source_node.clone(),
            operation_name: event.replay_operation_name(),
            body: event.payload.clone(),
        }
    }
}

/// Executes replay calls. Returns the HTTP status on any response.
pub trait Replayer: Send + Sync {
    fn replay<'a>(&'a self, request: &'a ReplayRequest) -> BoxFuture<'a, Result<u16>>;
}

/// Replays over HTTP with a fixed per-call timeout.
pub struct HttpReplayer {
    client: reqwest::Client,
}

impl HttpReplayer {
    pub fn new(config: &ReplayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| ReplicationError::Config(format!("Cannot build replay client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Replayer for HttpReplayer {
    fn replay<'a>(&'a self, request: &'a ReplayRequest) -> BoxFuture<'a, Result<u16>> {
        Box::pin(async move {
            let response = self
                .client
                .request(request.method.into(), &request.url)
                .header(HEADER_REPLICATED_FROM, &request.replicated_from)
                .header(HEADER_OPERATION_NAME, &request.operation_name)
                .json(&request.body)
                .send()
                .await
                .map_err(|e| ReplicationError::replay(&request.url, e.to_string()))?;
            Ok(response.status().as_u16())
        })
    }
}

/// Consumes this node's inbound queue and replays what it receives.
pub struct ReplicationConsumer {
    topology: Arc<Topology>,
    broker: Arc<dyn Broker>,
    replayer: Arc<dyn Replayer>,
}

impl ReplicationConsumer {
    pub fn new(topology: Arc<Topology>, broker: Arc<dyn Broker>, replayer: Arc<dyn Replayer>) -> Self {
        Self {
            topology,
            broker,
            replayer,
        }
    }

    /// The consumer's broker connection.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Connect (idempotently) and consume until `shutdown` fires or the
    /// connection drops.
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<ConsumeStats> {
        let span = info_span!("replication_consumer", node_id = %self.topology.node_id());
        async move {
            if let Err(e) = self.broker.connect().await {
                error!(error = %e, "Consumer could not connect to broker");
                metrics::record_error(e.kind());
                return Err(e);
            }
            info!(
                queue = %self.topology.queue_name(),
                peers = self.topology.peer_count(),
                "Replication consumer started"
            );
            let handler: Arc<dyn DeliveryHandler> = self.clone();
            self.broker
                .consume(self.topology.queue_name(), handler, shutdown)
                .await
        }
        .instrument(span)
        .await
    }

    /// Validate an envelope against this node's topology and its own event type.
    pub fn validate(&self, event: &MutationEvent) -> std::result::Result<(), RejectReason> {
        if !self.topology.is_peer(&event.source_node) {
            return Err(RejectReason::UnknownSource(event.source_node.clone()));
        }
        if event.target_node != self.topology.node_id() {
            return Err(RejectReason::TargetMismatch {
                expected: self.topology.node_id().to_string(),
                actual: event.target_node.clone(),
            });
        }
        if !event.routing_key_consistent() {
            return Err(RejectReason::InvalidRoute(format!(
                "routing key {} does not match edge",
                event.routing_key
            )));
        }
        if !event.method_consistent() {
            return Err(RejectReason::InvalidRoute(format!(
                "{} does not fit {}",
                event.http_method, event.event_type
            )));
        }
        // The path is appended to this node's endpoint; anything else could
        // redirect the replay to another host.
        if !event.resource_path_valid() {
            return Err(RejectReason::InvalidRoute(format!(
                "path {:?} does not fit {}",
                event.resource_path, event.event_type
            )));
        }
        Ok(())
    }

    /// Parse, validate and replay one delivery.
    pub async fn handle_delivery(&self, body: &[u8], headers: &MessageHeaders) -> Disposition {
        let event = match MutationEvent::from_slice(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    bytes = body.len(),
                    operation = headers.get(HEADER_OPERATION_NAME).map(String::as_str).unwrap_or(""),
                    error = %e,
                    "Dropping undecodable delivery"
                );
                return Disposition::Rejected(RejectReason::Parse(e.to_string()));
            }
        };

        if let Err(reason) = self.validate(&event) {
            warn!(
                source = %event.source_node,
                target = %event.target_node,
                routing_key = %event.routing_key,
                reason = %reason,
                "Dropping delivery from disallowed edge"
            );
            return Disposition::Rejected(reason);
        }

        let request = ReplayRequest::from_event(&event, self.topology.self_endpoint());
        debug!(
            method = %request.method,
            url = %request.url,
            event_type = %event.event_type,
            "Replaying mutation event"
        );

        let started = Instant::now();
        let result = self.replayer.replay(&request).await;
        metrics::record_replay_latency(request.method.as_str(), started.elapsed());

        match result {
            Ok(status) if (200..300).contains(&status) => {
                info!(
                    source = %event.source_node,
                    event_type = %event.event_type,
                    operation = %event.operation_tag,
                    status,
                    "Replayed mutation event"
                );
                Disposition::Replayed { status }
            }
            Ok(status) => {
                warn!(
                    source = %event.source_node,
                    url = %request.url,
                    status,
                    "Replay returned non-success status, event dropped"
                );
                Disposition::ReplayFailed {
                    reason: format!("HTTP {}", status),
                }
            }
            Err(e) => {
                warn!(
                    source = %event.source_node,
                    url = %request.url,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Replay failed, event dropped"
                );
                metrics::record_error(e.kind());
                Disposition::ReplayFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

impl DeliveryHandler for ReplicationConsumer {
    fn handle<'a>(&'a self, body: &'a [u8], headers: &'a MessageHeaders) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let disposition = self.handle_delivery(body, headers).await;
            metrics::record_delivery(disposition.label());
            disposition.outcome()
        })
    }
}
