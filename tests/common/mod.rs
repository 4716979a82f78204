// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for the flow, chaos and integration tests.
//!
//! This module provides:
//! - An in-process mesh of replica nodes sharing one `InMemoryExchange`
//! - A replayer that routes replay calls into the target node's router
//! - A recording replayer for consumer-only tests
//! - RabbitMQ testcontainer setup (see `containers`)

#![allow(dead_code)]

pub mod containers;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use logistics_replication::broker::BoxFuture;
use logistics_replication::consumer::ReplayRequest;
use logistics_replication::{
    BrokerRole, InMemoryBroker, InMemoryExchange, NodeConfig, NodeMode, ReplicaNode,
    ReplicationError, Replayer, Result, Topology,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tower::ServiceExt;

/// Base URL a mesh node is reachable at (never dialed, only routed).
pub fn mesh_endpoint(node_id: &str) -> String {
    format!("http://{}.mesh.test", node_id.to_ascii_lowercase())
}

/// Config for a mesh member: in-memory store, explicit endpoint.
pub fn mesh_config(node_id: &str, peers: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::for_testing(node_id, peers);
    config
        .endpoints
        .insert(node_id.to_string(), mesh_endpoint(node_id));
    config
}

// =============================================================================
// Replayers
// =============================================================================

/// Replays into the router registered for the request's endpoint.
///
/// Requests for endpoints with no router fail like a refused connection.
#[derive(Default)]
pub struct MeshReplayer {
    routes: RwLock<HashMap<String, Router>>,
    calls: Mutex<Vec<ReplayRequest>>,
    offline: AtomicBool,
}

impl MeshReplayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, endpoint: &str, router: Router) {
        self.routes
            .write()
            .unwrap()
            .insert(endpoint.to_string(), router);
    }

    /// Make every replay fail as if the local API were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ReplayRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn resolve(&self, url: &str) -> Option<(Router, String)> {
        let routes = self.routes.read().unwrap();
        routes.iter().find_map(|(endpoint, router)| {
            url.strip_prefix(endpoint.as_str())
                .map(|path| (router.clone(), path.to_string()))
        })
    }
}

impl Replayer for MeshReplayer {
    fn replay<'a>(&'a self, request: &'a ReplayRequest) -> BoxFuture<'a, Result<u16>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.clone());
            if self.offline.load(Ordering::SeqCst) {
                return Err(ReplicationError::replay(&request.url, "connection refused"));
            }
            let (router, path) = self
                .resolve(&request.url)
                .ok_or_else(|| ReplicationError::replay(&request.url, "connection refused"))?;

            let body = serde_json::to_vec(&request.body)
                .map_err(|e| ReplicationError::replay(&request.url, e.to_string()))?;
            let http_request = Request::builder()
                .method(request.method.as_str())
                .uri(path)
                .header("content-type", "application/json")
                .header("X-Replicated-From", &request.replicated_from)
                .header("operation-name", &request.operation_name)
                .body(Body::from(body))
                .map_err(|e| ReplicationError::replay(&request.url, e.to_string()))?;

            let response = router
                .oneshot(http_request)
                .await
                .map_err(|e| ReplicationError::replay(&request.url, e.to_string()))?;
            Ok(response.status().as_u16())
        })
    }
}

/// Records replay calls and answers with a fixed status.
pub struct RecordingReplayer {
    status: AtomicU16,
    calls: Mutex<Vec<ReplayRequest>>,
}

impl RecordingReplayer {
    pub fn new(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU16::new(status),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ReplayRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl Replayer for RecordingReplayer {
    fn replay<'a>(&'a self, request: &'a ReplayRequest) -> BoxFuture<'a, Result<u16>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.clone());
            Ok(self.status.load(Ordering::SeqCst))
        })
    }
}

// =============================================================================
// Mesh
// =============================================================================

/// Build a node wired to `exchange` with two independent in-memory connections.
pub fn in_memory_node(
    exchange: &Arc<InMemoryExchange>,
    config: NodeConfig,
    replayer: Arc<dyn Replayer>,
) -> ReplicaNode {
    let topology = Arc::new(Topology::from_config(&config).unwrap());
    ReplicaNode::with_components(
        config,
        Arc::new(InMemoryBroker::new(
            exchange.clone(),
            topology.clone(),
            BrokerRole::Publisher,
        )),
        Arc::new(InMemoryBroker::new(exchange.clone(), topology, BrokerRole::Consumer)),
        replayer,
    )
    .unwrap()
}

/// A full mesh of started nodes, each peering with all the others.
pub struct Mesh {
    pub exchange: Arc<InMemoryExchange>,
    pub replayer: Arc<MeshReplayer>,
    pub nodes: BTreeMap<String, ReplicaNode>,
    routers: BTreeMap<String, Router>,
}

impl Mesh {
    pub async fn start(ids: &[&str]) -> Self {
        let exchange = InMemoryExchange::new();
        let replayer = MeshReplayer::new();
        let mut nodes = BTreeMap::new();
        let mut routers = BTreeMap::new();

        for id in ids {
            let peers: Vec<&str> = ids.iter().copied().filter(|p| p != id).collect();
            let node = in_memory_node(&exchange, mesh_config(id, &peers), replayer.clone());
            node.start(NodeMode::Serve).await.unwrap();
            let router = node.router().await.unwrap();
            replayer.register(&mesh_endpoint(id), router.clone());
            routers.insert(id.to_string(), router);
            nodes.insert(id.to_string(), node);
        }

        Self {
            exchange,
            replayer,
            nodes,
            routers,
        }
    }

    pub fn node(&self, id: &str) -> &ReplicaNode {
        &self.nodes[id]
    }

    /// Send a client request to one node's API.
    pub async fn send(
        &self,
        id: &str,
        method: Method,
        uri: &str,
        operation: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        send(&self.routers[id], method, uri, &[("operation-name", operation)], body).await
    }

    /// Wait until the exchange has seen `count` settlements.
    pub async fn settled(&self, count: usize) {
        wait_for_settlements(&self.exchange, count).await;
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown().await;
        }
    }
}

/// Issue one request against a router and decode the JSON body.
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Poll until the exchange has recorded at least `count` settlements.
///
/// Panics after five seconds.
pub async fn wait_for_settlements(exchange: &InMemoryExchange, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let seen = exchange.settlements().len();
        if seen >= count {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {} settlements, saw {}", count, seen);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
