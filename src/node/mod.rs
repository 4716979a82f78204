// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica node.
//!
//! Owns everything one running instance needs and manages its lifecycle:
//! - Two independent broker connections (publisher, consumer)
//! - The local store and the CRUD service built on it
//! - One consumer worker reading the inbound queue sequentially
//! - The HTTP router
//!
//! # Startup
//!
//! 1. Open the store (failure → `Failed`)
//! 2. Connect the publisher; failure is logged and the node still starts
//! 3. Spawn the consumer worker
//!
//! The worker runs until shutdown or until its connection drops. It is not
//! restarted: a dropped consumer shows up as `consumer_running: false` on
//! `/health`.

mod types;

pub use types::{HealthCheck, HealthProbe, NodeMode, NodeState};

use crate::api::{self, AppState};
use crate::broker::{AmqpBroker, Broker, BrokerRole};
use crate::config::NodeConfig;
use crate::consumer::{HttpReplayer, Replayer, ReplicationConsumer};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::publisher::EventPublisher;
use crate::service::LogisticsService;
use crate::store::LogisticsStore;
use crate::topology::Topology;
use axum::Router;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for the consumer worker.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One replica of the logistics service.
pub struct ReplicaNode {
    config: NodeConfig,
    topology: Arc<Topology>,

    /// Broker connection used by the publisher
    publisher_broker: Arc<dyn Broker>,
    /// Broker connection used by the consumer worker
    consumer_broker: Arc<dyn Broker>,
    replayer: Arc<dyn Replayer>,

    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Opened on start (serve mode only)
    service: RwLock<Option<Arc<LogisticsService>>>,
    consumer_running: Arc<AtomicBool>,
    worker: RwLock<Option<JoinHandle<()>>>,
}

impl ReplicaNode {
    /// Create a node talking to RabbitMQ and replaying over HTTP.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let topology = Arc::new(Topology::from_config(&config)?);
        let publisher_broker = Arc::new(AmqpBroker::new(
            config.broker.clone(),
            topology.clone(),
            BrokerRole::Publisher,
        ));
        let consumer_broker = Arc::new(AmqpBroker::new(
            config.broker.clone(),
            topology.clone(),
            BrokerRole::Consumer,
        ));
        let replayer = Arc::new(HttpReplayer::new(&config.replay)?);
        Ok(Self::assemble(config, topology, publisher_broker, consumer_broker, replayer))
    }

    /// Create a node with caller-provided broker connections and replayer.
    pub fn with_components(
        config: NodeConfig,
        publisher_broker: Arc<dyn Broker>,
        consumer_broker: Arc<dyn Broker>,
        replayer: Arc<dyn Replayer>,
    ) -> Result<Self> {
        let topology = Arc::new(Topology::from_config(&config)?);
        Ok(Self::assemble(config, topology, publisher_broker, consumer_broker, replayer))
    }

    fn assemble(
        config: NodeConfig,
        topology: Arc<Topology>,
        publisher_broker: Arc<dyn Broker>,
        consumer_broker: Arc<dyn Broker>,
        replayer: Arc<dyn Replayer>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            topology,
            publisher_broker,
            consumer_broker,
            replayer,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            service: RwLock::new(None),
            consumer_running: Arc::new(AtomicBool::new(false)),
            worker: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        self.topology.node_id()
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), NodeState::Running)
    }

    /// The CRUD service (available once started in serve mode).
    pub async fn service(&self) -> Option<Arc<LogisticsService>> {
        self.service.read().await.clone()
    }

    fn set_state(&self, state: NodeState) {
        let _ = self.state_tx.send(state);
        metrics::set_node_state(&state.to_string());
    }

    /// Start the node.
    pub async fn start(&self, mode: NodeMode) -> Result<()> {
        if self.state() != NodeState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            node_id = %self.node_id(),
            peers = ?self.topology.peers().collect::<Vec<_>>(),
            mode = ?mode,
            "Starting replica node"
        );
        self.set_state(NodeState::Starting);
        metrics::set_peer_count(self.topology.peer_count());

        if mode == NodeMode::Serve {
            let store = match LogisticsStore::open(&self.config.store).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!(path = %self.config.store.sqlite_path, error = %e, "Cannot open store");
                    self.set_state(NodeState::Failed);
                    return Err(e);
                }
            };

            if let Err(e) = self.publisher_broker.connect().await {
                warn!(
                    error = %e,
                    "Broker unreachable at startup, mutations will not replicate until it is back"
                );
            }

            let publisher = Arc::new(EventPublisher::new(
                self.topology.clone(),
                self.publisher_broker.clone(),
            ));
            *self.service.write().await = Some(Arc::new(LogisticsService::new(store, publisher)));
        }

        self.spawn_consumer_worker().await;

        self.set_state(NodeState::Running);
        info!(node_id = %self.node_id(), "Replica node running");
        Ok(())
    }

    async fn spawn_consumer_worker(&self) {
        let consumer = Arc::new(ReplicationConsumer::new(
            self.topology.clone(),
            self.consumer_broker.clone(),
            self.replayer.clone(),
        ));
        let shutdown_rx = self.shutdown_rx.clone();
        let running = self.consumer_running.clone();
        running.store(true, Ordering::Release);

        let handle = tokio::spawn(async move {
            match consumer.start(shutdown_rx).await {
                Ok(stats) => {
                    info!(delivered = stats.delivered, "Consumer worker stopped");
                }
                Err(e) => {
                    error!(error = %e, "Consumer worker stopped on error");
                    metrics::record_error(e.kind());
                }
            }
            running.store(false, Ordering::Release);
        });

        *self.worker.write().await = Some(handle);
    }

    /// Build the HTTP router. Requires a node started in serve mode.
    pub async fn router(&self) -> Result<Router> {
        let service = self.service().await.ok_or_else(|| ReplicationError::InvalidState {
            expected: "Running (serve)".to_string(),
            actual: self.state().to_string(),
        })?;
        Ok(api::router(AppState {
            service,
            health: self.health_probe(),
        }))
    }

    pub fn health_probe(&self) -> HealthProbe {
        HealthProbe::new(
            self.topology.clone(),
            self.state_rx.clone(),
            self.publisher_broker.clone(),
            self.consumer_running.clone(),
        )
    }

    /// Health snapshot. Performs no network I/O.
    pub async fn health_check(&self) -> HealthCheck {
        self.health_probe().check().await
    }

    /// Whether the consumer worker is still consuming.
    pub fn consumer_running(&self) -> bool {
        self.consumer_running.load(Ordering::Acquire)
    }

    /// Bind the configured address, then [`serve_with_listener`](Self::serve_with_listener).
    pub async fn serve<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ReplicationError::Config(format!("Cannot bind {}: {}", addr, e)))?;
        self.serve_with_listener(listener, signal).await
    }

    /// Start in serve mode on a bound listener, serve HTTP until `signal`
    /// resolves, then shut down.
    ///
    /// The listener must be bound before the consumer worker starts: replays
    /// of a queued backlog then wait in the accept queue instead of being
    /// refused and dropped.
    pub async fn serve_with_listener<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.start(NodeMode::Serve).await?;
        let app = self.router().await?;
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "HTTP API listening");
        }

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| ReplicationError::Internal(format!("HTTP server failed: {}", e)));

        self.shutdown().await;
        served
    }

    /// Start in consume-only mode and run until `signal` resolves or the worker stops.
    pub async fn consume<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start(NodeMode::ConsumeOnly).await?;

        let running = self.consumer_running.clone();
        let worker_done = async move {
            while running.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };

        tokio::select! {
            _ = signal => info!("Shutdown signal received"),
            _ = worker_done => warn!("Consumer worker exited"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal the consumer worker and wait for it (with timeout)
    /// 2. Disconnect both broker connections
    /// 3. Close the store
    pub async fn shutdown(&self) {
        if matches!(self.state(), NodeState::Stopped) {
            return;
        }
        info!(node_id = %self.node_id(), "Shutting down replica node");
        self.set_state(NodeState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.worker.write().await.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Consumer worker drained"),
                Ok(Err(e)) => warn!(error = %e, "Consumer worker panicked during shutdown"),
                Err(_) => warn!("Consumer worker timed out during shutdown (in-flight delivery will be redelivered)"),
            }
        }
        self.consumer_running.store(false, Ordering::Release);

        self.consumer_broker.disconnect().await;
        self.publisher_broker.disconnect().await;

        if let Some(service) = self.service.write().await.take() {
            service.store().close().await;
        }

        self.set_state(NodeState::Stopped);
        info!(node_id = %self.node_id(), "Replica node stopped");
    }
}
