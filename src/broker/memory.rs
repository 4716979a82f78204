// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process topic exchange.
//!
//! Mirrors the parts of RabbitMQ topic semantics the replication mesh relies
//! on: durable named queues, pattern bindings with `*` and `#`, prefetch-1
//! sequential delivery, ack and reject-without-requeue. Several
//! [`InMemoryBroker`]s (one per node and role) share one
//! [`InMemoryExchange`], so a whole mesh can run inside one test.
//!
//! The exchange also records every publish and settlement, and can be made
//! unavailable to simulate a broker outage.

use super::{
    shutdown_requested, Broker, BoxFuture, BrokerRole, ConsumeStats, DeliveryHandler,
    MessageHeaders, Outcome,
};
use crate::error::{ReplicationError, Result};
use crate::topology::Topology;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Whether a topic binding `pattern` matches `routing_key`.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) => (word == "*" || word == k) && match_words(rest, key_rest),
            None => false,
        },
    }
}

/// A message as it was handed to the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

/// How a queued delivery was settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub queue: String,
    pub routing_key: String,
    pub outcome: Outcome,
}

#[derive(Default)]
struct QueueState {
    bindings: BTreeSet<String>,
    messages: VecDeque<PublishedMessage>,
}

struct ExchangeState {
    available: bool,
    queues: HashMap<String, QueueState>,
    published: Vec<PublishedMessage>,
    settlements: Vec<Settlement>,
}

/// Shared in-process exchange.
pub struct InMemoryExchange {
    state: Mutex<ExchangeState>,
    notify: Notify,
}

impl InMemoryExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ExchangeState {
                available: true,
                queues: HashMap::new(),
                published: Vec::new(),
                settlements: Vec::new(),
            }),
            notify: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate the broker going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
        self.notify.notify_waiters();
    }

    pub fn is_available(&self) -> bool {
        self.state().available
    }

    /// Declare a durable queue and add bindings (idempotent).
    pub fn declare_queue(&self, queue: &str, patterns: &[String]) -> Result<()> {
        let mut state = self.state();
        if !state.available {
            return Err(ReplicationError::broker_msg("queue_declare", "broker unavailable"));
        }
        let entry = state.queues.entry(queue.to_string()).or_default();
        entry.bindings.extend(patterns.iter().cloned());
        Ok(())
    }

    /// Route a message to every queue with a matching binding.
    ///
    /// Returns the number of queues it landed in. Unroutable messages are
    /// dropped silently, as with a topic exchange without an alternate.
    pub fn publish(&self, routing_key: &str, body: Vec<u8>, headers: MessageHeaders) -> Result<usize> {
        let mut state = self.state();
        if !state.available {
            return Err(ReplicationError::broker_msg("basic_publish", "broker unavailable"));
        }
        let message = PublishedMessage {
            routing_key: routing_key.to_string(),
            body,
            headers,
        };
        let mut routed = 0;
        for queue in state.queues.values_mut() {
            if queue.bindings.iter().any(|p| topic_matches(p, routing_key)) {
                queue.messages.push_back(message.clone());
                routed += 1;
            }
        }
        state.published.push(message);
        drop(state);
        self.notify.notify_waiters();
        Ok(routed)
    }

    /// Put a raw message straight into a queue, bypassing routing.
    pub fn deliver_raw(&self, queue: &str, routing_key: &str, body: Vec<u8>, headers: MessageHeaders) {
        self.state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push_back(PublishedMessage {
                routing_key: routing_key.to_string(),
                body,
                headers,
            });
        self.notify.notify_waiters();
    }

    /// Every message accepted by the exchange, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Messages published with exactly this routing key.
    pub fn published_with_key(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Number of messages waiting in a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Bindings of a queue, sorted.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every settlement, in order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    fn pop(&self, queue: &str) -> Result<Option<PublishedMessage>> {
        let mut state = self.state();
        if !state.available {
            return Err(ReplicationError::broker_msg("consume", "broker unavailable"));
        }
        Ok(state.queues.get_mut(queue).and_then(|q| q.messages.pop_front()))
    }

    fn settle(&self, queue: &str, routing_key: &str, outcome: Outcome) {
        self.state().settlements.push(Settlement {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            outcome,
        });
    }
}

/// A [`Broker`] backed by an [`InMemoryExchange`].
pub struct InMemoryBroker {
    exchange: Arc<InMemoryExchange>,
    topology: Arc<Topology>,
    role: BrokerRole,
    connected: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(exchange: Arc<InMemoryExchange>, topology: Arc<Topology>, role: BrokerRole) -> Self {
        Self {
            exchange,
            topology,
            role,
            connected: AtomicBool::new(false),
        }
    }

    /// The shared exchange, for assertions.
    pub fn exchange(&self) -> &Arc<InMemoryExchange> {
        &self.exchange
    }

    fn connect_now(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) && self.exchange.is_available() {
            return Ok(());
        }
        self.exchange
            .declare_queue(self.topology.queue_name(), &self.topology.binding_patterns())
            .inspect_err(|_| self.connected.store(false, Ordering::Release))?;
        self.connected.store(true, Ordering::Release);
        debug!(
            node_id = %self.topology.node_id(),
            role = self.role.as_str(),
            "Connected to in-memory exchange"
        );
        Ok(())
    }
}

impl Broker for InMemoryBroker {
    fn role(&self) -> BrokerRole {
        self.role
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.connect_now() })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Release);
        })
    }

    fn is_connected(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.connected.load(Ordering::Acquire) && self.exchange.is_available()
        })
    }

    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        body: Vec<u8>,
        headers: MessageHeaders,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.connect_now()?;
            self.exchange
                .publish(routing_key, body, headers)
                .inspect_err(|_| self.connected.store(false, Ordering::Release))?;
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        handler: Arc<dyn DeliveryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BoxFuture<'a, Result<ConsumeStats>> {
        Box::pin(async move {
            self.connect_now()?;
            info!(queue, "Consuming in-memory queue");
            let mut stats = ConsumeStats::default();

            loop {
                if shutdown_requested(&shutdown) {
                    break;
                }

                let notified = self.exchange.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let message = match self.exchange.pop(queue) {
                    Ok(message) => message,
                    Err(e) => {
                        self.connected.store(false, Ordering::Release);
                        return Err(e);
                    }
                };

                match message {
                    Some(message) => {
                        let outcome = handler.handle(&message.body, &message.headers).await;
                        self.exchange.settle(queue, &message.routing_key, outcome);
                        stats.record(outcome);
                    }
                    None => {
                        tokio::select! {
                            _ = &mut notified => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn topology(id: &str, peers: &[&str]) -> Arc<Topology> {
        Arc::new(Topology::from_config(&NodeConfig::for_testing(id, peers)).unwrap())
    }

    struct CountingHandler {
        seen: AtomicUsize,
        outcome: Outcome,
    }

    impl DeliveryHandler for CountingHandler {
        fn handle<'a>(&'a self, _body: &'a [u8], _headers: &'a MessageHeaders) -> BoxFuture<'a, Outcome> {
            Box::pin(async move {
                self.seen.fetch_add(1, Ordering::SeqCst);
                self.outcome
            })
        }
    }

    #[test]
    fn test_topic_matches_exact_and_wildcards() {
        assert!(topic_matches("A.B", "A.B"));
        assert!(!topic_matches("A.B", "A.C"));
        assert!(topic_matches("*.B", "C.B"));
        assert!(!topic_matches("*.B", "C.D.B"));
        assert!(topic_matches("#", "A.B"));
        assert!(topic_matches("#.B", "B"));
        assert!(topic_matches("A.#", "A.B.C"));
        assert!(!topic_matches("A.B", "A.B.C"));
    }

    #[tokio::test]
    async fn test_routes_only_to_bound_queue() {
        let exchange = InMemoryExchange::new();
        let a = InMemoryBroker::new(exchange.clone(), topology("A", &["B", "C"]), BrokerRole::Publisher);
        let b = InMemoryBroker::new(exchange.clone(), topology("B", &["A", "C"]), BrokerRole::Consumer);
        let c = InMemoryBroker::new(exchange.clone(), topology("C", &["A", "B"]), BrokerRole::Consumer);
        b.connect().await.unwrap();
        c.connect().await.unwrap();

        a.publish("A.B", b"{}".to_vec(), MessageHeaders::new()).await.unwrap();

        assert_eq!(exchange.queue_depth("B"), 1);
        assert_eq!(exchange.queue_depth("C"), 0);
        assert_eq!(exchange.bindings("B"), vec!["A.B", "C.B"]);
    }

    #[tokio::test]
    async fn test_publish_fails_when_unavailable() {
        let exchange = InMemoryExchange::new();
        let a = InMemoryBroker::new(exchange.clone(), topology("A", &["B"]), BrokerRole::Publisher);
        exchange.set_available(false);

        assert!(a.publish("A.B", Vec::new(), MessageHeaders::new()).await.is_err());
        assert!(!a.is_connected().await);

        exchange.set_available(true);
        a.publish("A.B", Vec::new(), MessageHeaders::new()).await.unwrap();
        assert_eq!(exchange.published().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_settles_each_delivery_once() {
        let exchange = InMemoryExchange::new();
        let b = Arc::new(InMemoryBroker::new(
            exchange.clone(),
            topology("B", &["A"]),
            BrokerRole::Consumer,
        ));
        b.connect().await.unwrap();
        for _ in 0..3 {
            exchange.publish("A.B", b"x".to_vec(), MessageHeaders::new()).unwrap();
        }

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            outcome: Outcome::Reject,
        });
        let (tx, rx) = watch::channel(false);
        let task = {
            let b = b.clone();
            let handler = handler.clone();
            tokio::spawn(async move { b.consume("B", handler, rx).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while exchange.settlements().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tx.send(true).unwrap();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.rejected, 3);
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.queue_depth("B"), 0);
    }
}
