// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker connection abstraction.
//!
//! A [`Broker`] owns one logical connection (connection + channel) to the
//! shared topic exchange and declares the node's topology on connect:
//!
//! ```text
//!  connect() ──► declare exchange (topic, durable)
//!            ──► declare queue "{prefix}{self}" (durable)
//!            ──► bind queue once per peer with "{peer}.{self}"
//! ```
//!
//! Each node holds two independent instances: one for publishing and one for
//! consuming. They share no state, so a consumer stall never blocks writes.
//!
//! Two implementations exist:
//!
//! - [`AmqpBroker`]: RabbitMQ over AMQP 0-9-1 (production).
//! - [`InMemoryBroker`]: an in-process topic exchange for tests and local runs.

mod amqp;
mod memory;

pub use amqp::AmqpBroker;
pub use memory::{topic_matches, InMemoryBroker, InMemoryExchange, PublishedMessage, Settlement};

pub use crate::event::MessageHeaders;

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

/// Type alias for boxed async futures (keeps the traits object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledge: remove from the queue.
    Ack,
    /// Reject without requeue: discard.
    Reject,
}

/// Which half of the node a broker connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    Publisher,
    Consumer,
}

impl BrokerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerRole::Publisher => "publisher",
            BrokerRole::Consumer => "consumer",
        }
    }
}

/// Counters returned when a consume loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub delivered: u64,
    pub acked: u64,
    pub rejected: u64,
}

impl ConsumeStats {
    pub(crate) fn record(&mut self, outcome: Outcome) {
        self.delivered += 1;
        match outcome {
            Outcome::Ack => self.acked += 1,
            Outcome::Reject => self.rejected += 1,
        }
    }
}

/// Processes one delivery and decides how it is settled.
///
/// Called sequentially: the next delivery is not handed out until the
/// returned future completes and the outcome has been applied.
pub trait DeliveryHandler: Send + Sync {
    fn handle<'a>(&'a self, body: &'a [u8], headers: &'a MessageHeaders) -> BoxFuture<'a, Outcome>;
}

/// One logical connection to the topic exchange.
pub trait Broker: Send + Sync + 'static {
    /// Role this connection was created for (labels logs and metrics).
    fn role(&self) -> BrokerRole;

    /// Establish the connection and declare exchange, queue and bindings.
    ///
    /// Idempotent while connected. Declarations are idempotent on the broker.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Close the channel and connection. Failures are logged and ignored.
    fn disconnect(&self) -> BoxFuture<'_, ()>;

    /// Whether a usable connection is currently held.
    fn is_connected(&self) -> BoxFuture<'_, bool>;

    /// Publish one message to the exchange.
    ///
    /// Makes a single lazy connection attempt when not connected. There is
    /// no confirm and no retry.
    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        body: Vec<u8>,
        headers: MessageHeaders,
    ) -> BoxFuture<'a, Result<()>>;

    /// Consume `queue` with prefetch 1 until `shutdown` flips to `true`.
    ///
    /// Each delivery is passed to `handler` and settled exactly once with
    /// the returned [`Outcome`].
    fn consume<'a>(
        &'a self,
        queue: &'a str,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> BoxFuture<'a, Result<ConsumeStats>>;
}

/// Whether the shutdown signal has fired (or its sender is gone).
pub(crate) fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}
