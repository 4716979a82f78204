// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! RabbitMQ broker connection over AMQP 0-9-1.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connected
//!      ▲                          │
//!      └── publish/consume error ─┘
//! ```
//!
//! Connections are **lazy**: `publish()` makes exactly one connection
//! attempt when none is held. A failed operation drops the session, so the
//! next publish reconnects. There is no backoff and no retry loop.

use super::{
    shutdown_requested, Broker, BoxFuture, BrokerRole, ConsumeStats, DeliveryHandler,
    MessageHeaders, Outcome,
};
use crate::config::BrokerConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::topology::Topology;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

const CONTENT_TYPE_JSON: &str = "application/json";

/// An open connection and the single channel used on it.
struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

/// A RabbitMQ connection for one role of one node.
pub struct AmqpBroker {
    config: BrokerConfig,
    topology: Arc<Topology>,
    role: BrokerRole,
    session: Mutex<Option<AmqpSession>>,
    /// Mirrors whether `session` holds a live channel. Readable while a
    /// connect attempt holds the session lock.
    connected: AtomicBool,
}

impl AmqpBroker {
    /// Create a broker connection (not yet connected).
    pub fn new(config: BrokerConfig, topology: Arc<Topology>, role: BrokerRole) -> Self {
        Self {
            config,
            topology,
            role,
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        metrics::set_broker_connected(self.role.as_str(), connected);
    }

    /// Connect and declare, with the session lock already held.
    async fn connect_locked(&self, slot: &mut Option<AmqpSession>) -> Result<Channel> {
        if let Some(session) = slot.as_ref() {
            if session.channel.status().connected() {
                return Ok(session.channel.clone());
            }
            debug!(role = self.role.as_str(), "Dropping stale broker session");
            *slot = None;
            self.set_connected(false);
        }

        let role = self.role.as_str();
        info!(
            node_id = %self.topology.node_id(),
            role,
            exchange = %self.topology.exchange(),
            "Connecting to broker"
        );

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                metrics::record_broker_connection(role, false);
                self.set_connected(false);
                return Err(e);
            }
        };

        metrics::record_broker_connection(role, true);
        info!(
            node_id = %self.topology.node_id(),
            role,
            queue = %self.topology.queue_name(),
            bindings = self.topology.peer_count(),
            "Connected to broker"
        );

        let channel = session.channel.clone();
        *slot = Some(session);
        self.set_connected(true);
        Ok(channel)
    }

    async fn open_session(&self) -> Result<AmqpSession> {
        let connect_timeout = self.config.connection_timeout_duration();
        let connection = match timeout(
            connect_timeout,
            Connection::connect(&self.config.url, ConnectionProperties::default()),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(ReplicationError::broker("connect", e)),
            Err(_) => {
                return Err(ReplicationError::broker_msg(
                    "connect",
                    format!("timed out after {}ms", connect_timeout.as_millis()),
                ))
            }
        };

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ReplicationError::broker("create_channel", e))?;

        self.declare_topology(&channel).await?;

        Ok(AmqpSession {
            connection,
            channel,
        })
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<()> {
        let exchange = self.topology.exchange();
        let queue = self.topology.queue_name();

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ReplicationError::broker("exchange_declare", e))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ReplicationError::broker("queue_declare", e))?;

        for pattern in self.topology.binding_patterns() {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    &pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ReplicationError::broker("queue_bind", e))?;
            debug!(queue, pattern = %pattern, "Bound queue");
        }
        Ok(())
    }

    /// Forget the session after a failed operation so the next call reconnects.
    async fn mark_disconnected(&self) {
        *self.session.lock().await = None;
        self.set_connected(false);
        warn!(role = self.role.as_str(), "Broker connection marked as disconnected");
    }
}

impl Broker for AmqpBroker {
    fn role(&self) -> BrokerRole {
        self.role
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut slot = self.session.lock().await;
            self.connect_locked(&mut slot).await.map(|_| ())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let session = self.session.lock().await.take();
            if let Some(session) = session {
                if let Err(e) = session.channel.close(200, "closing").await {
                    debug!(role = self.role.as_str(), error = %e, "Channel close failed");
                }
                if let Err(e) = session.connection.close(200, "closing").await {
                    debug!(role = self.role.as_str(), error = %e, "Connection close failed");
                }
                self.set_connected(false);
                info!(role = self.role.as_str(), "Disconnected from broker");
            }
        })
    }

    fn is_connected(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.connected.load(Ordering::Acquire) })
    }

    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        body: Vec<u8>,
        headers: MessageHeaders,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let channel = {
                let mut slot = self.session.lock().await;
                self.connect_locked(&mut slot).await?
            };

            let properties = BasicProperties::default()
                .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
                .with_headers(to_field_table(headers));

            let result = async {
                channel
                    .basic_publish(
                        self.topology.exchange(),
                        routing_key,
                        BasicPublishOptions::default(),
                        &body,
                        properties,
                    )
                    .await?
                    .await?;
                Ok::<_, lapin::Error>(())
            }
            .await;

            if let Err(e) = result {
                self.mark_disconnected().await;
                return Err(ReplicationError::broker("basic_publish", e));
            }
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
            let channel = {
                let mut slot = self.session.lock().await;
                self.connect_locked(&mut slot).await?
            };

            channel
                .basic_qos(1, BasicQosOptions::default())
                .await
                .map_err(|e| ReplicationError::broker("basic_qos", e))?;

            let consumer_tag = format!("replica-{}", self.topology.node_id());
            let mut consumer = channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ReplicationError::broker("basic_consume", e))?;

            info!(queue, consumer_tag = %consumer_tag, "Consuming inbound queue");
            let mut stats = ConsumeStats::default();

            loop {
                if shutdown_requested(&shutdown) {
                    break;
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }

                    next = consumer.next() => {
                        let delivery = match next {
                            Some(Ok(delivery)) => delivery,
                            Some(Err(e)) => {
                                error!(queue, error = %e, "Consumer stream failed");
                                self.mark_disconnected().await;
                                return Err(ReplicationError::broker("consume", e));
                            }
                            None => {
                                self.mark_disconnected().await;
                                return Err(ReplicationError::broker_msg(
                                    "consume",
                                    "consumer stream closed by broker",
                                ));
                            }
                        };

                        let headers = from_field_table(delivery.properties.headers().as_ref());
                        let outcome = handler.handle(&delivery.data, &headers).await;

                        let settled = match outcome {
                            Outcome::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
                            Outcome::Reject => {
                                delivery
                                    .acker
                                    .reject(BasicRejectOptions { requeue: false })
                                    .await
                            }
                        };
                        if let Err(e) = settled {
                            // Unsettled deliveries return to the queue on reconnect
                            error!(queue, delivery_tag = delivery.delivery_tag, error = %e, "Failed to settle delivery");
                            self.mark_disconnected().await;
                            return Err(ReplicationError::broker("settle", e));
                        }
                        stats.record(outcome);
                    }
                }
            }

            info!(
                queue,
                delivered = stats.delivered,
                acked = stats.acked,
                rejected = stats.rejected,
                "Consume loop stopped"
            );
            Ok(stats)
        })
    }
}

fn to_field_table(headers: MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> MessageHeaders {
    let mut headers = MessageHeaders::new();
    let Some(table) = table else {
        return headers;
    };
    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), value);
    }
    headers
}
