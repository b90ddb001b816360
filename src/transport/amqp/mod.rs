//! AMQP (RabbitMQ) transport implementation.
//!
//! Maps protocol topics onto a topic exchange: `/`-separated topic
//! names become `.`-separated routing keys. Each connection holds one
//! exclusive, server-named queue; subscribing binds the queue to a
//! routing key and unsubscribing removes the binding.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Frame, InboundHandler, Result, Transport, TransportError};
use crate::config::BrokerConfig;

/// Exchange name for job traffic.
const JOBS_EXCHANGE: &str = "sketch.jobs";

/// Maximum publish attempts before giving up.
const MAX_PUBLISH_RETRIES: usize = 5;

/// Convert a protocol topic into an AMQP routing key.
fn routing_key(topic: &str) -> String {
    topic.replace('/', ".")
}

/// Convert an AMQP routing key back into a protocol topic.
fn topic_name(routing_key: &str) -> String {
    routing_key.replace('.', "/")
}

/// Transport backed by a RabbitMQ topic exchange.
pub struct AmqpTransport {
    pool: Pool,
    exchange: String,
    /// Server-named exclusive queue, present while connected.
    queue: Arc<RwLock<Option<String>>>,
    /// Topics with an active binding.
    topics: Arc<RwLock<HashSet<String>>>,
    /// Consumer task, present while connected.
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Create a transport for the configured broker.
    pub async fn new(config: &BrokerConfig) -> Result<Self> {
        let manager = Manager::new(config.amqp_url(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection and declare the exchange up front
        let conn = pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect: {}", e)))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .exchange_declare(
                JOBS_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Connection(format!("Failed to declare exchange: {}", e))
            })?;

        info!(exchange = JOBS_EXCHANGE, host = %config.host, "Connected to AMQP");

        Ok(Self {
            pool,
            exchange: JOBS_EXCHANGE.to_string(),
            queue: Arc::new(RwLock::new(None)),
            topics: Arc::new(RwLock::new(HashSet::new())),
            consumer: Mutex::new(None),
        })
    }

    /// Get a channel from the pool.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            TransportError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Consumer loop with automatic reconnection and exponential
    /// backoff with jitter.
    ///
    /// Bindings do not survive the exclusive queue, so each reconnect
    /// starts with a clean subscription slate; the handler learns about
    /// the loss and abandons whatever was in flight.
    async fn consume_with_reconnect(
        pool: Pool,
        exchange: String,
        queue: Arc<RwLock<Option<String>>>,
        topics: Arc<RwLock<HashSet<String>>>,
        handler: Arc<dyn InboundHandler>,
    ) {
        use std::time::Duration;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            match Self::setup_consumer(&pool, &exchange).await {
                Ok((queue_name, mut consumer)) => {
                    info!(queue = %queue_name, "Consumer connected, processing messages");
                    *queue.write().await = Some(queue_name.clone());
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                Self::process_delivery(delivery, &handler).await;
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    *queue.write().await = None;
                    topics.write().await.clear();
                    warn!(queue = %queue_name, "Consumer stream ended");
                    handler.on_connection_lost("consumer stream ended");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Set up the exclusive consumer queue.
    async fn setup_consumer(pool: &Pool, exchange: &str) -> Result<(String, lapin::Consumer)> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            TransportError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Connection(format!("Failed to declare exchange: {}", e))
            })?;

        // Server-named queue scoped to this connection
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        let queue_name = queue.name().as_str().to_string();

        let consumer = channel
            .basic_consume(
                &queue_name,
                "sketchlink-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok((queue_name, consumer))
    }

    /// Process a single delivery from the consumer.
    async fn process_delivery(delivery: lapin::message::Delivery, handler: &Arc<dyn InboundHandler>) {
        let topic = topic_name(delivery.routing_key.as_str());
        debug!(topic = %topic, "Received frame via AMQP");

        let frame = Arc::new(Frame::new(topic, delivery.data.clone()));
        handler.on_message(frame).await;

        if let Err(e) = delivery.ack(Default::default()).await {
            error!(error = %e, "Failed to ack message");
        }
    }

    /// The consumer queue name, or `NotConnected`.
    async fn current_queue(&self) -> Result<String> {
        self.queue
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Err(TransportError::Connection(
                "already connected".to_string(),
            ));
        }

        let pool = self.pool.clone();
        let exchange = self.exchange.clone();
        let queue = self.queue.clone();
        let topics = self.topics.clone();

        let task = tokio::spawn(async move {
            Self::consume_with_reconnect(pool, exchange, queue, topics, handler).await;
        });
        *consumer = Some(task);

        // Wait for the first consumer setup so subscribes issued right
        // after connect find a queue to bind to.
        for _ in 0..50 {
            if self.queue.read().await.is_some() {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Err(TransportError::Connection(
            "consumer setup timed out".to_string(),
        ))
    }

    async fn disconnect(&self) -> Result<()> {
        let task = self.consumer.lock().await.take();
        match task {
            Some(task) => {
                task.abort();
                *self.queue.write().await = None;
                self.topics.write().await.clear();
                info!("AMQP transport disconnected");
                Ok(())
            }
            None => Err(TransportError::NotConnected),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        use std::time::Duration;

        let key = routing_key(topic);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_PUBLISH_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Fresh channel per attempt so a dead one is not reused
            let channel = match self.get_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Failed to get channel, retrying");
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default().with_content_type("application/json".into());

            match channel
                .basic_publish(
                    &self.exchange,
                    &key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(topic = %topic, routing_key = %key, "Published frame");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(attempt = attempt + 1, error = %e, "Publish confirmation failed, retrying");
                        last_error = Some(TransportError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Publish failed, retrying");
                    last_error =
                        Some(TransportError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::Publish("Max retries exceeded".to_string())))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let queue = self.current_queue().await?;

        {
            let topics = self.topics.read().await;
            if topics.contains(topic) {
                return Err(TransportError::Subscribe(format!(
                    "already subscribed: {}",
                    topic
                )));
            }
        }

        let channel = self.get_channel().await?;
        channel
            .queue_bind(
                &queue,
                &self.exchange,
                &routing_key(topic),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        self.topics.write().await.insert(topic.to_string());
        debug!(topic = %topic, queue = %queue, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let queue = self.current_queue().await?;

        let known = self.topics.write().await.remove(topic);
        if !known {
            return Err(TransportError::Unsubscribe(format!(
                "not subscribed: {}",
                topic
            )));
        }

        let channel = self.get_channel().await?;
        channel
            .queue_unbind(&queue, &self.exchange, &routing_key(topic), FieldTable::default())
            .await
            .map_err(|e| TransportError::Unsubscribe(format!("Failed to unbind queue: {}", e)))?;

        debug!(topic = %topic, queue = %queue, "Unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_mapping() {
        assert_eq!(routing_key("response/verify/abc"), "response.verify.abc");
        assert_eq!(topic_name("result.job1"), "result/job1");
    }

    #[test]
    fn test_routing_key_round_trip() {
        let topic = "response/upload/4a5b";
        assert_eq!(topic_name(&routing_key(topic)), topic);
    }
}
