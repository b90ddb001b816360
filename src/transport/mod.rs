//! Pub/sub transport adapter.
//!
//! This module contains:
//! - `Transport` trait: the connection the protocol runs over
//! - `InboundHandler` trait: the single inbound dispatch callback
//! - Implementations: in-memory channel broker, AMQP (RabbitMQ)
//!
//! The transport owns the physical connection and its reconnection
//! policy; it knows nothing about requests or correlation state.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
#[cfg(feature = "channel")]
pub use channel::{ChannelTransport, InMemoryBroker};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("not connected")]
    NotConnected,
}

/// A raw inbound message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a topic and payload.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Callback surface for inbound transport events.
///
/// One handler is registered at connect time and receives every message
/// matching an active subscription, plus connection-loss notifications.
pub trait InboundHandler: Send + Sync {
    /// Process an inbound message.
    fn on_message(&self, frame: Arc<Frame>) -> BoxFuture<'static, ()>;

    /// The connection was lost; messages stop flowing until the caller
    /// reconnects.
    fn on_connection_lost(&self, reason: &str);
}

/// Interface the protocol requires from a pub/sub connection.
///
/// Implementations:
/// - `ChannelTransport`: in-memory broker for standalone mode and tests
/// - `AmqpTransport`: RabbitMQ topic exchange
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and start delivering inbound messages to the
    /// handler.
    async fn connect(&self, handler: Arc<dyn InboundHandler>) -> Result<()>;

    /// Close the connection. Active subscriptions are discarded.
    async fn disconnect(&self) -> Result<()>;

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic. Subscribing to a topic that already has an
    /// active subscription is an error.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Drop the subscription for a topic.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}
