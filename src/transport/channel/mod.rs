//! In-memory channel-based transport for standalone mode.
//!
//! Uses a tokio broadcast channel as the broker: every frame reaches
//! every connected transport, which filters against its own set of
//! subscribed topics. Ideal for local development and testing without
//! an external broker.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Frame, InboundHandler, Result, Transport, TransportError};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// In-process broker shared by every transport attached to it.
///
/// Frames published by any party are broadcast to all parties; topic
/// filtering happens at each transport.
#[derive(Clone)]
pub struct InMemoryBroker {
    sender: broadcast::Sender<Arc<Frame>>,
}

impl InMemoryBroker {
    /// Create a new broker.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a transport attached to this broker.
    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport::new(self.sender.clone())
    }

    /// Inject a frame as if some remote party published it.
    pub fn send(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        // No receivers is fine; the frame is simply dropped.
        let _ = self.sender.send(Arc::new(Frame::new(topic, payload)));
    }

    /// Raw receiver seeing every frame, regardless of subscriptions.
    ///
    /// In-process worker stubs use this in place of broker-side wildcard
    /// subscriptions.
    pub fn tap(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport backed by an `InMemoryBroker`.
pub struct ChannelTransport {
    /// Broadcast sender shared with the broker.
    sender: broadcast::Sender<Arc<Frame>>,
    /// Topics with an active subscription.
    topics: Arc<RwLock<HashSet<String>>>,
    /// Consumer task, present while connected.
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelTransport {
    fn new(sender: broadcast::Sender<Arc<Frame>>) -> Self {
        Self {
            sender,
            topics: Arc::new(RwLock::new(HashSet::new())),
            consumer: Mutex::new(None),
        }
    }

    async fn connected(&self) -> bool {
        self.consumer.lock().await.is_some()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Err(TransportError::Connection(
                "already connected".to_string(),
            ));
        }

        let mut receiver = self.sender.subscribe();
        let topics = self.topics.clone();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        let subscribed = topics.read().await.contains(&frame.topic);
                        if !subscribed {
                            continue;
                        }
                        debug!(topic = %frame.topic, "Received frame via channel");
                        handler.on_message(frame).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        handler.on_connection_lost("channel closed");
                        break;
                    }
                }
            }
        });

        *consumer = Some(task);
        info!("Channel transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let task = self.consumer.lock().await.take();
        match task {
            Some(task) => {
                task.abort();
                self.topics.write().await.clear();
                info!("Channel transport disconnected");
                Ok(())
            }
            None => Err(TransportError::NotConnected),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.connected().await {
            return Err(TransportError::NotConnected);
        }

        match self.sender.send(Arc::new(Frame::new(topic, payload))) {
            Ok(receiver_count) => {
                debug!(topic = %topic, receivers = receiver_count, "Published frame to channel");
            }
            Err(_) => {
                // No receivers, that's okay for publish-only scenarios
                debug!(topic = %topic, "Published frame (no receivers)");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if !self.connected().await {
            return Err(TransportError::NotConnected);
        }

        let inserted = self.topics.write().await.insert(topic.to_string());
        if !inserted {
            return Err(TransportError::Subscribe(format!(
                "already subscribed: {}",
                topic
            )));
        }
        debug!(topic = %topic, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = self.topics.write().await.remove(topic);
        if !removed {
            return Err(TransportError::Unsubscribe(format!(
                "not subscribed: {}",
                topic
            )));
        }
        debug!(topic = %topic, "Unsubscribed");
        Ok(())
    }
}
