//! Topic-addressed publish/subscribe transport.
//!
//! The scheduler core only needs three operations from the bus: publish,
//! subscribe and unsubscribe. Anything that can provide them (NATS, an
//! in-process bus in tests) plugs in behind [`Transport`].

mod memory;

pub use memory::InMemoryBus;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to encode message for {topic}: {reason}")]
    Encode { topic: String, reason: String },

    #[error("Transport closed")]
    Closed,

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Identity of one subscription on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// An active subscription: raw message payloads in publish order.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, receiver: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { id: SubscriptionId::new(), topic: topic.into(), receiver }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the transport dropped the subscription.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

/// Narrow publish/subscribe interface the scheduler depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish raw bytes to a topic. Delivery is at-least-once to every
    /// subscription that exists at publish time.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a topic. Messages published after this returns are
    /// delivered to the subscription.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    /// Stop delivering to a subscription. Idempotent; safe to call from `Drop`.
    fn unsubscribe(&self, topic: &str, id: SubscriptionId);
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    transport: &dyn Transport,
    topic: &str,
    message: &T,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(message).map_err(|e| TransportError::Encode {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    transport.publish(topic, payload).await
}
