//! In-process bus for tests and single-node deployments.
//!
//! Uses DashMap so publishers on different topics never contend.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Subscription, SubscriptionId, Transport, TransportError};

type Subscriber = (SubscriptionId, mpsc::UnboundedSender<Vec<u8>>);

/// Topic → subscribers map with unbounded per-subscription channels.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, Vec<Subscriber>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            tracing::trace!(topic, "publish with no subscribers, dropping");
            return Ok(());
        };
        subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        let empty = subscribers.is_empty();
        drop(subscribers);
        if empty {
            self.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription::new(topic, rx);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((subscription.id(), tx));
        Ok(subscription)
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|(sid, _)| *sid != id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }
}
