//! Response multiplexer: one subscription per in-flight request.
//!
//! The caller subscribes to the request's response topic before the request
//! is submitted, so a fast runner can never publish into the void. Each
//! subscription is released when its channel is closed or dropped, and
//! anything published after that is discarded by the transport.

mod stream;

pub use stream::{CompletionStream, PendingResponse, ResponseMode, StreamAssembler, StreamStep};

use std::sync::Arc;

use crate::error::DispatchError;
use crate::protocol::{runner_responses_topic, Correlation, EnvelopeError, RequestId, ResponseEnvelope};
use crate::telemetry;
use crate::transport::{Subscription, Transport};

/// Opens per-request response channels on a transport.
#[derive(Clone)]
pub struct ResponseMultiplexer {
    transport: Arc<dyn Transport>,
}

impl ResponseMultiplexer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Subscribe to the response topic for `correlation`.
    pub async fn open(&self, correlation: &Correlation) -> Result<ResponseChannel, DispatchError> {
        let topic = runner_responses_topic(&correlation.owner_id, correlation.request_id);
        let subscription = self.transport.subscribe(&topic).await?;
        tracing::trace!(topic = %topic, request_id = %correlation.request_id, "response channel open");
        Ok(ResponseChannel {
            transport: Arc::clone(&self.transport),
            subscription,
            request_id: correlation.request_id,
            closed: false,
        })
    }
}

/// Decoded envelopes for one request, in publish order.
pub struct ResponseChannel {
    transport: Arc<dyn Transport>,
    subscription: Subscription,
    request_id: RequestId,
    closed: bool,
}

impl ResponseChannel {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    /// Next well-formed envelope for this request. Undecodable and
    /// misrouted messages are logged and skipped. `None` once the channel
    /// is closed or the transport dropped the subscription.
    pub async fn next_envelope(&mut self) -> Option<ResponseEnvelope> {
        if self.closed {
            return None;
        }
        loop {
            let payload = self.subscription.recv().await?;
            match ResponseEnvelope::decode(&payload, self.request_id) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    let kind = match &e {
                        EnvelopeError::Decode(_) => "decode",
                        EnvelopeError::Misrouted { .. } => "misrouted",
                    };
                    telemetry::record_envelope_error(kind);
                    tracing::warn!(
                        request_id = %self.request_id,
                        topic = self.subscription.topic(),
                        error = %e,
                        "ignoring bad response envelope",
                    );
                }
            }
        }
    }

    /// Unsubscribe. Idempotent.
    pub fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            self.transport.unsubscribe(self.subscription.topic(), self.subscription.id());
        }
    }
}

impl Drop for ResponseChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatCompletionChunk, ResponseEnvelope};
    use crate::transport::{publish_json, InMemoryBus};

    fn correlation() -> Correlation {
        Correlation { owner_id: "owner".into(), request_id: RequestId::new(), ..Default::default() }
    }

    #[tokio::test]
    async fn skips_garbage_and_foreign_envelopes() {
        let bus = Arc::new(InMemoryBus::new());
        let mux = ResponseMultiplexer::new(bus.clone());
        let corr = correlation();
        let mut channel = mux.open(&corr).await.unwrap();
        let topic = channel.topic().to_string();

        bus.publish(&topic, b"not json".to_vec()).await.unwrap();
        let foreign = ResponseEnvelope::done(correlation());
        publish_json(bus.as_ref(), &topic, &foreign).await.unwrap();
        let ours = ResponseEnvelope::chunk(corr.clone(), ChatCompletionChunk::text("hi"), false);
        publish_json(bus.as_ref(), &topic, &ours).await.unwrap();

        assert_eq!(channel.next_envelope().await, Some(ours));
    }

    #[tokio::test]
    async fn close_and_drop_unsubscribe() {
        let bus = Arc::new(InMemoryBus::new());
        let mux = ResponseMultiplexer::new(bus.clone());
        let corr = correlation();
        let topic = runner_responses_topic(&corr.owner_id, corr.request_id);

        let mut channel = mux.open(&corr).await.unwrap();
        assert_eq!(bus.subscriber_count(&topic), 1);
        channel.close();
        channel.close();
        assert_eq!(bus.subscriber_count(&topic), 0);
        assert!(channel.next_envelope().await.is_none());

        let channel = mux.open(&corr).await.unwrap();
        drop(channel);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
