//! Runner-side helper: heartbeat, pull loop and response publishing.
//!
//! The pull loop is the explicit client retry policy: pull with the
//! dispatcher's bounded wait, sleep briefly on an empty result, repeat.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::protocol::{
    runner_responses_topic, ChatCompletionChunk, ChatCompletionResponse, ResponseEnvelope,
};
use crate::registry::RunnerReport;
use crate::scheduler::{Dispatcher, InferenceRequest, RequestFilter, RequestStatus};
use crate::transport::{publish_json, Transport};

#[derive(Debug, Clone, Copy)]
pub struct PullPolicy {
    /// Delay after an empty pull.
    pub empty_delay: Duration,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self { empty_delay: Duration::from_millis(200) }
    }
}

pub struct RunnerClient {
    runner_id: String,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    policy: PullPolicy,
}

impl RunnerClient {
    pub fn new(runner_id: impl Into<String>, dispatcher: Arc<Dispatcher>, transport: Arc<dyn Transport>) -> Self {
        Self { runner_id: runner_id.into(), dispatcher, transport, policy: PullPolicy::default() }
    }

    pub fn with_policy(mut self, policy: PullPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Report capacity and models. The report's runner id is overwritten
    /// with this client's.
    pub fn heartbeat(&self, mut report: RunnerReport) {
        report.runner_id = self.runner_id.clone();
        self.dispatcher.update_runner(report);
    }

    /// Pull until a request arrives or `cancel` fires.
    pub async fn next_request(
        &self,
        filter: &RequestFilter,
        cancel: &CancellationToken,
    ) -> Result<Option<InferenceRequest>, DispatchError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let pulled = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                pulled = self.dispatcher.pull_next(&self.runner_id, filter) => pulled?,
            };
            if let Some(request) = pulled {
                tracing::debug!(runner_id = %self.runner_id, request_id = %request.id, "pulled request");
                return Ok(Some(request));
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(self.policy.empty_delay) => {}
            }
        }
    }

    /// Publish an envelope to the caller. A terminal envelope also releases
    /// the request's slot; a request the caller already settled is ignored.
    pub async fn respond(&self, request: &InferenceRequest, envelope: &ResponseEnvelope) -> Result<(), DispatchError> {
        let topic = runner_responses_topic(&request.owner_id, request.id);
        publish_json(self.transport.as_ref(), &topic, envelope).await?;
        if !envelope.is_terminal() {
            return Ok(());
        }
        let status = match envelope {
            ResponseEnvelope::Error { .. } => RequestStatus::Failed,
            _ => RequestStatus::Completed,
        };
        match self.dispatcher.runner_finished(&self.runner_id, request.id, status) {
            Ok(()) | Err(DispatchError::UnknownRequest(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn respond_final(
        &self,
        request: &InferenceRequest,
        response: ChatCompletionResponse,
    ) -> Result<(), DispatchError> {
        self.respond(request, &ResponseEnvelope::final_response(request.correlation(), response)).await
    }

    pub async fn respond_chunk(
        &self,
        request: &InferenceRequest,
        chunk: ChatCompletionChunk,
        done: bool,
    ) -> Result<(), DispatchError> {
        self.respond(request, &ResponseEnvelope::chunk(request.correlation(), chunk, done)).await
    }

    pub async fn respond_error(&self, request: &InferenceRequest, message: &str) -> Result<(), DispatchError> {
        self.respond(request, &ResponseEnvelope::error(request.correlation(), message)).await
    }
}
