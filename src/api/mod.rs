//! Caller-facing completion API.
//!
//! Binds the dispatcher to the response multiplexer: subscribe, submit,
//! then wait on the subscription. Callers are assumed authenticated by an
//! outer layer; only the owner identity is required here.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse};
use crate::response::{CompletionStream, PendingResponse, ResponseMode, ResponseMultiplexer};
use crate::scheduler::{Dispatcher, InferenceRequest};
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::{RequestSpan, SpanExt};
use crate::transport::Transport;

/// Identity and cancellation scope of one caller request.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub owner_id: String,
    pub session_id: String,
    pub interaction_id: String,
    /// Cancelled when the caller goes away.
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            session_id: String::new(),
            interaction_id: String::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>, interaction_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self.interaction_id = interaction_id.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// `createCompletion` and `createCompletionStream`.
pub struct InferenceApi {
    dispatcher: Arc<Dispatcher>,
    mux: ResponseMultiplexer,
    shutdown: ShutdownCoordinator,
    config: Arc<DispatchConfig>,
}

impl InferenceApi {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn Transport>,
        shutdown: ShutdownCoordinator,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self { dispatcher, mux: ResponseMultiplexer::new(transport), shutdown, config }
    }

    /// How long a caller waits for a terminal message.
    pub fn response_timeout(&self) -> Duration {
        self.config.slot_ttl
    }

    /// Blocks until the runner's final response, an error, or the timeout.
    pub async fn create_completion(
        &self,
        ctx: &CallContext,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, DispatchError> {
        let pending = self.start(ctx, request, ResponseMode::Unary).await?;
        let span = pending.span().clone();
        pending.wait_final().instrument(span).await
    }

    /// Returns once the request is submitted; chunks follow on the stream.
    pub async fn create_completion_stream(
        &self,
        ctx: &CallContext,
        request: ChatCompletionRequest,
    ) -> Result<CompletionStream, DispatchError> {
        let pending = self.start(ctx, request, ResponseMode::Stream).await?;
        Ok(pending.into_stream())
    }

    async fn start(
        &self,
        ctx: &CallContext,
        mut payload: ChatCompletionRequest,
        mode: ResponseMode,
    ) -> Result<PendingResponse, DispatchError> {
        let admission = self.shutdown.track().ok_or(DispatchError::ShuttingDown)?;
        if ctx.owner_id.is_empty() {
            return Err(DispatchError::InvalidRequest("owner id is required".into()));
        }
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        payload.stream = mode == ResponseMode::Stream;
        let model = Some(payload.model.as_str()).filter(|m| !m.is_empty());
        let memory = self.config.model_footprint(model);
        let request = InferenceRequest::new(ctx.owner_id.clone(), payload, memory)
            .with_session(ctx.session_id.clone(), ctx.interaction_id.clone());
        let span = RequestSpan::new(
            &request.id.to_string(),
            &ctx.owner_id,
            request.model.as_deref().unwrap_or(""),
            request.stream,
        );

        // Subscribe before the request becomes visible to any runner.
        let channel = self.mux.open(&request.correlation()).await?;
        let submission = match self.dispatcher.submit(request) {
            Ok(submission) => submission,
            Err(err) => {
                span.record_result::<(), _>(&Err(&err));
                tracing::warn!(parent: &span, error = %err, "submission refused");
                return Err(err);
            }
        };
        tracing::debug!(parent: &span, placement = ?submission.placement, "submitted");

        let guard = self.dispatcher.guard(submission.request_id);
        Ok(PendingResponse::new(
            channel,
            mode,
            submission.failure,
            guard,
            ctx.cancel.clone(),
            self.config.slot_ttl,
        )
        .with_span(span)
        .with_admission(admission))
    }
}
