//! Streaming reassembly and the caller-side wait.

use std::time::{Duration, Instant};

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use super::ResponseChannel;
use crate::error::DispatchError;
use crate::protocol::{ChatCompletionChunk, ChatCompletionResponse, ResponseEnvelope};
use crate::scheduler::{FailureWatch, RequestGuard};
use crate::shutdown::ShutdownGuard;
use crate::telemetry::{self, SpanExt};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// The first final response completes the call.
    Unary,
    /// Chunks in publish order until `done`.
    Stream,
}

/// What one envelope means for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    Chunk(ChatCompletionChunk),
    /// Terminal chunk of a stream. `None` for a bare end marker.
    Last(Option<ChatCompletionChunk>),
    Finished(ChatCompletionResponse),
    Failed(DispatchError),
    Ignore,
}

/// Turns envelopes into caller-visible steps. Nothing is emitted after the
/// first terminal step.
#[derive(Debug)]
pub struct StreamAssembler {
    mode: ResponseMode,
    terminated: bool,
}

impl StreamAssembler {
    pub fn new(mode: ResponseMode) -> Self {
        Self { mode, terminated: false }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn step(&mut self, envelope: ResponseEnvelope) -> StreamStep {
        if self.terminated {
            tracing::debug!(request_id = %envelope.correlation().request_id, "envelope after terminal, ignoring");
            return StreamStep::Ignore;
        }
        let step = match (self.mode, envelope) {
            (_, ResponseEnvelope::Error { message, .. }) => StreamStep::Failed(DispatchError::Runner(message)),
            (ResponseMode::Unary, ResponseEnvelope::Final { response, .. }) => StreamStep::Finished(response),
            (ResponseMode::Unary, ResponseEnvelope::Chunk { correlation, .. }) => {
                tracing::debug!(request_id = %correlation.request_id, "chunk on unary call, ignoring");
                StreamStep::Ignore
            }
            (ResponseMode::Stream, ResponseEnvelope::Final { response, .. }) => {
                StreamStep::Last(Some(ChatCompletionChunk::from(&response)))
            }
            (ResponseMode::Stream, ResponseEnvelope::Chunk { chunk, done: true, .. }) => StreamStep::Last(chunk),
            (ResponseMode::Stream, ResponseEnvelope::Chunk { chunk: Some(chunk), done: false, .. }) => {
                StreamStep::Chunk(chunk)
            }
            (ResponseMode::Stream, ResponseEnvelope::Chunk { chunk: None, done: false, .. }) => StreamStep::Ignore,
        };
        if matches!(step, StreamStep::Last(_) | StreamStep::Finished(_) | StreamStep::Failed(_)) {
            self.terminated = true;
        }
        step
    }
}

/// A submitted request waiting for its terminal message.
///
/// Settles the request in the dispatcher when it ends: completed on a
/// terminal response, failed on error or timeout, abandoned on cancellation
/// or drop.
pub struct PendingResponse {
    channel: ResponseChannel,
    assembler: StreamAssembler,
    failure: FailureWatch,
    guard: RequestGuard,
    cancel: CancellationToken,
    timeout: Duration,
    deadline: tokio::time::Instant,
    started: Instant,
    span: Span,
    admission: Option<ShutdownGuard>,
}

impl PendingResponse {
    pub fn new(
        channel: ResponseChannel,
        mode: ResponseMode,
        failure: FailureWatch,
        guard: RequestGuard,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            assembler: StreamAssembler::new(mode),
            failure,
            guard,
            cancel,
            timeout,
            deadline: tokio::time::Instant::now() + timeout,
            started: Instant::now(),
            span: Span::none(),
            admission: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Hold an admission slot until the response ends.
    pub fn with_admission(mut self, admission: ShutdownGuard) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    async fn next_step(&mut self) -> StreamStep {
        let timeout = self.timeout;
        loop {
            let envelope = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return StreamStep::Failed(DispatchError::Cancelled),
                envelope = self.channel.next_envelope() => envelope,
                err = self.failure.wait() => return StreamStep::Failed(err),
                () = tokio::time::sleep_until(self.deadline) => {
                    return StreamStep::Failed(DispatchError::Timeout(timeout));
                }
            };
            let Some(envelope) = envelope else {
                return StreamStep::Failed(TransportError::Closed.into());
            };
            match self.assembler.step(envelope) {
                StreamStep::Ignore => continue,
                step => return step,
            }
        }
    }

    fn settle(&mut self, result: Result<(), &DispatchError>) {
        self.channel.close();
        match result {
            Ok(()) => self.guard.complete(),
            Err(DispatchError::Cancelled) => self.guard.abandon(),
            Err(e) => self.guard.fail(e),
        }
        let elapsed = self.started.elapsed();
        self.span.record("latency_ms", elapsed.as_millis() as u64);
        self.span.record_result(&result);
        if result.is_ok() {
            let streaming = self.assembler.mode == ResponseMode::Stream;
            telemetry::record_completion_latency(elapsed.as_secs_f64(), streaming);
        }
        self.admission = None;
    }

    /// Wait for the final response of a unary call.
    pub async fn wait_final(mut self) -> Result<ChatCompletionResponse, DispatchError> {
        loop {
            match self.next_step().await {
                StreamStep::Finished(response) => {
                    self.settle(Ok(()));
                    return Ok(response);
                }
                StreamStep::Failed(err) => {
                    self.settle(Err(&err));
                    return Err(err);
                }
                StreamStep::Chunk(_) | StreamStep::Last(_) | StreamStep::Ignore => continue,
            }
        }
    }

    pub fn into_stream(self) -> CompletionStream {
        CompletionStream { pending: self, done: false }
    }
}

/// Lazy, finite, non-restartable sequence of chunks.
///
/// Yields chunks in publish order. A failure is yielded once as `Err` and
/// ends the sequence.
pub struct CompletionStream {
    pending: PendingResponse,
    done: bool,
}

impl CompletionStream {
    pub fn request_id(&self) -> crate::protocol::RequestId {
        self.pending.channel.request_id()
    }

    pub async fn recv(&mut self) -> Option<Result<ChatCompletionChunk, DispatchError>> {
        if self.done {
            return None;
        }
        loop {
            match self.pending.next_step().await {
                StreamStep::Chunk(chunk) => return Some(Ok(chunk)),
                StreamStep::Last(chunk) => {
                    self.done = true;
                    self.pending.settle(Ok(()));
                    return chunk.map(Ok);
                }
                StreamStep::Failed(err) => {
                    self.done = true;
                    self.pending.settle(Err(&err));
                    return Some(Err(err));
                }
                StreamStep::Finished(_) | StreamStep::Ignore => continue,
            }
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChatCompletionChunk, DispatchError>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|item| (item, stream))
        })
    }

    /// Drain the stream, concatenating chunk content.
    pub async fn collect_text(mut self) -> Result<String, DispatchError> {
        let mut text = String::new();
        while let Some(chunk) = self.recv().await {
            text.push_str(chunk?.content());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatChoice, ChatMessage, Correlation, RequestId};

    fn corr() -> Correlation {
        Correlation { owner_id: "o".into(), request_id: RequestId::new(), ..Default::default() }
    }

    fn response(text: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            choices: vec![ChatChoice { message: ChatMessage::assistant(text), ..Default::default() }],
            ..Default::default()
        }
    }

    #[test]
    fn error_wins_over_prior_chunks() {
        let mut asm = StreamAssembler::new(ResponseMode::Stream);
        let c = corr();
        assert_eq!(
            asm.step(ResponseEnvelope::chunk(c.clone(), ChatCompletionChunk::text("One,"), false)),
            StreamStep::Chunk(ChatCompletionChunk::text("One,"))
        );
        let step = asm.step(ResponseEnvelope::error(c.clone(), "too many tokens"));
        assert!(matches!(step, StreamStep::Failed(DispatchError::Runner(m)) if m == "too many tokens"));
        let late = asm.step(ResponseEnvelope::chunk(c, ChatCompletionChunk::text("Two,"), true));
        assert_eq!(late, StreamStep::Ignore);
    }

    #[test]
    fn unary_takes_first_final_only() {
        let mut asm = StreamAssembler::new(ResponseMode::Unary);
        let c = corr();
        assert_eq!(asm.step(ResponseEnvelope::done(c.clone())), StreamStep::Ignore);
        assert_eq!(
            asm.step(ResponseEnvelope::final_response(c.clone(), response("first"))),
            StreamStep::Finished(response("first"))
        );
        assert_eq!(asm.step(ResponseEnvelope::final_response(c, response("second"))), StreamStep::Ignore);
        assert!(asm.is_terminated());
    }

    #[test]
    fn final_response_ends_a_stream() {
        let mut asm = StreamAssembler::new(ResponseMode::Stream);
        let step = asm.step(ResponseEnvelope::final_response(corr(), response("all")));
        match step {
            StreamStep::Last(Some(chunk)) => assert_eq!(chunk.content(), "all"),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn bare_done_marker_ends_stream_without_chunk() {
        let mut asm = StreamAssembler::new(ResponseMode::Stream);
        assert_eq!(asm.step(ResponseEnvelope::done(corr())), StreamStep::Last(None));
    }
}
