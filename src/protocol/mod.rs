//! Wire types shared by callers, the scheduler and runners.

mod chat;
mod envelope;

pub use chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ChunkChoice, ChunkDelta, Usage,
};
pub use envelope::{runner_responses_topic, Correlation, EnvelopeError, RequestId, ResponseEnvelope};
