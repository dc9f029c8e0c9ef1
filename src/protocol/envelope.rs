//! Runner response envelopes.
//!
//! A runner publishes zero or more envelopes per request on the request's
//! dedicated topic, ending with exactly one terminal envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::chat::{ChatCompletionChunk, ChatCompletionResponse};

/// Unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identities that tie a response back to the caller's request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub owner_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub interaction_id: String,
    pub request_id: RequestId,
}

/// One message on a request's response topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEnvelope {
    /// Complete non-streaming response.
    Final {
        correlation: Correlation,
        response: ChatCompletionResponse,
    },
    /// Streaming chunk. `chunk` is absent on a bare end-of-stream marker.
    Chunk {
        correlation: Correlation,
        #[serde(default)]
        chunk: Option<ChatCompletionChunk>,
        #[serde(default)]
        done: bool,
    },
    /// Runner-reported failure. Always terminal.
    Error {
        correlation: Correlation,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Undecodable envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Envelope for request {got} arrived on channel for {expected}")]
    Misrouted { expected: RequestId, got: RequestId },
}

impl ResponseEnvelope {
    pub fn final_response(correlation: Correlation, response: ChatCompletionResponse) -> Self {
        Self::Final { correlation, response }
    }

    pub fn chunk(correlation: Correlation, chunk: ChatCompletionChunk, done: bool) -> Self {
        Self::Chunk { correlation, chunk: Some(chunk), done }
    }

    pub fn done(correlation: Correlation) -> Self {
        Self::Chunk { correlation, chunk: None, done: true }
    }

    pub fn error(correlation: Correlation, message: impl Into<String>) -> Self {
        Self::Error { correlation, message: message.into() }
    }

    pub fn correlation(&self) -> &Correlation {
        match self {
            Self::Final { correlation, .. }
            | Self::Chunk { correlation, .. }
            | Self::Error { correlation, .. } => correlation,
        }
    }

    /// Whether this envelope ends the caller's wait.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Final { .. } | Self::Error { .. } => true,
            Self::Chunk { done, .. } => *done,
        }
    }

    /// Decode an envelope and check it belongs to `expected`.
    pub fn decode(bytes: &[u8], expected: RequestId) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        let got = envelope.correlation().request_id;
        if got != expected {
            return Err(EnvelopeError::Misrouted { expected, got });
        }
        Ok(envelope)
    }
}

/// Topic a runner publishes responses for one request to.
pub fn runner_responses_topic(owner_id: &str, request_id: RequestId) -> String {
    format!("runner-responses.{owner_id}.{request_id}")
}
