//! Inference request tracked by the dispatcher.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::protocol::{ChatCompletionRequest, Correlation, RequestId};
use crate::registry::Demand;

/// Lifecycle of a request inside the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting in the pending queue.
    Queued,
    /// Slot reserved on a runner, not yet pulled.
    Assigned,
    /// Handed to the runner by a pull.
    Dispatched,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A chat completion request on its way to a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: RequestId,
    pub owner_id: String,
    pub session_id: String,
    pub interaction_id: String,
    /// Target model; `None` lets any runner with capacity take it.
    pub model: Option<String>,
    pub stream: bool,
    /// Memory the request occupies on a runner while in flight.
    pub memory: u64,
    pub payload: ChatCompletionRequest,
    #[serde(skip, default = "Instant::now")]
    pub arrived_at: Instant,
}

impl InferenceRequest {
    pub fn new(owner_id: impl Into<String>, payload: ChatCompletionRequest, memory: u64) -> Self {
        let model = Some(payload.model.clone()).filter(|m| !m.is_empty());
        Self {
            id: RequestId::new(),
            owner_id: owner_id.into(),
            session_id: String::new(),
            interaction_id: String::new(),
            model,
            stream: payload.stream,
            memory,
            payload,
            arrived_at: Instant::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>, interaction_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self.interaction_id = interaction_id.into();
        self
    }

    pub fn demand(&self) -> Demand<'_> {
        Demand { model: self.model.as_deref(), memory: self.memory }
    }

    pub fn correlation(&self) -> Correlation {
        Correlation {
            owner_id: self.owner_id.clone(),
            session_id: self.session_id.clone(),
            interaction_id: self.interaction_id.clone(),
            request_id: self.id,
        }
    }
}

/// Restricts which assigned requests a pull may take.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    /// Exact model name.
    #[serde(default)]
    pub model: Option<String>,
    /// Model family, i.e. the part of the name before the first `:`.
    #[serde(default)]
    pub model_family: Option<String>,
}

impl RequestFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn model(model: impl Into<String>) -> Self {
        Self { model: Some(model.into()), model_family: None }
    }

    pub fn family(family: impl Into<String>) -> Self {
        Self { model: None, model_family: Some(family.into()) }
    }

    pub fn matches(&self, request: &InferenceRequest) -> bool {
        let model = request.model.as_deref().unwrap_or("");
        if let Some(want) = &self.model {
            if model != want {
                return false;
            }
        }
        if let Some(family) = &self.model_family {
            if model.split(':').next() != Some(family.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str) -> InferenceRequest {
        InferenceRequest::new(
            "owner",
            ChatCompletionRequest { model: model.into(), ..Default::default() },
            1,
        )
    }

    #[test]
    fn empty_model_means_no_preference() {
        assert_eq!(request("").model, None);
        assert_eq!(request("llama3:8b").model.as_deref(), Some("llama3:8b"));
    }

    #[test]
    fn filter_by_family() {
        let filter = RequestFilter::family("llama3");
        assert!(filter.matches(&request("llama3:8b")));
        assert!(filter.matches(&request("llama3")));
        assert!(!filter.matches(&request("phi3:mini")));
        assert!(RequestFilter::any().matches(&request("phi3:mini")));
    }

    #[test]
    fn filter_by_exact_model() {
        let filter = RequestFilter::model("phi3:mini");
        assert!(filter.matches(&request("phi3:mini")));
        assert!(!filter.matches(&request("phi3:medium")));
    }
}
