//! OpenAI-shaped chat completion payloads.
//!
//! Only the fields the control plane and its tests touch are modelled; the
//! scheduler treats the payload as opaque beyond the model name and the
//! streaming flag.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatCompletionResponse {
    /// Content of the first choice, or an empty string.
    pub fn content(&self) -> &str {
        self.choices.first().map(|c| c.message.content.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// Single-choice chunk carrying `content`.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { role: None, content: content.into() },
                finish_reason: None,
            }],
            ..Default::default()
        }
    }

    /// Delta content of the first choice, or an empty string.
    pub fn content(&self) -> &str {
        self.choices.first().map(|c| c.delta.content.as_str()).unwrap_or("")
    }
}

impl From<&ChatCompletionResponse> for ChatCompletionChunk {
    fn from(response: &ChatCompletionResponse) -> Self {
        Self {
            id: response.id.clone(),
            model: response.model.clone(),
            choices: response
                .choices
                .iter()
                .map(|c| ChunkChoice {
                    index: c.index,
                    delta: ChunkDelta {
                        role: Some(c.message.role.clone()),
                        content: c.message.content.clone(),
                    },
                    finish_reason: c.finish_reason.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_missing_fields() {
        let req: ChatCompletionRequest = serde_json::from_str(r#"{"model":"llama3:8b"}"#).unwrap();
        assert_eq!(req.model, "llama3:8b");
        assert!(!req.stream);
        assert!(req.messages.is_empty());
    }

    #[test]
    fn final_response_converts_to_chunk() {
        let response = ChatCompletionResponse {
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant("Hello, world!"),
                finish_reason: Some("stop".into()),
            }],
            ..Default::default()
        };
        let chunk = ChatCompletionChunk::from(&response);
        assert_eq!(chunk.content(), "Hello, world!");
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
