//! The completion service seam.
//!
//! [`CompletionClient`] is the only way the engine talks to a model. Requests
//! borrow the conversation state; responses carry zero or one candidate
//! message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    message::{AssistantMessage, Message},
    tool::ToolDefinition,
};

/// A chat-completion request built from the current conversation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    /// Provider parameters (model, temperature, ...) forwarded as-is.
    pub params: &'a Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

impl CompletionResponse {
    /// Wraps a single assistant message in a response.
    pub fn from_message(message: AssistantMessage) -> Self {
        Self {
            choices: vec![Choice {
                index: 0,
                message: Some(message),
                finish_reason: None,
            }],
            ..Self::default()
        }
    }

    /// The first candidate message, if the provider returned one.
    pub fn message(&self) -> Option<&AssistantMessage> {
        self.choices.first().and_then(|choice| choice.message.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: Option<AssistantMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Structured error detail returned by the completion provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ApiErrorDetail {
    /// Extracts the detail from an `{"error": {...}}` envelope.
    ///
    /// Non-string `type`/`param`/`code` values are ignored rather than
    /// rejected, so odd provider payloads still yield a usable message.
    pub fn from_envelope(body: &Value) -> Option<Self> {
        let error = body.get("error")?.as_object()?;
        let text = |key: &str| error.get(key).and_then(Value::as_str).map(str::to_owned);

        let message = text("message")
            .or_else(|| body.get("message").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_default();

        Some(Self {
            message,
            kind: text("type"),
            param: text("param"),
            code: text("code"),
        })
    }
}

/// Failure of a completion request. Always fatal for the current turn.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CompletionError {
    #[error("completion API error: {}", .detail.message)]
    Api {
        status: Option<u16>,
        detail: ApiErrorDetail,
    },
    #[error("failed to encode completion request: {0}")]
    Encode(String),
    #[error("completion transport error: {0}")]
    Transport(String),
    #[error("failed to decode completion response: {0}")]
    Decode(String),
}

impl CompletionError {
    pub fn api_detail(&self) -> Option<&ApiErrorDetail> {
        match self {
            Self::Api { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError>;
}
