//! OpenAI-compatible chat-completions client.
//!
//! [`OpenAiClient`] implements [`CompletionClient`] against any server that
//! speaks the `/chat/completions` protocol. Error responses are decoded from
//! the provider's `{"error": {...}}` envelope into
//! [`CompletionError::Api`], which keeps the structured `type`, `param` and
//! `code` fields that tool schema classification relies on.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tollgate_core::{
    ApiErrorDetail, CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
    config::OpenAiSettings,
};
use tracing::{debug, instrument};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("environment variable {0} is not set")]
    MissingApiKey(String),
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            api_key: Some(api_key.into()),
        }
    }

    /// A client that sends no `Authorization` header, for local servers.
    pub fn unauthenticated() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            api_key: None,
        }
    }

    /// Builds a client from settings, reading the key from `api_key_env`.
    pub fn from_settings(settings: &OpenAiSettings) -> Result<Self, ClientError> {
        let api_key = std::env::var(&settings.api_key_env)
            .map_err(|_| ClientError::MissingApiKey(settings.api_key_env.clone()))?;
        Ok(Self::new(api_key).with_base_url(&settings.base_url))
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        base_url.trim_end_matches('/').clone_into(&mut self.base_url);
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    #[instrument(skip_all, fields(messages = request.messages.len(), tools = request.tools.len()))]
    async fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let body = request_body(request)?;

        let mut builder = self.http.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), "Completion request rejected");
            return Err(api_error(status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| CompletionError::Decode(e.to_string()))
    }
}

/// Assembles the request body. Messages and tools always come from the
/// conversation; `tool_choice` defaults to `auto` when tools are declared.
fn request_body(request: CompletionRequest<'_>) -> Result<Value, CompletionError> {
    let encode = |e: serde_json::Error| CompletionError::Encode(e.to_string());

    let mut body: Map<String, Value> = request.params.clone();
    body.insert(
        "messages".to_owned(),
        serde_json::to_value(request.messages).map_err(encode)?,
    );
    if request.tools.is_empty() {
        body.remove("tools");
    } else {
        body.insert(
            "tools".to_owned(),
            serde_json::to_value(request.tools).map_err(encode)?,
        );
        body.entry("tool_choice")
            .or_insert_with(|| Value::from("auto"));
    }
    Ok(Value::Object(body))
}

fn api_error(status: u16, text: &str) -> CompletionError {
    let detail = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|body| ApiErrorDetail::from_envelope(&body))
        .unwrap_or_else(|| ApiErrorDetail {
            message: if text.is_empty() {
                format!("HTTP {status}")
            } else {
                text.to_owned()
            },
            ..ApiErrorDetail::default()
        });

    CompletionError::Api {
        status: Some(status),
        detail,
    }
}
