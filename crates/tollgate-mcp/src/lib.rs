//! MCP tool backend.
//!
//! [`McpToolBackend`] connects to a remote MCP server over streamable HTTP,
//! exposes the server's tools as [`ToolDefinition`]s and executes tool calls
//! on the server. The raw `CallToolResult` is returned as JSON so the model
//! sees the full result, including `isError`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use rmcp::{
    RoleClient, ServiceExt,
    model::{CallToolRequestParam, JsonObject},
    service::{Peer, RunningService},
    transport::{
        StreamableHttpClientTransport,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tollgate_core::{ToolBackend, ToolDefinition, ToolError, config::McpSettings};
use tracing::{debug, info, instrument, warn};

/// Header carrying the configured profile.
pub const PROFILE_HEADER: &str = "x-profile";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum McpError {
    #[error("no MCP server URL configured")]
    MissingUrl,

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to connect to MCP server: {0}")]
    Connect(String),

    #[error("MCP request failed: {0}")]
    Request(String),
}

/// A [`ToolBackend`] backed by a remote MCP server.
pub struct McpToolBackend {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl std::fmt::Debug for McpToolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolBackend").finish_non_exhaustive()
    }
}

impl McpToolBackend {
    /// Connects using the `[mcp]` settings.
    #[instrument(skip_all)]
    pub async fn connect(settings: &McpSettings) -> Result<Self, McpError> {
        let url = settings.url.as_deref().ok_or(McpError::MissingUrl)?;
        let http = reqwest::Client::builder()
            .default_headers(default_headers(settings)?)
            .build()?;
        Self::connect_with_client(url, http).await
    }

    /// Connects to `url` with a preconfigured HTTP client.
    pub async fn connect_with_client(url: &str, http: reqwest::Client) -> Result<Self, McpError> {
        let transport = StreamableHttpClientTransport::with_client(
            http,
            StreamableHttpClientTransportConfig::with_uri(url.to_owned()),
        );
        let service = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::Connect(e.to_string()))?;
        info!(url, "Connected to MCP server");

        Ok(Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        })
    }

    /// Lists the server's tools, leaving out any name in `exclude`.
    pub async fn list_tools(&self, exclude: &[String]) -> Result<Vec<ToolDefinition>, McpError> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| McpError::Request(e.to_string()))?;

        let definitions = tools
            .into_iter()
            .filter(|tool| {
                let excluded = exclude.iter().any(|name| *name == *tool.name);
                if excluded {
                    debug!(tool = %tool.name, "Excluding tool");
                }
                !excluded
            })
            .map(|tool| {
                tool_definition(
                    &tool.name,
                    tool.description.as_deref(),
                    &tool.input_schema,
                )
            })
            .collect::<Vec<_>>();
        info!(count = definitions.len(), "Discovered MCP tools");
        Ok(definitions)
    }
}

#[async_trait]
impl ToolBackend for McpToolBackend {
    #[instrument(skip(self, arguments, cancel))]
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError> {
        let request = CallToolRequestParam {
            name: name.to_owned().into(),
            arguments: arguments_object(arguments)?,
        };

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(ToolError::Cancelled),
            response = self.peer.call_tool(request) => response,
        };
        let result = response.map_err(|e| ToolError::Transport(e.to_string()))?;

        serde_json::to_value(&result)
            .map_err(|e| ToolError::Failed(format!("failed to encode tool result: {e}")))
    }

    async fn close(&self) {
        let Some(service) = self.service.lock().await.take() else {
            return;
        };
        if let Err(e) = service.cancel().await {
            warn!(error = %e, "MCP client did not shut down cleanly");
        }
    }
}

/// Maps an MCP tool to a function declaration.
fn tool_definition(name: &str, description: Option<&str>, schema: &JsonObject) -> ToolDefinition {
    ToolDefinition::function(
        name,
        description.map(str::to_owned),
        Value::Object(schema.clone()),
    )
}

/// MCP arguments must be an object; `null` means no arguments.
fn arguments_object(arguments: Value) -> Result<Option<JsonObject>, ToolError> {
    match arguments {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(ToolError::InvalidArguments(format!(
            "MCP tool arguments must be an object, got: {other}"
        ))),
    }
}

fn default_headers(settings: &McpSettings) -> Result<HeaderMap, McpError> {
    let mut headers = HeaderMap::new();
    if let Some(session_id) = &settings.session_id {
        headers.insert(COOKIE, header_value("cookie", &format!("sessionId={session_id}"))?);
    }
    headers.insert(
        HeaderName::from_static(PROFILE_HEADER),
        header_value(PROFILE_HEADER, &settings.profile)?,
    );
    insert_custom_headers(&mut headers, &settings.headers)?;
    Ok(headers)
}

fn insert_custom_headers(
    headers: &mut HeaderMap,
    custom: &BTreeMap<String, String>,
) -> Result<(), McpError> {
    for (name, value) in custom {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        headers.insert(header_name, header_value(name, value)?);
    }
    Ok(())
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, McpError> {
    HeaderValue::from_str(value).map_err(|e| McpError::InvalidHeader {
        name: name.to_owned(),
        reason: e.to_string(),
    })
}
