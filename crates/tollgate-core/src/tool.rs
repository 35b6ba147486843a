//! Tool declarations and execution backends.
//!
//! # Architecture
//!
//! - [`ToolDefinition`]: what the model sees. Declared tools are sent verbatim
//!   with every completion request, and their order is significant because
//!   provider errors refer to tools by position (`tools[N]`).
//! - [`ToolBackend`]: what actually runs a tool. The engine never executes a
//!   tool directly; it hands the call to a backend through the policy layer.
//! - [`ToolRegistry`]: an in-process backend of async handlers, used for local
//!   tools and in tests.
//!
//! # Thread Safety
//!
//! Registration requires `&mut self`. Register every tool before wrapping the
//! registry in [`Arc`] and handing it to a conversation.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// A tool as declared to the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the arguments object.
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: Option<String>,
        parameters: Value,
    ) -> Self {
        Self {
            kind: crate::message::FUNCTION_CALL_KIND.to_owned(),
            function: FunctionDefinition {
                name: name.into(),
                description,
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Errors reported by a [`ToolBackend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool with this name exists on the backend.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The backend rejected the arguments before running the tool.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The tool ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The backend could not be reached.
    #[error("tool transport error: {0}")]
    Transport(String),

    #[error("tool call cancelled")]
    Cancelled,
}

/// Executes tool calls on behalf of the engine.
///
/// `cancel` is scoped to a single invocation. Backends that perform I/O
/// should stop work once it fires.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError>;

    /// Releases backend resources. Called once when a conversation closes.
    async fn close(&self) {}
}

/// Errors raised while registering local tools.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Tool names must be unique within a registry.
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),

    #[error("tool name must not be empty")]
    EmptyName,

    #[error("failed to generate input schema for `{name}`: {source}")]
    Schema {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// In-process [`ToolBackend`] backed by async handlers.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tollgate_core::{ToolDefinition, ToolRegistry};
///
/// let mut registry = ToolRegistry::new();
/// registry
///     .register(
///         ToolDefinition::function("echo", None, json!({ "type": "object" })),
///         |args| async move { Ok(args) },
///     )
///     .unwrap();
/// assert_eq!(registry.definitions()[0].name(), "echo");
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool that receives its arguments as raw JSON.
    pub fn register<F, Fut>(
        &mut self,
        definition: ToolDefinition,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let name = definition.name().to_owned();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        let handler: ToolHandler = Arc::new(move |args: Value| handler(args).boxed());
        self.by_name.insert(name, self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            handler,
        });
        Ok(())
    }

    /// Registers a tool with typed input and output.
    ///
    /// The parameters schema is generated from `I`. Arguments that do not
    /// deserialize into `I` fail with [`ToolError::InvalidArguments`].
    pub fn register_typed<I, O, F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        I: JsonSchema + DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    {
        let parameters =
            serde_json::to_value(schemars::schema_for!(I)).map_err(|source| {
                RegistryError::Schema {
                    name: name.to_owned(),
                    source,
                }
            })?;
        let definition =
            ToolDefinition::function(name, Some(description.to_owned()), parameters);

        let handler = Arc::new(handler);
        self.register(definition, move |args: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let input: I = serde_json::from_value(args)
                    .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
                let output = handler(input).await?;
                serde_json::to_value(output)
                    .map_err(|e| ToolError::Failed(format!("failed to serialize output: {e}")))
            }
        })
    }

    /// Definitions of every registered tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolBackend for ToolRegistry {
    #[instrument(skip(self, arguments, _cancel))]
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ToolError> {
        let index = *self
            .by_name
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_owned()))?;
        let handler = Arc::clone(&self.tools[index].handler);

        debug!("Invoking local tool");
        handler(arguments).await
    }
}
