//! Executes a single tool call and turns the outcome into a tool message.
//!
//! The invoker never fails: argument errors, policy denials, backend errors,
//! timeouts and cancellation all become a tool message whose content is the
//! error text, so the model can see what went wrong and adapt.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::{
    message::{FunctionCall, Message},
    policy::{PolicyEnforcer, PolicyError},
    tool::{ToolBackend, ToolError},
};

/// A tool call with parsed arguments, as seen by policies and backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Id of the request this call answers.
    pub id: String,
    /// Tool name as requested by the model (not normalized).
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ToolCallError {
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(#[source] serde_json::Error),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Backend(#[from] ToolError),

    #[error("tool call cancelled")]
    Cancelled,

    #[error("tool call timed out after {0:?}")]
    TimedOut(Duration),
}

/// Result of answering one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Tool message to append to the conversation.
    pub message: Message,
    /// Whether the content is an error description.
    pub failed: bool,
}

/// Runs tool calls through a [`PolicyEnforcer`] against a [`ToolBackend`].
pub struct ToolInvoker {
    backend: Arc<dyn ToolBackend>,
    enforcer: PolicyEnforcer,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("enforcer", &self.enforcer)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ToolInvoker {
    pub fn new(backend: Arc<dyn ToolBackend>, enforcer: PolicyEnforcer) -> Self {
        Self {
            backend,
            enforcer,
            timeout: None,
        }
    }

    /// Bounds each backend call. Policies are not covered by the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn enforcer_mut(&mut self) -> &mut PolicyEnforcer {
        &mut self.enforcer
    }

    /// Answers the call `id`. The returned message always carries `id`.
    ///
    /// Work is scoped to a child of `cancel`, so cancelling the conversation
    /// aborts an in-flight backend call.
    #[instrument(skip_all, fields(call_id = %id, tool = %function.name))]
    pub async fn invoke(
        &mut self,
        id: &str,
        function: &FunctionCall,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let scope = cancel.child_token();
        match self.execute(id, function, scope).await {
            Ok(value) => {
                info!("Tool call succeeded");
                ToolOutcome {
                    message: Message::tool(id, value.to_string()),
                    failed: false,
                }
            }
            Err(err) => {
                error!(error = %err, "Tool call failed");
                ToolOutcome {
                    message: Message::tool(id, err.to_string()),
                    failed: true,
                }
            }
        }
    }

    async fn execute(
        &mut self,
        id: &str,
        function: &FunctionCall,
        scope: CancellationToken,
    ) -> Result<Value, ToolCallError> {
        let arguments = function
            .parse_arguments()
            .map_err(ToolCallError::InvalidArguments)?;
        let invocation = ToolInvocation {
            id: id.to_owned(),
            name: function.name.clone(),
            arguments,
        };

        let backend = Arc::clone(&self.backend);
        let timeout = self.timeout;
        self.enforcer
            .wrap_call(&invocation, move |call| async move {
                run_backend(backend.as_ref(), call, scope, timeout).await
            })
            .await
    }

    /// Closes the backend.
    pub async fn close(&self) {
        self.backend.close().await;
    }
}

async fn run_backend(
    backend: &dyn ToolBackend,
    call: ToolInvocation,
    scope: CancellationToken,
    timeout: Option<Duration>,
) -> Result<Value, ToolCallError> {
    let ToolInvocation {
        name, arguments, ..
    } = call;
    let request = backend.call_tool(&name, arguments, scope.clone());
    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(result) => result.map_err(ToolCallError::from),
                Err(_) => Err(ToolCallError::TimedOut(limit)),
            },
            None => request.await.map_err(ToolCallError::from),
        }
    };

    tokio::select! {
        biased;
        () = scope.cancelled() => Err(ToolCallError::Cancelled),
        result = bounded => result,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        policy::{PolicyVerdict, policy_fn},
        tool::{ToolDefinition, ToolRegistry},
    };

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::function("fetch", None, json!({})),
                |args| async move { Ok(json!({ "fetched": args["url"] })) },
            )
            .unwrap();
        registry
            .register(ToolDefinition::function("broken", None, json!({})), |_| {
                async { Err(ToolError::Failed("upstream exploded".to_owned())) }
            })
            .unwrap();
        registry
            .register(ToolDefinition::function("slow", None, json!({})), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            })
            .unwrap();
        Arc::new(registry)
    }

    fn call(name: &str, arguments: &str) -> FunctionCall {
        FunctionCall {
            name: name.to_owned(),
            arguments: arguments.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_success_serializes_result_as_json() {
        let mut invoker = ToolInvoker::new(registry(), PolicyEnforcer::new());

        let outcome = invoker
            .invoke(
                "call_1",
                &call("fetch", r#"{"url":"https://a.test"}"#),
                &CancellationToken::new(),
            )
            .await;

        assert!(!outcome.failed);
        assert_eq!(
            outcome.message,
            Message::tool("call_1", r#"{"fetched":"https://a.test"}"#)
        );
    }

    #[tokio::test]
    async fn test_malformed_arguments_become_tool_message() {
        let mut invoker = ToolInvoker::new(registry(), PolicyEnforcer::new());

        let outcome = invoker
            .invoke("call_1", &call("fetch", "{oops"), &CancellationToken::new())
            .await;

        assert!(outcome.failed);
        assert_eq!(outcome.message.tool_call_id(), Some("call_1"));
        assert!(
            outcome
                .message
                .content()
                .unwrap()
                .starts_with("invalid tool arguments:")
        );
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_tool_message() {
        let mut invoker = ToolInvoker::new(registry(), PolicyEnforcer::new());

        let outcome = invoker
            .invoke("call_2", &call("broken", "{}"), &CancellationToken::new())
            .await;

        assert!(outcome.failed);
        assert_eq!(outcome.message, Message::tool("call_2", "upstream exploded"));
    }

    #[tokio::test]
    async fn test_policy_denial_becomes_tool_message() {
        let mut enforcer = PolicyEnforcer::new();
        enforcer
            .add_before_policy("fetch", policy_fn(|_, _, _| PolicyVerdict::deny("blocked")))
            .unwrap();
        let mut invoker = ToolInvoker::new(registry(), enforcer);

        let outcome = invoker
            .invoke("call_3", &call("fetch", "{}"), &CancellationToken::new())
            .await;

        assert!(outcome.failed);
        assert_eq!(
            outcome.message,
            Message::tool("call_3", "Policy violation: blocked")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_tool_message() {
        let mut invoker = ToolInvoker::new(registry(), PolicyEnforcer::new())
            .with_timeout(Some(Duration::from_secs(5)));

        let outcome = invoker
            .invoke("call_4", &call("slow", "{}"), &CancellationToken::new())
            .await;

        assert!(outcome.failed);
        assert_eq!(
            outcome.message,
            Message::tool("call_4", "tool call timed out after 5s")
        );
    }

    #[tokio::test]
    async fn test_cancelled_scope_aborts_call() {
        let mut invoker = ToolInvoker::new(registry(), PolicyEnforcer::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = invoker
            .invoke("call_5", &call("slow", "{}"), &cancel)
            .await;

        assert!(outcome.failed);
        assert_eq!(outcome.message, Message::tool("call_5", "tool call cancelled"));
    }
}
