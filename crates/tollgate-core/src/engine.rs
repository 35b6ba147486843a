//! The resumable turn engine.
//!
//! A [`Conversation`] owns the message log and drives one turn at a time
//! through three states:
//!
//! ```text
//!            push_message                    no tool calls
//!   Ready ───────────────▶ Pending ─────────────────────────▶ Ready
//!                           │   ▲
//!             tool calls    │   │ last call answered
//!                           ▼   │
//!                        InputWait { index } ──┐
//!                           ▲                  │ next call
//!                           └──────────────────┘
//! ```
//!
//! [`Conversation::step`] performs exactly one transition, so a caller can stop
//! between any two steps, take a [`ConversationSnapshot`], and resume later.
//! [`Conversation::run_turn`] repeats `step` until the turn is finished.
//!
//! Tool calls are answered sequentially in the order the model listed them.
//! Tool failures never abort a turn; completion failures always do, leaving
//! the log exactly as it was before the failed request.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    completion::{CompletionClient, CompletionRequest, CompletionResponse},
    error::EngineError,
    invoker::ToolInvoker,
    message::{Message, ToolCallRequest},
    policy::PolicyEnforcer,
    tool::{ToolBackend, ToolDefinition},
};

/// Tracing target for the conversation transcript.
pub const TRANSCRIPT_TARGET: &str = "tollgate::transcript";

/// Where the current turn stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnState {
    /// A completion request is due.
    Pending,
    /// Tool call `index` of the latest assistant message is due.
    InputWait { index: usize },
    /// The turn is complete and the conversation awaits a new message.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The call is not a function call.
    NotInvokable,
    /// A tool message for the call is already in the log.
    AlreadyAnswered,
}

/// What a single [`Conversation::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The model asked for `count` tool calls.
    ToolCallsRequested { count: usize },
    /// A tool call was answered. `failed` is set when the answer is an error.
    ToolAnswered { call_id: String, failed: bool },
    /// A tool call was passed over without appending a message.
    ToolSkipped { call_id: String, reason: SkipReason },
    /// The turn is complete.
    Finished,
}

/// The result of a completed turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnOutput<'a> {
    /// The last raw completion response, if any request has succeeded.
    pub response: Option<&'a CompletionResponse>,
    /// The full conversation log.
    pub messages: &'a [Message],
}

impl TurnOutput<'_> {
    /// Text of the final assistant message.
    pub fn final_text(&self) -> Option<&str> {
        self.messages
            .last()
            .and_then(Message::as_assistant)
            .and_then(|message| message.content.as_deref())
    }
}

/// Everything needed to resume a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub state: TurnState,
    #[serde(default)]
    pub last_response: Option<CompletionResponse>,
    /// Number of messages already written to the transcript.
    #[serde(default)]
    pub logged: usize,
}

/// Builder for [`Conversation`].
pub struct ConversationBuilder {
    client: Arc<dyn CompletionClient>,
    backend: Arc<dyn ToolBackend>,
    tools: Vec<ToolDefinition>,
    params: Map<String, Value>,
    enforcer: PolicyEnforcer,
    tool_timeout: Option<Duration>,
    snapshot: Option<ConversationSnapshot>,
    cancel: Option<CancellationToken>,
}

impl ConversationBuilder {
    /// Declares the tools sent with every completion request.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Provider parameters such as `model` or `temperature`.
    #[must_use]
    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn enforcer(mut self, enforcer: PolicyEnforcer) -> Self {
        self.enforcer = enforcer;
        self
    }

    #[must_use]
    pub fn tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Seeds the log with initial messages. The conversation starts pending.
    #[must_use]
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.snapshot = Some(ConversationSnapshot {
            messages,
            state: TurnState::Pending,
            last_response: None,
            logged: 0,
        });
        self
    }

    /// Resumes from a snapshot. Replaces any seeded messages.
    #[must_use]
    pub fn restore(mut self, snapshot: ConversationSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Uses `token` as the parent of all cancellation in the conversation.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Conversation {
        let snapshot = self.snapshot.unwrap_or(ConversationSnapshot {
            messages: Vec::new(),
            state: TurnState::Ready,
            last_response: None,
            logged: 0,
        });

        Conversation {
            client: self.client,
            invoker: ToolInvoker::new(self.backend, self.enforcer).with_timeout(self.tool_timeout),
            tools: self.tools,
            params: self.params,
            messages: snapshot.messages,
            state: snapshot.state,
            last_response: snapshot.last_response,
            logged: snapshot.logged,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

/// A policy-gated, tool-calling conversation.
pub struct Conversation {
    client: Arc<dyn CompletionClient>,
    invoker: ToolInvoker,
    tools: Vec<ToolDefinition>,
    params: Map<String, Value>,
    messages: Vec<Message>,
    state: TurnState,
    last_response: Option<CompletionResponse>,
    logged: usize,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("state", &self.state)
            .field("messages", &self.messages.len())
            .field("tools", &self.tools.len())
            .field("invoker", &self.invoker)
            .finish_non_exhaustive()
    }
}

impl Conversation {
    pub fn builder(
        client: Arc<dyn CompletionClient>,
        backend: Arc<dyn ToolBackend>,
    ) -> ConversationBuilder {
        ConversationBuilder {
            client,
            backend,
            tools: Vec::new(),
            params: Map::new(),
            enforcer: PolicyEnforcer::new(),
            tool_timeout: None,
            snapshot: None,
            cancel: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn last_response(&self) -> Option<&CompletionResponse> {
        self.last_response.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.state == TurnState::Ready
    }

    /// Token that cancels the conversation. In-flight tool calls observe a
    /// child of this token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The enforcer gating this conversation's tool calls.
    pub fn policies_mut(&mut self) -> &mut PolicyEnforcer {
        self.invoker.enforcer_mut()
    }

    /// Appends a system or user message and starts a new turn.
    ///
    /// Assistant and tool messages are only ever appended by the engine, and
    /// nothing may be appended while tool calls are outstanding.
    pub fn push_message(&mut self, message: Message) -> Result<(), EngineError> {
        if matches!(message, Message::Assistant(_) | Message::Tool { .. }) {
            return Err(EngineError::IllegalState(format!(
                "{} messages are appended by the engine",
                message.role()
            )));
        }
        if let TurnState::InputWait { index } = self.state {
            return Err(EngineError::IllegalState(format!(
                "cannot add a message while tool call {index} is outstanding"
            )));
        }
        self.messages.push(message);
        self.state = TurnState::Pending;
        Ok(())
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.messages.clone(),
            state: self.state,
            last_response: self.last_response.clone(),
            logged: self.logged,
        }
    }

    /// Performs one state transition.
    ///
    /// A pending completion request is abandoned with
    /// [`EngineError::Cancelled`] once the conversation is cancelled.
    pub async fn step(&mut self) -> Result<Step, EngineError> {
        match self.state {
            TurnState::Pending => self.request_completion().await,
            TurnState::InputWait { index } => self.answer_tool_call(index).await,
            TurnState::Ready => Err(EngineError::IllegalState(
                "turn is complete; push a message to start another".to_owned(),
            )),
        }
    }

    /// Steps until the turn is finished.
    ///
    /// Cancellation is checked before and during each completion request, so a
    /// cancelled conversation stops with [`EngineError::Cancelled`] and the log
    /// is left as it was.
    pub async fn run_turn(&mut self) -> Result<TurnOutput<'_>, EngineError> {
        loop {
            if self.state == TurnState::Pending && self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if self.step().await? == Step::Finished {
                break;
            }
        }
        Ok(TurnOutput {
            response: self.last_response.as_ref(),
            messages: &self.messages,
        })
    }

    /// Cancels outstanding work and closes the tool backend.
    pub async fn close(self) {
        self.cancel.cancel();
        self.invoker.close().await;
    }

    #[instrument(skip_all, fields(messages = self.messages.len()))]
    async fn request_completion(&mut self) -> Result<Step, EngineError> {
        let request = CompletionRequest {
            messages: &self.messages,
            tools: &self.tools,
            params: &self.params,
        };
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            response = self.client.complete(request) => response,
        };
        let response = response.map_err(|err| EngineError::from_completion(err, &self.tools))?;

        let Some(message) = response.message().cloned() else {
            warn!("Completion returned no message");
            self.last_response = Some(response);
            return Ok(self.finish());
        };

        let count = message.tool_calls().len();
        self.messages.push(Message::Assistant(message));
        self.last_response = Some(response);

        if count == 0 {
            return Ok(self.finish());
        }

        self.flush_transcript();
        self.state = TurnState::InputWait { index: 0 };
        info!(tool_calls = count, "Model requested tool calls");
        Ok(Step::ToolCallsRequested { count })
    }

    async fn answer_tool_call(&mut self, index: usize) -> Result<Step, EngineError> {
        let (origin, calls) = self.pending_calls()?;
        let total = calls.len();
        let Some(call) = calls.get(index).cloned() else {
            return Err(EngineError::IllegalState(format!(
                "tool call {index} does not exist; the assistant requested {total}"
            )));
        };

        let step = if self.is_answered(origin, &call) {
            debug!(call_id = %call.id, "Tool call already answered");
            Step::ToolSkipped {
                call_id: call.id,
                reason: SkipReason::AlreadyAnswered,
            }
        } else if let Some(function) = call.invokable() {
            let outcome = self.invoker.invoke(&call.id, function, &self.cancel).await;
            self.messages.push(outcome.message);
            self.flush_transcript();
            Step::ToolAnswered {
                call_id: call.id,
                failed: outcome.failed,
            }
        } else {
            warn!(call_id = %call.id, kind = %call.kind, "Skipping non-function tool call");
            Step::ToolSkipped {
                call_id: call.id,
                reason: SkipReason::NotInvokable,
            }
        };

        self.state = if index + 1 < total {
            TurnState::InputWait { index: index + 1 }
        } else {
            TurnState::Pending
        };
        Ok(step)
    }

    /// Finds the assistant message whose tool calls are being answered.
    fn pending_calls(&self) -> Result<(usize, &[ToolCallRequest]), EngineError> {
        let origin = self
            .messages
            .iter()
            .rposition(|message| matches!(message, Message::Assistant(_)))
            .ok_or_else(|| {
                EngineError::IllegalState("no assistant message awaiting tool results".to_owned())
            })?;
        if self.messages[origin + 1..]
            .iter()
            .any(|message| !matches!(message, Message::Tool { .. }))
        {
            return Err(EngineError::IllegalState(
                "only tool messages may follow the assistant message being answered".to_owned(),
            ));
        }
        let calls = self.messages[origin]
            .as_assistant()
            .map(|message| message.tool_calls())
            .unwrap_or_default();
        Ok((origin, calls))
    }

    fn is_answered(&self, origin: usize, call: &ToolCallRequest) -> bool {
        self.messages[origin + 1..]
            .iter()
            .any(|message| message.tool_call_id() == Some(call.id.as_str()))
    }

    fn finish(&mut self) -> Step {
        self.state = TurnState::Ready;
        self.flush_transcript();
        match self.messages.last().and_then(Message::as_assistant) {
            Some(message) => info!(
                target: TRANSCRIPT_TARGET,
                content = message.content.as_deref().unwrap_or_default(),
                "Final response"
            ),
            None => info!(target: TRANSCRIPT_TARGET, "Turn finished without a response"),
        }
        Step::Finished
    }

    /// Writes messages appended since the last flush to the transcript.
    fn flush_transcript(&mut self) {
        let fresh = self.messages.get(self.logged..).unwrap_or_default();
        for message in fresh {
            info!(
                target: TRANSCRIPT_TARGET,
                role = message.role(),
                content = message.content().unwrap_or_default(),
                tool_calls = message.as_assistant().map_or(0, |m| m.tool_calls().len()),
                "Message"
            );
        }
        self.logged = self.messages.len();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        completion::{ApiErrorDetail, CompletionError},
        message::AssistantMessage,
        policy::limits::HostCallLimit,
        schema_error::{INVALID_FUNCTION_PARAMETERS, INVALID_REQUEST_ERROR},
        tool::{ToolError, ToolRegistry},
    };

    /// Completion client that replays scripted responses and records requests.
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<CompletionResponse, CompletionError>>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<CompletionResponse, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::default(),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(
            &self,
            request: CompletionRequest<'_>,
        ) -> Result<CompletionResponse, CompletionError> {
            self.requests.lock().unwrap().push(request.messages.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Transport("script exhausted".to_owned())))
        }
    }

    /// Completion client whose requests never finish.
    struct StalledClient;

    #[async_trait]
    impl CompletionClient for StalledClient {
        async fn complete(
            &self,
            _request: CompletionRequest<'_>,
        ) -> Result<CompletionResponse, CompletionError> {
            std::future::pending().await
        }
    }

    fn text(content: &str) -> Result<CompletionResponse, CompletionError> {
        Ok(CompletionResponse::from_message(AssistantMessage::text(content)))
    }

    fn calls(calls: Vec<ToolCallRequest>) -> Result<CompletionResponse, CompletionError> {
        Ok(CompletionResponse::from_message(
            AssistantMessage::with_tool_calls(calls),
        ))
    }

    fn fetch_call(id: &str, url: &str) -> ToolCallRequest {
        ToolCallRequest::function(id, "mcpx_fetch", json!({ "url": url }).to_string())
    }

    fn backend(executions: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::function("mcpx_fetch", None, json!({ "type": "object" })),
                move |args| {
                    let executions = Arc::clone(&executions);
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({ "body": format!("page at {}", args["url"].as_str().unwrap_or("")) }))
                    }
                },
            )
            .unwrap();
        registry
            .register(ToolDefinition::function("mcpx_fail", None, json!({})), |_| async {
                Err(ToolError::Failed("boom".to_owned()))
            })
            .unwrap();
        registry
            .register(ToolDefinition::function("mcpx_slow", None, json!({})), |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("late"))
            })
            .unwrap();
        Arc::new(registry)
    }

    fn conversation(client: Arc<ScriptedClient>, executions: Arc<AtomicUsize>) -> Conversation {
        let backend = backend(executions);
        Conversation::builder(client, Arc::clone(&backend) as Arc<dyn ToolBackend>)
            .tools(backend.definitions())
            .build()
    }

    #[tokio::test]
    async fn test_plain_answer_finishes_in_one_request() {
        let client = ScriptedClient::new(vec![text("Hello there")]);
        let mut conversation = conversation(Arc::clone(&client), Arc::default());
        conversation.push_message(Message::user("hi")).unwrap();

        let output = conversation.run_turn().await.unwrap();

        assert_eq!(output.messages.len(), 2);
        assert_eq!(output.final_text(), Some("Hello there"));
        assert!(output.response.is_some());
        assert_eq!(client.request_count(), 1);
        assert_eq!(conversation.state(), TurnState::Ready);
    }

    #[tokio::test]
    async fn test_tool_round_trip_answers_every_call_in_order() {
        let client = ScriptedClient::new(vec![
            calls(vec![
                fetch_call("call_a", "https://a.test"),
                fetch_call("call_b", "https://b.test"),
            ]),
            text("done"),
        ]);
        let executions = Arc::new(AtomicUsize::new(0));
        let mut conversation = conversation(Arc::clone(&client), Arc::clone(&executions));
        conversation.push_message(Message::user("fetch both")).unwrap();

        let output = conversation.run_turn().await.unwrap();

        let roles: Vec<_> = output.messages.iter().map(Message::role).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "tool", "assistant"]);
        assert_eq!(output.messages[2].tool_call_id(), Some("call_a"));
        assert_eq!(output.messages[3].tool_call_id(), Some("call_b"));
        assert_eq!(
            output.messages[2].content(),
            Some(r#"{"body":"page at https://a.test"}"#)
        );
        assert_eq!(output.final_text(), Some("done"));
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn test_step_walks_through_each_state() {
        let client = ScriptedClient::new(vec![
            calls(vec![fetch_call("call_a", "https://a.test")]),
            text("done"),
        ]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("go")).unwrap();

        assert_eq!(
            conversation.step().await.unwrap(),
            Step::ToolCallsRequested { count: 1 }
        );
        assert_eq!(conversation.state(), TurnState::InputWait { index: 0 });
        assert_eq!(
            conversation.step().await.unwrap(),
            Step::ToolAnswered {
                call_id: "call_a".to_owned(),
                failed: false
            }
        );
        assert_eq!(conversation.state(), TurnState::Pending);
        assert_eq!(conversation.step().await.unwrap(), Step::Finished);
        assert!(conversation.is_finished());
    }

    #[tokio::test]
    async fn test_tool_failure_is_reported_to_model() {
        let client = ScriptedClient::new(vec![
            calls(vec![ToolCallRequest::function("call_x", "mcpx_fail", "{}")]),
            text("sorry"),
        ]);
        let mut conversation = conversation(Arc::clone(&client), Arc::default());
        conversation.push_message(Message::user("try")).unwrap();

        let output = conversation.run_turn().await.unwrap();

        assert_eq!(output.messages[2], Message::tool("call_x", "boom"));
        assert_eq!(output.final_text(), Some("sorry"));
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[1].last(), Some(&Message::tool("call_x", "boom")));
    }

    #[tokio::test]
    async fn test_failed_call_does_not_stop_the_rest_of_the_batch() {
        let client = ScriptedClient::new(vec![
            calls(vec![
                ToolCallRequest::function("call_1", "mcpx_fail", "{}"),
                fetch_call("call_2", "https://a.test"),
            ]),
            text("partial"),
        ]);
        let executions = Arc::new(AtomicUsize::new(0));
        let mut conversation = conversation(Arc::clone(&client), Arc::clone(&executions));
        conversation.push_message(Message::user("both")).unwrap();

        let output = conversation.run_turn().await.unwrap();

        let expected = [
            Message::tool("call_1", "boom"),
            Message::tool("call_2", r#"{"body":"page at https://a.test"}"#),
        ];
        assert_eq!(output.messages[2..4], expected);
        assert_eq!(output.final_text(), Some("partial"));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[1][2..], expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_during_a_tool_call_answers_it_as_cancelled() {
        let client = ScriptedClient::new(vec![calls(vec![ToolCallRequest::function(
            "call_s", "mcpx_slow", "{}",
        )])]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("wait")).unwrap();
        conversation.step().await.unwrap();
        let cancel = conversation.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let step = conversation.step().await.unwrap();

        assert_eq!(
            step,
            Step::ToolAnswered {
                call_id: "call_s".to_owned(),
                failed: true
            }
        );
        assert_eq!(conversation.state(), TurnState::Pending);
        assert_eq!(
            conversation.messages().last(),
            Some(&Message::tool("call_s", "tool call cancelled"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_abandons_an_outstanding_completion() {
        let mut conversation =
            Conversation::builder(Arc::new(StalledClient), backend(Arc::default())).build();
        conversation.push_message(Message::user("hello?")).unwrap();
        let cancel = conversation.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = conversation.step().await.unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.state(), TurnState::Pending);
    }

    #[tokio::test]
    async fn test_host_limit_denies_fourth_fetch_but_turn_completes() {
        let client = ScriptedClient::new(vec![
            calls(
                (1..=4)
                    .map(|n| fetch_call(&format!("call_{n}"), &format!("https://example.com/{n}")))
                    .collect(),
            ),
            text("summary"),
        ]);
        let executions = Arc::new(AtomicUsize::new(0));
        let backend = backend(Arc::clone(&executions));
        let mut enforcer = PolicyEnforcer::new();
        HostCallLimit::new("fetch", 3).install(&mut enforcer).unwrap();
        let mut conversation = Conversation::builder(client, backend.clone())
            .tools(backend.definitions())
            .enforcer(enforcer)
            .build();
        conversation.push_message(Message::user("crawl")).unwrap();

        let output = conversation.run_turn().await.unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert_eq!(
            output.messages[5],
            Message::tool(
                "call_4",
                "Policy violation: The domain example.com was called too many times: 3"
            )
        );
        assert_eq!(output.final_text(), Some("summary"));
    }

    #[tokio::test]
    async fn test_schema_error_aborts_turn_without_partial_output() {
        let error = CompletionError::Api {
            status: Some(400),
            detail: ApiErrorDetail {
                message: "Invalid schema".to_owned(),
                kind: Some(INVALID_REQUEST_ERROR.to_owned()),
                param: Some("tools[1].function.parameters".to_owned()),
                code: Some(INVALID_FUNCTION_PARAMETERS.to_owned()),
            },
        };
        let client = ScriptedClient::new(vec![Err(error)]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("hi")).unwrap();

        let err = conversation.run_turn().await.unwrap_err();

        match err {
            EngineError::ToolSchema(schema_error) => {
                assert_eq!(schema_error.tool_name(), Some("mcpx_fail"));
            }
            other => panic!("expected schema error, got {other:?}"),
        }
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.state(), TurnState::Pending);
    }

    #[tokio::test]
    async fn test_other_completion_errors_pass_through() {
        let client = ScriptedClient::new(vec![Err(CompletionError::Transport(
            "reset".to_owned(),
        ))]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("hi")).unwrap();

        let err = conversation.run_turn().await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Completion(CompletionError::Transport(ref msg)) if msg == "reset"
        ));
    }

    #[tokio::test]
    async fn test_empty_response_finishes_turn() {
        let client = ScriptedClient::new(vec![Ok(CompletionResponse::default())]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("hi")).unwrap();

        let output = conversation.run_turn().await.unwrap();

        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.final_text(), None);
        assert!(output.response.is_some());
    }

    #[tokio::test]
    async fn test_empty_tool_call_list_means_ready() {
        let client = ScriptedClient::new(vec![calls(Vec::new())]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("hi")).unwrap();

        assert_eq!(conversation.step().await.unwrap(), Step::Finished);
        assert_eq!(conversation.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_non_function_calls_are_skipped() {
        let mut custom = ToolCallRequest::function("call_c", "grammar", "");
        custom.kind = "custom".to_owned();
        custom.function = None;
        let client = ScriptedClient::new(vec![
            calls(vec![custom, fetch_call("call_f", "https://a.test")]),
            text("ok"),
        ]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("go")).unwrap();
        conversation.step().await.unwrap();

        assert_eq!(
            conversation.step().await.unwrap(),
            Step::ToolSkipped {
                call_id: "call_c".to_owned(),
                reason: SkipReason::NotInvokable
            }
        );
        let output = conversation.run_turn().await.unwrap();
        let roles: Vec<_> = output.messages.iter().map(Message::role).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "assistant"]);
    }

    #[tokio::test]
    async fn test_push_message_rejected_while_calls_outstanding() {
        let client = ScriptedClient::new(vec![calls(vec![fetch_call("call_a", "https://a.test")])]);
        let mut conversation = conversation(client, Arc::default());
        conversation.push_message(Message::user("go")).unwrap();
        conversation.step().await.unwrap();

        let err = conversation.push_message(Message::user("again")).unwrap_err();

        assert!(matches!(err, EngineError::IllegalState(_)));
        assert_eq!(conversation.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_push_message_rejects_engine_only_roles() {
        let client = ScriptedClient::new(vec![text("one")]);
        let mut conversation = conversation(Arc::clone(&client), Arc::default());
        conversation.push_message(Message::user("first")).unwrap();
        conversation.run_turn().await.unwrap();

        let forged_tool = conversation.push_message(Message::tool("bogus_id", "forged"));
        let forged_reply =
            conversation.push_message(Message::Assistant(AssistantMessage::text("forged")));

        assert!(matches!(forged_tool, Err(EngineError::IllegalState(_))));
        assert!(matches!(forged_reply, Err(EngineError::IllegalState(_))));
        assert_eq!(conversation.messages().len(), 2);
        assert_eq!(conversation.state(), TurnState::Ready);
        conversation.push_message(Message::system("be brief")).unwrap();
        assert_eq!(conversation.state(), TurnState::Pending);
    }

    #[tokio::test]
    async fn test_step_when_ready_is_illegal() {
        let client = ScriptedClient::new(vec![]);
        let mut conversation = conversation(Arc::clone(&client), Arc::default());

        let err = conversation.step().await.unwrap_err();

        assert!(matches!(err, EngineError::IllegalState(_)));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_push_after_ready_starts_new_turn() {
        let client = ScriptedClient::new(vec![text("one"), text("two")]);
        let mut conversation = conversation(Arc::clone(&client), Arc::default());
        conversation.push_message(Message::user("first")).unwrap();
        conversation.run_turn().await.unwrap();

        conversation.push_message(Message::user("second")).unwrap();
        let output = conversation.run_turn().await.unwrap();

        assert_eq!(output.final_text(), Some("two"));
        assert_eq!(output.messages.len(), 4);
        assert_eq!(client.requests.lock().unwrap()[1].len(), 3);
    }

    #[tokio::test]
    async fn test_resume_from_snapshot_skips_answered_calls() {
        let executions = Arc::new(AtomicUsize::new(0));
        let first_client = ScriptedClient::new(vec![calls(vec![
            fetch_call("call_a", "https://a.test"),
            fetch_call("call_b", "https://b.test"),
        ])]);
        let mut original = conversation(first_client, Arc::clone(&executions));
        original.push_message(Message::user("go")).unwrap();
        original.step().await.unwrap();
        original.step().await.unwrap();

        let mut snapshot = original.snapshot();
        assert_eq!(snapshot.state, TurnState::InputWait { index: 1 });
        // Rewind as if the process stopped before recording progress.
        snapshot.state = TurnState::InputWait { index: 0 };
        let snapshot: ConversationSnapshot =
            serde_json::from_value(serde_json::to_value(&snapshot).unwrap()).unwrap();

        let second_client = ScriptedClient::new(vec![text("resumed")]);
        let backend = backend(Arc::clone(&executions));
        let mut resumed = Conversation::builder(second_client, backend.clone())
            .tools(backend.definitions())
            .restore(snapshot)
            .build();

        assert_eq!(
            resumed.step().await.unwrap(),
            Step::ToolSkipped {
                call_id: "call_a".to_owned(),
                reason: SkipReason::AlreadyAnswered
            }
        );
        let output = resumed.run_turn().await.unwrap();

        assert_eq!(output.final_text(), Some("resumed"));
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        let tool_ids: Vec<_> = output
            .messages
            .iter()
            .filter_map(Message::tool_call_id)
            .collect();
        assert_eq!(tool_ids, ["call_a", "call_b"]);
    }

    #[tokio::test]
    async fn test_cancelled_conversation_stops_before_next_request() {
        let client = ScriptedClient::new(vec![text("never")]);
        let mut conversation = conversation(Arc::clone(&client), Arc::default());
        conversation.push_message(Message::user("hi")).unwrap();
        conversation.cancellation_token().cancel();

        let err = conversation.run_turn().await.unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_seeded_messages_start_pending() {
        let client = ScriptedClient::new(vec![text("hi")]);
        let backend = backend(Arc::default());
        let mut conversation = Conversation::builder(client, backend)
            .messages(vec![Message::system("be brief"), Message::user("hello")])
            .build();

        assert_eq!(conversation.state(), TurnState::Pending);
        let output = conversation.run_turn().await.unwrap();
        assert_eq!(output.messages.len(), 3);
    }
}
