//! Core of the tollgate tool-calling conversation engine.
//!
//! This crate drives conversations between a user, a chat-completion model and
//! a set of tools, with every tool call gated by per-tool policies.
//!
//! # Key Components
//!
//! - **Conversation**: [`Conversation`] is a resumable state machine that
//!   alternates completion requests and tool execution until the model
//!   produces a final answer
//! - **Policies**: [`PolicyEnforcer`] runs before/after checks around each
//!   tool call and keeps shared [`PolicyContext`] state
//! - **Tool execution**: [`ToolInvoker`] turns every tool call, successful or
//!   not, into a tool message the model can read
//! - **Error classification**: [`ToolSchemaError`] pinpoints the declared tool
//!   whose parameter schema the provider rejected
//!
//! Completion providers and tool backends plug in through the
//! [`CompletionClient`] and [`ToolBackend`] traits.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tollgate_core::{Conversation, Message, ToolRegistry};
//!
//! # async fn example(client: Arc<dyn tollgate_core::CompletionClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let tools = Arc::new(ToolRegistry::new());
//! let mut conversation = Conversation::builder(client, tools).build();
//! conversation.push_message(Message::user("What's new on example.com?"))?;
//! let output = conversation.run_turn().await?;
//! println!("{}", output.final_text().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod completion;
pub mod config;
mod engine;
mod error;
pub mod invoker;
pub mod message;
pub mod policy;
pub mod schema_error;
pub mod tool;

pub use completion::{
    ApiErrorDetail, CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
};
pub use config::{Config, ConfigError};
pub use engine::{
    Conversation, ConversationBuilder, ConversationSnapshot, SkipReason, Step, TRANSCRIPT_TARGET,
    TurnOutput, TurnState,
};
pub use error::EngineError;
pub use invoker::{ToolCallError, ToolInvocation, ToolInvoker, ToolOutcome};
pub use message::{AssistantMessage, FunctionCall, Message, ToolCallRequest};
pub use policy::{Policy, PolicyContext, PolicyEnforcer, PolicyError, PolicyVerdict};
pub use schema_error::ToolSchemaError;
pub use tool::{RegistryError, ToolBackend, ToolDefinition, ToolError, ToolRegistry};
