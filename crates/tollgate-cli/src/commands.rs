//! CLI command implementations for `tollgate`.
//!
//! - **`chat`**: Interactive conversation that keeps going until `exit`
//! - **`ask`**: One turn for a single prompt
//! - **`tools`**: Show what the model will be offered
//!
//! Each command module exports an `*Args` struct and an async `run` function.
//! This module holds the setup they share: connecting the completion client,
//! the tool backend and the policies described by the config file.

pub mod ask;
pub mod chat;
pub mod tools;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use serde_json::Value;
use tollgate_core::{
    Config, Conversation, ConversationSnapshot, EngineError, Message, SkipReason, Step,
    ToolBackend, ToolDefinition, ToolRegistry, TurnState,
};
use tollgate_mcp::McpToolBackend;
use tollgate_openai::OpenAiClient;

/// System prompt for new conversations: an agent that works through tools
/// on its own instead of asking the user.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful AI assistant with access to various external tools and APIs. Your goal is to \
complete tasks thoroughly and autonomously by making full use of these tools. Here are your core \
operating principles:

1. Take initiative - Don't wait for user permission to use tools. If a tool would help complete \
the task, use it immediately.
2. Chain multiple tools together - Many tasks require multiple tool calls in sequence. Plan out \
and execute the full chain of calls needed to achieve the goal.
3. Handle errors gracefully - If a tool call fails, try alternative approaches or tools rather \
than asking the user what to do.
4. Make reasonable assumptions - When tool calls require parameters, use your best judgment to \
provide appropriate values rather than asking the user.
5. Show your work - After completing tool calls, explain what you did and show relevant results, \
but focus on the final outcome the user wanted.
6. Be thorough - Use tools repeatedly as needed until you're confident you've fully completed the \
task. Don't stop at partial solutions.

Your responses should focus on results rather than asking questions. Only ask the user for \
clarification if the task itself is unclear or impossible with the tools available.";

/// Connection flags shared by `chat` and `ask`.
#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Model to use instead of the configured one.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Save the conversation to this file after every step and resume from it
    /// when it exists.
    #[arg(short, long)]
    pub session: Option<PathBuf>,

    /// Do not connect to the configured MCP server.
    #[arg(long)]
    pub no_mcp: bool,
}

/// Connects the tool backend and returns it with the tools to declare.
pub async fn connect_tools(
    config: &Config,
    no_mcp: bool,
) -> Result<(Arc<dyn ToolBackend>, Vec<ToolDefinition>)> {
    if no_mcp || config.mcp.url.is_none() {
        return Ok((Arc::new(ToolRegistry::new()), Vec::new()));
    }

    let backend = McpToolBackend::connect(&config.mcp)
        .await
        .context("failed to connect to MCP server")?;
    let tools = backend
        .list_tools(&config.tools.exclude)
        .await
        .context("failed to list MCP tools")?;
    Ok((Arc::new(backend), tools))
}

/// Builds a conversation from config, restoring the session file if present.
pub async fn open_conversation(
    config: &Config,
    args: &ConnectionArgs,
    system_prompt: &str,
) -> Result<Conversation> {
    let client = OpenAiClient::from_settings(&config.openai)
        .context("failed to configure completion client")?;
    let (backend, tools) = connect_tools(config, args.no_mcp).await?;
    let enforcer = config
        .policy
        .enforcer()
        .context("invalid policy configuration")?;

    let mut params = config.openai.request_params();
    if let Some(model) = &args.model {
        params.insert("model".to_owned(), Value::from(model.clone()));
    }

    let builder = Conversation::builder(Arc::new(client), backend)
        .tools(tools)
        .params(params)
        .enforcer(enforcer)
        .tool_timeout(config.tools.timeout());

    let snapshot = args.session.as_deref().map(load_snapshot).transpose()?;
    let builder = if let Some(Some(snapshot)) = snapshot {
        builder.restore(snapshot)
    } else {
        builder.messages(vec![Message::system(system_prompt)])
    };

    let conversation = builder.build();
    let cancel = conversation.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    Ok(conversation)
}

/// Whether a restored conversation stopped in the middle of a turn.
pub fn needs_resume(conversation: &Conversation) -> bool {
    match conversation.state() {
        TurnState::Ready => false,
        TurnState::InputWait { .. } => true,
        TurnState::Pending => !matches!(
            conversation.messages().last(),
            None | Some(Message::System { .. })
        ),
    }
}

/// Finishes a turn left incomplete by an earlier run.
pub async fn resume_turn(conversation: &mut Conversation, session: Option<&Path>) -> Result<()> {
    if !needs_resume(conversation) {
        return Ok(());
    }
    println!("{} Resuming interrupted turn", style("→").cyan());
    if let Some(text) = drive_turn(conversation, session).await? {
        println!("{text}");
    }
    Ok(())
}

/// Steps through a turn, reporting progress, and returns the final answer.
///
/// Ctrl-C cancels the conversation: an outstanding completion request is
/// abandoned and a running tool call is answered as cancelled.
pub async fn drive_turn(
    conversation: &mut Conversation,
    session: Option<&Path>,
) -> Result<Option<String>> {
    loop {
        if conversation.state() == TurnState::Pending
            && conversation.cancellation_token().is_cancelled()
        {
            return Err(EngineError::Cancelled.into());
        }

        let step = conversation.step().await?;
        if let Some(path) = session {
            save_snapshot(path, &conversation.snapshot())?;
        }

        match step {
            Step::ToolCallsRequested { count } => {
                println!(
                    "{} Model requested {} tool call(s)",
                    style("→").cyan(),
                    style(count).bold()
                );
            }
            Step::ToolAnswered { call_id, failed } => {
                let tool = tool_name(conversation, &call_id).unwrap_or("tool");
                if failed {
                    println!("  {} {tool} ({call_id})", style("✗").red().bold());
                } else {
                    println!("  {} {tool} ({call_id})", style("✓").green().bold());
                }
            }
            Step::ToolSkipped { call_id, reason } => {
                let why = match reason {
                    SkipReason::NotInvokable => "not a function call",
                    SkipReason::AlreadyAnswered => "already answered",
                };
                println!("  {} {call_id}: {why}", style("?").yellow().bold());
            }
            Step::Finished => break,
        }
    }

    Ok(conversation
        .messages()
        .last()
        .and_then(Message::as_assistant)
        .and_then(|message| message.content.clone()))
}

fn tool_name<'a>(conversation: &'a Conversation, call_id: &str) -> Option<&'a str> {
    conversation
        .messages()
        .iter()
        .rev()
        .filter_map(Message::as_assistant)
        .flat_map(|message| message.tool_calls())
        .find(|call| call.id == call_id)
        .and_then(|call| call.function.as_ref())
        .map(|function| function.name.as_str())
}

/// Reads a snapshot, returning `None` when the file does not exist.
pub fn load_snapshot(path: &Path) -> Result<Option<ConversationSnapshot>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read session: {}", path.display()));
        }
    };
    let snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("invalid session file: {}", path.display()))?;
    Ok(Some(snapshot))
}

pub fn save_snapshot(path: &Path, snapshot: &ConversationSnapshot) -> Result<()> {
    let contents = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, contents)
        .with_context(|| format!("failed to write session: {}", path.display()))
}
