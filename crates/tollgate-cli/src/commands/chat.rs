//! `tollgate chat` command implementation.

use std::{io::Write, path::Path};

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tollgate_core::{Config, Conversation, Message};
use tracing::info;

use super::{ConnectionArgs, DEFAULT_SYSTEM_PROMPT, drive_turn, open_conversation, resume_turn};

/// Arguments for the `chat` command.
#[derive(Debug, Args)]
pub struct ChatArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// System prompt for a new conversation. Ignored when resuming a session.
    #[arg(long)]
    pub system: Option<String>,
}

pub async fn run(args: &ChatArgs, config: &Config) -> Result<()> {
    let system = args.system.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let mut conversation = open_conversation(config, &args.connection, system).await?;
    info!(
        tools = conversation.tools().len(),
        messages = conversation.messages().len(),
        "Conversation ready"
    );

    println!(
        "{} Chatting with {} tool(s). Type {} to quit.",
        style("→").cyan(),
        style(conversation.tools().len()).bold(),
        style("exit").bold()
    );

    let result = repl(&mut conversation, args.connection.session.as_deref()).await;
    conversation.close().await;
    result
}

async fn repl(conversation: &mut Conversation, session: Option<&Path>) -> Result<()> {
    resume_turn(conversation, session).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", style(">").green().bold());
        std::io::stdout().flush().context("failed to flush stdout")?;

        let line = tokio::select! {
            () = conversation.cancellation_token().cancelled() => None,
            line = lines.next_line() => line.context("failed to read input")?,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" {
            break;
        }

        conversation.push_message(Message::user(input))?;
        if let Some(text) = drive_turn(conversation, session).await? {
            println!("{text}");
        }
    }

    println!();
    Ok(())
}
