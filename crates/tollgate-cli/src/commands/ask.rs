//! `tollgate ask` command implementation.

use anyhow::Result;
use clap::Args;
use console::style;
use tollgate_core::{Config, Message};

use super::{ConnectionArgs, DEFAULT_SYSTEM_PROMPT, drive_turn, open_conversation, resume_turn};

/// Arguments for the `ask` command.
#[derive(Debug, Args)]
pub struct AskArgs {
    /// The question to ask.
    pub prompt: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

pub async fn run(args: &AskArgs, config: &Config) -> Result<()> {
    let session = args.connection.session.as_deref();
    let mut conversation =
        open_conversation(config, &args.connection, DEFAULT_SYSTEM_PROMPT).await?;

    let result = async {
        resume_turn(&mut conversation, session).await?;
        conversation.push_message(Message::user(args.prompt.as_str()))?;
        drive_turn(&mut conversation, session).await
    }
    .await;
    conversation.close().await;

    match result? {
        Some(text) => println!("{text}"),
        None => println!("{} The model returned no text", style("!").yellow().bold()),
    }
    Ok(())
}
