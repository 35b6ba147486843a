//! Policy-gated chat with MCP tools.
//!
//! Usage:
//! ```bash
//! tollgate chat                      # Interactive session
//! tollgate chat --session chat.json  # Resumable session
//! tollgate ask "What changed today?" # Single turn
//! tollgate tools                     # List tools offered to the model
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "tollgate", author, version, about)]
struct Cli {
    /// Config file. Defaults to `TOLLGATE_CONFIG_PATH`, then
    /// `~/.config/tollgate/config.toml`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log engine activity, including the conversation transcript.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive chat session
    Chat(commands::chat::ChatArgs),

    /// Run a single turn and print the answer
    Ask(commands::ask::AskArgs),

    /// List the tools offered to the model
    Tools(commands::tools::ToolsArgs),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat(_) => f.debug_tuple("Chat").finish(),
            Self::Ask(_) => f.debug_tuple("Ask").finish(),
            Self::Tools(_) => f.debug_tuple("Tools").finish(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(level.parse().context("failed to parse log directive")?),
        )
        .init();

    let config = tollgate_core::Config::resolve(cli.config.as_deref())
        .context("failed to load configuration")?;

    match &cli.command {
        Command::Chat(args) => commands::chat::run(args, &config).await,
        Command::Ask(args) => commands::ask::run(args, &config).await,
        Command::Tools(args) => commands::tools::run(args, &config).await,
    }
}
