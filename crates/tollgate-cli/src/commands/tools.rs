//! `tollgate tools` command implementation.

use anyhow::Result;
use clap::Args;
use console::style;
use tollgate_core::Config;

use super::connect_tools;

/// Arguments for the `tools` command.
#[derive(Debug, Args)]
pub struct ToolsArgs {
    /// Print the tool declarations as JSON.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: &ToolsArgs, config: &Config) -> Result<()> {
    let (backend, tools) = connect_tools(config, false).await?;
    backend.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    if tools.is_empty() {
        println!("{} No tools available", style("!").yellow().bold());
        return Ok(());
    }

    println!("{} {} tool(s)", style("→").cyan(), style(tools.len()).bold());
    for tool in &tools {
        let description = tool.function.description.as_deref().unwrap_or("");
        println!("  {} {description}", style(tool.name()).bold());
    }
    Ok(())
}
