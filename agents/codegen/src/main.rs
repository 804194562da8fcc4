mod agent;
mod config;
mod executor;
mod opencode;
mod pipeline;
mod stream;
mod summary;
mod tools;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use taskrelay::{link, logging, process, Link, LinkConfig};

use agent::CodegenAgent;
use config::CodegenConfig;

#[derive(Parser)]
#[command(
    name = "codegen-agent",
    about = "Runs coding CLIs for tasks assigned by the orchestration server",
    version
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agent.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config = CodegenConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    let agent_id = link::new_agent_id("agent");
    info!(
        %agent_id,
        name = %config.agent_name,
        server = %config.server_url,
        workspaces = ?config.workspaces,
        max_concurrent = config.max_concurrent,
        auto_deploy = config.deploy.is_some(),
        "codegen agent starting"
    );

    let link = Arc::new(Link::new(LinkConfig::new(
        config.server_url.clone(),
        config.auth_token.clone(),
    )));
    let agent = Arc::new(CodegenAgent::new(agent_id, config));

    {
        let link = link.clone();
        tokio::spawn(async move {
            process::shutdown_signal().await;
            link.stop();
        });
    }

    link.run(agent).await?;
    info!("codegen agent stopped");
    Ok(())
}
