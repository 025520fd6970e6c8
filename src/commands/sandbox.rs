//! Sandbox management commands.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::time::Duration;

use crate::config::Config;
use crate::provision::Provisioner;
use crate::sandbox::Orchestrator;
use crate::transport::{connect_with_retry, ConnectPolicy};

/// Sandbox management actions.
#[derive(Subcommand, Debug)]
pub enum SandboxAction {
    /// List sandboxes created by boxrun
    List,

    /// Create the configured sandbox and start its agent
    Create,

    /// Delete the configured sandbox
    Delete {
        /// Sandbox name (default: from boxrun.toml)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show whether the sandbox and its agent are up
    Status,
}

/// Run sandbox management command.
pub async fn run(action: SandboxAction) -> Result<()> {
    let project_dir = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&project_dir)?;
    let provisioner = Provisioner::from_config(&config, &project_dir)?;

    match action {
        SandboxAction::List => list(provisioner.orchestrator(), &config.sandbox.name).await,
        SandboxAction::Create => {
            let session = provisioner.ensure(&config.sandbox.handle()).await?;
            let hello = session.client.hello();
            println!(
                "{} Sandbox {} ready (agent {}, root {})",
                "✓".green().bold(),
                config.sandbox.name.cyan(),
                hello.version,
                hello.root
            );
            Ok(())
        }
        SandboxAction::Delete { name } => {
            let name = name.unwrap_or_else(|| config.sandbox.name.clone());
            delete(provisioner.orchestrator(), &name).await
        }
        SandboxAction::Status => status(provisioner.orchestrator(), &config).await,
    }
}

async fn list(orchestrator: &dyn Orchestrator, configured: &str) -> Result<()> {
    let names = orchestrator
        .list()
        .await
        .context("Failed to list sandboxes")?;

    if names.is_empty() {
        println!("{} No sandboxes found.", "ℹ".blue());
        return Ok(());
    }
    for name in names {
        if name == configured {
            println!("  {} {}", name.cyan(), "(configured)".dimmed());
        } else {
            println!("  {name}");
        }
    }
    Ok(())
}

async fn delete(orchestrator: &dyn Orchestrator, name: &str) -> Result<()> {
    match orchestrator.delete(name).await {
        Ok(()) => {
            println!("{} Deleted sandbox {}", "✓".green().bold(), name.cyan());
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            println!("{} Sandbox {} does not exist.", "ℹ".blue(), name.cyan());
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to delete sandbox {name}")),
    }
}

async fn status(orchestrator: &dyn Orchestrator, config: &Config) -> Result<()> {
    let name = &config.sandbox.name;

    println!("\n{}", "━".repeat(50).dimmed());
    println!("{}", "   📦 Sandbox Status".yellow().bold());
    println!("{}", "━".repeat(50).dimmed());
    println!("  Name:       {}", name.cyan());
    println!("  Backend:    {}", orchestrator.name().cyan());
    println!("  Image:      {}", config.sandbox.image.cyan());

    let exists = orchestrator
        .exists(name)
        .await
        .with_context(|| format!("Failed to query sandbox {name}"))?;
    if !exists {
        println!("  Sandbox:    {}", "absent".red());
        println!("{}", "━".repeat(50).dimmed());
        println!("  Run {} to create it.", "boxrun sandbox create".green());
        return Ok(());
    }
    println!("  Sandbox:    {}", "present".green().bold());

    // One quick attempt: status never starts the agent.
    let tunnel = orchestrator
        .open_tunnel(name, config.agent.port)
        .await
        .with_context(|| format!("Failed to open tunnel to sandbox {name}"))?;
    let policy = ConnectPolicy {
        attempts: 1,
        interval: Duration::ZERO,
        attempt_timeout: Duration::from_millis(config.connect.attempt_timeout_ms.max(2000)),
        max_frame_bytes: config.agent.max_frame_bytes,
    };
    match connect_with_retry(tunnel.addr(), policy).await {
        Ok(client) => {
            let hello = client.hello();
            println!(
                "  Agent:      {} ({})",
                "running".green().bold(),
                hello.version.cyan()
            );
            println!("  Root:       {}", hello.root.cyan());
        }
        Err(_) => println!("  Agent:      {}", "not running".red()),
    }
    println!("{}", "━".repeat(50).dimmed());
    Ok(())
}
