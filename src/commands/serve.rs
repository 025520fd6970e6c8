//! The in-sandbox agent process.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::server::{self, Agent, Workspace};

/// Options of `boxrun serve`.
#[derive(Debug, Clone)]
pub(crate) struct ServeOptions {
    pub root: PathBuf,
    pub bind: IpAddr,
    pub port: u16,
    pub state_dir: PathBuf,
    /// Shell-style command prefix, split with `shell-words`.
    pub launcher: Option<String>,
    pub max_frame_bytes: usize,
}

pub(crate) async fn run(options: ServeOptions) -> Result<()> {
    let launcher = parse_launcher(options.launcher.as_deref())?;
    let workspace = Workspace::open(&options.root, launcher)
        .with_context(|| format!("Failed to open sandbox root {}", options.root.display()))?;
    let agent = Arc::new(Agent::new(
        workspace,
        options.state_dir,
        options.max_frame_bytes,
    ));

    let listener = TcpListener::bind((options.bind, options.port))
        .await
        .with_context(|| format!("Failed to listen on {}:{}", options.bind, options.port))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            trigger.cancel();
        }
    });

    server::serve(listener, agent, shutdown).await
}

fn parse_launcher(launcher: Option<&str>) -> Result<Vec<String>> {
    match launcher {
        Some(line) => shell_words::split(line).context("Invalid --launcher"),
        None => Ok(Vec::new()),
    }
}
