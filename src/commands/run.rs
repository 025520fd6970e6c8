//! Run a command in the sandbox.
//!
//! Provision → lease → push → run → reconcile → print. The remote exit code
//! becomes the process exit code.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch;
use crate::protocol::{CollectSpec, TaskInvocation, TaskResult};
use crate::provision::Provisioner;
use crate::reconcile;
use crate::sync;
use crate::transport::{AgentClient, TransportError};

/// Options of `boxrun run`.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub root: Option<PathBuf>,
    pub collect: Vec<String>,
    pub modified_only: bool,
    pub argv: Vec<String>,
}

impl RunOptions {
    /// Explicit `--collect`/`--modified-only` flags win over config presets.
    fn collect_spec(&self, config: &Config) -> CollectSpec {
        if self.collect.is_empty() && !self.modified_only {
            return config.collect_for(&self.argv);
        }
        CollectSpec {
            patterns: self.collect.clone(),
            modified_only: self.modified_only,
        }
    }
}

pub(crate) async fn run(options: RunOptions) -> Result<u8> {
    let root = match &options.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("Project root {} does not exist", root.display()))?;
    let config = Config::load(&root)?;
    let collect = options.collect_spec(&config);

    let provisioner = Provisioner::from_config(&config, &root)?;

    let handle = config.sandbox.handle();
    let mut session = provisioner.ensure(&handle).await?;

    let cancel = dispatch::cancel_on_ctrl_c();
    let outcome = execute(
        &mut session.client,
        &root,
        &config.sync.exclude,
        options.argv,
        collect,
        &cancel,
    )
    .await;

    let result = match outcome {
        Ok(result) => result,
        Err(e) if is_cancelled(&e) => {
            warn!("Task cancelled");
            return Ok(dispatch::INTERRUPTED_EXIT);
        }
        Err(e) => return Err(e),
    };

    print_output(&result)?;
    Ok(exit_status(result.exit_code))
}

/// Leases the sandbox, pushes `root`, runs `argv` and reconciles the
/// returned files into `root`.
pub(crate) async fn execute(
    client: &mut AgentClient,
    root: &Path,
    exclude: &[String],
    argv: Vec<String>,
    collect: CollectSpec,
    cancel: &CancellationToken,
) -> Result<TaskResult> {
    if argv.is_empty() {
        bail!("No command given");
    }
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled.into());
    }

    let holder = holder_name();
    let grant = match client.acquire_lease(&holder).await {
        Ok(grant) => grant,
        Err(e) if e.is_lease_held() => bail!("Sandbox is busy: {e}"),
        Err(e) => return Err(e).context("Failed to acquire sandbox lease"),
    };

    if cancel.is_cancelled() {
        return Err(abandon(client, &grant.token).await);
    }
    sync::push(root, exclude, client, &grant.token)
        .await
        .context("Failed to sync project into sandbox")?;

    if cancel.is_cancelled() {
        return Err(abandon(client, &grant.token).await);
    }
    let invocation = TaskInvocation {
        argv,
        collect,
        lease: grant.token.clone(),
    };
    let result = dispatch::run(client, &invocation, cancel).await?;

    let written = reconcile::apply(root, &result.changed_files)
        .context("Failed to reconcile changed files")?;
    if written > 0 {
        info!("Updated {} local files", written);
    }

    if let Err(e) = client.release_lease(&grant.token).await {
        warn!("Failed to release sandbox lease: {}", e);
    }
    Ok(result)
}

/// Gives up before the task is sent, releasing the lease.
async fn abandon(client: &mut AgentClient, token: &str) -> anyhow::Error {
    if let Err(e) = client.release_lease(token).await {
        warn!("Failed to release sandbox lease: {}", e);
    }
    TransportError::Cancelled.into()
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransportError>()
        .is_some_and(TransportError::is_cancelled)
}

/// Identifies this client in lease errors shown to other users.
fn holder_name() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host} (pid {})", std::process::id())
}

fn print_output(result: &TaskResult) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&result.stdout)
        .and_then(|()| stdout.flush())
        .context("Failed to write task stdout")?;

    let mut stderr = std::io::stderr().lock();
    stderr
        .write_all(&result.stderr)
        .and_then(|()| stderr.flush())
        .context("Failed to write task stderr")?;
    Ok(())
}

/// Maps a remote exit code onto a process exit status.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
