//! Sends a task to the agent and waits for its result.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{TaskInvocation, TaskResult};
use crate::transport::AgentClient;

/// Runs `invocation` remotely. There is no deadline; `cancel` stops the task.
pub(crate) async fn run(
    client: &mut AgentClient,
    invocation: &TaskInvocation,
    cancel: &CancellationToken,
) -> Result<TaskResult> {
    let command = shell_words::join(&invocation.argv);
    info!("Running `{}` in sandbox", command);
    if invocation.collect.is_empty() {
        debug!("No files requested back");
    }

    let result = client
        .run_task(invocation, cancel)
        .await
        .with_context(|| format!("Task `{command}` failed"))?;

    info!(
        "`{}` exited with {} ({} changed files)",
        command,
        result.exit_code,
        result.changed_files.len()
    );
    Ok(result)
}

/// A token cancelled on the first Ctrl-C. A second Ctrl-C exits at once.
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, cancelling remote task (Ctrl-C again to quit)");
        trigger.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted twice, exiting without waiting for the sandbox");
            std::process::exit(i32::from(INTERRUPTED_EXIT));
        }
    });
    token
}

/// Exit status after a Ctrl-C, as for SIGINT.
pub(crate) const INTERRUPTED_EXIT: u8 = 130;
