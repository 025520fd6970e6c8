//! Filesystem and process operations scoped to the sandbox root.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collect;
use super::error::AgentError;
use crate::paths::contained_join;
use crate::protocol::{CollectSpec, FileRecord, TaskResult};

/// Environment variable naming the sandbox root to task processes.
pub(crate) const ROOT_ENV: &str = "BOXRUN_ROOT";

/// The sandbox root plus the command prefix used to launch tasks.
#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    root: PathBuf,
    launcher: Vec<String>,
}

impl Workspace {
    /// Creates the root directory if needed and pins it for the lifetime of
    /// the agent.
    pub fn open(root: &Path, launcher: Vec<String>) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
            launcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes a whole file, creating parent directories and overwriting.
    pub async fn write_file(&self, record: &FileRecord) -> Result<(), AgentError> {
        let target = contained_join(&self.root, &record.path)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::io(&record.path, e))?;
        }
        tokio::fs::write(&target, &record.content)
            .await
            .map_err(|e| AgentError::io(&record.path, e))?;

        debug!("Wrote {} ({} bytes)", record.path, record.content.len());
        Ok(())
    }

    /// Reads a whole file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, AgentError> {
        let target = contained_join(&self.root, path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| AgentError::io(path, e))
    }

    /// Runs `launcher ++ argv` in the root and collects the requested files.
    ///
    /// Output is buffered in full. A process that starts and exits non-zero
    /// yields `Ok` with that exit code; only a failure to start is an error.
    /// If `cancel` fires first the process is killed and `Cancelled` returned.
    pub async fn run_task(
        &self,
        argv: &[String],
        spec: &CollectSpec,
        cancel: CancellationToken,
    ) -> Result<TaskResult, AgentError> {
        let patterns = collect::compile(spec)?;

        let mut command_line = self.launcher.iter().chain(argv.iter());
        let program = command_line.next().ok_or(AgentError::EmptyCommand)?.clone();
        let args: Vec<&String> = command_line.collect();

        info!("Running task: {}", shell_words::join(argv));
        let started = SystemTime::now();

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&self.root)
            .env(ROOT_ENV, &self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Launch {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let finished = tokio::select! {
            output = async {
                tokio::try_join!(read_pipe(stdout), read_pipe(stderr), child.wait())
            } => Some(output),
            () = cancel.cancelled() => None,
        };

        let Some(output) = finished else {
            warn!("Task {} cancelled, killing process", program);
            // Kill and reap, so the pid is gone once the call returns.
            if let Err(e) = child.kill().await {
                warn!("Failed to kill task {}: {}", program, e);
            }
            return Err(AgentError::Cancelled);
        };
        let (stdout, stderr, status) = output.map_err(|e| AgentError::io(program.as_str(), e))?;

        let exit_code = exit_code(status);
        info!("Task exited with code {}", exit_code);

        let root = self.root.clone();
        let modified_only = spec.modified_only;
        let changed_files = tokio::task::spawn_blocking(move || {
            collect::collect_files(&root, &patterns, modified_only, started)
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Collection task failed: {}", e);
            Vec::new()
        });

        Ok(TaskResult {
            exit_code,
            stdout,
            stderr,
            changed_files,
        })
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Best available exit code. Death by signal is reported shell-style as
/// `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
