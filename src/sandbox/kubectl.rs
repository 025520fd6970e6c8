//! Kubernetes backend driving the `kubectl` CLI.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ExecOutput, Orchestrator, SandboxError, SandboxHandle, Tunnel, SANDBOX_LABEL};

/// Runs sandboxes as bare pods, managed through `kubectl`.
pub(crate) struct KubectlOrchestrator {
    namespace: Option<String>,
    context: Option<String>,
    local_port: u16,
}

impl KubectlOrchestrator {
    pub fn new(namespace: Option<String>, context: Option<String>, local_port: u16) -> Self {
        Self {
            namespace,
            context,
            local_port,
        }
    }

    /// Global flags followed by `args`.
    fn args<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = Vec::new();
        if let Some(context) = &self.context {
            all.push(format!("--context={context}"));
        }
        if let Some(namespace) = &self.namespace {
            all.push(format!("--namespace={namespace}"));
        }
        all.extend(args.into_iter().map(Into::into));
        all
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut cmd = Command::new("kubectl");
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Runs kubectl to completion, failing `operation` on a non-zero exit.
    async fn run(&self, operation: &str, args: Vec<String>) -> Result<String, SandboxError> {
        debug!("kubectl {}", shell_words::join(&args));
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to run kubectl ({e}). Is it installed?")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::failed(operation, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn create_args(&self, handle: &SandboxHandle, entrypoint: &[String], port: u16) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            handle.name.clone(),
            format!("--image={}", handle.image),
            "--restart=Never".to_string(),
            format!("--labels={}={}", SANDBOX_LABEL.0, SANDBOX_LABEL.1),
            format!("--port={port}"),
            "--".to_string(),
        ];
        args.extend(entrypoint.iter().cloned());
        self.args(args)
    }
}

#[async_trait]
impl Orchestrator for KubectlOrchestrator {
    fn name(&self) -> &'static str {
        "kubectl"
    }

    async fn exists(&self, name: &str) -> Result<bool, SandboxError> {
        let output = self
            .command(self.args(["get", "pod", name, "--ignore-not-found", "-o", "name"]))
            .output()
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to run kubectl ({e}). Is it installed?")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::unavailable(stderr.trim().to_string()));
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn create(
        &self,
        handle: &SandboxHandle,
        entrypoint: &[String],
        port: u16,
    ) -> Result<(), SandboxError> {
        info!("Creating pod {} from {}", handle.name, handle.image);
        self.run("create", self.create_args(handle, entrypoint, port))
            .await
            .map(|_| ())
    }

    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<(), SandboxError> {
        let args = self.args([
            "wait".to_string(),
            "--for=condition=Ready".to_string(),
            format!("pod/{name}"),
            format!("--timeout={}s", timeout.as_secs()),
        ]);

        // kubectl enforces the timeout; the outer bound covers a hung CLI.
        let grace = timeout + Duration::from_secs(5);
        match tokio::time::timeout(grace, self.run("wait", args)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(SandboxError::OperationFailed { message, .. }))
                if message.contains("timed out") =>
            {
                Err(SandboxError::timeout(name, timeout))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SandboxError::timeout(name, timeout)),
        }
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        let mut args = vec!["exec".to_string(), name.to_string(), "--".to_string()];
        args.extend(argv.iter().cloned());

        let output = self
            .command(self.args(args))
            .output()
            .await
            .map_err(|e| SandboxError::unavailable(format!("Failed to run kubectl ({e}). Is it installed?")))?;

        Ok(ExecOutput {
            exit_code: output.status.code().map_or(-1, i64::from),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn copy_into(
        &self,
        name: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SandboxError> {
        let args = self.args([
            "cp".to_string(),
            local_path.display().to_string(),
            format!("{name}:{remote_path}"),
        ]);
        self.run("copy", args).await.map(|_| ())
    }

    async fn open_tunnel(&self, name: &str, port: u16) -> Result<Tunnel, SandboxError> {
        let args = self.args([
            "port-forward".to_string(),
            format!("pod/{name}"),
            format!("{}:{port}", self.local_port),
        ]);
        debug!("kubectl {}", shell_words::join(&args));

        // stderr stays attached so a failed bind is visible to the user.
        let child = self
            .command(args)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SandboxError::failed("tunnel", format!("failed to start port-forward: {e}")))?;

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_port);
        Ok(Tunnel::with_process(addr, child))
    }

    async fn list(&self) -> Result<Vec<String>, SandboxError> {
        let selector = format!("-l={}={}", SANDBOX_LABEL.0, SANDBOX_LABEL.1);
        let out = self
            .run(
                "list",
                self.args([
                    "get",
                    "pods",
                    selector.as_str(),
                    "-o",
                    "jsonpath={.items[*].metadata.name}",
                ]),
            )
            .await?;
        Ok(out.split_whitespace().map(ToString::to_string).collect())
    }

    async fn delete(&self, name: &str) -> Result<(), SandboxError> {
        self.run("delete", self.args(["delete", "pod", name]))
            .await
            .map_err(|e| match e {
                SandboxError::OperationFailed { message, .. } if message.contains("NotFound") => {
                    SandboxError::not_found(name)
                }
                other => other,
            })
            .map(|_| ())
    }
}
