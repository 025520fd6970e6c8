//! Orchestrator backends for sandbox compute units.
//!
//! A sandbox is a long-lived container (Docker) or pod (Kubernetes) that
//! idles until the agent is bootstrapped into it. The [`Orchestrator`] trait
//! is the only surface the rest of the crate uses, so provisioning logic is
//! backend-independent and testable with the mock.

mod docker;
mod error;
mod kubectl;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::DockerOrchestrator;
pub(crate) use error::SandboxError;
pub(crate) use kubectl::KubectlOrchestrator;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

use crate::config::{Backend, Config};

/// Label attached to every sandbox this tool creates.
pub(crate) const SANDBOX_LABEL: (&str, &str) = ("app", "boxrun-sandbox");

/// Identity of one sandbox: name plus the image it is created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SandboxHandle {
    pub name: String,
    pub image: String,
}

impl SandboxHandle {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

/// Captured output of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Local endpoint reaching the agent port of a sandbox.
///
/// When the endpoint is served by a helper process (e.g. `kubectl
/// port-forward`), the process is owned here and killed on drop.
#[derive(Debug)]
pub(crate) struct Tunnel {
    addr: SocketAddr,
    process: Option<Child>,
}

impl Tunnel {
    /// An endpoint that needs no helper process.
    pub fn direct(addr: SocketAddr) -> Self {
        Self {
            addr,
            process: None,
        }
    }

    /// An endpoint served by `process` for as long as the tunnel lives.
    pub fn with_process(addr: SocketAddr, process: Child) -> Self {
        Self {
            addr,
            process: Some(process),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Fails if the helper process has exited.
    pub fn check(&mut self) -> Result<(), SandboxError> {
        let Some(child) = self.process.as_mut() else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(SandboxError::failed(
                "tunnel",
                format!(
                    "helper for {} exited ({status}); is the local port already in use?",
                    self.addr
                ),
            )),
            Err(e) => Err(SandboxError::failed("tunnel", e)),
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            debug!("Stopping tunnel to {}", self.addr);
            let _ = child.start_kill();
            // Reaps it if it already died; otherwise tokio reaps it later.
            let _ = child.try_wait();
        }
    }
}

/// Operations needed from the container/pod orchestrator.
#[async_trait]
pub(crate) trait Orchestrator: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Whether a unit with this name exists.
    async fn exists(&self, name: &str) -> Result<bool, SandboxError>;

    /// Creates and starts a unit that runs `entrypoint` and exposes `port`.
    async fn create(
        &self,
        handle: &SandboxHandle,
        entrypoint: &[String],
        port: u16,
    ) -> Result<(), SandboxError>;

    /// Waits until the unit is running, failing after `timeout`.
    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<(), SandboxError>;

    /// Runs `argv` inside the unit and captures its output.
    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput, SandboxError>;

    /// Copies a local file into the unit at `remote_path`, byte for byte.
    async fn copy_into(
        &self,
        name: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SandboxError>;

    /// Opens a local endpoint reaching `port` inside the unit.
    async fn open_tunnel(&self, name: &str, port: u16) -> Result<Tunnel, SandboxError>;

    /// Lists sandboxes created by this tool.
    async fn list(&self) -> Result<Vec<String>, SandboxError>;

    /// Deletes the unit.
    async fn delete(&self, name: &str) -> Result<(), SandboxError>;
}

/// Builds the orchestrator selected in the configuration.
pub(crate) fn from_config(config: &Config) -> Result<Box<dyn Orchestrator>, SandboxError> {
    match config.sandbox.backend {
        Backend::Docker => Ok(Box::new(DockerOrchestrator::connect()?)),
        Backend::Kubectl => Ok(Box::new(KubectlOrchestrator::new(
            config.sandbox.namespace.clone(),
            config.sandbox.context.clone(),
            config.agent.local_port,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        assert!(ExecOutput::default().success());
        let failed = ExecOutput {
            exit_code: 1,
            ..Default::default()
        };
        assert!(!failed.success());
    }

    #[test]
    fn test_direct_tunnel_addr() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        let tunnel = Tunnel::direct(addr);
        assert_eq!(tunnel.addr(), addr);
    }

    #[tokio::test]
    async fn test_exited_helper_fails_check() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let mut tunnel = Tunnel::with_process(addr, child);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let err = loop {
            match tunnel.check() {
                Err(e) => break e,
                Ok(()) => {
                    assert!(std::time::Instant::now() < deadline, "helper never exited");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        };
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn test_running_helper_passes_check() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut tunnel = Tunnel::with_process(addr, child);
        assert!(tunnel.check().is_ok());
        assert!(Tunnel::direct(addr).check().is_ok());
    }

    #[test]
    fn test_orchestrator_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn Orchestrator>();
    }
}
