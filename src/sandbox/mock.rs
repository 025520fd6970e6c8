//! Mock orchestrator for testing.
//!
//! Records every call and answers from configurable state, so provisioning
//! can be tested without Docker or a cluster.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ExecOutput, Orchestrator, SandboxError, SandboxHandle, Tunnel};

/// A recorded orchestrator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Exists(String),
    Create {
        name: String,
        image: String,
        entrypoint: Vec<String>,
    },
    WaitReady(String),
    Exec(Vec<String>),
    CopyInto {
        local: String,
        remote: String,
    },
    OpenTunnel(u16),
    List,
    Delete(String),
}

#[derive(Debug, Default)]
struct MockState {
    exists: bool,
    ready_fails: bool,
    installed_version: Option<String>,
    tunnel_addr: Option<SocketAddr>,
    calls: Vec<Call>,
}

/// An in-memory orchestrator.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockOrchestrator {
    state: Arc<Mutex<MockState>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends the unit already exists.
    pub fn existing(self) -> Self {
        self.state.lock().unwrap().exists = true;
        self
    }

    /// Makes `wait_ready` time out.
    pub fn never_ready(self) -> Self {
        self.state.lock().unwrap().ready_fails = true;
        self
    }

    /// Reports `version` from the installed agent binary.
    pub fn with_agent_version(self, version: &str) -> Self {
        self.state.lock().unwrap().installed_version = Some(version.to_string());
        self
    }

    /// Address returned by `open_tunnel`.
    pub fn with_tunnel(self, addr: SocketAddr) -> Self {
        self.state.lock().unwrap().tunnel_addr = Some(addr);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn exists(&self, name: &str) -> Result<bool, SandboxError> {
        self.record(Call::Exists(name.to_string()));
        Ok(self.state.lock().unwrap().exists)
    }

    async fn create(
        &self,
        handle: &SandboxHandle,
        entrypoint: &[String],
        _port: u16,
    ) -> Result<(), SandboxError> {
        self.record(Call::Create {
            name: handle.name.clone(),
            image: handle.image.clone(),
            entrypoint: entrypoint.to_vec(),
        });
        self.state.lock().unwrap().exists = true;
        Ok(())
    }

    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<(), SandboxError> {
        self.record(Call::WaitReady(name.to_string()));
        if self.state.lock().unwrap().ready_fails {
            return Err(SandboxError::timeout(name, timeout));
        }
        Ok(())
    }

    async fn exec(&self, _name: &str, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        self.record(Call::Exec(argv.to_vec()));

        // Version probe: `sh -c "... --version"`.
        let is_probe = argv.last().is_some_and(|cmd| cmd.contains("--version"));
        if is_probe {
            let installed = self.state.lock().unwrap().installed_version.clone();
            return Ok(match installed {
                Some(version) => ExecOutput {
                    exit_code: 0,
                    stdout: format!("boxrun {version}\n"),
                    stderr: String::new(),
                },
                None => ExecOutput {
                    exit_code: 127,
                    stdout: String::new(),
                    stderr: "not found".to_string(),
                },
            });
        }
        Ok(ExecOutput::default())
    }

    async fn copy_into(
        &self,
        _name: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SandboxError> {
        self.record(Call::CopyInto {
            local: local_path.display().to_string(),
            remote: remote_path.to_string(),
        });
        Ok(())
    }

    async fn open_tunnel(&self, _name: &str, port: u16) -> Result<Tunnel, SandboxError> {
        self.record(Call::OpenTunnel(port));
        let addr = self
            .state
            .lock()
            .unwrap()
            .tunnel_addr
            .ok_or_else(|| SandboxError::failed("tunnel", "no tunnel configured"))?;
        Ok(Tunnel::direct(addr))
    }

    async fn list(&self) -> Result<Vec<String>, SandboxError> {
        self.record(Call::List);
        Ok(Vec::new())
    }

    async fn delete(&self, name: &str) -> Result<(), SandboxError> {
        self.record(Call::Delete(name.to_string()));
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(SandboxError::not_found(name));
        }
        state.exists = false;
        Ok(())
    }
}
