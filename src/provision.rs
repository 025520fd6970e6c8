//! Provisioning: bring a named sandbox to the point where its agent answers.
//!
//! ```text
//! exists? ──no──▸ create (sleep infinity)
//!    │                     │
//!    └───────▸ wait_ready ◂┘
//!                  │
//!                  ▼
//!         probe agent version ──stale──▸ build + copy + swap
//!                  │                              │
//!                  ▼◂─────────────────────────────┘
//!       start agent (idempotent, nohup)
//!                  ▼
//!   open tunnel ──▸ connect (while tunnel lives) ──▸ check root ──▸ Session
//! ```
//!
//! Every step before the tunnel is idempotent, so a half-provisioned sandbox
//! is repaired by the next invocation.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{AgentConfig, BuildConfig, Config};
use crate::sandbox::{Orchestrator, SandboxHandle, Tunnel};
use crate::transport::{connect_while, AgentClient, ConnectPolicy};

/// Version the installed agent must report.
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Entrypoint keeping a fresh unit alive until the agent is started.
const IDLE_ENTRYPOINT: [&str; 2] = ["sleep", "infinity"];

/// Produces the agent binary to upload.
#[async_trait]
pub(crate) trait AgentBuilder: Send + Sync {
    /// Builds the binary and returns its local path.
    async fn build(&self) -> Result<PathBuf>;
}

/// Runs a configured build command and returns its artifact.
#[derive(Debug, Clone)]
pub(crate) struct CommandBuilder {
    project_dir: PathBuf,
    command: Vec<String>,
    artifact: PathBuf,
}

impl CommandBuilder {
    pub fn new(project_dir: &Path, command: Vec<String>, artifact: PathBuf) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            command,
            artifact,
        }
    }
}

#[async_trait]
impl AgentBuilder for CommandBuilder {
    async fn build(&self) -> Result<PathBuf> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("Agent build command is empty");
        };

        info!("Building agent: {}", shell_words::join(&self.command));
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run agent build command '{program}'"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Agent build failed:\n{}", stderr.trim());
        }

        let artifact = self.project_dir.join(&self.artifact);
        if !artifact.is_file() {
            bail!("Agent build produced no artifact at {}", artifact.display());
        }
        Ok(artifact)
    }
}

/// Uploads the running executable.
///
/// Works when the client and the sandbox share OS and architecture.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CurrentExe;

#[async_trait]
impl AgentBuilder for CurrentExe {
    async fn build(&self) -> Result<PathBuf> {
        std::env::current_exe().context("Failed to locate the running executable")
    }
}

/// Picks the agent builder from `[agent.build]`.
pub(crate) fn builder_from_config(
    build: &BuildConfig,
    project_dir: &Path,
) -> Result<Box<dyn AgentBuilder>> {
    if build.command.is_empty() {
        return Ok(Box::new(CurrentExe));
    }
    let Some(artifact) = &build.artifact else {
        bail!("agent.build.artifact is required when agent.build.command is set");
    };
    Ok(Box::new(CommandBuilder::new(
        project_dir,
        build.command.clone(),
        artifact.clone(),
    )))
}

/// A connected agent plus the tunnel carrying the connection.
///
/// Dropping the session closes the connection (releasing any lease) and then
/// tears down the tunnel.
#[derive(Debug)]
pub(crate) struct Session {
    pub client: AgentClient,
    tunnel: Tunnel,
}

impl Session {
    #[allow(dead_code)] // Public API for callers
    pub fn addr(&self) -> std::net::SocketAddr {
        self.tunnel.addr()
    }
}

/// Settings the provisioner reads from configuration.
#[derive(Debug, Clone)]
pub(crate) struct ProvisionSettings {
    pub agent: AgentConfig,
    pub ready_timeout: Duration,
    pub policy: ConnectPolicy,
}

impl ProvisionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent: config.agent.clone(),
            ready_timeout: config.sandbox.ready_timeout(),
            policy: config.connect.policy(config.agent.max_frame_bytes),
        }
    }
}

/// Ensures a sandbox exists and runs a current agent.
pub(crate) struct Provisioner {
    orchestrator: Box<dyn Orchestrator>,
    builder: Box<dyn AgentBuilder>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(
        orchestrator: Box<dyn Orchestrator>,
        builder: Box<dyn AgentBuilder>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            orchestrator,
            builder,
            settings,
        }
    }

    /// Builds the configured orchestrator and agent builder.
    pub fn from_config(config: &Config, project_dir: &Path) -> Result<Self> {
        let orchestrator =
            crate::sandbox::from_config(config).context("Failed to reach orchestrator")?;
        let builder = builder_from_config(&config.agent.build, project_dir)?;
        Ok(Self::new(
            orchestrator,
            builder,
            ProvisionSettings::from_config(config),
        ))
    }

    /// The orchestrator behind this provisioner.
    pub fn orchestrator(&self) -> &dyn Orchestrator {
        self.orchestrator.as_ref()
    }

    /// Brings `handle` up and returns a handshaken session with its agent.
    pub async fn ensure(&self, handle: &SandboxHandle) -> Result<Session> {
        self.ensure_unit(handle).await?;
        self.ensure_agent_binary(&handle.name).await?;
        self.start_agent(&handle.name).await?;

        let mut tunnel = self
            .orchestrator
            .open_tunnel(&handle.name, self.settings.agent.port)
            .await
            .with_context(|| format!("Failed to open tunnel to sandbox {}", handle.name))?;
        let addr = tunnel.addr();
        debug!("Tunnel to {} at {}", handle.name, addr);

        let client = connect_while(addr, self.settings.policy, || {
            tunnel.check().map_err(|e| e.to_string())
        })
        .await
        .with_context(|| format!("Sandbox {} agent is not reachable", handle.name))?;

        // Anything else answering on the tunnel port is some other agent.
        let root = &client.hello().root;
        if Path::new(root) != Path::new(&self.settings.agent.root) {
            bail!(
                "Agent at {addr} serves root {root}, expected {} for sandbox {}; \
                 is another tunnel holding the local port?",
                self.settings.agent.root,
                handle.name
            );
        }

        Ok(Session { client, tunnel })
    }

    /// Creates the unit if absent, then waits for it to be running.
    async fn ensure_unit(&self, handle: &SandboxHandle) -> Result<()> {
        let exists = self
            .orchestrator
            .exists(&handle.name)
            .await
            .with_context(|| format!("Failed to query sandbox {}", handle.name))?;

        if exists {
            debug!("Reusing sandbox {}", handle.name);
        } else {
            info!(
                "Creating sandbox {} from {} ({})",
                handle.name,
                handle.image,
                self.orchestrator.name()
            );
            let entrypoint: Vec<String> =
                IDLE_ENTRYPOINT.iter().map(ToString::to_string).collect();
            self.orchestrator
                .create(handle, &entrypoint, self.settings.agent.port)
                .await
                .with_context(|| format!("Failed to create sandbox {}", handle.name))?;
        }

        // Returns at once for a running unit; covers one left pending too.
        self.orchestrator
            .wait_ready(&handle.name, self.settings.ready_timeout)
            .await
            .with_context(|| format!("Sandbox {} did not become ready", handle.name))
    }

    /// Installs the agent binary unless the installed one is current.
    async fn ensure_agent_binary(&self, name: &str) -> Result<()> {
        let binary = &self.settings.agent.binary_path;
        let installed = self.probe_version(name).await?;
        if installed.as_deref() == Some(AGENT_VERSION) {
            debug!("Agent {} already installed in {}", AGENT_VERSION, name);
            return Ok(());
        }

        match &installed {
            Some(version) => info!("Upgrading agent in {} from {} to {}", name, version, AGENT_VERSION),
            None => info!("Installing agent {} into {}", AGENT_VERSION, name),
        }

        let local = self.builder.build().await.context("Failed to build agent")?;
        let staging = format!("{binary}.new");
        self.orchestrator
            .copy_into(name, &local, &staging)
            .await
            .with_context(|| format!("Failed to copy agent into {name}:{staging}"))?;

        self.exec_script(name, "install agent", &install_script(&self.settings.agent))
            .await
    }

    /// Version reported by the installed agent, if any.
    async fn probe_version(&self, name: &str) -> Result<Option<String>> {
        let binary = shell_words::quote(&self.settings.agent.binary_path);
        let probe = format!("test -x {binary} && {binary} --version");
        let output = self
            .orchestrator
            .exec(name, &sh(probe))
            .await
            .with_context(|| format!("Failed to probe agent in {name}"))?;

        if !output.success() {
            return Ok(None);
        }
        Ok(parse_version(&output.stdout))
    }

    async fn start_agent(&self, name: &str) -> Result<()> {
        self.exec_script(name, "start agent", &start_script(&self.settings.agent))
            .await
    }

    async fn exec_script(&self, name: &str, stage: &str, script: &str) -> Result<()> {
        debug!("[{}] {}: {}", name, stage, script);
        let output = self
            .orchestrator
            .exec(name, &sh(script.to_string()))
            .await
            .with_context(|| format!("Failed to {stage} in {name}"))?;
        if !output.success() {
            bail!(
                "Failed to {stage} in {name} (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

fn sh(script: String) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Extracts the version from `boxrun 1.2.3`.
fn parse_version(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().last())
        .map(ToString::to_string)
}

/// Makes the staged binary executable, swaps it in and stops a running agent
/// so the new binary is the one started next.
fn install_script(agent: &AgentConfig) -> String {
    let binary = shell_words::quote(&agent.binary_path);
    let staging = shell_words::quote(&format!("{}.new", agent.binary_path)).into_owned();
    let pid = shell_words::quote(&agent.pid_path);
    format!(
        "chmod +x {staging} && mv -f {staging} {binary} && \
         if [ -f {pid} ]; then kill \"$(cat {pid})\" 2>/dev/null; rm -f {pid}; fi; true"
    )
}

/// Starts the agent detached unless the pid file names a live process.
fn start_script(agent: &AgentConfig) -> String {
    let mut serve = vec![
        agent.binary_path.clone(),
        "serve".to_string(),
        "--root".to_string(),
        agent.root.clone(),
        "--port".to_string(),
        agent.port.to_string(),
        "--state-dir".to_string(),
        agent.state_dir.clone(),
        "--max-frame-bytes".to_string(),
        agent.max_frame_bytes.to_string(),
    ];
    if !agent.launcher.is_empty() {
        serve.push(format!("--launcher={}", shell_words::join(&agent.launcher)));
    }

    let root = shell_words::quote(&agent.root);
    let state = shell_words::quote(&agent.state_dir);
    let pid = shell_words::quote(&agent.pid_path);
    let log = shell_words::quote(&agent.log_path);
    format!(
        "mkdir -p {root} {state} && \
         if [ -f {pid} ] && kill -0 \"$(cat {pid})\" 2>/dev/null; then exit 0; fi; \
         nohup {} > {log} 2>&1 & echo $! > {pid}",
        shell_words::join(&serve)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::{Call, MockOrchestrator};
    use crate::sandbox::SandboxError;
    use crate::server::testing::LocalAgent;
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    /// Returns a fixed file and counts builds.
    #[derive(Default)]
    struct StaticBuilder {
        path: PathBuf,
        builds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentBuilder for StaticBuilder {
        async fn build(&self) -> Result<PathBuf> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(self.path.clone())
        }
    }

    /// Settings for an agent serving `root`.
    fn settings(root: &Path) -> ProvisionSettings {
        ProvisionSettings {
            agent: AgentConfig {
                root: root.display().to_string(),
                ..AgentConfig::default()
            },
            ready_timeout: Duration::from_secs(5),
            policy: ConnectPolicy {
                attempts: 3,
                interval: Duration::from_millis(10),
                attempt_timeout: Duration::from_millis(500),
                max_frame_bytes: 1024 * 1024,
            },
        }
    }

    fn provisioner(mock: &MockOrchestrator, builds: Arc<AtomicUsize>, root: &Path) -> Provisioner {
        let builder = StaticBuilder {
            path: PathBuf::from("/tmp/boxrun-test-agent"),
            builds,
        };
        Provisioner::new(Box::new(mock.clone()), Box::new(builder), settings(root))
    }

    fn handle() -> SandboxHandle {
        SandboxHandle::new("box", "golang:1.25-trixie")
    }

    #[tokio::test]
    async fn test_fresh_sandbox_full_bootstrap() {
        let agent = LocalAgent::start(Vec::new()).await;
        let mock = MockOrchestrator::new().with_tunnel(agent.addr);
        let builds = Arc::new(AtomicUsize::new(0));

        let session = provisioner(&mock, builds.clone(), agent.root())
            .ensure(&handle())
            .await
            .unwrap();
        assert_eq!(session.client.hello().version, AGENT_VERSION);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let calls = mock.calls();
        assert_eq!(calls[0], Call::Exists("box".to_string()));
        assert_eq!(
            calls[1],
            Call::Create {
                name: "box".to_string(),
                image: "golang:1.25-trixie".to_string(),
                entrypoint: vec!["sleep".to_string(), "infinity".to_string()],
            }
        );
        assert_eq!(calls[2], Call::WaitReady("box".to_string()));
        assert!(matches!(&calls[3], Call::Exec(argv) if argv[2].contains("--version")));
        assert_eq!(
            calls[4],
            Call::CopyInto {
                local: "/tmp/boxrun-test-agent".to_string(),
                remote: "/usr/local/bin/boxrun.new".to_string(),
            }
        );
        assert!(matches!(&calls[5], Call::Exec(argv) if argv[2].contains("mv -f")));
        assert!(matches!(&calls[6], Call::Exec(argv) if argv[2].contains("nohup")));
        assert_eq!(calls[7], Call::OpenTunnel(50051));
    }

    #[tokio::test]
    async fn test_existing_sandbox_with_current_agent() {
        let agent = LocalAgent::start(Vec::new()).await;
        let mock = MockOrchestrator::new()
            .existing()
            .with_agent_version(AGENT_VERSION)
            .with_tunnel(agent.addr);
        let builds = Arc::new(AtomicUsize::new(0));

        provisioner(&mock, builds.clone(), agent.root())
            .ensure(&handle())
            .await
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 0);
        let calls = mock.calls();
        assert!(!calls.iter().any(|c| matches!(c, Call::Create { .. })));
        // A reused unit may still be pending from an interrupted run.
        assert_eq!(calls[1], Call::WaitReady("box".to_string()));
        assert!(!calls.iter().any(|c| matches!(c, Call::CopyInto { .. })));
        // Start is still attempted; the script itself is idempotent.
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::Exec(argv) if argv[2].contains("nohup"))));
    }

    #[tokio::test]
    async fn test_stale_agent_is_replaced() {
        let agent = LocalAgent::start(Vec::new()).await;
        let mock = MockOrchestrator::new()
            .existing()
            .with_agent_version("0.0.0-old")
            .with_tunnel(agent.addr);
        let builds = Arc::new(AtomicUsize::new(0));

        provisioner(&mock, builds.clone(), agent.root())
            .ensure(&handle())
            .await
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::CopyInto { .. })));
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_fatal() {
        let mock = MockOrchestrator::new().never_ready();
        let err = provisioner(&mock, Arc::default(), Path::new("/workspace/src"))
            .ensure(&handle())
            .await
            .unwrap_err();

        let sandbox_err = err.downcast_ref::<SandboxError>().unwrap();
        assert!(sandbox_err.is_timeout());
        // Nothing else is attempted after the timeout.
        assert!(!mock.calls().iter().any(|c| matches!(c, Call::Exec(_))));
    }

    #[tokio::test]
    async fn test_unreachable_agent_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let mock = MockOrchestrator::new()
            .existing()
            .with_agent_version(AGENT_VERSION)
            .with_tunnel(dead);
        let err = provisioner(&mock, Arc::default(), Path::new("/workspace/src"))
            .ensure(&handle())
            .await
            .unwrap_err();

        let transport = err.downcast_ref::<TransportError>().unwrap();
        assert!(transport.is_connect_exhausted());
        assert!(format!("{err:#}").contains("not reachable"));
    }

    #[tokio::test]
    async fn test_agent_with_other_root_is_rejected() {
        // Stands in for a leftover forward reaching a different sandbox.
        let stranger = LocalAgent::start(Vec::new()).await;
        let mock = MockOrchestrator::new()
            .existing()
            .with_agent_version(AGENT_VERSION)
            .with_tunnel(stranger.addr);

        let err = provisioner(&mock, Arc::default(), Path::new("/workspace/src"))
            .ensure(&handle())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("expected /workspace/src"), "{message}");
        assert!(message.contains("another tunnel"), "{message}");
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("boxrun 0.3.1\n"), Some("0.3.1".to_string()));
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_start_script_is_idempotent_and_quoted() {
        let agent = AgentConfig {
            root: "/work space/src".to_string(),
            launcher: vec!["make".to_string(), "-s".to_string()],
            ..AgentConfig::default()
        };
        let script = start_script(&agent);

        assert!(script.contains("kill -0"));
        assert!(script.contains("nohup /usr/local/bin/boxrun serve --root '/work space/src'"));
        assert!(script.contains("'--launcher=make -s'"));
        assert!(script.contains("> /tmp/boxrun-serve.log 2>&1 &"));
        assert!(script.ends_with("echo $! > /tmp/boxrun-serve.pid"));
    }

    #[test]
    fn test_install_script_swaps_atomically() {
        let script = install_script(&AgentConfig::default());
        assert!(script.starts_with(
            "chmod +x /usr/local/bin/boxrun.new && mv -f /usr/local/bin/boxrun.new /usr/local/bin/boxrun"
        ));
        assert!(script.contains("kill"));
    }

    #[test]
    fn test_builder_from_config() {
        let dir = tempdir().unwrap();
        assert!(builder_from_config(&BuildConfig::default(), dir.path()).is_ok());

        let missing_artifact = BuildConfig {
            command: vec!["make".to_string()],
            artifact: None,
        };
        let err = builder_from_config(&missing_artifact, dir.path())
            .err()
            .unwrap();
        assert!(err.to_string().contains("artifact"));
    }

    #[tokio::test]
    async fn test_command_builder() {
        let dir = tempdir().unwrap();
        let builder = CommandBuilder::new(
            dir.path(),
            vec!["sh".into(), "-c".into(), "printf bin > agent.bin".into()],
            PathBuf::from("agent.bin"),
        );
        let path = builder.build().await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"bin");

        let failing = CommandBuilder::new(
            dir.path(),
            vec!["sh".into(), "-c".into(), "echo broken >&2; exit 2".into()],
            PathBuf::from("agent.bin"),
        );
        let err = failing.build().await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
