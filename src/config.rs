use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::protocol::{CollectSpec, DEFAULT_MAX_FRAME_BYTES};
use crate::sandbox::SandboxHandle;
use crate::transport::ConnectPolicy;

pub(crate) const CONFIG_FILE: &str = "boxrun.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Collect presets keyed by the first word of the command line.
    /// Entries here override the built-in presets of the same name.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskPreset>,
}

/// Orchestrator backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Docker,
    Kubectl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Name of the container/pod
    #[serde(default = "default_sandbox_name")]
    pub name: String,

    /// Image the sandbox is created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Orchestrator: "docker" or "kubectl"
    #[serde(default)]
    pub backend: Backend,

    /// How long to wait for a new sandbox to become ready
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Kubernetes namespace (kubectl backend only)
    #[serde(default)]
    pub namespace: Option<String>,

    /// Kubernetes context (kubectl backend only)
    #[serde(default)]
    pub context: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: default_sandbox_name(),
            image: default_image(),
            backend: Backend::default(),
            ready_timeout_secs: default_ready_timeout(),
            namespace: None,
            context: None,
        }
    }
}

impl SandboxConfig {
    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle::new(&self.name, &self.image)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Port the agent listens on inside the sandbox
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local port for the kubectl port-forward
    #[serde(default = "default_port")]
    pub local_port: u16,

    /// Sandbox root the local tree is synced into
    #[serde(default = "default_remote_root")]
    pub root: String,

    /// Where the agent binary is installed inside the sandbox
    #[serde(default = "default_binary_path")]
    pub binary_path: String,

    /// Agent stdout/stderr inside the sandbox
    #[serde(default = "default_log_path")]
    pub log_path: String,

    /// Agent pid file inside the sandbox
    #[serde(default = "default_pid_path")]
    pub pid_path: String,

    /// Agent state directory (lease file) inside the sandbox
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Command prefix for tasks, e.g. ["make"] to run `make <args>`
    #[serde(default)]
    pub launcher: Vec<String>,

    /// Maximum size of one protocol message
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// How the agent binary is built locally
    #[serde(default)]
    pub build: BuildConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            local_port: default_port(),
            root: default_remote_root(),
            binary_path: default_binary_path(),
            log_path: default_log_path(),
            pid_path: default_pid_path(),
            state_dir: default_state_dir(),
            launcher: Vec::new(),
            max_frame_bytes: default_max_frame_bytes(),
            build: BuildConfig::default(),
        }
    }
}

/// Local build of the agent binary.
///
/// With no `command`, the running executable is uploaded as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build command, e.g. ["cargo", "build", "--release", "--target", "x86_64-unknown-linux-musl"]
    #[serde(default)]
    pub command: Vec<String>,

    /// Path of the produced binary, relative to the project root
    #[serde(default)]
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Number of connection attempts
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay between attempts
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Timeout of a single attempt (connect + handshake)
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval_ms: default_interval_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl ConnectConfig {
    pub fn policy(&self, max_frame_bytes: usize) -> ConnectPolicy {
        ConnectPolicy {
            attempts: self.attempts.max(1),
            interval: Duration::from_millis(self.interval_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            max_frame_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory names never pushed to the sandbox
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
        }
    }
}

/// Files to bring back for a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPreset {
    /// Glob patterns relative to the sandbox root
    #[serde(default)]
    pub collect: Vec<String>,

    /// Only return files modified while the task ran
    #[serde(default)]
    pub modified_only: bool,
}

impl From<&TaskPreset> for CollectSpec {
    fn from(preset: &TaskPreset) -> Self {
        Self {
            patterns: preset.collect.clone(),
            modified_only: preset.modified_only,
        }
    }
}

// Default value functions
fn default_sandbox_name() -> String {
    "boxrun-sandbox".to_string()
}

fn default_image() -> String {
    "golang:1.25-trixie".to_string()
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_port() -> u16 {
    50051
}

fn default_remote_root() -> String {
    "/workspace/src".to_string()
}

fn default_binary_path() -> String {
    "/usr/local/bin/boxrun".to_string()
}

fn default_log_path() -> String {
    "/tmp/boxrun-serve.log".to_string()
}

fn default_pid_path() -> String {
    "/tmp/boxrun-serve.pid".to_string()
}

fn default_state_dir() -> String {
    "/tmp/boxrun".to_string()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_attempts() -> u32 {
    10
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_attempt_timeout_ms() -> u64 {
    1000
}

fn default_exclude() -> Vec<String> {
    vec![
        ".git".to_string(),
        ".build".to_string(),
        "node_modules".to_string(),
    ]
}

/// Presets used when `[tasks]` does not name the command.
fn builtin_preset(command: &str) -> Option<TaskPreset> {
    match command {
        "test" => Some(TaskPreset {
            collect: vec![".build/test-results/**/*".to_string()],
            modified_only: false,
        }),
        "format" | "fmt" => Some(TaskPreset {
            collect: vec!["**/*".to_string()],
            modified_only: true,
        }),
        _ => None,
    }
}

impl Config {
    /// Load configuration from the project, then the user config directory,
    /// using defaults if neither exists
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_path = project_dir.join(CONFIG_FILE);
        if project_path.exists() {
            return Self::load_file(&project_path);
        }

        if let Some(user_path) = user_config_path() {
            if user_path.exists() {
                return Self::load_file(&user_path);
            }
        }

        Ok(Self::default())
    }

    fn load_file(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {}", config_path.display());

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Collect spec for a command line: the preset named by `argv[0]`, or
    /// nothing if no preset matches.
    pub fn collect_for(&self, argv: &[String]) -> CollectSpec {
        let Some(command) = argv.first() else {
            return CollectSpec::default();
        };

        self.tasks
            .get(command)
            .cloned()
            .or_else(|| builtin_preset(command))
            .map(|preset| CollectSpec::from(&preset))
            .unwrap_or_default()
    }
}

/// `~/.config/boxrun/config.toml` (platform equivalent).
fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("boxrun").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sandbox.backend, Backend::Docker);
        assert_eq!(config.sandbox.ready_timeout_secs, 60);
        assert_eq!(config.agent.port, 50051);
        assert_eq!(config.agent.root, "/workspace/src");
        assert_eq!(config.connect.attempts, 10);
        assert_eq!(config.connect.interval_ms, 1000);
        assert!(config.sync.exclude.contains(&".git".to_string()));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sandbox]
name = "ci-box"
backend = "kubectl"
namespace = "sandboxes"

[agent]
port = 6000
launcher = ["make"]

[agent.build]
command = ["cargo", "build", "--release"]
artifact = "target/release/boxrun"

[connect]
attempts = 3

[sync]
exclude = ["target"]

[tasks.lint]
collect = ["reports/*.json"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.name, "ci-box");
        assert_eq!(config.sandbox.backend, Backend::Kubectl);
        assert_eq!(config.sandbox.namespace.as_deref(), Some("sandboxes"));
        assert_eq!(config.sandbox.image, "golang:1.25-trixie");
        assert_eq!(config.agent.port, 6000);
        assert_eq!(config.agent.local_port, 50051);
        assert_eq!(config.agent.launcher, vec!["make"]);
        assert_eq!(
            config.agent.build.artifact,
            Some(PathBuf::from("target/release/boxrun"))
        );
        assert_eq!(config.connect.attempts, 3);
        assert_eq!(config.connect.interval_ms, 1000);
        assert_eq!(config.sync.exclude, vec!["target"]);
        assert_eq!(config.tasks["lint"].collect, vec!["reports/*.json"]);
    }

    #[test]
    fn test_builtin_presets() {
        let config = Config::default();

        let test = config.collect_for(&argv(&["test", "./..."]));
        assert_eq!(test.patterns, vec![".build/test-results/**/*"]);
        assert!(!test.modified_only);

        for name in ["format", "fmt"] {
            let spec = config.collect_for(&argv(&[name]));
            assert!(spec.modified_only);
            assert_eq!(spec.patterns, vec!["**/*"]);
        }

        assert!(config.collect_for(&argv(&["build"])).is_empty());
        assert!(config.collect_for(&[]).is_empty());
    }

    #[test]
    fn test_user_presets_override_builtin() {
        let config: Config = toml::from_str(
            r#"
[tasks.test]
collect = ["out/junit.xml"]
"#,
        )
        .unwrap();
        let spec = config.collect_for(&argv(&["test"]));
        assert_eq!(spec.patterns, vec!["out/junit.xml"]);
        // Other built-ins survive.
        assert!(config.collect_for(&argv(&["fmt"])).modified_only);
    }

    #[test]
    fn test_connect_policy() {
        let config = ConnectConfig {
            attempts: 0,
            interval_ms: 250,
            attempt_timeout_ms: 500,
        };
        let policy = config.policy(1024);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.attempt_timeout, Duration::from_millis(500));
        assert_eq!(policy.max_frame_bytes, 1024);
    }

    #[test]
    fn test_load_from_project_dir() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[sandbox]\nname = \"from-file\"\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.name, "from-file");
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[sandbox\n").unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
