//! Docker backend using the Engine API through `bollard`.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tar::{Builder, Header};
use tracing::{debug, info, warn};

use super::{ExecOutput, Orchestrator, SandboxError, SandboxHandle, Tunnel, SANDBOX_LABEL};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs sandboxes as long-lived Docker containers.
///
/// The agent port is published on a random loopback port at creation time,
/// so the "tunnel" is just the published address.
pub(crate) struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::unavailable(format!("Failed to connect to Docker ({e}). Is Docker running?"))
        })?;
        Ok(Self { docker })
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, SandboxError> {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::not_found(name),
                other => docker_error("inspect", other),
            })
    }

    fn build_container_config(
        handle: &SandboxHandle,
        entrypoint: &[String],
        port: u16,
    ) -> ContainerConfig<String> {
        let port_key = format!("{port}/tcp");

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                // Empty host port: Docker picks a free one.
                host_port: Some(String::new()),
            }]),
        );

        ContainerConfig {
            image: Some(handle.image.clone()),
            cmd: Some(entrypoint.to_vec()),
            labels: Some(HashMap::from([(
                SANDBOX_LABEL.0.to_string(),
                SANDBOX_LABEL.1.to_string(),
            )])),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn exists(&self, name: &str) -> Result<bool, SandboxError> {
        match self.inspect(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        handle: &SandboxHandle,
        entrypoint: &[String],
        port: u16,
    ) -> Result<(), SandboxError> {
        info!("Creating container {} from {}", handle.name, handle.image);

        let config = Self::build_container_config(handle, entrypoint, port);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: handle.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| docker_error("create", e))?;

        debug!("Starting container {}", handle.name);
        self.docker
            .start_container::<String>(&handle.name, None)
            .await
            .map_err(|e| docker_error("start", e))?;

        Ok(())
    }

    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<(), SandboxError> {
        let poll = async {
            loop {
                let inspected = self.inspect(name).await?;
                let state = inspected.state.unwrap_or_default();

                if state.running == Some(true) {
                    return Ok(());
                }
                if let Some(
                    status @ (ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD),
                ) = state.status
                {
                    return Err(SandboxError::unhealthy(
                        name,
                        format!("container is {status}"),
                    ));
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SandboxError::timeout(name, timeout))?
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_error("exec", e))?;

        let mut output = ExecOutput::default();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_error("exec", e))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        output.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    _ => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| docker_error("exec", e))?;
        output.exit_code = inspected.exit_code.unwrap_or(-1);

        Ok(output)
    }

    async fn copy_into(
        &self,
        name: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SandboxError> {
        let remote = Path::new(remote_path);
        let (Some(dir), Some(file_name)) = (remote.parent(), remote.file_name()) else {
            return Err(SandboxError::failed(
                "copy",
                format!("invalid remote path {remote_path}"),
            ));
        };

        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| SandboxError::failed("copy", format!("{}: {e}", local_path.display())))?;
        let archive = single_file_tar(Path::new(file_name), &data)
            .map_err(|e| SandboxError::failed("copy", format!("failed to build archive: {e}")))?;

        debug!(
            "Uploading {} ({} bytes) to {}:{}",
            local_path.display(),
            data.len(),
            name,
            remote_path
        );
        self.docker
            .upload_to_container(
                name,
                Some(UploadToContainerOptions {
                    path: dir.to_string_lossy().into_owned(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| docker_error("copy", e))
    }

    async fn open_tunnel(&self, name: &str, port: u16) -> Result<Tunnel, SandboxError> {
        let inspected = self.inspect(name).await?;
        let settings = inspected.network_settings.unwrap_or_default();
        let key = format!("{port}/tcp");

        let published = settings
            .ports
            .as_ref()
            .and_then(|ports| ports.get(&key))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|binding| binding.host_port.as_deref())
            .and_then(|host_port| host_port.parse::<u16>().ok());

        if let Some(host_port) = published {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), host_port);
            debug!("Container {} port {} published at {}", name, port, addr);
            return Ok(Tunnel::direct(addr));
        }

        // Container not created by us: fall back to its bridge address.
        let ip = settings
            .ip_address
            .filter(|ip| !ip.is_empty())
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .ok_or_else(|| {
                SandboxError::failed(
                    "tunnel",
                    format!("container {name} neither publishes {key} nor has a bridge address"),
                )
            })?;
        Ok(Tunnel::direct(SocketAddr::new(ip, port)))
    }

    async fn list(&self) -> Result<Vec<String>, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", SANDBOX_LABEL.0, SANDBOX_LABEL.1)],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| docker_error("list", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::not_found(name),
                other => docker_error("delete", other),
            })
    }
}

fn docker_error(operation: &str, err: DockerError) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => SandboxError::failed(operation, format!("{status_code}: {message}")),
        other => SandboxError::unavailable(format!("{operation}: {other}. Is Docker running?")),
    }
}

/// Builds an in-memory tar archive holding one executable file.
fn single_file_tar(file_name: &Path, data: &[u8]) -> std::io::Result<Bytes> {
    let mut tar_buf = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_buf);
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_mtime(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        );
        tar.append_data(&mut header, file_name, data)?;
        tar.finish()?;
    }
    Ok(Bytes::from(tar_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_container_config_publishes_agent_port() {
        let handle = SandboxHandle::new("box", "golang:1.25");
        let entrypoint = vec!["sleep".to_string(), "infinity".to_string()];
        let config = DockerOrchestrator::build_container_config(&handle, &entrypoint, 50051);

        assert_eq!(config.image.as_deref(), Some("golang:1.25"));
        assert_eq!(config.cmd, Some(entrypoint));
        assert!(config.exposed_ports.unwrap().contains_key("50051/tcp"));

        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let binding = &bindings["50051/tcp"].as_ref().unwrap()[0];
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));

        let labels = config.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("boxrun-sandbox"));
    }

    #[test]
    fn test_single_file_tar_contents() {
        let archive = single_file_tar(Path::new("boxrun.new"), b"\x7fELF").unwrap();
        let mut tar = tar::Archive::new(archive.as_ref());
        let mut entries = tar.entries().unwrap();

        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap(), Path::new("boxrun.new"));
        assert_eq!(entry.header().mode().unwrap(), 0o755);
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"\x7fELF");

        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_exists_without_docker() {
        // Passes whether or not a daemon is reachable.
        let Ok(orchestrator) = DockerOrchestrator::connect() else {
            return;
        };
        match orchestrator.exists("boxrun-test-surely-missing").await {
            Ok(exists) => assert!(!exists),
            Err(e) => assert!(e.to_string().contains("Docker") || e.to_string().contains("docker")),
        }
    }
}
