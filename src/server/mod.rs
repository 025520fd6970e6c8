//! Sandbox agent: the long-lived process serving file and task calls.
//!
//! Each TCP connection is a session handled by its own task. A reader task
//! decodes lines and forwards requests to a processor that handles them in
//! order, so a `task/cancel` notification or a dropped connection is seen
//! while a long `task/run` is still in flight. Session state (lease, task
//! cancellation) lives in the connection task only.

mod collect;
mod error;
mod workspace;

pub(crate) use error::AgentError;
pub(crate) use workspace::Workspace;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::{self, LeaseGuard};
use crate::protocol::{
    AcquireLeaseParams, HelloResult, ReadFileParams, ReadFileResult, ReleaseLeaseParams, Request,
    Response, TaskInvocation, WriteFileParams, ERR_PARSE, METHOD_CANCEL_TASK, METHOD_HELLO,
    METHOD_LEASE_ACQUIRE, METHOD_LEASE_RELEASE, METHOD_READ_FILE, METHOD_RUN_TASK,
    METHOD_WRITE_FILE,
};

/// Immutable agent state shared by all connections.
#[derive(Debug)]
pub(crate) struct Agent {
    workspace: Workspace,
    state_dir: PathBuf,
    max_frame_bytes: usize,
}

impl Agent {
    pub fn new(workspace: Workspace, state_dir: PathBuf, max_frame_bytes: usize) -> Self {
        Self {
            workspace,
            state_dir,
            max_frame_bytes,
        }
    }
}

/// Accepts connections on `listener` until `shutdown` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    agent: Arc<Agent>,
    shutdown: CancellationToken,
) -> Result<()> {
    match lease::clear_stale(&agent.state_dir) {
        Ok(true) => warn!("Removed stale lease from a previous agent"),
        Ok(false) => {}
        Err(e) => warn!("Failed to clear stale lease: {}", e),
    }

    info!(
        "Sandbox agent listening on {} (root {})",
        listener.local_addr().context("Failed to read listener address")?,
        agent.workspace.root().display()
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept connection")?;
                debug!("Accepted connection from {}", peer);
                let agent = agent.clone();
                let conn_shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    handle_connection(agent, stream, peer, conn_shutdown).await;
                });
            }
            () = shutdown.cancelled() => {
                info!("Sandbox agent shutting down");
                return Ok(());
            }
        }
    }
}

/// A line read from the peer.
enum Incoming {
    Request(Request),
    /// A `task/run` call with its sequence number on this connection.
    Task(Request, u64),
    Malformed(String),
}

/// Cancellation bookkeeping shared by a connection's reader and processor.
///
/// `task/cancel` applies to the latest `task/run` read off the wire, whether
/// or not the processor has reached it yet.
#[derive(Debug, Default)]
struct TaskControl {
    received: u64,
    cancelled: u64,
    running: Option<(u64, CancellationToken)>,
}

impl TaskControl {
    fn next_task(&mut self) -> u64 {
        self.received += 1;
        self.received
    }

    /// Cancels the latest task. Returns true if it was already running.
    fn cancel_latest(&mut self) -> bool {
        self.cancelled = self.received;
        match &self.running {
            Some((seq, token)) if *seq == self.received => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Registers task `seq` as running, unless it was cancelled first.
    fn start(&mut self, seq: u64, token: &CancellationToken) -> bool {
        if self.cancelled >= seq {
            return false;
        }
        self.running = Some((seq, token.clone()));
        true
    }

    fn finish(&mut self) {
        self.running = None;
    }
}

async fn handle_connection(
    agent: Arc<Agent>,
    stream: TcpStream,
    peer: SocketAddr,
    conn_token: CancellationToken,
) {
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(agent.max_frame_bytes));
    let (mut sink, mut lines) = framed.split();

    let control: Arc<Mutex<TaskControl>> = Arc::default();
    let (tx, mut rx) = mpsc::channel::<Incoming>(32);

    let reader_token = conn_token.clone();
    let reader_control = control.clone();
    let reader = tokio::spawn(async move {
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("[{}] read failed: {}", peer, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let incoming = match serde_json::from_str::<Request>(&line) {
                Ok(req) if req.id.is_none() && req.method == METHOD_CANCEL_TASK => {
                    if let Ok(mut control) = reader_control.lock() {
                        if control.cancel_latest() {
                            info!("[{}] task cancelled by client", peer);
                        } else {
                            debug!("[{}] cancel recorded before task start", peer);
                        }
                    }
                    continue;
                }
                Ok(req) if req.id.is_some() && req.method == METHOD_RUN_TASK => {
                    match reader_control.lock() {
                        Ok(mut control) => Incoming::Task(req, control.next_task()),
                        Err(_) => Incoming::Request(req),
                    }
                }
                Ok(req) => Incoming::Request(req),
                Err(e) => Incoming::Malformed(e.to_string()),
            };
            if tx.send(incoming).await.is_err() {
                break;
            }
        }
        // Connection gone: abort whatever this session is running.
        reader_token.cancel();
    });

    let mut session = Session {
        agent,
        lease: None,
        conn_token,
        control,
    };

    while let Some(incoming) = rx.recv().await {
        let response = match incoming {
            Incoming::Request(req) => session.dispatch(req, None).await,
            Incoming::Task(req, seq) => session.dispatch(req, Some(seq)).await,
            Incoming::Malformed(message) => {
                Some(Response::err(0, ERR_PARSE, format!("Parse error: {message}")))
            }
        };
        let Some(response) = response else {
            continue;
        };

        let line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                warn!("[{}] failed to encode response: {}", peer, e);
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            warn!("[{}] write failed: {}", peer, e);
            break;
        }
    }

    reader.abort();
    debug!("[{}] connection closed", peer);
}

/// Per-connection state.
struct Session {
    agent: Arc<Agent>,
    lease: Option<LeaseGuard>,
    conn_token: CancellationToken,
    control: Arc<Mutex<TaskControl>>,
}

impl Session {
    /// Handles one request. Notifications yield no response. `task_seq` is
    /// set for `task/run` calls.
    async fn dispatch(&mut self, req: Request, task_seq: Option<u64>) -> Option<Response> {
        let Some(id) = req.id else {
            debug!("Ignoring notification {}", req.method);
            return None;
        };

        let outcome = match req.method.as_str() {
            METHOD_HELLO => Ok(json!(HelloResult {
                version: env!("CARGO_PKG_VERSION").to_string(),
                root: self.agent.workspace.root().display().to_string(),
            })),
            METHOD_LEASE_ACQUIRE => self.acquire_lease(req.params),
            METHOD_LEASE_RELEASE => self.release_lease(req.params),
            METHOD_WRITE_FILE => self.write_file(req.params).await,
            METHOD_READ_FILE => self.read_file(req.params).await,
            METHOD_RUN_TASK => self.run_task(req.params, task_seq).await,
            other => Err(AgentError::MethodNotFound(other.to_string())),
        };

        Some(match outcome {
            Ok(value) => Response::ok(id, value),
            Err(e) => {
                debug!("{} failed: {}", req.method, e);
                let rpc = e.to_rpc();
                Response::err(id, rpc.code, rpc.message)
            }
        })
    }

    fn acquire_lease(&mut self, params: serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let params: AcquireLeaseParams = parse(params)?;
        if let Some(held) = &self.lease {
            return Ok(json!(held.grant()));
        }
        let guard = lease::acquire(&self.agent.state_dir, &params.holder)?;
        info!("Lease granted to {}", params.holder);
        let grant = json!(guard.grant());
        self.lease = Some(guard);
        Ok(grant)
    }

    fn release_lease(&mut self, params: serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let params: ReleaseLeaseParams = parse(params)?;
        self.require_lease(&params.token)?;
        self.lease = None;
        Ok(json!({}))
    }

    fn require_lease(&self, token: &str) -> Result<(), AgentError> {
        match &self.lease {
            Some(guard) if guard.token() == token => Ok(()),
            _ => Err(AgentError::LeaseRequired),
        }
    }

    async fn write_file(&self, params: serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let params: WriteFileParams = parse(params)?;
        self.require_lease(&params.lease)?;
        self.agent.workspace.write_file(&params.file).await?;
        Ok(json!({}))
    }

    async fn read_file(&self, params: serde_json::Value) -> Result<serde_json::Value, AgentError> {
        let params: ReadFileParams = parse(params)?;
        let content = self.agent.workspace.read_file(&params.path).await?;
        Ok(json!(ReadFileResult { content }))
    }

    async fn run_task(
        &self,
        params: serde_json::Value,
        seq: Option<u64>,
    ) -> Result<serde_json::Value, AgentError> {
        let invocation: TaskInvocation = parse(params)?;
        self.require_lease(&invocation.lease)?;

        let token = self.conn_token.child_token();
        if let (Some(seq), Ok(mut control)) = (seq, self.control.lock()) {
            if !control.start(seq, &token) {
                info!("Task cancelled before it started");
                return Err(AgentError::Cancelled);
            }
        }

        let result = self
            .agent
            .workspace
            .run_task(&invocation.argv, &invocation.collect, token)
            .await;

        if let Ok(mut control) = self.control.lock() {
            control.finish();
        }

        Ok(json!(result?))
    }
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, AgentError> {
    serde_json::from_value(params).map_err(|e| AgentError::invalid_params(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::testing::LocalAgent;
    use super::*;
    use crate::protocol::CollectSpec;
    use std::time::{Duration, Instant};

    fn invocation(argv: &[&str], lease: &str) -> TaskInvocation {
        TaskInvocation {
            argv: argv.iter().map(ToString::to_string).collect(),
            collect: CollectSpec::default(),
            lease: lease.to_string(),
        }
    }

    #[test]
    fn test_cancel_before_start_blocks_task() {
        let mut control = TaskControl::default();
        let seq = control.next_task();
        assert!(!control.cancel_latest());

        assert!(!control.start(seq, &CancellationToken::new()));
    }

    #[test]
    fn test_cancel_reaches_running_task() {
        let mut control = TaskControl::default();
        let seq = control.next_task();
        let token = CancellationToken::new();
        assert!(control.start(seq, &token));

        assert!(control.cancel_latest());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_late_cancel_does_not_leak_into_next_task() {
        let mut control = TaskControl::default();
        let first = control.next_task();
        assert!(control.start(first, &CancellationToken::new()));
        control.finish();

        // Arrives after the first task answered.
        control.cancel_latest();

        let second = control.next_task();
        assert!(control.start(second, &CancellationToken::new()));
    }

    #[tokio::test]
    async fn test_cancel_right_behind_run_is_honored() {
        let agent = LocalAgent::start(Vec::new()).await;
        let mut client = agent.connect().await;
        let grant = client.acquire_lease("test").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let err = client
            .run_task(&invocation(&["sleep", "5"], &grant.token), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));

        // The connection stays usable for the next task.
        let result = client
            .run_task(
                &invocation(&["true"], &grant.token),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
    }

    #[cfg(unix)]
    fn is_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_kills_running_task() {
        let agent = LocalAgent::start(Vec::new()).await;
        let mut client = agent.connect().await;
        let grant = client.acquire_lease("test").await.unwrap();

        let task = invocation(
            &["sh", "-c", "echo $$ > task.pid; exec sleep 30"],
            &grant.token,
        );
        let running = tokio::spawn(async move {
            let _ = client.run_task(&task, &CancellationToken::new()).await;
        });

        let pid_file = agent.root().join("task.pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        let pid = loop {
            let parsed = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            if let Some(pid) = parsed {
                break pid;
            }
            assert!(Instant::now() < deadline, "task never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert!(is_alive(pid));

        // Dropping the client closes the connection mid-task.
        running.abort();
        let _ = running.await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while is_alive(pid) {
            assert!(Instant::now() < deadline, "task {pid} outlived its connection");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
