//! Client side of the agent connection.
//!
//! Turns a tunnel address into a connected [`AgentClient`]: connect with a
//! fixed retry budget, then handshake. The handshake is the readiness
//! signal, since a port-forward may accept locally before the agent listens.
//!
//! ```text
//! ┌──────────────┐   JSON lines over TCP   ┌─────────────┐
//! │ AgentClient  │ ──requests────────────▸ │   Agent     │
//! │  (boxrun)    │ ◂──responses─────────── │ (in sandbox)│
//! └──────────────┘                         └─────────────┘
//! ```

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    AcquireLeaseParams, FileRecord, HelloResult, LeaseGrant, ReadFileParams, ReadFileResult,
    ReleaseLeaseParams, Request, Response, RpcError, TaskInvocation, TaskResult,
    WriteFileParams, ERR_CANCELLED, ERR_LAUNCH, ERR_LEASE_HELD, METHOD_CANCEL_TASK, METHOD_HELLO,
    METHOD_LEASE_ACQUIRE, METHOD_LEASE_RELEASE, METHOD_READ_FILE, METHOD_RUN_TASK,
    METHOD_WRITE_FILE,
};

type Channel = Framed<TcpStream, LinesCodec>;

/// Agent transport error.
#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("Could not reach sandbox agent at {addr} after {attempts} attempts: {last_error}")]
    ConnectExhausted {
        addr: SocketAddr,
        attempts: u32,
        last_error: String,
    },

    #[error("Agent connection closed")]
    ChannelClosed,

    #[error("Tunnel closed: {0}")]
    TunnelClosed(String),

    #[error("Agent connection error: {0}")]
    Frame(String),

    #[error("Failed to serialize request: {0}")]
    SerializeError(String),

    #[error("Failed to deserialize response: {0}")]
    DeserializeError(String),

    #[error("Agent RPC error: {0}")]
    RpcError(RpcError),

    #[error("Cancelled before the task was sent")]
    Cancelled,
}

impl TransportError {
    /// Returns true if the agent could not start the task process.
    #[allow(dead_code)] // Public API for callers
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::RpcError(e) if e.code == ERR_LAUNCH)
    }

    /// Returns true if the task was cancelled, locally or on the agent.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::RpcError(e) => e.code == ERR_CANCELLED,
            _ => false,
        }
    }

    /// Returns true if another session holds the sandbox.
    pub fn is_lease_held(&self) -> bool {
        matches!(self, Self::RpcError(e) if e.code == ERR_LEASE_HELD)
    }

    /// Returns true if the connect retry budget ran out.
    #[allow(dead_code)] // Public API for callers
    pub fn is_connect_exhausted(&self) -> bool {
        matches!(self, Self::ConnectExhausted { .. })
    }
}

/// Retry budget for reaching a freshly started agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub attempt_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Connects to the agent at `addr`, retrying per `policy`.
///
/// Each attempt is a TCP connect plus an `agent/hello` handshake, bounded
/// together by `attempt_timeout`.
pub(crate) async fn connect_with_retry(
    addr: SocketAddr,
    policy: ConnectPolicy,
) -> Result<AgentClient, TransportError> {
    connect_while(addr, policy, || Ok(())).await
}

/// Like [`connect_with_retry`], but stops early once `alive` reports that
/// the tunnel behind `addr` is gone.
pub(crate) async fn connect_while<F>(
    addr: SocketAddr,
    policy: ConnectPolicy,
    mut alive: F,
) -> Result<AgentClient, TransportError>
where
    F: FnMut() -> Result<(), String>,
{
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=policy.attempts {
        alive().map_err(TransportError::TunnelClosed)?;
        match tokio::time::timeout(policy.attempt_timeout, AgentClient::connect(addr, policy)).await
        {
            Ok(Ok(client)) => {
                info!(
                    "Connected to sandbox agent {} (root {})",
                    client.hello.version, client.hello.root
                );
                return Ok(client);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", policy.attempt_timeout),
        }

        debug!(
            "Connect attempt {}/{} to {} failed: {}",
            attempt, policy.attempts, addr, last_error
        );
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    warn!("Giving up on sandbox agent at {}", addr);
    Err(TransportError::ConnectExhausted {
        addr,
        attempts: policy.attempts,
        last_error,
    })
}

/// A connected, handshaken session with the agent.
#[derive(Debug)]
pub(crate) struct AgentClient {
    channel: Channel,
    next_id: u64,
    hello: HelloResult,
}

impl AgentClient {
    async fn connect(addr: SocketAddr, policy: ConnectPolicy) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Frame(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Frame(e.to_string()))?;

        let mut client = Self {
            channel: Framed::new(stream, LinesCodec::new_with_max_length(policy.max_frame_bytes)),
            next_id: 1,
            hello: HelloResult {
                version: String::new(),
                root: String::new(),
            },
        };
        client.hello = client.call(METHOD_HELLO, json!({})).await?;
        Ok(client)
    }

    /// Handshake result: agent version and sandbox root.
    pub fn hello(&self) -> &HelloResult {
        &self.hello
    }

    pub async fn acquire_lease(&mut self, holder: &str) -> Result<LeaseGrant, TransportError> {
        self.call(
            METHOD_LEASE_ACQUIRE,
            AcquireLeaseParams {
                holder: holder.to_string(),
            },
        )
        .await
    }

    pub async fn release_lease(&mut self, token: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                METHOD_LEASE_RELEASE,
                ReleaseLeaseParams {
                    token: token.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn write_file(&mut self, file: FileRecord, lease: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                METHOD_WRITE_FILE,
                WriteFileParams {
                    file,
                    lease: lease.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let result: ReadFileResult = self
            .call(
                METHOD_READ_FILE,
                ReadFileParams {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(result.content)
    }

    /// Sends `task/run` and waits for the result without a deadline.
    ///
    /// If `cancel` fires first, a `task/cancel` notification is sent and the
    /// agent's answer (normally a cancellation error) is still awaited.
    pub async fn run_task(
        &mut self,
        invocation: &TaskInvocation,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, TransportError> {
        let id = self.send(METHOD_RUN_TASK, invocation).await?;
        let mut cancel_sent = false;

        loop {
            tokio::select! {
                value = read_response(&mut self.channel, id) => {
                    return decode(value?);
                }
                () = cancel.cancelled(), if !cancel_sent => {
                    warn!("Cancelling remote task");
                    write_request(
                        &mut self.channel,
                        &Request::notification(METHOD_CANCEL_TASK, json!({})),
                    )
                    .await?;
                    cancel_sent = true;
                }
            }
        }
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<R, TransportError> {
        let id = self.send(method, params).await?;
        decode(read_response(&mut self.channel, id).await?)
    }

    async fn send<P: Serialize>(&mut self, method: &str, params: P) -> Result<u64, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let params = serde_json::to_value(params)
            .map_err(|e| TransportError::SerializeError(e.to_string()))?;
        write_request(&mut self.channel, &Request::call(id, method, params)).await?;
        Ok(id)
    }
}

async fn write_request(channel: &mut Channel, request: &Request) -> Result<(), TransportError> {
    let line =
        serde_json::to_string(request).map_err(|e| TransportError::SerializeError(e.to_string()))?;
    channel
        .send(line)
        .await
        .map_err(|e| TransportError::Frame(e.to_string()))
}

/// Reads lines until the response for `id` arrives.
async fn read_response(channel: &mut Channel, id: u64) -> Result<serde_json::Value, TransportError> {
    loop {
        let line = match channel.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(TransportError::Frame(e.to_string())),
            None => return Err(TransportError::ChannelClosed),
        };
        if line.trim().is_empty() {
            continue;
        }

        let response: Response = serde_json::from_str(&line)
            .map_err(|e| TransportError::DeserializeError(e.to_string()))?;
        if response.id != id {
            if let Some(err) = response.error {
                return Err(TransportError::RpcError(err));
            }
            warn!("Response for unknown id {}", response.id);
            continue;
        }

        return match response.error {
            Some(err) => Err(TransportError::RpcError(err)),
            None => Ok(response.result.unwrap_or_default()),
        };
    }
}

fn decode<R: DeserializeOwned>(value: serde_json::Value) -> Result<R, TransportError> {
    serde_json::from_value(value).map_err(|e| TransportError::DeserializeError(e.to_string()))
}
