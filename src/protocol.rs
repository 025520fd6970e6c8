//! JSON-RPC protocol types shared by the client and the sandbox agent.
//!
//! Wire format: one JSON object per line over a TCP stream.
//! - Requests have `id` + `method` + optional `params`
//! - Responses have `id` + `result` or `error`
//! - Notifications have `method` + `params` but NO `id`
//!
//! File contents and captured process output are raw bytes; they travel
//! base64-encoded inside the JSON documents.

use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Method names
// -----------------------------------------------------------------------------

pub(crate) const METHOD_HELLO: &str = "agent/hello";
pub(crate) const METHOD_LEASE_ACQUIRE: &str = "lease/acquire";
pub(crate) const METHOD_LEASE_RELEASE: &str = "lease/release";
pub(crate) const METHOD_WRITE_FILE: &str = "fs/writeFile";
pub(crate) const METHOD_READ_FILE: &str = "fs/readFile";
pub(crate) const METHOD_RUN_TASK: &str = "task/run";
pub(crate) const METHOD_CANCEL_TASK: &str = "task/cancel";

// -----------------------------------------------------------------------------
// Error codes
// -----------------------------------------------------------------------------

pub(crate) const ERR_PARSE: i32 = -32700;
pub(crate) const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub(crate) const ERR_INVALID_PARAMS: i32 = -32602;
pub(crate) const ERR_INTERNAL: i32 = -32603;
pub(crate) const ERR_IO: i32 = -1;
pub(crate) const ERR_NOT_FOUND: i32 = -2;
pub(crate) const ERR_PATH_ESCAPE: i32 = -3;
pub(crate) const ERR_LAUNCH: i32 = -4;
pub(crate) const ERR_CANCELLED: i32 = -5;
pub(crate) const ERR_LEASE_HELD: i32 = -6;
pub(crate) const ERR_LEASE_REQUIRED: i32 = -7;

/// Default maximum length of a single protocol line.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// -----------------------------------------------------------------------------
// Envelope
// -----------------------------------------------------------------------------

/// Any message a peer may send: a request or a notification.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn call(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self {
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// Response to a request with an `id`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub(crate) struct RpcError {
    pub code: i32,
    pub message: String,
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// -----------------------------------------------------------------------------
// agent/hello
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HelloResult {
    pub version: String,
    pub root: String,
}

// -----------------------------------------------------------------------------
// lease/*
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AcquireLeaseParams {
    pub holder: String,
}

/// A granted lease. The token must accompany every mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LeaseGrant {
    pub token: String,
    pub holder: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReleaseLeaseParams {
    pub token: String,
}

// -----------------------------------------------------------------------------
// fs/*
// -----------------------------------------------------------------------------

/// A whole file, addressed relative to a root. Paths use `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileRecord {
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WriteFileParams {
    #[serde(flatten)]
    pub file: FileRecord,
    pub lease: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReadFileParams {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReadFileResult {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

// -----------------------------------------------------------------------------
// task/*
// -----------------------------------------------------------------------------

/// Which files the caller wants back after a task finishes.
///
/// A file is returned when it matches any of `patterns` (globs relative to
/// the sandbox root) and, with `modified_only`, was modified after the task
/// started. An empty pattern list returns nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CollectSpec {
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub modified_only: bool,
}

impl CollectSpec {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// The command to execute inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TaskInvocation {
    pub argv: Vec<String>,
    #[serde(default)]
    pub collect: CollectSpec,
    pub lease: String,
}

/// Outcome of a launched task. A non-zero `exit_code` is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TaskResult {
    pub exit_code: i32,
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    #[serde(default)]
    pub changed_files: Vec<FileRecord>,
}

/// Serde adapter encoding `Vec<u8>` as a standard base64 string.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_has_no_id() {
        let line = serde_json::to_string(&Request::notification(METHOD_CANCEL_TASK, json!({})))
            .unwrap();
        assert!(!line.contains("\"id\""));
        assert!(line.contains("task/cancel"));
    }

    #[test]
    fn test_request_without_params_parses() {
        let req: Request = serde_json::from_str(r#"{"id":7,"method":"agent/hello"}"#).unwrap();
        assert_eq!(req.id, Some(7));
        assert_eq!(req.method, METHOD_HELLO);
        assert!(req.params.is_null());
    }

    #[test]
    fn test_file_record_content_is_base64() {
        let record = FileRecord {
            path: "bin/blob".to_string(),
            content: vec![0, 159, 146, 150, 255],
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["content"], "AJ+Slv8=");

        let back: FileRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_write_params_flatten_record() {
        let params = WriteFileParams {
            file: FileRecord {
                path: "a.txt".to_string(),
                content: b"hi".to_vec(),
            },
            lease: "tok".to_string(),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["path"], "a.txt");
        assert_eq!(value["content"], "aGk=");
        assert_eq!(value["lease"], "tok");
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let err = serde_json::from_str::<ReadFileResult>(r#"{"content":"***"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let resp = Response::err(3, ERR_NOT_FOUND, "missing");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["error"]["code"], ERR_NOT_FOUND);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_collect_spec_defaults_to_empty() {
        let inv: TaskInvocation =
            serde_json::from_str(r#"{"argv":["make"],"lease":"t"}"#).unwrap();
        assert!(inv.collect.is_empty());
        assert!(!inv.collect.modified_only);
    }
}
