//! Request and response types exchanged between controller and agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bumped whenever a frame changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// A request line sent by the controller.
///
/// `Exec` switches the connection into streaming mode: every following line
/// is an [`ExecRequestFrame`] and the agent answers with [`Response::Exec`]
/// frames until `done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Start(StartRequest),
    Stop(StopRequest),
    Status,
    Version,
    Stdin(StdinRequest),
    Exec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub command: String,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub pid: u32,
    /// Grace period before force-termination; agent default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdinRequest {
    pub pid: u32,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// One inbound frame on an Exec stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExecRequestFrame {
    Input(#[serde(with = "base64_bytes")] Vec<u8>),
    Eof,
}

/// A response line sent by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Started(StartResponse),
    Stopped(StopResponse),
    Status(AgentStatus),
    Version(VersionResponse),
    StdinAck,
    Exec(ExecResponseFrame),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub running: bool,
    pub version: String,
    pub started_at: DateTime<Utc>,
    /// Headless processes currently registered.
    pub processes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub protocol: u32,
}

impl VersionResponse {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
        }
    }

    /// Whether an agent reporting `self` needs replacing by a controller
    /// running `local`.
    pub fn needs_upgrade(&self, local: &VersionResponse) -> bool {
        self.protocol != local.protocol || self.version != local.version
    }
}

/// One outbound frame on an Exec stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponseFrame {
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub stdout: Vec<u8>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub stderr: Vec<u8>,
    #[serde(default)]
    pub done: bool,
    /// Only set on the `done` frame, when the exit status is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecResponseFrame {
    /// A frame carrying process stdout.
    pub fn stdout(bytes: Vec<u8>) -> Self {
        Self {
            stdout: bytes,
            ..Default::default()
        }
    }

    /// A frame carrying process stderr.
    pub fn stderr(bytes: Vec<u8>) -> Self {
        Self {
            stderr: bytes,
            ..Default::default()
        }
    }

    /// The final frame of a stream.
    pub fn done(exit_code: Option<i32>) -> Self {
        Self {
            done: true,
            exit_code,
            ..Default::default()
        }
    }
}

/// Machine-readable failure class of an [`ErrorResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    SpawnFailed,
    Protocol,
    Internal,
}

impl ErrorCode {
    /// Wire spelling of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Shorthand for a [`Response::Error`].
pub fn error_response(code: ErrorCode, message: impl Into<String>) -> Response {
    Response::Error(ErrorResponse {
        code,
        message: message.into(),
    })
}

/// Byte fields travel as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
