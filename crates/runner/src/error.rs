//! Error types for supervisors and the RPC client.

use std::time::Duration;
use thiserror::Error;

/// Errors from the process/container supervisors.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Container tool missing or failed its version probe at startup
    #[error("supervisor not available: {0}")]
    SupervisorNotAvailable(String),

    /// Command not resolvable on PATH
    #[error("command '{0}' not found in PATH")]
    CommandNotFound(String),

    /// Subprocess or container failed to start
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// Child exited within the settle window after spawn
    #[error("child exited immediately ({status}): {stderr}")]
    SettleExit { status: String, stderr: String },

    /// A container-tool invocation returned a non-zero exit
    #[error("container command failed: {0}")]
    ContainerFailed(String),

    /// Volume mounts are rejected in the default profile
    #[error("volume mounts are disabled in the default profile")]
    VolumesDisabled,

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors from the stdio JSON-RPC client.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Pending-slot deadline elapsed; the slot has been removed
    #[error("rpc timeout after {timeout:?} waiting for '{method}'")]
    Timeout { method: String, timeout: Duration },

    /// Child stdout hit EOF (or the client was closed) with the call in flight
    #[error("rpc connection closed")]
    ConnectionClosed,

    /// The remote returned a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Remote { code: i64, message: String },

    /// The remote sent something that is not valid JSON-RPC
    #[error("rpc protocol error: {0}")]
    Protocol(String),

    /// IO errors on the child's stdin
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// JSON-RPC "method not found"; list calls treat it as an empty result.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, RpcError::Remote { code: -32601, .. })
    }
}
