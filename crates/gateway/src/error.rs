//! Error types for the gateway layer.

use mcp_registry_catalog::CatalogError;
use mcp_registry_runner::{RpcError, RunnerError};
use thiserror::Error;

/// Main error type for mount, dispatch and surface operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Second activation for an entry that is already mounted (idempotent;
    /// no child was spawned)
    #[error("server already active: {0}")]
    AlreadyActive(String),

    /// Deactivation/config for an entry with no active mount
    #[error("server not active: {0}")]
    NotActive(String),

    /// Entry's launch method cannot be mounted
    #[error("unsupported launch method: {0}")]
    UnsupportedLaunch(String),

    /// `initialize` or discovery failed or timed out; the mount was rolled
    /// back
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The child returned a JSON-RPC error for `tools/call`
    #[error("tool call failed ({code}): {message}")]
    ToolCallFailed { code: i64, message: String },

    /// The schema converter rejected a tool definition
    #[error("invalid tool schema: {0}")]
    SchemaInvalid(String),

    /// Malformed or already-taken mount prefix
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// Dispatch target is not a known dynamic tool
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Caller arguments failed the descriptor's contract
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Mount exists but its RPC client handle is gone
    #[error("rpc client unavailable for {0}")]
    ClientUnavailable(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
