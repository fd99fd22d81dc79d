//! Child supervision and downstream JSON-RPC for the MCP registry gateway.
//!
//! Two supervisors (local processes and interactive containers) hand out
//! [`SpawnedChild`] handles; the [`rpc::RpcClient`] takes the child's stdio
//! streams and speaks newline-delimited JSON-RPC 2.0 over them.

pub mod command;
pub mod container;
pub mod error;
pub mod process;
pub mod rpc;

pub use command::{parse_command_line, render_command_line, validate_command_available};
pub use container::{ContainerInfo, ContainerSupervisor};
pub use error::{Result, RpcError, RunnerError};
pub use process::ProcessSupervisor;
pub use rpc::{Notification, PROTOCOL_VERSION, RpcClient, RpcClientOptions};

use tokio::process::{ChildStderr, ChildStdin, ChildStdout};

/// Stdio streams of a spawned child. Owned by the RPC client once handed
/// over; the supervisor keeps only the process handle.
pub struct ChildIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// A running child plus the opaque id the supervisor tracks it under.
pub struct SpawnedChild {
    /// Supervisor-scoped handle id; also the RPC client registry key.
    pub handle_id: String,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub io: ChildIo,
}
