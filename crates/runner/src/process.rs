//! Supervisor for stdio-based MCP servers run as direct subprocesses
//! (npx/node/python entrypoints and friends).

use crate::error::{Result, RunnerError};
use crate::{ChildIo, SpawnedChild};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};

/// Environment keys inherited from the gateway process when not set
/// explicitly for the child.
const INHERITED_ENV: [&str; 4] = ["PATH", "HOME", "USER", "SHELL"];

/// How long a child gets to crash before we accept it as started.
const SETTLE_WINDOW: Duration = Duration::from_millis(500);

/// Manages local subprocess children keyed by opaque handle id.
pub struct ProcessSupervisor {
    children: Mutex<HashMap<String, Child>>,
    grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::with_grace(Duration::from_secs(10))
    }

    /// `grace` bounds the wait between graceful terminate and force kill.
    #[must_use]
    pub fn with_grace(grace: Duration) -> Self {
        ProcessSupervisor {
            children: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Spawn a child with all three stdio streams captured.
    ///
    /// # Errors
    ///
    /// `CommandNotFound` if `command` is not on PATH, `SpawnFailed` if the
    /// OS rejects the spawn, `SettleExit` if the child dies within 500 ms
    /// (with its captured stderr).
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<SpawnedChild> {
        let resolved = which::which(command)
            .map_err(|_| RunnerError::CommandNotFound(command.to_string()))?;

        let mut merged: HashMap<String, String> = env.clone();
        for key in INHERITED_ENV {
            if !merged.contains_key(key)
                && let Ok(value) = std::env::var(key)
            {
                merged.insert(key.to_string(), value);
            }
        }

        tracing::info!(
            command = %resolved.display(),
            args = ?args,
            "spawning stdio server"
        );

        let mut child = Command::new(&resolved)
            .args(args)
            .env_clear()
            .envs(&merged)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed(format!("{command}: {e}")))?;

        tokio::time::sleep(SETTLE_WINDOW).await;

        if let Some(status) = child
            .try_wait()
            .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?
        {
            let stderr = match child.stderr.take() {
                Some(mut pipe) => {
                    let mut buf = Vec::new();
                    let _ = tokio::time::timeout(
                        Duration::from_millis(250),
                        pipe.read_to_end(&mut buf),
                    )
                    .await;
                    String::from_utf8_lossy(&buf).trim().to_string()
                }
                None => String::new(),
            };
            return Err(RunnerError::SettleExit {
                status: status.to_string(),
                stderr,
            });
        }

        let pid = child.id();
        let io = ChildIo {
            stdin: child
                .stdin
                .take()
                .ok_or_else(|| RunnerError::SpawnFailed("child stdin not captured".into()))?,
            stdout: child
                .stdout
                .take()
                .ok_or_else(|| RunnerError::SpawnFailed("child stdout not captured".into()))?,
            stderr: child.stderr.take(),
        };

        let handle_id = format!("proc-{}", uuid::Uuid::new_v4());
        self.children.lock().insert(handle_id.clone(), child);
        tracing::info!(handle_id = %handle_id, pid = ?pid, "stdio server started");

        Ok(SpawnedChild {
            handle_id,
            pid,
            container_id: None,
            io,
        })
    }

    /// Stop a child: graceful terminate, then force kill after the grace
    /// period. Returns false if the handle is unknown.
    pub async fn stop(&self, handle_id: &str) -> bool {
        let Some(mut child) = self.children.lock().remove(handle_id) else {
            tracing::warn!(handle_id = %handle_id, "stop requested for unknown child");
            return false;
        };

        if matches!(child.try_wait(), Ok(Some(_))) {
            return true;
        }

        terminate(&child);
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => {
                tracing::info!(handle_id = %handle_id, "child terminated gracefully");
            }
            Err(_) => {
                tracing::warn!(handle_id = %handle_id, "child did not terminate, force killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        true
    }

    /// Force kill without the graceful phase.
    pub async fn kill(&self, handle_id: &str) -> bool {
        let Some(mut child) = self.children.lock().remove(handle_id) else {
            return false;
        };
        let _ = child.start_kill();
        let _ = child.wait().await;
        true
    }

    #[must_use]
    pub fn is_running(&self, handle_id: &str) -> bool {
        let mut children = self.children.lock();
        match children.get_mut(handle_id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// handle id → PID of every live child.
    #[must_use]
    pub fn list_running(&self) -> HashMap<String, u32> {
        let mut children = self.children.lock();
        children
            .iter_mut()
            .filter_map(|(id, child)| {
                if matches!(child.try_wait(), Ok(None)) {
                    child.id().map(|pid| (id.clone(), pid))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Stop every tracked child. Idempotent; runs on gateway shutdown.
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = self.children.lock().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "cleaning up stdio servers");
        for id in ids {
            self.stop(&id).await;
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No SIGTERM equivalent; the force-kill fallback handles it.
    let _ = child;
}
