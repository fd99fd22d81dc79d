//! Container supervision via the podman/docker CLI.
//!
//! Detached containers are fire-and-forget services; interactive containers
//! pipe stdio back to the caller and are the mode the mount engine uses for
//! MCP servers.

use crate::error::{Result, RunnerError};
use crate::{ChildIo, SpawnedChild};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};

const SETTLE_WINDOW: Duration = Duration::from_millis(500);

/// Bookkeeping for one managed container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub environment: HashMap<String, String>,
}

struct ManagedContainer {
    info: ContainerInfo,
    /// Present for interactive containers: the `podman run -i` process.
    child: Option<Child>,
}

/// Manages containers through the configured container tool.
pub struct ContainerSupervisor {
    program: String,
    containers: Mutex<HashMap<String, ManagedContainer>>,
    grace: Duration,
}

impl ContainerSupervisor {
    /// Probe the container tool (`<program> --version`) and build the
    /// supervisor.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorNotAvailable` if the tool is missing or the probe
    /// fails/times out.
    pub async fn probe(program: impl Into<String>) -> Result<Self> {
        let program = program.into();
        let mut probe = Command::new(&program);
        probe.arg("--version");
        match tokio::time::timeout(Duration::from_secs(5), probe.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                tracing::info!(tool = %program, version = %version, "container tool available");
                Ok(ContainerSupervisor {
                    program,
                    containers: Mutex::new(HashMap::new()),
                    grace: Duration::from_secs(10),
                })
            }
            Ok(Ok(output)) => Err(RunnerError::SupervisorNotAvailable(format!(
                "{program} --version failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Ok(Err(e)) => Err(RunnerError::SupervisorNotAvailable(format!(
                "{program} not found: {e}"
            ))),
            Err(_) => Err(RunnerError::SupervisorNotAvailable(format!(
                "{program} --version timed out"
            ))),
        }
    }

    #[must_use]
    pub fn tool(&self) -> &str {
        &self.program
    }

    #[cfg(test)]
    fn unprobed(program: &str) -> Self {
        ContainerSupervisor {
            program: program.to_string(),
            containers: Mutex::new(HashMap::new()),
            grace: Duration::from_secs(1),
        }
    }

    /// Pull an image if not present.
    ///
    /// # Errors
    ///
    /// Returns `ContainerFailed` with the tool's stderr on a non-zero exit.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        tracing::info!(image = %image, "pulling image");
        let (_, stderr, code) = self.run_tool(&["pull", image]).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(RunnerError::ContainerFailed(format!(
                "pull {image}: {stderr}"
            )))
        }
    }

    /// Run a detached container (`-d --rm --name`). Volume mounts are
    /// rejected in the default profile. Returns the container id.
    ///
    /// # Errors
    ///
    /// `VolumesDisabled` if volumes were requested, `ContainerFailed` on a
    /// non-zero run exit.
    pub async fn run_detached(
        &self,
        image: &str,
        name: &str,
        environment: &HashMap<String, String>,
        ports: &HashMap<String, String>,
        volumes: &HashMap<String, String>,
    ) -> Result<String> {
        if !volumes.is_empty() {
            tracing::warn!(name = %name, "volume mounts requested but disabled");
            return Err(RunnerError::VolumesDisabled);
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
        ];
        for (key, value) in environment {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (host, container) in ports {
            args.push("-p".into());
            args.push(format!("{host}:{container}"));
        }
        args.push(image.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let (stdout, stderr, code) = self.run_tool(&arg_refs).await?;
        if code != 0 {
            return Err(RunnerError::ContainerFailed(format!(
                "run {name}: {stderr}"
            )));
        }

        let container_id = stdout.trim().to_string();
        tracing::info!(container = %short_id(&container_id), name = %name, "container started");
        self.containers.lock().insert(
            container_id.clone(),
            ManagedContainer {
                info: ContainerInfo {
                    container_id: container_id.clone(),
                    name: name.to_string(),
                    image: image.to_string(),
                    status: "running".into(),
                    created_at: Utc::now(),
                    environment: environment.clone(),
                },
                child: None,
            },
        );
        Ok(container_id)
    }

    /// Run an interactive container (`-i --rm --name`) with stdio piped back
    /// to the caller. This is the mode the mount engine uses.
    ///
    /// # Errors
    ///
    /// `SpawnFailed` if the run process cannot start, `SettleExit` if it
    /// dies within 500 ms (with captured stderr).
    pub async fn run_interactive(
        &self,
        image: &str,
        name: &str,
        environment: &HashMap<String, String>,
    ) -> Result<SpawnedChild> {
        let mut command = Command::new(&self.program);
        command.arg("run").arg("-i").arg("--rm").arg("--name").arg(name);
        for (key, value) in environment {
            command.arg("-e").arg(format!("{key}={value}"));
        }
        command.arg(image);

        tracing::info!(image = %image, name = %name, "starting interactive container");

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed(format!("{} run: {e}", self.program)))?;

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

        let io = ChildIo {
            stdin: child
                .stdin
                .take()
                .ok_or_else(|| RunnerError::SpawnFailed("container stdin not captured".into()))?,
            stdout: child
                .stdout
                .take()
                .ok_or_else(|| RunnerError::SpawnFailed("container stdout not captured".into()))?,
            stderr: child.stderr.take(),
        };

        // The real container id is not cheap to learn in interactive mode;
        // the name doubles as the id (it was passed to --name).
        let handle_id = format!("interactive-{name}");
        let pid = child.id();
        self.containers.lock().insert(
            handle_id.clone(),
            ManagedContainer {
                info: ContainerInfo {
                    container_id: handle_id.clone(),
                    name: name.to_string(),
                    image: image.to_string(),
                    status: "running".into(),
                    created_at: Utc::now(),
                    environment: environment.clone(),
                },
                child: Some(child),
            },
        );

        Ok(SpawnedChild {
            handle_id: handle_id.clone(),
            pid,
            container_id: Some(handle_id),
            io,
        })
    }

    /// Stop a container gracefully (`stop -t <grace>`), falling back to
    /// `kill`. Returns false if the handle is unknown.
    pub async fn stop(&self, handle_id: &str) -> bool {
        let Some(mut managed) = self.containers.lock().remove(handle_id) else {
            tracing::warn!(handle_id = %handle_id, "stop requested for unknown container");
            return false;
        };

        let name = managed.info.name.clone();
        let grace_secs = self.grace.as_secs().to_string();
        let stopped = match self.run_tool(&["stop", "-t", &grace_secs, &name]).await {
            Ok((_, _, 0)) => true,
            Ok((_, stderr, _)) => {
                tracing::warn!(name = %name, stderr = %stderr, "stop failed, killing");
                matches!(self.run_tool(&["kill", &name]).await, Ok((_, _, 0)))
            }
            Err(e) => {
                tracing::error!(name = %name, error = %e, "container stop errored");
                false
            }
        };

        // Interactive runs also hold the `run -i` process; reap it.
        if let Some(child) = managed.child.as_mut() {
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        if stopped {
            tracing::info!(name = %name, "container stopped");
        }
        stopped
    }

    /// Force kill a container.
    pub async fn kill(&self, handle_id: &str) -> bool {
        let Some(mut managed) = self.containers.lock().remove(handle_id) else {
            return false;
        };
        let name = managed.info.name.clone();
        let killed = matches!(self.run_tool(&["kill", &name]).await, Ok((_, _, 0)));
        if let Some(child) = managed.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        killed
    }

    /// Execute a command inside a running container, optionally feeding
    /// stdin. Returns `(stdout, stderr, exit_code)`.
    ///
    /// # Errors
    ///
    /// Returns `SpawnFailed`/`Io` if the exec process cannot run.
    pub async fn exec(
        &self,
        container: &str,
        command: &[String],
        stdin_data: Option<&str>,
    ) -> Result<(String, String, i32)> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("exec").arg("-i").arg(container).args(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed(format!("{} exec: {e}", self.program)))?;

        if let Some(data) = stdin_data
            && let Some(mut stdin) = child.stdin.take()
        {
            use tokio::io::AsyncWriteExt as _;
            stdin.write_all(data.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            output.status.code().unwrap_or(-1),
        ))
    }

    /// Tail a container's logs.
    ///
    /// # Errors
    ///
    /// Returns `ContainerFailed` on a non-zero exit.
    pub async fn logs(&self, container: &str, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        let (stdout, stderr, code) = self
            .run_tool(&["logs", "--tail", &tail, container])
            .await?;
        if code == 0 {
            Ok(stdout)
        } else {
            Err(RunnerError::ContainerFailed(format!(
                "logs {container}: {stderr}"
            )))
        }
    }

    /// Inspect a container; `None` if the tool reports it unknown.
    ///
    /// # Errors
    ///
    /// Returns `ContainerFailed` if the inspect output is not valid JSON.
    pub async fn inspect(&self, container: &str) -> Result<Option<serde_json::Value>> {
        let (stdout, _, code) = self.run_tool(&["inspect", container]).await?;
        if code != 0 {
            return Ok(None);
        }
        let parsed: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| RunnerError::ContainerFailed(format!("inspect parse: {e}")))?;
        Ok(parsed.as_array().and_then(|arr| arr.first()).cloned())
    }

    /// List containers as reported by the tool (`ps --format json`).
    ///
    /// # Errors
    ///
    /// Returns `ContainerFailed` on a non-zero exit or unparsable output.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<serde_json::Value>> {
        let mut args = vec!["ps", "--format", "json"];
        if all {
            args.push("-a");
        }
        let (stdout, stderr, code) = self.run_tool(&args).await?;
        if code != 0 {
            return Err(RunnerError::ContainerFailed(format!("ps: {stderr}")));
        }
        let parsed: serde_json::Value = serde_json::from_str(&stdout)
            .map_err(|e| RunnerError::ContainerFailed(format!("ps parse: {e}")))?;
        Ok(parsed.as_array().cloned().unwrap_or_default())
    }

    /// Containers currently tracked by this supervisor.
    #[must_use]
    pub fn running(&self) -> Vec<ContainerInfo> {
        self.containers
            .lock()
            .values()
            .map(|m| m.info.clone())
            .collect()
    }

    /// Stop (or kill) every tracked container; returns how many went down.
    pub async fn cleanup_all(&self) -> usize {
        let ids: Vec<String> = self.containers.lock().keys().cloned().collect();
        let mut cleaned = 0;
        for id in ids {
            if self.stop(&id).await || self.kill(&id).await {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            tracing::info!(count = cleaned, "cleaned up containers");
        }
        cleaned
    }

    async fn run_tool(&self, args: &[&str]) -> Result<(String, String, i32)> {
        let output = Command::new(&self.program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            output.status.code().unwrap_or(-1),
        ))
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
