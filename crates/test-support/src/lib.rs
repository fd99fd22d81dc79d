//! Shared helpers for the workspace's test suites.

use mcp_registry_catalog::{Entry, LaunchMethod, ServerCommand, SourceType, Store};
use std::collections::HashMap;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Kills the wrapped process when the test ends, passing or not.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

/// A store rooted in a fresh temp dir. Keep the `TempDir` alive for the
/// duration of the test.
///
/// # Errors
///
/// Returns an error if the temp directory or store cannot be created.
pub fn temp_store(refresh_interval: Duration) -> anyhow::Result<(TempDir, Arc<Store>)> {
    let dir = TempDir::new()?;
    let store = Store::open(
        dir.path().join("cache"),
        dir.path().join("sources"),
        refresh_interval,
    )?;
    Ok((dir, Arc::new(store)))
}

/// A valid stdio-launchable entry pointing at `command`.
#[must_use]
pub fn stdio_entry(id: &str, command: &str, env: HashMap<String, String>) -> Entry {
    let mut entry = Entry::new(id, id, "test stdio server", SourceType::Custom)
        .expect("test entry ids are valid");
    entry.launch_method = LaunchMethod::Stdio;
    entry.server_command = Some(ServerCommand {
        command: command.to_string(),
        args: Vec::new(),
        env,
    });
    entry
}

/// A container-launchable entry with the given image reference.
#[must_use]
pub fn container_entry(id: &str, image: &str) -> Entry {
    let mut entry = Entry::new(id, id, "test container server", SourceType::Docker)
        .expect("test entry ids are valid");
    entry.launch_method = LaunchMethod::Container;
    entry.container_image = Some(image.to_string());
    entry
}
