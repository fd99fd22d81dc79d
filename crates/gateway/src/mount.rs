//! The mount engine: activates catalog entries as running children,
//! discovers and registers their tools, dispatches upstream calls to the
//! right child, and tears everything down symmetrically.

use crate::error::{GatewayError, Result};
use crate::schema::{self, ToolDescriptor};
use crate::surface::ToolSurface;
use chrono::Utc;
use mcp_registry_catalog::{
    ActiveMount, Entry, LaunchMethod, ServerCommand, SourceType, Store, validate_env_keys,
    validate_id,
};
use mcp_registry_runner::{
    ContainerSupervisor, ProcessSupervisor, RpcClient, RpcClientOptions, RpcError, RunnerError,
    SpawnedChild,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of a successful activation.
#[derive(Debug, Clone)]
pub struct Activation {
    pub mount: ActiveMount,
    /// Fully-qualified names registered on the upstream surface.
    pub registered_tools: Vec<String>,
    pub capabilities: Value,
}

/// Orchestrates spawn → handshake → discover → register → record, and the
/// reverse. Owns the RPC client registry; mount records carry only the
/// opaque handle id.
pub struct MountEngine {
    store: Arc<Store>,
    processes: Arc<ProcessSupervisor>,
    containers: Option<Arc<ContainerSupervisor>>,
    surface: Arc<ToolSurface>,
    clients: RwLock<HashMap<String, Arc<RpcClient>>>,
    rpc_opts: RpcClientOptions,
}

impl MountEngine {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        processes: Arc<ProcessSupervisor>,
        containers: Option<Arc<ContainerSupervisor>>,
        surface: Arc<ToolSurface>,
        rpc_opts: RpcClientOptions,
    ) -> Self {
        MountEngine {
            store,
            processes,
            containers,
            surface,
            clients: RwLock::new(HashMap::new()),
            rpc_opts,
        }
    }

    #[must_use]
    pub fn surface(&self) -> &Arc<ToolSurface> {
        &self.surface
    }

    /// Activate a catalog entry: spawn its child, handshake, discover
    /// tools/resources/prompts, register converted tools upstream and record
    /// the mount. Emits one `tools/list_changed` when the tool set changed.
    ///
    /// # Errors
    ///
    /// `AlreadyActive` if the entry is mounted (idempotent, nothing
    /// spawned), `UnsupportedLaunch`/`SupervisorNotAvailable` before spawn,
    /// `HandshakeFailed` (after full rollback) for a child that will not
    /// speak MCP.
    pub async fn activate(&self, entry_id: &str, prefix: Option<&str>) -> Result<Activation> {
        if let Some(existing) = self.store.get_mount(entry_id) {
            return Err(GatewayError::AlreadyActive(format!(
                "{} (prefix: {})",
                existing.entry_id, existing.prefix
            )));
        }

        let entry = self
            .store
            .get(entry_id)
            .ok_or_else(|| mcp_registry_catalog::CatalogError::EntryNotFound(entry_id.into()))?;

        let prefix = match prefix {
            Some(p) => p.to_string(),
            None => derive_prefix(entry_id),
        };
        validate_prefix(&prefix)?;
        if let Some(taken) = self.store.find_mount_by_prefix(&prefix) {
            return Err(GatewayError::InvalidPrefix(format!(
                "'{prefix}' is already used by {}",
                taken.entry_id
            )));
        }

        let (child, environment) = self.spawn_child(&entry, &prefix).await?;
        let handle_id = child.handle_id.clone();
        let pid = child.pid;
        let container_id = child.container_id.clone();
        let client = Arc::new(RpcClient::for_child(child.io, self.rpc_opts.clone()));

        match self.discover_and_register(&entry, &prefix, &client).await {
            Ok((capabilities, descriptors, registered, resources, prompts)) => {
                let mount = ActiveMount {
                    entry_id: entry.id.clone(),
                    name: entry.name.clone(),
                    prefix,
                    handle_id: handle_id.clone(),
                    container_id,
                    pid,
                    environment,
                    mounted_at: Utc::now(),
                    tools: descriptors.iter().map(|d| d.original_name.clone()).collect(),
                    resources,
                    prompts,
                };
                self.clients.write().insert(handle_id, Arc::clone(&client));
                self.store.add_mount(mount.clone());
                if !registered.is_empty() {
                    self.surface.notify_tools_changed().await;
                }
                Ok(Activation {
                    mount,
                    registered_tools: registered,
                    capabilities,
                })
            }
            Err((e, registered)) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "mount failed, rolling back");
                self.surface.remove_tools(&registered);
                client.close().await;
                self.stop_child(&handle_id, container_id.is_some()).await;
                Err(e)
            }
        }
    }

    /// Deactivate a mount. Teardown order is fixed: tools → rpc → child →
    /// record; the reverse would let a call dispatch to a dead child.
    ///
    /// # Errors
    ///
    /// `NotActive` if the entry has no mount (idempotent, nothing torn
    /// down).
    pub async fn deactivate(&self, entry_id: &str) -> Result<ActiveMount> {
        let Some(mount) = self.store.get_mount(entry_id) else {
            return Err(GatewayError::NotActive(entry_id.into()));
        };

        let removed = self.surface.remove_entry_tools(entry_id);

        let client = self.clients.write().remove(&mount.handle_id);
        if let Some(client) = client {
            client.close().await;
        }

        self.stop_child(&mount.handle_id, mount.container_id.is_some())
            .await;

        let record = self.store.remove_mount(entry_id).unwrap_or(mount);
        if !removed.is_empty() {
            self.surface.notify_tools_changed().await;
        }
        Ok(record)
    }

    /// Dispatch an upstream call to the owning child and stringify the
    /// content blocks.
    ///
    /// # Errors
    ///
    /// `UnknownTool` for an unresolvable name, `NotActive` /
    /// `ClientUnavailable` for stale mounts, `InvalidArguments` for a
    /// descriptor violation, `ToolCallFailed` carrying the child's JSON-RPC
    /// error verbatim.
    pub async fn dispatch(&self, full_name: &str, args: Map<String, Value>) -> Result<String> {
        // Exact descriptor lookup first.
        if let Some(dynamic) = self.surface.get(full_name) {
            let payload = dynamic
                .descriptor
                .build_payload(&args)
                .map_err(GatewayError::InvalidArguments)?;
            let mount = self
                .store
                .get_mount(&dynamic.entry_id)
                .ok_or_else(|| GatewayError::NotActive(dynamic.entry_id.clone()))?;
            return self
                .call_child(&mount, &dynamic.descriptor.original_name, payload)
                .await;
        }

        // Fallback: longest `mcp_<prefix>_` match across active mounts, for
        // callers that name tools the surface never registered.
        let Some(rest) = full_name.strip_prefix("mcp_") else {
            return Err(GatewayError::UnknownTool(format!(
                "{full_name} (expected mcp_<prefix>_<tool>)"
            )));
        };
        let mut mounts = self.store.list_mounts();
        mounts.sort_by_key(|m| std::cmp::Reverse(m.prefix.len()));
        let matched = mounts.into_iter().find_map(|mount| {
            rest.strip_prefix(&format!("{}_", mount.prefix))
                .map(|tool| (mount, tool.to_string()))
        });
        let Some((mount, tool_name)) = matched else {
            return Err(GatewayError::UnknownTool(full_name.into()));
        };
        self.call_child(&mount, &tool_name, args).await
    }

    async fn call_child(
        &self,
        mount: &ActiveMount,
        tool_name: &str,
        payload: Map<String, Value>,
    ) -> Result<String> {
        let client = self
            .clients
            .read()
            .get(&mount.handle_id)
            .cloned()
            .ok_or_else(|| GatewayError::ClientUnavailable(mount.entry_id.clone()))?;

        match client.call_tool(tool_name, Value::Object(payload)).await {
            Ok(content) => Ok(render_content(&content)),
            Err(RpcError::Remote { code, message }) => {
                Err(GatewayError::ToolCallFailed { code, message })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate env keys against the allowlist and merge them into the
    /// mount (applied on the next restart of the child).
    ///
    /// # Errors
    ///
    /// `Catalog(Validation)` for a disallowed key (the mount is untouched),
    /// `NotActive` when nothing is mounted under `entry_id`.
    pub fn config_set(
        &self,
        entry_id: &str,
        environment: HashMap<String, String>,
    ) -> Result<ActiveMount> {
        validate_env_keys(&environment)?;
        self.store
            .update_mount_env(entry_id, environment)
            .ok_or_else(|| GatewayError::NotActive(entry_id.into()))
    }

    /// Ad-hoc stdio activation bypassing the catalog: synthesizes a `custom`
    /// entry for `command` and mounts it under `prefix`.
    ///
    /// # Errors
    ///
    /// Validation errors for the synthesized entry or prefix, then whatever
    /// `activate` surfaces.
    pub async fn launch_stdio(
        &self,
        command: &str,
        prefix: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<Activation> {
        validate_prefix(prefix)?;
        let entry_id = validate_id(&format!("custom/{prefix}"))?;
        let mut entry = Entry::new(
            entry_id.clone(),
            format!("ad-hoc: {command}"),
            format!("stdio server launched directly ({command})"),
            SourceType::Custom,
        )?;
        entry.launch_method = LaunchMethod::Stdio;
        entry.server_command = Some(ServerCommand {
            command: command.to_string(),
            args,
            env,
        });
        self.store.add(entry)?;
        self.activate(&entry_id, Some(prefix)).await
    }

    /// Deactivate every mount and stop any stragglers. Part of the gateway
    /// shutdown sequence.
    pub async fn shutdown(&self) {
        for mount in self.store.list_mounts() {
            if let Err(e) = self.deactivate(&mount.entry_id).await {
                tracing::warn!(entry_id = %mount.entry_id, error = %e, "deactivate during shutdown failed");
            }
        }
        self.processes.cleanup_all().await;
        if let Some(containers) = &self.containers {
            containers.cleanup_all().await;
        }
    }

    async fn spawn_child(
        &self,
        entry: &Entry,
        prefix: &str,
    ) -> Result<(SpawnedChild, HashMap<String, String>)> {
        match entry.launch_method {
            LaunchMethod::Container => {
                let image = entry.container_image.as_deref().ok_or_else(|| {
                    GatewayError::UnsupportedLaunch(format!(
                        "{}: container launch without an image",
                        entry.id
                    ))
                })?;
                let containers = self.containers.as_ref().ok_or_else(|| {
                    RunnerError::SupervisorNotAvailable("container mounts are disabled".into())
                })?;
                containers.pull_image(image).await?;
                let name = format!("mcp-registry-{prefix}");
                let environment = HashMap::new();
                let child = containers
                    .run_interactive(image, &name, &environment)
                    .await?;
                Ok((child, environment))
            }
            LaunchMethod::Stdio => {
                let command = entry.server_command.as_ref().ok_or_else(|| {
                    GatewayError::UnsupportedLaunch(format!(
                        "{}: stdio launch without a server command",
                        entry.id
                    ))
                })?;
                let child = self
                    .processes
                    .spawn(&command.command, &command.args, &command.env)
                    .await?;
                Ok((child, command.env.clone()))
            }
            other => Err(GatewayError::UnsupportedLaunch(format!(
                "{}: {other}",
                entry.id
            ))),
        }
    }

    #[allow(clippy::type_complexity)]
    async fn discover_and_register(
        &self,
        entry: &Entry,
        prefix: &str,
        client: &Arc<RpcClient>,
    ) -> std::result::Result<
        (Value, Vec<ToolDescriptor>, Vec<String>, Vec<String>, Vec<String>),
        (GatewayError, Vec<String>),
    > {
        let handshake = async {
            let capabilities = client.initialize().await?;
            let tools = client.list_tools().await?;
            let resources = client.list_resources().await?;
            let prompts = client.list_prompts().await?;
            Ok::<_, RpcError>((capabilities, tools, resources, prompts))
        };
        let (capabilities, tools, resources, prompts) = handshake.await.map_err(|e| {
            (
                GatewayError::HandshakeFailed(format!("{}: {e}", entry.id)),
                Vec::new(),
            )
        })?;

        tracing::info!(
            entry_id = %entry.id,
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "discovered child capabilities"
        );

        let mut descriptors = Vec::with_capacity(tools.len());
        for tool in &tools {
            match schema::convert_tool(tool, prefix) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(message) => {
                    // A bad tool never aborts the mount.
                    tracing::warn!(
                        entry_id = %entry.id,
                        tool = %tool.get("name").and_then(serde_json::Value::as_str).unwrap_or("?"),
                        error = %message,
                        "skipping tool with invalid schema"
                    );
                }
            }
        }

        let registered = self.surface.register_tools(&entry.id, descriptors.clone());

        let resources = resources
            .iter()
            .filter_map(|r| r.get("uri").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let prompts = prompts
            .iter()
            .filter_map(|p| p.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        Ok((capabilities, descriptors, registered, resources, prompts))
    }

    async fn stop_child(&self, handle_id: &str, is_container: bool) {
        if is_container {
            if let Some(containers) = &self.containers {
                if !containers.stop(handle_id).await {
                    containers.kill(handle_id).await;
                }
                return;
            }
        }
        if !self.processes.stop(handle_id).await {
            self.processes.kill(handle_id).await;
        }
    }
}

/// Derive a default prefix from the tail of an entry id.
#[must_use]
pub fn derive_prefix(entry_id: &str) -> String {
    let tail = entry_id.rsplit('/').next().unwrap_or(entry_id);
    let prefix = tail.replace('-', "_");
    if prefix.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("_{prefix}")
    } else {
        prefix
    }
}

/// Prefixes must match `[A-Za-z_][A-Za-z0-9_]*`.
///
/// # Errors
///
/// `InvalidPrefix` otherwise.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let mut chars = prefix.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidPrefix(format!(
            "'{prefix}' must match [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}

/// Render content blocks for the upstream caller: text blocks joined,
/// anything else pretty-printed JSON.
#[must_use]
pub fn render_content(content: &Value) -> String {
    if let Some(blocks) = content.as_array() {
        let texts: Vec<&str> = blocks
            .iter()
            .filter_map(|block| {
                (block.get("type").and_then(Value::as_str) == Some("text"))
                    .then(|| block.get("text").and_then(Value::as_str))
                    .flatten()
            })
            .collect();
        if !blocks.is_empty() && texts.len() == blocks.len() {
            return texts.join("\n");
        }
    }
    serde_json::to_string_pretty(content).unwrap_or_else(|_| content.to_string())
}
