//! Upstream tool surface: dynamic descriptor registry plus the
//! `tools/list_changed` notifier.
//!
//! Registration and removal are data-level operations on a name → descriptor
//! map; a single dispatcher with parameter metadata serves every dynamic
//! tool, so no per-tool code is generated.

use crate::schema::ToolDescriptor;
use parking_lot::RwLock;
use rmcp::model::Tool;
use rmcp::service::{Peer, RoleServer};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A registered dynamic tool and the mount it belongs to.
#[derive(Debug, Clone)]
pub struct DynamicTool {
    pub entry_id: String,
    pub descriptor: ToolDescriptor,
}

/// Holds the dynamic tool set and every connected upstream peer.
#[derive(Default)]
pub struct ToolSurface {
    dynamic: RwLock<HashMap<String, DynamicTool>>,
    peers: RwLock<Vec<Peer<RoleServer>>>,
    notifications_sent: AtomicU64,
}

impl ToolSurface {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an upstream peer for later `tools/list_changed` broadcasts.
    pub fn observe_peer(&self, peer: Peer<RoleServer>) {
        self.peers.write().push(peer);
    }

    /// Register descriptors for a mount; returns the exposed names actually
    /// added. A name collision is logged and skipped rather than clobbering
    /// another mount's tool.
    pub fn register_tools(
        &self,
        entry_id: &str,
        descriptors: Vec<ToolDescriptor>,
    ) -> Vec<String> {
        let mut dynamic = self.dynamic.write();
        let mut registered = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = descriptor.full_name.clone();
            if dynamic.contains_key(&name) {
                tracing::warn!(tool = %name, "duplicate dynamic tool name; skipping");
                continue;
            }
            tracing::info!(tool = %name, entry_id = %entry_id, "registered dynamic tool");
            dynamic.insert(
                name.clone(),
                DynamicTool {
                    entry_id: entry_id.to_string(),
                    descriptor,
                },
            );
            registered.push(name);
        }
        registered
    }

    /// Remove every dynamic tool registered for `entry_id`; returns the
    /// removed names.
    pub fn remove_entry_tools(&self, entry_id: &str) -> Vec<String> {
        let mut dynamic = self.dynamic.write();
        let names: Vec<String> = dynamic
            .iter()
            .filter(|(_, tool)| tool.entry_id == entry_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            dynamic.remove(name);
            tracing::info!(tool = %name, "removed dynamic tool");
        }
        names
    }

    /// Remove specific exposed names (partial-mount rollback).
    pub fn remove_tools(&self, names: &[String]) {
        let mut dynamic = self.dynamic.write();
        for name in names {
            dynamic.remove(name);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<DynamicTool> {
        self.dynamic.read().get(name).cloned()
    }

    #[must_use]
    pub fn dynamic_tool_count(&self) -> usize {
        self.dynamic.read().len()
    }

    /// Dynamic tools rendered as MCP tool descriptors, sorted by name for a
    /// stable `tools/list`.
    #[must_use]
    pub fn dynamic_tools(&self) -> Vec<Tool> {
        let dynamic = self.dynamic.read();
        let mut tools: Vec<Tool> = dynamic
            .values()
            .map(|t| descriptor_to_tool(&t.descriptor))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Broadcast `notifications/tools/list_changed` to every live peer,
    /// dropping peers whose transport is gone.
    pub async fn notify_tools_changed(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        let peers: Vec<Peer<RoleServer>> = self.peers.read().clone();
        if peers.is_empty() {
            return;
        }

        let mut alive = Vec::with_capacity(peers.len());
        for peer in peers {
            match peer.notify_tool_list_changed().await {
                Ok(()) => alive.push(peer),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping peer that failed tools list_changed");
                }
            }
        }
        *self.peers.write() = alive;
    }

    /// How many `tools/list_changed` broadcasts have been requested.
    #[must_use]
    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }
}

fn descriptor_to_tool(descriptor: &ToolDescriptor) -> Tool {
    Tool {
        name: descriptor.full_name.clone().into(),
        title: None,
        description: Some(descriptor.description.clone().into()),
        input_schema: Arc::new(descriptor.input_schema()),
        output_schema: None,
        icons: None,
        annotations: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::convert_tool;
    use serde_json::json;

    fn descriptor(name: &str, prefix: &str) -> ToolDescriptor {
        convert_tool(
            &json!({
                "name": name,
                "description": "a tool",
                "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}},
            }),
            prefix,
        )
        .unwrap()
    }

    #[test]
    fn register_and_remove_by_entry() {
        let surface = ToolSurface::new();
        let registered = surface.register_tools(
            "docker/sqlite",
            vec![descriptor("list_tables", "sqlite"), descriptor("read_query", "sqlite")],
        );
        assert_eq!(registered.len(), 2);
        assert!(surface.get("mcp_sqlite_list_tables").is_some());

        let removed = surface.remove_entry_tools("docker/sqlite");
        assert_eq!(removed.len(), 2);
        assert_eq!(surface.dynamic_tool_count(), 0);
    }

    #[test]
    fn collisions_are_skipped_not_clobbered() {
        let surface = ToolSurface::new();
        surface.register_tools("first", vec![descriptor("search", "web")]);
        let registered = surface.register_tools("second", vec![descriptor("search", "web")]);

        assert!(registered.is_empty());
        assert_eq!(surface.get("mcp_web_search").unwrap().entry_id, "first");
    }

    #[test]
    fn dynamic_tools_render_schemas() {
        let surface = ToolSurface::new();
        surface.register_tools("e", vec![descriptor("b_tool", "p"), descriptor("a_tool", "p")]);

        let tools = surface.dynamic_tools();
        assert_eq!(tools.len(), 2);
        // Sorted for a stable listing.
        assert_eq!(tools[0].name, "mcp_p_a_tool");
        assert!(tools[0].input_schema.get("properties").is_some());
    }

    #[tokio::test]
    async fn notify_counts_without_peers() {
        let surface = ToolSurface::new();
        surface.notify_tools_changed().await;
        surface.notify_tools_changed().await;
        assert_eq!(surface.notifications_sent(), 2);
    }
}
