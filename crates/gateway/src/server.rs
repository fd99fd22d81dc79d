//! The upstream MCP server: ten fixed registry tools plus whatever dynamic
//! tools the mount engine has registered, served over stdio.

use crate::error::GatewayError;
use crate::format;
use crate::mount::MountEngine;
use crate::surface::ToolSurface;
use mcp_registry_catalog::{RefreshScheduler, SearchQuery, SourceType, Store};
use rmcp::ErrorData;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, InitializeRequestParam,
    InitializeResult, ListToolsResult, PaginatedRequestParam, ServerCapabilities, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

const INSTRUCTIONS: &str = "This server is a dynamic MCP registry that aggregates servers from \
multiple catalogs. Use registry_find to search, registry_add to activate a server (its tools are \
then exposed directly, namespaced as mcp_<prefix>_<tool>), and registry_remove to deactivate it.";

/// The gateway's upstream MCP surface.
#[derive(Clone)]
pub struct RegistryServer {
    store: Arc<Store>,
    engine: Arc<MountEngine>,
    scheduler: Arc<RefreshScheduler>,
    surface: Arc<ToolSurface>,
}

impl RegistryServer {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        engine: Arc<MountEngine>,
        scheduler: Arc<RefreshScheduler>,
    ) -> Self {
        let surface = Arc::clone(engine.surface());
        RegistryServer {
            store,
            engine,
            scheduler,
            surface,
        }
    }

    /// Serve over stdio until the client disconnects.
    ///
    /// # Errors
    ///
    /// Propagates transport failures from the MCP framework.
    pub async fn serve_stdio(self) -> anyhow::Result<()> {
        use rmcp::ServiceExt as _;
        let transport = (tokio::io::stdin(), tokio::io::stdout());
        let running = self.serve(transport).await?;

        tokio::select! {
            result = running.waiting() => {
                result?;
                tracing::info!("upstream client disconnected");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }
        Ok(())
    }

    // ── fixed tool handlers ────────────────────────────────────────────

    async fn find(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let query = arg_str(args, "query")?;
        let mut sources = Vec::new();
        for slug in arg_str_list(args, "sources") {
            match slug.parse::<SourceType>() {
                Ok(source) => sources.push(source),
                Err(_) => tracing::warn!(source = %slug, "ignoring unknown source filter"),
            }
        }
        let search = SearchQuery {
            query: query.clone(),
            categories: arg_str_list(args, "categories"),
            tags: arg_str_list(args, "tags"),
            sources,
            official_only: arg_bool(args, "official_only"),
            featured_only: arg_bool(args, "featured_only"),
            requires_api_key: None,
            limit: arg_usize(args, "limit", 20),
        };
        let results = self.store.search(&search);
        Ok(format::search_results(&query, &results))
    }

    fn list(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let limit = arg_usize(args, "limit", 50).clamp(1, 200);
        let entries = match arg_str_opt(args, "source") {
            Some(slug) if slug != "all" => {
                let source = slug.parse::<SourceType>().map_err(|_| {
                    GatewayError::InvalidArguments(format!(
                        "invalid source: {slug} (valid: docker, mcpservers, mcp_official, awesome, custom, all)"
                    ))
                })?;
                self.store.by_source(source)
            }
            _ => self.store.list(limit),
        };
        Ok(format::listing(&entries, limit))
    }

    async fn add(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let entry_id = arg_str(args, "entry_id")?;
        let prefix = arg_str_opt(args, "prefix");
        let activation = self.engine.activate(&entry_id, prefix.as_deref()).await?;
        Ok(activation_message(&activation))
    }

    async fn remove(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let entry_id = arg_str(args, "entry_id")?;
        let mount = self.engine.deactivate(&entry_id).await?;
        Ok(format!("Successfully deactivated: {}", mount.name))
    }

    fn active(&self) -> String {
        format::active_mounts(&self.store.list_mounts())
    }

    fn config_set(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let entry_id = arg_str(args, "entry_id")?;
        let environment = arg_str_map(args, "environment")?;
        let mut keys: Vec<String> = environment.keys().cloned().collect();
        keys.sort_unstable();
        let mount = self.engine.config_set(&entry_id, environment)?;
        Ok(format!(
            "Configuration updated for {}\n\n**Environment variables set:** {}\n\nChanges take \
             effect on the next restart. To apply now, use `registry_remove` followed by \
             `registry_add`.",
            mount.name,
            keys.join(", ")
        ))
    }

    async fn exec(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let tool_name = arg_str(args, "tool_name")?;
        let arguments = args
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        self.engine.dispatch(&tool_name, arguments).await
    }

    async fn refresh(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let slug = arg_str(args, "source")?;
        let sources = if slug == "all" {
            self.scheduler.sources()
        } else {
            vec![slug.parse::<SourceType>().map_err(|_| {
                GatewayError::InvalidArguments(format!("invalid source: {slug}"))
            })?]
        };

        let mut lines = vec!["# Refresh results\n".to_string()];
        for source in sources {
            match self.scheduler.force_refresh(source).await {
                Ok(count) => lines.push(format!("- {source}: Success ({count} entries)")),
                Err(e) => lines.push(format!("- {source}: Failed ({e})")),
            }
        }
        Ok(lines.join("\n"))
    }

    fn status(&self) -> String {
        format::status(&self.store.status())
    }

    async fn launch_stdio(&self, args: &Map<String, Value>) -> Result<String, GatewayError> {
        let command = arg_str(args, "command")?;
        let prefix = arg_str(args, "prefix")?;
        let extra_args = arg_str_list(args, "args");
        let env = match args.get("env") {
            Some(_) => arg_str_map(args, "env")?,
            None => HashMap::new(),
        };
        let activation = self.engine.launch_stdio(&command, &prefix, extra_args, env).await?;
        Ok(activation_message(&activation))
    }
}

impl ServerHandler for RegistryServer {
    async fn initialize(
        &self,
        request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        tracing::info!(
            client = %request.client_info.name,
            version = %request.client_info.version,
            "upstream client connected"
        );
        self.surface.observe_peer(context.peer.clone());

        Ok(InitializeResult {
            protocol_version: request.protocol_version,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: "mcp-registry".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("MCP Registry Gateway".to_string()),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        })
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let mut tools = fixed_tools();
        tools.extend(self.surface.dynamic_tools());
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let args = request.arguments.unwrap_or_default();
        let name = request.name.as_ref();

        let outcome = match name {
            "registry_find" => self.find(&args).await,
            "registry_list" => self.list(&args),
            "registry_add" => self.add(&args).await,
            "registry_remove" => self.remove(&args).await,
            "registry_active" => Ok(self.active()),
            "registry_config_set" => self.config_set(&args),
            "registry_exec" => self.exec(&args).await,
            "registry_refresh" => self.refresh(&args).await,
            "registry_status" => Ok(self.status()),
            "registry_launch_stdio" => self.launch_stdio(&args).await,
            dynamic if self.surface.get(dynamic).is_some() || dynamic.starts_with("mcp_") => {
                self.engine.dispatch(dynamic, args).await
            }
            _ => {
                return Err(ErrorData::method_not_found::<
                    rmcp::model::CallToolRequestMethod,
                >());
            }
        };

        Ok(render_outcome(name, outcome))
    }
}

fn render_outcome(tool: &str, outcome: Result<String, GatewayError>) -> CallToolResult {
    let (text, is_error) = match outcome {
        Ok(text) => (text, None),
        // Idempotent outcomes read as answers, not failures.
        Err(e @ (GatewayError::AlreadyActive(_) | GatewayError::NotActive(_))) => {
            (e.to_string(), None)
        }
        Err(e) => {
            tracing::warn!(tool = %tool, error = %e, "tool call failed");
            (format!("Error: {e}"), Some(true))
        }
    };
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: None,
        is_error,
        meta: None,
    }
}

fn activation_message(activation: &crate::mount::Activation) -> String {
    let mount = &activation.mount;
    let mut out = vec![format!("Successfully activated: {}", mount.name), String::new()];
    if let Some(container) = &mount.container_id {
        out.push(format!("**Container:** {container}"));
    }
    if let Some(pid) = mount.pid {
        out.push(format!("**PID:** {pid}"));
    }
    out.push(format!("**Prefix:** {}", mount.prefix));
    out.push(format!("**Tools discovered:** {}", mount.tools.len()));
    if !activation.registered_tools.is_empty() {
        out.push(String::new());
        out.push("Available tools (callable via MCP):".to_string());
        for name in activation.registered_tools.iter().take(10) {
            out.push(format!("  - {name}"));
        }
        if activation.registered_tools.len() > 10 {
            out.push(format!(
                "  ... and {} more",
                activation.registered_tools.len() - 10
            ));
        }
    }
    out.push(String::new());
    out.push(
        "Use `registry_config_set` to configure environment variables (requires restart)."
            .to_string(),
    );
    out.join("\n")
}

// ── fixed tool descriptors ─────────────────────────────────────────────

fn tool(name: &'static str, description: &'static str, schema: Value) -> Tool {
    let Value::Object(schema) = schema else {
        unreachable!("fixed tool schemas are object literals")
    };
    Tool {
        name: name.into(),
        title: None,
        description: Some(description.into()),
        input_schema: Arc::new(schema),
        output_schema: None,
        icons: None,
        annotations: None,
    }
}

fn fixed_tools() -> Vec<Tool> {
    vec![
        tool(
            "registry_find",
            "Search for MCP servers in the aggregated registry (fuzzy matched, filterable).",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search text (fuzzy matched)"},
                    "categories": {"type": "array", "items": {"type": "string"}, "description": "Filter by categories (OR logic)"},
                    "tags": {"type": "array", "items": {"type": "string"}, "description": "Filter by tags (OR logic)"},
                    "sources": {"type": "array", "items": {"type": "string"}, "description": "Filter by sources (OR logic)"},
                    "official_only": {"type": "boolean", "default": false},
                    "featured_only": {"type": "boolean", "default": false},
                    "limit": {"type": "integer", "default": 20, "description": "Max results (1-100)"},
                },
                "required": ["query"],
            }),
        ),
        tool(
            "registry_list",
            "List servers in the registry, optionally filtered by source.",
            json!({
                "type": "object",
                "properties": {
                    "source": {"type": "string", "description": "docker, mcpservers, mcp_official, awesome, custom or all"},
                    "limit": {"type": "integer", "default": 50, "description": "Max results (1-200)"},
                },
            }),
        ),
        tool(
            "registry_add",
            "Activate an MCP server from the registry and expose its tools dynamically.",
            json!({
                "type": "object",
                "properties": {
                    "entry_id": {"type": "string", "description": "Registry entry ID to activate"},
                    "prefix": {"type": "string", "description": "Tool prefix for namespacing (default: derived from the entry id)"},
                },
                "required": ["entry_id"],
            }),
        ),
        tool(
            "registry_remove",
            "Deactivate an active MCP server and remove its dynamic tools.",
            json!({
                "type": "object",
                "properties": {
                    "entry_id": {"type": "string", "description": "Registry entry ID to deactivate"},
                },
                "required": ["entry_id"],
            }),
        ),
        tool(
            "registry_active",
            "List currently active MCP servers with discovered capability counts.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "registry_config_set",
            "Set allowlisted environment variables on an active server (applied on next restart).",
            json!({
                "type": "object",
                "properties": {
                    "entry_id": {"type": "string", "description": "Active server ID to configure"},
                    "environment": {"type": "object", "description": "Environment variables to set (string values)"},
                },
                "required": ["entry_id", "environment"],
            }),
        ),
        tool(
            "registry_exec",
            "Execute a tool from an active server by fully-qualified name (mcp_<prefix>_<tool>).",
            json!({
                "type": "object",
                "properties": {
                    "tool_name": {"type": "string", "description": "Fully-qualified tool name"},
                    "arguments": {"type": "object", "description": "Tool arguments"},
                },
                "required": ["tool_name"],
            }),
        ),
        tool(
            "registry_refresh",
            "Force refresh a registry source (or 'all').",
            json!({
                "type": "object",
                "properties": {
                    "source": {"type": "string", "description": "Source slug or 'all'"},
                },
                "required": ["source"],
            }),
        ),
        tool(
            "registry_status",
            "Registry statistics and per-source refresh status.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "registry_launch_stdio",
            "Launch a stdio MCP server directly (bypassing the catalog) and mount it.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Executable to run"},
                    "prefix": {"type": "string", "description": "Tool prefix for namespacing"},
                    "args": {"type": "array", "items": {"type": "string"}, "description": "Command arguments"},
                    "env": {"type": "object", "description": "Environment variables"},
                },
                "required": ["command", "prefix"],
            }),
        ),
    ]
}

// ── argument helpers ───────────────────────────────────────────────────

fn arg_str(args: &Map<String, Value>, key: &str) -> Result<String, GatewayError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::InvalidArguments(format!("missing required argument '{key}'")))
}

fn arg_str_opt(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn arg_bool(args: &Map<String, Value>, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn arg_usize(args: &Map<String, Value>, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn arg_str_list(args: &Map<String, Value>, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn arg_str_map(
    args: &Map<String, Value>,
    key: &str,
) -> Result<HashMap<String, String>, GatewayError> {
    let Some(value) = args.get(key) else {
        return Err(GatewayError::InvalidArguments(format!(
            "missing required argument '{key}'"
        )));
    };
    let Some(object) = value.as_object() else {
        return Err(GatewayError::InvalidArguments(format!(
            "'{key}' must be an object of string values"
        )));
    };
    let mut out = HashMap::with_capacity(object.len());
    for (k, v) in object {
        let Some(v) = v.as_str() else {
            return Err(GatewayError::InvalidArguments(format!(
                "'{key}.{k}' must be a string"
            )));
        };
        out.insert(k.clone(), v.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountEngine;
    use crate::surface::ToolSurface;
    use mcp_registry_catalog::{Entry, SourceType as Src};
    use mcp_registry_runner::{ProcessSupervisor, RpcClientOptions};
    use mcp_registry_test_support::temp_store;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_server() -> (TempDir, RegistryServer) {
        let (dir, store) = temp_store(Duration::from_secs(3600)).expect("temp store");
        let engine = Arc::new(MountEngine::new(
            Arc::clone(&store),
            Arc::new(ProcessSupervisor::new()),
            None,
            Arc::new(ToolSurface::new()),
            RpcClientOptions::default(),
        ));
        let scheduler = Arc::new(RefreshScheduler::new(Arc::clone(&store), Vec::new()));
        let server = RegistryServer::new(Arc::clone(&store), engine, scheduler);
        (dir, server)
    }

    fn seed(server: &RegistryServer) {
        let mut official =
            Entry::new("docker/postgres", "Postgres", "SQL database server", Src::Docker)
                .expect("valid entry");
        official.official = true;
        official.categories = vec!["Database".into()];
        server.store.add(official).unwrap();
        server
            .store
            .add(Entry::new("plain", "Note Taker", "keeps notes", Src::Mcpservers).unwrap())
            .unwrap();
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().expect("object literal").clone()
    }

    #[tokio::test]
    async fn find_formats_hits_and_ignores_unknown_sources() {
        let (_dir, server) = test_server();
        seed(&server);

        let text = server
            .find(&obj(json!({"query": "postgres", "sources": ["docker", "not-a-source"]})))
            .await
            .unwrap();
        assert!(text.contains("Postgres"));
        assert!(text.contains("`docker/postgres`"));

        let text = server.find(&obj(json!({"query": "zzzzzz"}))).await.unwrap();
        assert!(text.contains("No servers found"));

        assert!(server.find(&Map::new()).await.is_err(), "query is required");
    }

    #[tokio::test]
    async fn list_filters_by_source_and_rejects_bad_slugs() {
        let (_dir, server) = test_server();
        seed(&server);

        let text = server.list(&obj(json!({"source": "docker"}))).unwrap();
        assert!(text.contains("docker/postgres"));
        assert!(!text.contains("Note Taker"));

        let err = server.list(&obj(json!({"source": "bogus"}))).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArguments(_)));

        let text = server.list(&Map::new()).unwrap();
        assert!(text.contains("2 servers"));
    }

    #[tokio::test]
    async fn refresh_reports_per_source_outcomes() {
        let (_dir, server) = test_server();

        // No scrapers registered: "all" yields an empty result list,
        // a named source reports the failure.
        let text = server.refresh(&obj(json!({"source": "all"}))).await.unwrap();
        assert!(text.contains("Refresh results"));

        let text = server.refresh(&obj(json!({"source": "docker"}))).await.unwrap();
        assert!(text.contains("docker: Failed"));

        let err = server.refresh(&obj(json!({"source": "bogus"}))).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn status_and_active_render() {
        let (_dir, server) = test_server();
        seed(&server);

        let text = server.status();
        assert!(text.contains("**Total entries:** 2"));
        assert!(text.contains("**Active mounts:** 0"));

        assert_eq!(server.active(), "No active servers.");
    }

    #[tokio::test]
    async fn config_set_requires_an_active_mount() {
        let (_dir, server) = test_server();
        let err = server
            .config_set(&obj(json!({
                "entry_id": "nope",
                "environment": {"API_KEY": "k"},
            })))
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotActive(_)));
    }

    #[test]
    fn fixed_tool_set_is_complete() {
        let tools = fixed_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(
            names,
            vec![
                "registry_find",
                "registry_list",
                "registry_add",
                "registry_remove",
                "registry_active",
                "registry_config_set",
                "registry_exec",
                "registry_refresh",
                "registry_status",
                "registry_launch_stdio",
            ]
        );
        for tool in &tools {
            assert_eq!(tool.input_schema.get("type"), Some(&json!("object")));
        }
    }

    #[test]
    fn argument_helpers() {
        let args = json!({
            "query": "db",
            "official_only": true,
            "limit": 7,
            "tags": ["a", "b"],
            "environment": {"API_KEY": "k"},
        });
        let args = args.as_object().unwrap();

        assert_eq!(arg_str(args, "query").unwrap(), "db");
        assert!(arg_str(args, "missing").is_err());
        assert!(arg_bool(args, "official_only"));
        assert!(!arg_bool(args, "featured_only"));
        assert_eq!(arg_usize(args, "limit", 20), 7);
        assert_eq!(arg_usize(args, "nope", 20), 20);
        assert_eq!(arg_str_list(args, "tags"), vec!["a", "b"]);
        assert_eq!(arg_str_map(args, "environment").unwrap()["API_KEY"], "k");
        assert!(arg_str_map(args, "tags").is_err());
    }

    #[test]
    fn outcome_rendering_distinguishes_idempotent_results() {
        let ok = render_outcome("t", Ok("done".into()));
        assert_eq!(ok.is_error, None);

        let idempotent = render_outcome("t", Err(GatewayError::AlreadyActive("x".into())));
        assert_eq!(idempotent.is_error, None);

        let failed = render_outcome("t", Err(GatewayError::UnknownTool("nope".into())));
        assert_eq!(failed.is_error, Some(true));
    }
}
