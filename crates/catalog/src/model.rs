//! Normalized catalog records and the supporting value types.

use crate::error::{CatalogError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Origin catalog a registry entry was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Docker,
    Mcpservers,
    McpOfficial,
    Awesome,
    Custom,
}

impl SourceType {
    /// Every known source, in refresh-scheduling order.
    pub const ALL: [SourceType; 5] = [
        SourceType::Docker,
        SourceType::Mcpservers,
        SourceType::McpOfficial,
        SourceType::Awesome,
        SourceType::Custom,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Docker => "docker",
            SourceType::Mcpservers => "mcpservers",
            SourceType::McpOfficial => "mcp_official",
            SourceType::Awesome => "awesome",
            SourceType::Custom => "custom",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(SourceType::Docker),
            "mcpservers" => Ok(SourceType::Mcpservers),
            "mcp_official" | "mcp-official" => Ok(SourceType::McpOfficial),
            "awesome" => Ok(SourceType::Awesome),
            "custom" => Ok(SourceType::Custom),
            other => Err(CatalogError::Validation(format!(
                "unknown source type: {other}"
            ))),
        }
    }
}

/// How a catalog entry's server is launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMethod {
    Container,
    Stdio,
    RemoteHttp,
    #[default]
    Unknown,
}

impl LaunchMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchMethod::Container => "container",
            LaunchMethod::Stdio => "stdio",
            LaunchMethod::RemoteHttp => "remote_http",
            LaunchMethod::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LaunchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invocation for stdio-launched servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Normalized MCP server registry entry.
///
/// Entries are immutable once validated; a refresh re-creates them wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable slug; lowercase `[a-z0-9_\-/]`, primary key in the store.
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Image reference (e.g. `docker.io/mcp/postgres`); must contain `/` or `:`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub official: bool,
    #[serde(default)]
    pub featured: bool,
    #[serde(default)]
    pub requires_api_key: bool,
    /// Tool names seen at a prior activation. A hint only; every mount
    /// re-discovers the live set.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub launch_method: LaunchMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_command: Option<ServerCommand>,
    #[serde(default = "Utc::now")]
    pub last_refreshed: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
    /// Opaque per-source metadata (e.g. `github_stars`) kept for debugging
    /// and popularity signals.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub raw_metadata: HashMap<String, serde_json::Value>,
}

impl Entry {
    /// Minimal valid entry; callers fill in the rest field-by-field.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        source: SourceType,
    ) -> Result<Self> {
        let entry = Entry {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            source,
            repo_url: None,
            container_image: None,
            categories: Vec::new(),
            tags: Vec::new(),
            official: false,
            featured: false,
            requires_api_key: false,
            tools: Vec::new(),
            launch_method: LaunchMethod::Unknown,
            server_command: None,
            last_refreshed: Utc::now(),
            added_at: Utc::now(),
            raw_metadata: HashMap::new(),
        };
        entry.normalized()
    }

    /// Validate and normalize: lowercase the id, check the image reference,
    /// drop duplicate categories/tags (first occurrence wins).
    pub fn normalized(mut self) -> Result<Self> {
        self.id = validate_id(&self.id)?;
        if let Some(image) = &self.container_image {
            validate_container_image(image)?;
        }
        dedup_in_place(&mut self.categories);
        dedup_in_place(&mut self.tags);
        Ok(self)
    }
}

/// A currently running child server plus the gateway-side bookkeeping that
/// re-exposes its tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveMount {
    pub entry_id: String,
    pub name: String,
    /// Namespace segment for exposed tool names; `[A-Za-z_][A-Za-z0-9_]*`.
    pub prefix: String,
    /// Opaque supervisor handle id owning the child's lifetime.
    pub handle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub mounted_at: DateTime<Utc>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub prompts: Vec<String>,
}

/// Refresh lifecycle state of one catalog source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshState {
    Ok,
    Error,
    Refreshing,
    #[default]
    Unknown,
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefreshState::Ok => "ok",
            RefreshState::Error => "error",
            RefreshState::Refreshing => "refreshing",
            RefreshState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Status of a specific registry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRefreshStatus {
    pub source: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entry_count: usize,
    #[serde(default)]
    pub status: RefreshState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SourceRefreshStatus {
    #[must_use]
    pub fn new(source: SourceType) -> Self {
        SourceRefreshStatus {
            source,
            last_refresh: None,
            last_attempt: None,
            entry_count: 0,
            status: RefreshState::Unknown,
            error_message: None,
        }
    }
}

/// Search parameters. Filters are exact-match (OR within each list); the
/// text query is fuzzy-matched against indexed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub sources: Vec<SourceType>,
    pub official_only: bool,
    pub featured_only: bool,
    /// `None` = no filter.
    pub requires_api_key: Option<bool>,
    /// Clamped to 1..=100 when the search runs.
    pub limit: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        SearchQuery {
            query: String::new(),
            categories: Vec::new(),
            tags: Vec::new(),
            sources: Vec::new(),
            official_only: false,
            featured_only: false,
            requires_api_key: None,
            limit: 20,
        }
    }
}

impl SearchQuery {
    /// Text-only query with default filters.
    #[must_use]
    pub fn text(query: impl Into<String>) -> Self {
        SearchQuery {
            query: query.into(),
            ..SearchQuery::default()
        }
    }
}

/// Overall registry status and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub total_entries: usize,
    pub active_mounts: usize,
    /// Keyed by source slug for stable output.
    pub sources: BTreeMap<String, SourceRefreshStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub cache_dir: String,
    pub sources_dir: String,
}

/// Environment-variable prefixes accepted by `registry_config_set`.
/// Matching is case-insensitive on the key.
pub const ENV_KEY_ALLOWED_PREFIXES: [&str; 15] = [
    "API_KEY",
    "API_TOKEN",
    "AUTH_",
    "DATABASE_",
    "DB_",
    "GITHUB_",
    "OPENAI_",
    "ANTHROPIC_",
    "AWS_",
    "AZURE_",
    "GCP_",
    "SLACK_",
    "DISCORD_",
    "NOTION_",
    "MCP_",
];

/// Check every key against the allowlist.
///
/// # Errors
///
/// Returns `CatalogError::Validation` naming the first offending key.
pub fn validate_env_keys(env: &HashMap<String, String>) -> Result<()> {
    for key in env.keys() {
        let upper = key.to_ascii_uppercase();
        if !ENV_KEY_ALLOWED_PREFIXES
            .iter()
            .any(|prefix| upper.starts_with(prefix))
        {
            return Err(CatalogError::Validation(format!(
                "invalid_env_key: '{key}' not in allowlist (allowed prefixes: {})",
                ENV_KEY_ALLOWED_PREFIXES.join(", ")
            )));
        }
    }
    Ok(())
}

/// Validate an entry id and return its normalized (lowercased) form.
///
/// # Errors
///
/// Returns `CatalogError::Validation` for an empty id or disallowed
/// characters (anything outside `[a-z0-9_\-/]` after lowercasing).
pub fn validate_id(id: &str) -> Result<String> {
    if id.is_empty() {
        return Err(CatalogError::Validation("entry id cannot be empty".into()));
    }
    let lowered = id.to_ascii_lowercase();
    if !lowered
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '/'))
    {
        return Err(CatalogError::Validation(format!(
            "entry id must contain only lowercase alphanumerics, hyphens, underscores and slashes: {id}"
        )));
    }
    Ok(lowered)
}

fn validate_container_image(image: &str) -> Result<()> {
    if image.contains('/') || image.contains(':') {
        Ok(())
    } else {
        Err(CatalogError::Validation(format!(
            "invalid container image format: {image}"
        )))
    }
}

fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}
