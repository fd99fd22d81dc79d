//! Gateway entrypoint: stdio MCP server in front of the registry core.

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use mcp_registry_catalog::{FileScraper, RefreshScheduler, Scraper, Store};
use mcp_registry_gateway::{MountEngine, RegistryServer, ToolSurface};
use mcp_registry_runner::{ContainerSupervisor, ProcessSupervisor, RpcClientOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-registry", version, about = "Dynamic MCP tool-federation gateway")]
struct Args {
    /// Directory for cached registry state (entries.json, mounts.json).
    #[arg(long, env = "MCP_REGISTRY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory for scraper working state.
    #[arg(long, env = "MCP_REGISTRY_SOURCES_DIR")]
    sources_dir: Option<PathBuf>,

    /// Hours between automatic source refreshes.
    #[arg(long, env = "MCP_REGISTRY_REFRESH_HOURS", default_value_t = 24)]
    refresh_interval_hours: u64,

    /// Container tool used for container mounts; "none" disables them.
    #[arg(long, env = "MCP_REGISTRY_CONTAINER_TOOL", default_value = "podman")]
    container_tool: String,

    /// Per-call deadline for downstream RPC, in seconds.
    #[arg(long, env = "MCP_REGISTRY_RPC_TIMEOUT", default_value_t = 30)]
    rpc_timeout_secs: u64,

    /// Grace period before force-killing children, in seconds.
    #[arg(long, default_value_t = 10)]
    stop_grace_secs: u64,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    // Stdout carries the MCP transport; all logging goes to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-registry")
}

fn default_sources_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-registry")
        .join("sources")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let cache_dir = args.cache_dir.unwrap_or_else(default_cache_dir);
    let sources_dir = args.sources_dir.unwrap_or_else(default_sources_dir);
    tracing::info!(
        cache_dir = %cache_dir.display(),
        sources_dir = %sources_dir.display(),
        "starting mcp-registry gateway"
    );

    let store = Arc::new(
        Store::open(
            cache_dir,
            sources_dir,
            Duration::from_secs(args.refresh_interval_hours * 3600),
        )
        .context("open registry store")?,
    );

    let containers = if args.container_tool == "none" {
        tracing::warn!("container mounts disabled (--container-tool none)");
        None
    } else {
        let supervisor = ContainerSupervisor::probe(&args.container_tool)
            .await
            .with_context(|| format!("container tool '{}' unavailable", args.container_tool))?;
        Some(Arc::new(supervisor))
    };

    let processes = Arc::new(ProcessSupervisor::with_grace(Duration::from_secs(
        args.stop_grace_secs,
    )));
    let surface = Arc::new(ToolSurface::new());
    let engine = Arc::new(MountEngine::new(
        Arc::clone(&store),
        Arc::clone(&processes),
        containers,
        surface,
        RpcClientOptions {
            call_timeout: Duration::from_secs(args.rpc_timeout_secs),
            ..RpcClientOptions::default()
        },
    ));

    let scrapers: Vec<Arc<dyn Scraper>> = vec![Arc::new(FileScraper)];
    let scheduler = Arc::new(RefreshScheduler::new(Arc::clone(&store), scrapers));
    scheduler.start();

    let server = RegistryServer::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::clone(&scheduler),
    );
    let serve_result = server.serve_stdio().await;

    // Shutdown order: scheduler → mounts (clients, then children) → snapshot.
    scheduler.stop().await;
    engine.shutdown().await;
    store.save().context("write shutdown snapshot")?;
    tracing::info!("shutdown complete");

    serve_result
}
