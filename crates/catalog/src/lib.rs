//! Catalog core for the MCP registry gateway: normalized entry model,
//! searchable in-memory store with JSON snapshots, and the per-source
//! refresh scheduler.

pub mod error;
pub mod model;
pub mod scheduler;
pub mod scrape;
pub mod search;
pub mod store;

pub use error::{CatalogError, Result};
pub use model::{
    ActiveMount, Entry, LaunchMethod, RefreshState, RegistryStatus, SearchQuery, ServerCommand,
    SourceRefreshStatus, SourceType, validate_env_keys, validate_id,
};
pub use scheduler::RefreshScheduler;
pub use scrape::{FileScraper, ScrapeContext, Scraper};
pub use store::Store;
