//! Error types for the catalog core.

use thiserror::Error;

/// Main error type for catalog operations.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Lookup miss in the entry store
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// Malformed entry id, container image or environment key
    #[error("validation error: {0}")]
    Validation(String),

    /// IO errors (snapshot read/write, source files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;
