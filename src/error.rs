//! Error types for review-lease.
//!
//! Stale leases and pool exhaustion are deliberately absent: they are
//! outcomes, not failures, and are modelled by the return types of the
//! engine operations.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The store could not be opened or its directory could not be created.
    #[error(
        "store unavailable at {}: dir exists: {dir_exists} | writable: {writable} | {source}",
        .path.display()
    )]
    StorageUnavailable {
        path: PathBuf,
        dir_exists: bool,
        writable: bool,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A migration's expected prior shape does not hold.
    #[error("migration {version} cannot be applied: {reason}")]
    MigrationConflict { version: i64, reason: String },

    #[error("schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("result label not allowed: {0}")]
    UnknownLabel(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
