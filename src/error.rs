// src/error.rs

use thiserror::Error;

/// Core error types for quern
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database directory or database file missing
    #[error("No package database at {0}")]
    NoDb(String),

    /// Insufficient permissions to read or write the database
    #[error("Insufficient privileges to access {0}")]
    NoAccess(String),

    /// Database file ownership or mode is wrong
    #[error("Insecure database: {0}")]
    Insecure(String),

    /// Could not acquire the database lock within the retry budget
    #[error("Package database is locked by another process")]
    Locked,

    /// The solver discovered conflicts; the caller must re-solve
    #[error("Conflicts discovered while solving: {0}")]
    Conflict(String),

    /// The package manager upgraded itself; the process must re-exec
    #[error("The package manager has been upgraded, restart required")]
    NeedRestart,

    /// Transient store contention that exhausted its retry budget
    #[error("Database busy")]
    Busy,

    /// On-disk schema is newer than this library supports
    #[error(
        "Database schema version {on_disk} is newer than and incompatible with library version {compiled}"
    )]
    Incompatible { on_disk: i64, compiled: i64 },

    /// No work needed
    #[error("Already up to date")]
    UpToDate,

    /// Non-fatal condition, surfaced but not aborting the batch
    #[error("{0}")]
    Warn(String),

    /// Dependency formula could not be parsed
    #[error("Cannot parse dependency formula: {0}")]
    Parse(String),

    /// Any other unrecoverable error
    #[error("{0}")]
    Fatal(String),
}

impl Error {
    /// Whether the condition allows the current batch to continue
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::Warn(_) | Error::UpToDate)
    }
}

/// Result type alias using quern's Error type
pub type Result<T> = std::result::Result<T, Error>;
