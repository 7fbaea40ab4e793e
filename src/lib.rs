//! kticket - a file-backed ticket tracker.
//!
//! Tickets are markdown files with a YAML header, one file per ticket, kept in
//! a single store directory. This library provides the pieces the `kt` CLI is
//! built from:
//! - `ticket` - the ticket model and its markdown codec
//! - `lock` - cross-process advisory file locks
//! - `store` - the directory of tickets with locked, atomic read/write
//! - `id` - ticket id generation
//! - `ops` - multi-ticket operations built on the store (links, deps, close gate)
//! - `config` - settings resolved from flags, environment and `config.toml`
//! - `cli`, `commands` - argument definitions and command handlers for `kt`

pub mod cli;
pub mod commands;
pub mod config;
pub mod id;
pub mod lock;
pub mod ops;
pub mod store;
pub mod ticket;

use std::path::PathBuf;
use std::time::Duration;

/// Library-level error type for kticket operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid ticket format: {0}")]
    Format(String),

    #[error("Ticket {0:?} not found")]
    NotFound(String),

    #[error("Ambiguous ID {partial:?} matches multiple tickets: {}", .candidates.join(", "))]
    Ambiguous {
        partial: String,
        candidates: Vec<String>,
    },

    #[error("Lock timeout after {}ms on {}", .timeout.as_millis(), .path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Lock acquisition cancelled on {}", .path.display())]
    LockCancelled { path: PathBuf },

    #[error("Lock on {id} already released")]
    AlreadyReleased { id: String },

    #[error("Invalid ID: {0:?}")]
    InvalidId(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot close {id}: tests not passed (run 'kt pass {id}' first)")]
    TestsNotPassed { id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("Wait for {0} cancelled")]
    WaitCancelled(String),

    #[error("Invalid config {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },
}

impl Error {
    /// Wrap an IO error with the operation and path it came from.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True for errors that mean "no such ticket".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias for kticket operations.
pub type Result<T> = std::result::Result<T, Error>;
