//! Error taxonomy for synchronization cycles
//!
//! Per-project failures are values of [`SyncError`] and are contained at the
//! task boundary by the coordinator; only startup failures (unreadable
//! tracked-list file, unusable storage root) abort the process, and those are
//! reported through `anyhow` at the binary boundary.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Failure modes of a single sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A project reference that does not resolve to an (owner, name) pair.
    /// The entry is skipped; other entries are unaffected.
    #[error("invalid project reference: {input:?}")]
    InvalidReference { input: String },

    /// The remote has no matching resource (e.g. no release published yet).
    /// Treated as "nothing to sync this cycle", never retried.
    #[error("resource not found upstream")]
    NotFound,

    /// The rate-limit wait budget for a single call was exhausted.
    /// Transparent waits below the budget never surface this.
    #[error("rate limit exhausted, quota resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// 5xx or transport-level failure that survived the bounded retry loop.
    #[error("transient upstream failure: {message}")]
    TransientUpstream { status: Option<u16>, message: String },

    /// A persisted cursor record that cannot be parsed. Callers treat this
    /// as "never synced" and log a warning.
    #[error("malformed state record at {}", path.display())]
    MalformedState { path: PathBuf },

    /// Cursor or artifact could not be written. The cycle fails with the
    /// prior cursor untouched and is retried next cycle.
    #[error("storage write failed at {}: {source}", path.display())]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Transport error from the HTTP client outside the retry loop
    /// (e.g. response body decoding).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A wait was interrupted by the shutdown signal. Not a failure outcome.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl SyncError {
    /// Stable machine-readable name for event records.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::InvalidReference { .. } => "invalid_reference",
            SyncError::NotFound => "not_found",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::TransientUpstream { .. } => "transient_upstream",
            SyncError::MalformedState { .. } => "malformed_state",
            SyncError::StorageWrite { .. } => "storage_write_failure",
            SyncError::Http(_) => "transient_upstream",
            SyncError::Cancelled => "cancelled",
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. })
    }

    pub fn invalid_reference(input: impl Into<String>) -> Self {
        SyncError::InvalidReference {
            input: input.into(),
        }
    }

    pub fn storage_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::StorageWrite {
            path: path.into(),
            source,
        }
    }
}
