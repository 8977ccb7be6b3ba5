//! Error types for the bucket storage core.
//!
//! A single enum covers every error kind the core can surface, matching the
//! error-kind taxonomy of the component design: evaluator failures, storage
//! backend hiccups, invariant violations, config problems, and not-found
//! reads. Storage and invariant errors are distinguished so callers can tell
//! "retry me" (`Storage`) from "stop the group" (`Integrity`) apart without
//! string matching.

use std::fmt;
use std::io;

/// Unified error type for bucket storage core operations.
#[derive(Debug)]
pub enum BucketStoreError {
    /// I/O error reading or writing persisted state.
    Io(io::Error),
    /// JSON encode/decode error on a persisted row or config value.
    Json(String),
    /// A single source row failed sync-rule evaluation. Never fatal to a
    /// batch; the caller logs and continues.
    Evaluation(String),
    /// Timeout or congestion from the storage backend. Admin `clear()`
    /// retries with backoff; batch flushes surface this to the replicator.
    Storage(String),
    /// An invariant (I1-I6) was detected broken at runtime. Fatal: the group
    /// is set to STOP and the writer aborts.
    Integrity(String),
    /// Unparseable sync rules or an unsupported source descriptor,
    /// surfaced at batch open with no state mutation.
    Config(String),
    /// Attempt to read a group that has been terminated or never existed.
    NotFound(String),
}

impl BucketStoreError {
    pub fn integrity(msg: impl Into<String>) -> Self {
        BucketStoreError::Integrity(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        BucketStoreError::Storage(msg.into())
    }

    pub fn not_found(group_id: i64) -> Self {
        BucketStoreError::NotFound(format!("sync rule group {} not found", group_id))
    }
}

impl fmt::Display for BucketStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketStoreError::Io(e) => write!(f, "io error: {}", e),
            BucketStoreError::Json(msg) => write!(f, "json error: {}", msg),
            BucketStoreError::Evaluation(msg) => write!(f, "evaluation error: {}", msg),
            BucketStoreError::Storage(msg) => write!(f, "storage error: {}", msg),
            BucketStoreError::Integrity(msg) => write!(f, "integrity violation: {}", msg),
            BucketStoreError::Config(msg) => write!(f, "config error: {}", msg),
            BucketStoreError::NotFound(msg) => write!(f, "not found: {}", msg),
        }
    }
}

impl std::error::Error for BucketStoreError {}

impl From<io::Error> for BucketStoreError {
    fn from(e: io::Error) -> Self {
        BucketStoreError::Io(e)
    }
}

impl From<serde_json::Error> for BucketStoreError {
    fn from(e: serde_json::Error) -> Self {
        BucketStoreError::Json(e.to_string())
    }
}

/// Result type alias for bucket storage core operations.
pub type Result<T> = std::result::Result<T, BucketStoreError>;
