//! Error taxonomy
//!
//! Mirrors the flat, `thiserror`-derived enum style used throughout this
//! codebase: one enum per failure category, string-bearing variants where
//! the cause is external, typed fields where the cause is an internal
//! invariant violation.

use crate::lock::{LockId, LockStatus};

/// Failure raised when a `Lock` is asked to transition to a status that
/// isn't reachable from its current status (see the state machine in
/// `crate::lock`).
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal lock transition: {from:?} -> {to:?} refused for lock {lock_id}")]
pub struct WorkflowError {
    pub lock_id: LockId,
    pub from: LockStatus,
    pub to: LockStatus,
}

/// Failure raised when `acquireTimeoutMs` elapses before a lock is admitted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("lock {lock_id} for \"{name}\" timed out after {timeout_ms}ms waiting to acquire")]
pub struct AcquireTimeoutError {
    pub lock_id: LockId,
    pub name: String,
    pub timeout_ms: u64,
}

/// Adapter-level failure not tied to a single lock (setup, GC, transport).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter setup failed: {0}")]
    Setup(String),

    #[error("operation not supported by this adapter")]
    Unsupported,

    #[error("lock entry for \"{name}\" is no longer in the queue")]
    NotInQueue { name: String },

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),
}

/// Failure attached to a specific `Lock` (acquire/release path).
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("workflow error for lock {0}")]
    Workflow(#[from] WorkflowError),

    #[error("acquire timed out for lock {0}")]
    Timeout(#[from] AcquireTimeoutError),

    #[error("adapter error for lock {lock_id}: {source}")]
    Adapter {
        lock_id: LockId,
        #[source]
        source: AdapterError,
    },

    #[error("lock {0} rejected: {1}")]
    Rejected(LockId, String),

    #[error("invalid options for lock on \"{name}\": {reason}")]
    InvalidOptions { name: String, reason: String },
}

/// Generic top-level error category (`LockerError` in the spec).
#[derive(Debug, thiserror::Error)]
pub enum LockerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("locker setup failed: {0}")]
    Setup(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(error: std::io::Error) -> Self {
        AdapterError::Store(error.to_string())
    }
}
