//! Lock entity and its state machine.
//!
//! A `Lock` tracks identity, parameters, and timing telemetry for one
//! requested lock instance. State transitions are validated against the
//! DAG in the specification; anything outside the edge set below fails
//! with a `WorkflowError` and leaves the lock's state untouched.
//!
//! ```text
//! Acquiring ──► Acquired ──► Releasing ──► Released
//!     │              └───────────────────────►┘
//!     └──► Rejected
//! ```
//!
//! The lifecycle fields (`status`, `settled_at`, `released_at`, `reason`)
//! live behind a `parking_lot::Mutex` so that a `Lock` handle can be
//! cheaply cloned (an `Arc` bump) and shared between the adapter's
//! acquire-poll loop and the Locker's acquire-timeout task — the same
//! interior-mutability discipline the source crate's `BlockRegistry`
//! already uses for its map, applied here at the single-lock level so two
//! concurrent tasks can observe and drive the same state machine.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Process-unique opaque identifier for a `Lock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(pub String);

impl LockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two lock modes of a readers-writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    Reader,
    Writer,
}

/// Lifecycle status of a `Lock`. See the module docs for the transition
/// DAG; `Lock::transition` is the only place that is allowed to change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStatus {
    Acquiring,
    Acquired,
    Releasing,
    Released,
    Rejected,
}

/// Per-lock options. `pull_interval_ms` defaults to 25 per the spec;
/// `acquire_timeout_ms`, when set, must be > 0 — checked once by
/// `validate()`, which `Locker::lock_as_reader`/`lock_as_writer` call
/// before a `Lock` carrying these options is ever used, since options may
/// be built up piecemeal by a caller before being handed to the Locker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockOptions {
    pub acquire_timeout_ms: Option<u64>,
    pub pull_interval_ms: Option<u64>,
}

const DEFAULT_PULL_INTERVAL_MS: u64 = 25;

impl LockOptions {
    /// Returns the effective pull interval, defaulting to 25ms. Assumes
    /// `validate()` has already rejected a zero value; this accessor does
    /// not re-validate.
    pub fn pull_interval_ms(&self) -> u64 {
        self.pull_interval_ms.unwrap_or(DEFAULT_PULL_INTERVAL_MS)
    }

    /// Returns the configured acquire timeout, if any. Assumes `validate()`
    /// has already rejected a zero value.
    pub fn acquire_timeout_ms(&self) -> Option<u64> {
        self.acquire_timeout_ms
    }

    /// Checks `acquireTimeoutMs`/`pullIntervalMs` are > 0 when set. Returns
    /// the name of the offending field and why on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.acquire_timeout_ms == Some(0) {
            return Err("acquireTimeoutMs must be > 0".to_string());
        }
        if self.pull_interval_ms == Some(0) {
            return Err("pullIntervalMs must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LockInner {
    status: LockStatus,
    settled_at: Option<Instant>,
    released_at: Option<Instant>,
    reason: Option<String>,
}

/// Identity and state for one requested lock instance.
///
/// Cloning a `Lock` is cheap and shares lifecycle state with the original
/// (it clones the underlying `Arc`) — every clone observes the same
/// transitions.
#[derive(Debug, Clone)]
pub struct Lock {
    pub id: LockId,
    pub name: String,
    pub kind: LockType,
    pub options: LockOptions,
    pub created_at: Instant,
    inner: Arc<Mutex<LockInner>>,
}

impl Lock {
    pub fn new(name: impl Into<String>, kind: LockType, options: LockOptions) -> Self {
        Self {
            id: LockId::new(),
            name: name.into(),
            kind,
            options,
            created_at: Instant::now(),
            inner: Arc::new(Mutex::new(LockInner {
                status: LockStatus::Acquiring,
                settled_at: None,
                released_at: None,
                reason: None,
            })),
        }
    }

    pub fn is_writer(&self) -> bool {
        matches!(self.kind, LockType::Writer)
    }

    pub fn status(&self) -> LockStatus {
        self.inner.lock().status
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.lock().reason.clone()
    }

    /// Time from creation to settling into Acquired/Rejected, if settled.
    pub fn settled_in(&self) -> Option<Duration> {
        self.inner
            .lock()
            .settled_at
            .map(|t| t.duration_since(self.created_at))
    }

    /// Time held between settling and release, if released.
    pub fn acquired_for(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.settled_at, inner.released_at) {
            (Some(settled), Some(released)) => Some(released.duration_since(settled)),
            _ => None,
        }
    }

    pub fn settled_at(&self) -> Option<Instant> {
        self.inner.lock().settled_at
    }

    pub fn released_at(&self) -> Option<Instant> {
        self.inner.lock().released_at
    }

    /// Whether this lock is still being tracked by a `Locker`/`LockRegistry`
    /// (anything short of a terminal status).
    pub fn is_live(&self) -> bool {
        matches!(
            self.status(),
            LockStatus::Acquiring | LockStatus::Acquired | LockStatus::Releasing
        )
    }

    fn edge_allowed(from: LockStatus, to: LockStatus) -> bool {
        matches!(
            (from, to),
            (LockStatus::Acquiring, LockStatus::Acquired)
                | (LockStatus::Acquiring, LockStatus::Rejected)
                | (LockStatus::Acquired, LockStatus::Releasing)
                | (LockStatus::Acquired, LockStatus::Released)
                | (LockStatus::Releasing, LockStatus::Released)
        )
    }

    /// Attempt a state transition. On success, stamps `settled_at` when
    /// entering Acquired/Rejected and `released_at` when entering Released.
    /// On failure, returns a `WorkflowError` and leaves `self` unchanged.
    pub fn transition(&self, to: LockStatus) -> Result<(), WorkflowError> {
        let mut inner = self.inner.lock();
        let from = inner.status;
        if !Self::edge_allowed(from, to) {
            return Err(WorkflowError {
                lock_id: self.id.clone(),
                from,
                to,
            });
        }

        let now = Instant::now();
        match to {
            LockStatus::Acquired | LockStatus::Rejected => {
                inner.settled_at = Some(now);
            }
            LockStatus::Released => {
                debug_assert!(
                    inner.settled_at.is_some(),
                    "entering Released without a settled_at is an internal error"
                );
                inner.released_at = Some(now);
            }
            _ => {}
        }

        inner.status = to;
        Ok(())
    }

    /// Set `reason` and transition to Rejected. Must be called from
    /// Acquiring (enforced by `transition`'s edge set).
    pub fn reject(&self, reason: impl Into<String>) -> Result<(), WorkflowError> {
        self.inner.lock().reason = Some(reason.into());
        self.transition(LockStatus::Rejected)
    }
}
