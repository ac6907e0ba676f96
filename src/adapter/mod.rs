//! Adapter contract — the pluggable backend a `Locker` drives.
//!
//! `Adapter` is an `async_trait`, the same macro the source crate uses for
//! its `Block` trait, including the same "default no-op body, override to
//! opt in" pattern `Block::on_start`/`on_stop`/`on_reset` use: `setup` and
//! `gc` are optional capabilities here, so an adapter that doesn't support
//! them simply doesn't override the default, which reports
//! `AdapterError::Unsupported`.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::lock::Lock;
use crate::registry::LockRegistry;

/// Input to one GC pass: the registry of locally-live locks (to refresh),
/// the configured GC interval, "now", and the computed staleness cutoff
/// (`at - 2 * gc_interval_ms`).
pub struct GcInput<'a> {
    pub registry: &'a LockRegistry,
    pub gc_interval_ms: u64,
    pub at_ms: i64,
    pub stale_at_ms: i64,
}

/// Result of one GC pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub collected_count: u64,
    pub refreshed_count: u64,
}

/// Optional initialization input. When `gc_interval_ms` is set, an adapter
/// that supports GC must configure any TTL machinery `gc` depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupInput {
    pub gc_interval_ms: Option<u64>,
}

/// Abstract operations a lock backend must provide. All operations may
/// fail with `AdapterError`; `setup` and `gc` are optional capabilities
/// that default to `Unsupported`.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Idempotent initialization (create structures/indexes). The default
    /// implementation is a no-op success — most adapters (e.g. in-memory)
    /// need no setup; overriding is how an adapter opts into doing real
    /// work here.
    async fn setup(&self, _input: SetupInput) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Block until `lock` reaches Acquired, or return without acquiring
    /// if it leaves Acquiring some other way (e.g. externally rejected by
    /// a racing acquire-timeout). On success, must transition `lock`'s
    /// state to Acquired. `lock`'s lifecycle fields are interior-mutable,
    /// so a concurrent task (the Locker's timeout) can reject the same
    /// lock while this poll loop is running; the loop must notice and
    /// exit instead of overwriting that decision.
    async fn acquire(&self, lock: &Lock) -> Result<(), AdapterError>;

    /// Remove the lock's store presence and transition it to Released.
    /// Must fail if the entry is no longer present.
    async fn release(&self, lock: &Lock) -> Result<(), AdapterError>;

    /// Drop every entry this adapter owns.
    async fn release_all(&self) -> Result<(), AdapterError>;

    /// Whether this adapter implements `gc`. Locker only enables its GC
    /// driver when this is true and a `gc_interval_ms` was configured.
    fn supports_gc(&self) -> bool {
        false
    }

    /// Refresh heartbeats for every lock in `input.registry`; collect
    /// entries older than `input.stale_at_ms`.
    async fn gc(&self, _input: GcInput<'_>) -> Result<GcOutcome, AdapterError> {
        Err(AdapterError::Unsupported)
    }
}

/// Milliseconds since the Unix epoch, used for store-visible heartbeats.
/// Kept in one place so every caller of "now" for wire purposes agrees on
/// units and source.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
