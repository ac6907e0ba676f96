//! The Locker coordinator — public API, acquire-timeout, registry
//! bookkeeping, event emission, and the GC scheduler.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::adapter::{Adapter, GcInput, SetupInput};
use crate::error::{AcquireTimeoutError, AdapterError, LockError, LockerError};
use crate::events::{Event, EventBus, GarbageCycle, SubscriptionId};
use crate::lock::{Lock, LockId, LockOptions, LockStatus, LockType};
use crate::registry::LockRegistry;

/// Default GC interval used when a caller opts into GC without pinning a
/// specific interval (`gc_interval_ms: Some(0)` is treated the same as
/// "opted in, use the default").
const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;

/// Configuration for a `Locker`. Deserializable so an embedding
/// application can load it from its own config file/env layer even
/// though that loading step itself is out of scope for this crate.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct LockerConfig {
    #[serde(default)]
    pub gc_interval_ms: Option<u64>,
}

struct GcState {
    interval_ms: u64,
    running: AtomicBool,
    in_flight: AtomicBool,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Binds an `Adapter` and drives acquisition, release, and garbage
/// collection against it on behalf of one process.
pub struct Locker<A: Adapter + 'static> {
    adapter: Arc<A>,
    registry: LockRegistry,
    events: Arc<EventBus>,
    setup_once: OnceCell<()>,
    gc: Option<Arc<GcState>>,
}

impl<A: Adapter + 'static> Locker<A> {
    pub fn new(adapter: A, config: LockerConfig) -> Self {
        let gc = config.gc_interval_ms.map(|ms| {
            let interval_ms = if ms == 0 { DEFAULT_GC_INTERVAL_MS } else { ms };
            Arc::new(GcState {
                interval_ms,
                running: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                handle: parking_lot::Mutex::new(None),
            })
        });

        Self {
            adapter: Arc::new(adapter),
            registry: LockRegistry::new(),
            events: Arc::new(EventBus::new()),
            setup_once: OnceCell::new(),
            gc,
        }
    }

    fn gc_interval_ms(&self) -> Option<u64> {
        self.gc.as_ref().map(|gc| gc.interval_ms)
    }

    /// Idempotent, single-flight initialization. Concurrent callers share
    /// the same in-flight future via `OnceCell::get_or_try_init`.
    pub async fn setup(&self) -> Result<(), LockerError> {
        self.setup_once
            .get_or_try_init(|| async {
                tracing::info!(gc_interval_ms = ?self.gc_interval_ms(), "locker setup starting");
                let result = self
                    .adapter
                    .setup(SetupInput {
                        gc_interval_ms: self.gc_interval_ms(),
                    })
                    .await
                    .map_err(|e| LockerError::Setup(e.to_string()));
                if let Err(err) = &result {
                    tracing::error!(error = %err, "locker setup failed");
                }
                result
            })
            .await?;
        Ok(())
    }

    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id);
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    async fn lock_as(&self, name: &str, kind: LockType, options: LockOptions) -> Result<Lock, LockError> {
        if let Err(reason) = options.validate() {
            return Err(LockError::InvalidOptions {
                name: name.to_string(),
                reason,
            });
        }

        let lock = Lock::new(name, kind, options);
        tracing::debug!(lock_id = %lock.id, name, kind = ?kind, "acquiring lock");
        self.registry.add(lock.clone());
        self.ensure_gc_running();

        let result = self.acquire_with_timeout(&lock).await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    lock_id = %lock.id,
                    name,
                    settled_in_ms = ?lock.settled_in().map(|d| d.as_millis()),
                    "lock acquired"
                );
                self.events.emit(Event::AcquiredLock(lock.clone()));
                Ok(lock)
            }
            Err(err) => {
                self.registry.remove(&lock.id);
                tracing::warn!(lock_id = %lock.id, name, error = %err, "lock rejected");
                self.events.emit(Event::RejectedLock(lock.clone()));
                Err(err)
            }
        }
    }

    async fn acquire_with_timeout(&self, lock: &Lock) -> Result<(), LockError> {
        let timeout_ms = lock.options.acquire_timeout_ms();

        // The acquire poll loop runs as its own spawned task rather than a
        // plain future raced in `select!`: dropping a `JoinHandle` merely
        // detaches it (the task keeps running on the runtime), whereas
        // dropping a future mid-poll would abandon the queue entry with no
        // chance to self-clean. On timeout, we let the handle drop so the
        // still-running, now-detached loop notices the rejection on its
        // next check and exits; see `Adapter::acquire`'s contract.
        let adapter = self.adapter.clone();
        let task_lock = lock.clone();
        let handle = tokio::spawn(async move { adapter.acquire(&task_lock).await });

        let outcome = match timeout_ms {
            None => join_acquire(handle, lock).await,
            Some(ms) => {
                tokio::select! {
                    res = handle => into_acquire_result(res, lock),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        let timeout_err = AcquireTimeoutError {
                            lock_id: lock.id.clone(),
                            name: lock.name.clone(),
                            timeout_ms: ms,
                        };
                        let _ = lock.reject(timeout_err.to_string());
                        Err(LockError::Timeout(timeout_err))
                    }
                }
            }
        };

        match outcome {
            Ok(()) if lock.status() == LockStatus::Acquired => Ok(()),
            Ok(()) => {
                // Adapter returned without error but the lock never reached
                // Acquired (e.g. a timeout raced it to Rejected concurrently).
                let reason = lock
                    .reason()
                    .unwrap_or_else(|| "adapter returned without acquiring".to_string());
                Err(LockError::Rejected(lock.id.clone(), reason))
            }
            Err(err) => {
                // The timeout branch above may have already rejected this
                // lock with a more specific reason; reject() sets `reason`
                // before attempting the transition, so calling it again
                // unconditionally would clobber that reason even though the
                // transition itself fails. Only the first rejection should
                // stick.
                if lock.status() != LockStatus::Rejected {
                    let _ = lock.reject(err.to_string());
                }
                Err(err)
            }
        }
    }

    pub async fn lock_as_reader(&self, name: &str, options: LockOptions) -> Result<Lock, LockError> {
        self.lock_as(name, LockType::Reader, options).await
    }

    pub async fn lock_as_writer(&self, name: &str, options: LockOptions) -> Result<Lock, LockError> {
        self.lock_as(name, LockType::Writer, options).await
    }

    /// Acquire as reader, run `task`, release in a finally-block, and
    /// return the task's result — regardless of whether `task` succeeded.
    pub async fn ensure_reading_task_concurrency<T, F, Fut>(
        &self,
        name: &str,
        options: LockOptions,
        task: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_as_reader(name, options).await?;
        let result = task().await;
        self.release(&lock).await?;
        Ok(result)
    }

    /// Same as `ensure_reading_task_concurrency` but takes the lock as a
    /// writer.
    pub async fn ensure_writing_task_concurrency<T, F, Fut>(
        &self,
        name: &str,
        options: LockOptions,
        task: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_as_writer(name, options).await?;
        let result = task().await;
        self.release(&lock).await?;
        Ok(result)
    }

    /// Idempotent release: a no-op if the lock is already Releasing/gone,
    /// a registry-only drop if already Released, otherwise drives the
    /// adapter and unconditionally removes the lock from the registry.
    pub async fn release(&self, lock: &Lock) -> Result<(), LockError> {
        Self::release_owned(self.adapter.clone(), self.registry.clone(), self.events.clone(), lock.clone()).await
    }

    /// Shared release logic, taking its collaborators by owned/cloned
    /// handle so it can run inside a spawned task (see `release_many`)
    /// without borrowing `&self` across an await that outlives the call.
    async fn release_owned(
        adapter: Arc<A>,
        registry: LockRegistry,
        events: Arc<EventBus>,
        lock: Lock,
    ) -> Result<(), LockError> {
        if !registry.contains(&lock.id) {
            return Ok(());
        }

        match lock.status() {
            LockStatus::Releasing => return Ok(()),
            LockStatus::Released => {
                registry.remove(&lock.id);
                return Ok(());
            }
            _ => {}
        }

        lock.transition(LockStatus::Releasing)
            .map_err(LockError::Workflow)?;

        let result = adapter.release(&lock).await;
        registry.remove(&lock.id);

        match result {
            Ok(()) => {
                tracing::debug!(
                    lock_id = %lock.id,
                    name = %lock.name,
                    acquired_for_ms = ?lock.acquired_for().map(|d| d.as_millis()),
                    "lock released"
                );
                events.emit(Event::ReleasedLock(lock.clone()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(lock_id = %lock.id, name = %lock.name, error = %e, "release failed");
                Err(LockError::Adapter {
                    lock_id: lock.id.clone(),
                    source: e,
                })
            }
        }
    }

    /// Release many locks concurrently: each release (including its
    /// adapter round-trip) runs on its own spawned task via `JoinSet`,
    /// the same fan-out-and-collect shape the pack's own dispatcher uses
    /// for broadcasting to multiple nodes concurrently.
    pub async fn release_many(&self, locks: &[Lock]) -> Result<(), LockError> {
        let mut tasks = tokio::task::JoinSet::new();
        for lock in locks {
            let adapter = self.adapter.clone();
            let registry = self.registry.clone();
            let events = self.events.clone();
            let lock = lock.clone();
            tasks.spawn(async move { Self::release_owned(adapter, registry, events, lock).await });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(join_err) => Err(LockError::Adapter {
                    lock_id: LockId::new(),
                    source: AdapterError::Store(format!("release task panicked: {join_err}")),
                }),
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "release_many: one release failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop every entry the adapter owns and clear the registry.
    pub async fn release_all(&self) -> Result<(), LockerError> {
        self.adapter.release_all().await?;
        self.registry.clear();
        Ok(())
    }

    /// Run one GC pass immediately, outside of the periodic ticker.
    pub async fn gc(&self) -> Result<Option<GarbageCycle>, LockerError> {
        if !self.adapter.supports_gc() {
            return Ok(None);
        }
        let Some(gc) = self.gc.as_ref() else {
            return Ok(None);
        };
        Ok(Some(self.run_gc_cycle(gc).await?))
    }

    async fn run_gc_cycle(&self, gc: &GcState) -> Result<GarbageCycle, LockerError> {
        let start = std::time::Instant::now();
        let at_ms = crate::adapter::now_ms();
        let stale_at_ms = at_ms - 2 * gc.interval_ms as i64;

        let outcome = self
            .adapter
            .gc(GcInput {
                registry: &self.registry,
                gc_interval_ms: gc.interval_ms,
                at_ms,
                stale_at_ms,
            })
            .await?;

        let cycle = GarbageCycle {
            collected_count: outcome.collected_count,
            refreshed_count: outcome.refreshed_count,
            took_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        Ok(cycle)
    }

    /// Start the periodic GC ticker if GC is configured, supported, and
    /// not already running.
    fn ensure_gc_running(&self) {
        let Some(gc) = self.gc.clone() else { return };
        if !self.adapter.supports_gc() {
            return;
        }
        if gc.running.swap(true, Ordering::SeqCst) {
            return; // already running
        }

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let events = self.events.clone();
        let gc_for_task = gc.clone();

        tracing::debug!(interval_ms = gc_for_task.interval_ms, "gc ticker starting");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(gc_for_task.interval_ms));
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                ticker.tick().await;

                if registry.is_empty() {
                    tracing::debug!("gc ticker stopping: registry empty");
                    gc_for_task.running.store(false, Ordering::SeqCst);
                    return;
                }

                if gc_for_task.in_flight.swap(true, Ordering::SeqCst) {
                    tracing::warn!("gc cycle skipped: previous cycle still running");
                    events.emit(Event::Error(
                        "GC cycle skipped: previous cycle still running".into(),
                    ));
                    continue;
                }

                let start = std::time::Instant::now();
                let at_ms = crate::adapter::now_ms();
                let stale_at_ms = at_ms - 2 * gc_for_task.interval_ms as i64;

                let result = adapter
                    .gc(GcInput {
                        registry: &registry,
                        gc_interval_ms: gc_for_task.interval_ms,
                        at_ms,
                        stale_at_ms,
                    })
                    .await;

                gc_for_task.in_flight.store(false, Ordering::SeqCst);

                match result {
                    Ok(outcome) => {
                        let took_ms = start.elapsed().as_secs_f64() * 1000.0;
                        tracing::debug!(
                            collected = outcome.collected_count,
                            refreshed = outcome.refreshed_count,
                            took_ms,
                            "gc cycle completed"
                        );
                        events.emit(Event::GarbageCycle(GarbageCycle {
                            collected_count: outcome.collected_count,
                            refreshed_count: outcome.refreshed_count,
                            took_ms,
                        }));
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "gc cycle failed");
                        events.emit(Event::Error(err.to_string().into()));
                    }
                }
            }
        });

        *gc.handle.lock() = Some(handle);
    }
}

/// Await a spawned `acquire` task with no competing timeout branch.
async fn join_acquire(
    handle: JoinHandle<Result<(), AdapterError>>,
    lock: &Lock,
) -> Result<(), LockError> {
    into_acquire_result(handle.await, lock)
}

/// Turn a `JoinHandle`'s result (join error or adapter error) into the
/// `LockError` this module's callers expect.
fn into_acquire_result(
    result: Result<Result<(), AdapterError>, tokio::task::JoinError>,
    lock: &Lock,
) -> Result<(), LockError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LockError::Adapter {
            lock_id: lock.id.clone(),
            source: e,
        }),
        Err(join_err) => Err(LockError::Adapter {
            lock_id: lock.id.clone(),
            source: AdapterError::Store(format!("acquire task panicked or was cancelled: {join_err}")),
        }),
    }
}

impl<A: Adapter + 'static> Drop for Locker<A> {
    fn drop(&mut self) {
        if let Some(gc) = &self.gc {
            if let Some(handle) = gc.handle.lock().take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn locker_config_round_trips_through_json() {
        let config = LockerConfig {
            gc_interval_ms: Some(30_000),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LockerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.gc_interval_ms, Some(30_000));
    }

    #[test]
    fn locker_config_defaults_gc_interval_to_none() {
        let parsed: LockerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.gc_interval_ms, None);
    }
}
