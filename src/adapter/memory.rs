//! In-memory reference adapter.
//!
//! Single-process implementation of the FIFO admission rule, used as the
//! semantic oracle for tests and as a usable adapter when every lock
//! participant lives in one process. Internal shape directly mirrors the
//! source crate's `categories::concurrency::row_lock::RowLockBlock` lock
//! table (`HashMap<String, LockEntry>` guarded for concurrent access) —
//! same per-resource map, generalized from a 2PL shared/exclusive table to
//! an ordered reader/writer queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapter::{now_ms, Adapter, GcInput, GcOutcome, SetupInput};
use crate::error::AdapterError;
use crate::lock::{Lock, LockId, LockStatus, LockType};

#[derive(Clone)]
struct QueueEntry {
    id: LockId,
    kind: LockType,
    at_ms: i64,
}

/// `name -> ordered queue of waiting/held locks`.
#[derive(Default)]
pub struct InMemoryAdapter {
    queues: Mutex<HashMap<String, Vec<QueueEntry>>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Writer admitted iff head of queue; Reader admitted iff no Writer
    /// precedes it (the first entry that is either this lock or any
    /// Writer must be this lock).
    fn admitted(queue: &[QueueEntry], id: &LockId, kind: LockType) -> bool {
        for entry in queue {
            if entry.id == *id {
                return true;
            }
            if matches!(kind, LockType::Reader) && entry.kind == LockType::Writer {
                return false;
            }
            if matches!(kind, LockType::Writer) {
                return false;
            }
        }
        false
    }

    fn remove_entry(queue: &mut Vec<QueueEntry>, id: &LockId) {
        queue.retain(|e| e.id != *id);
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    async fn setup(&self, _input: SetupInput) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn acquire(&self, lock: &Lock) -> Result<(), AdapterError> {
        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(lock.name.clone()).or_default();
            queue.push(QueueEntry {
                id: lock.id.clone(),
                kind: lock.kind,
                at_ms: now_ms(),
            });
        }

        loop {
            if lock.status() != LockStatus::Acquiring {
                // Left Acquiring some other way (e.g. timed out); best-effort
                // removal, silent if already gone.
                let mut queues = self.queues.lock();
                if let Some(queue) = queues.get_mut(&lock.name) {
                    Self::remove_entry(queue, &lock.id);
                }
                return Ok(());
            }

            let admitted = {
                let queues = self.queues.lock();
                queues
                    .get(&lock.name)
                    .map(|q| Self::admitted(q, &lock.id, lock.kind))
                    .unwrap_or(false)
            };

            if admitted {
                // transition() may fail if a concurrent timeout already
                // rejected the lock; if so this entry is now a zombie that
                // would otherwise block admission for `name` forever, so
                // pull it before returning.
                if lock.transition(LockStatus::Acquired).is_err() {
                    let mut queues = self.queues.lock();
                    if let Some(queue) = queues.get_mut(&lock.name) {
                        Self::remove_entry(queue, &lock.id);
                    }
                }
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(lock.options.pull_interval_ms())).await;
        }
    }

    async fn release(&self, lock: &Lock) -> Result<(), AdapterError> {
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(&lock.name)
            .ok_or_else(|| AdapterError::NotInQueue {
                name: lock.name.clone(),
            })?;

        let before = queue.len();
        Self::remove_entry(queue, &lock.id);
        if queue.len() == before {
            return Err(AdapterError::NotInQueue {
                name: lock.name.clone(),
            });
        }

        lock.transition(LockStatus::Released)
            .map_err(|e| AdapterError::Store(e.to_string()))?;
        Ok(())
    }

    async fn release_all(&self) -> Result<(), AdapterError> {
        self.queues.lock().clear();
        Ok(())
    }

    fn supports_gc(&self) -> bool {
        true
    }

    async fn gc(&self, input: GcInput<'_>) -> Result<GcOutcome, AdapterError> {
        let mut queues = self.queues.lock();
        let mut collected_count = 0u64;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|e| e.at_ms >= input.stale_at_ms);
            collected_count += (before - queue.len()) as u64;
        }

        let mut refreshed_count = 0u64;
        for lock in input.registry.all() {
            if let Some(queue) = queues.get_mut(&lock.name) {
                if let Some(entry) = queue.iter_mut().find(|e| e.id == lock.id) {
                    entry.at_ms = entry.at_ms.max(input.at_ms);
                    refreshed_count += 1;
                }
            }
        }

        tracing::trace!(collected_count, refreshed_count, "in-memory gc pass");
        Ok(GcOutcome {
            collected_count,
            refreshed_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockOptions;
    use crate::registry::LockRegistry;

    fn opts(pull_ms: u64) -> LockOptions {
        LockOptions {
            acquire_timeout_ms: None,
            pull_interval_ms: Some(pull_ms),
        }
    }

    #[tokio::test]
    async fn two_readers_acquire_concurrently() {
        let adapter = InMemoryAdapter::new();
        let r1 = Lock::new("n", LockType::Reader, opts(5));
        let r2 = Lock::new("n", LockType::Reader, opts(5));

        adapter.acquire(&r1).await.unwrap();
        adapter.acquire(&r2).await.unwrap();

        assert_eq!(r1.status(), LockStatus::Acquired);
        assert_eq!(r2.status(), LockStatus::Acquired);
    }

    #[tokio::test]
    async fn writer_waits_behind_reader() {
        let adapter = InMemoryAdapter::new();
        let reader = Lock::new("n", LockType::Reader, opts(5));
        adapter.acquire(&reader).await.unwrap();

        let writer = Lock::new("n", LockType::Writer, opts(5));
        let writer_clone = writer.clone();
        let adapter = std::sync::Arc::new(adapter);
        let adapter_clone = adapter.clone();
        let handle = tokio::spawn(async move { adapter_clone.acquire(&writer_clone).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(writer.status(), LockStatus::Acquiring);

        adapter.release(&reader).await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(writer.status(), LockStatus::Acquired);
    }

    #[tokio::test]
    async fn fifo_reader_does_not_pass_waiting_writer() {
        let adapter = std::sync::Arc::new(InMemoryAdapter::new());
        let first_reader = Lock::new("n", LockType::Reader, opts(5));
        adapter.acquire(&first_reader).await.unwrap();

        let writer = Lock::new("n", LockType::Writer, opts(5));
        let writer_clone = writer.clone();
        let a1 = adapter.clone();
        let writer_task = tokio::spawn(async move { a1.acquire(&writer_clone).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second_reader = Lock::new("n", LockType::Reader, opts(5));
        let reader_clone = second_reader.clone();
        let a2 = adapter.clone();
        let reader_task = tokio::spawn(async move { a2.acquire(&reader_clone).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The writer arrived before the second reader, so the second
        // reader must still be waiting.
        assert_eq!(writer.status(), LockStatus::Acquiring);
        assert_eq!(second_reader.status(), LockStatus::Acquiring);

        adapter.release(&first_reader).await.unwrap();
        writer_task.await.unwrap().unwrap();
        assert_eq!(writer.status(), LockStatus::Acquired);

        adapter.release(&writer).await.unwrap();
        reader_task.await.unwrap().unwrap();
        assert_eq!(second_reader.status(), LockStatus::Acquired);
    }

    #[tokio::test]
    async fn release_on_absent_entry_fails() {
        let adapter = InMemoryAdapter::new();
        let lock = Lock::new("n", LockType::Writer, opts(5));
        let err = adapter.release(&lock).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotInQueue { .. }));
    }

    #[tokio::test]
    async fn gc_collects_stale_and_refreshes_live() {
        let adapter = InMemoryAdapter::new();
        let lock = Lock::new("n", LockType::Reader, opts(5));
        adapter.acquire(&lock).await.unwrap();

        let registry = LockRegistry::new();
        registry.add(lock.clone());

        let at_ms = now_ms();
        let outcome = adapter
            .gc(GcInput {
                registry: &registry,
                gc_interval_ms: 500,
                at_ms,
                stale_at_ms: at_ms - 2 * 500,
            })
            .await
            .unwrap();

        assert_eq!(outcome.collected_count, 0);
        assert_eq!(outcome.refreshed_count, 1);

        // Now simulate an orphan: a queue entry far older than staleAt.
        {
            let mut queues = adapter.queues.lock();
            let queue = queues.get_mut("n").unwrap();
            queue.push(QueueEntry {
                id: LockId::new(),
                kind: LockType::Reader,
                at_ms: at_ms - 100_000,
            });
        }

        let outcome = adapter
            .gc(GcInput {
                registry: &registry,
                gc_interval_ms: 500,
                at_ms,
                stale_at_ms: at_ms - 2 * 500,
            })
            .await
            .unwrap();
        assert_eq!(outcome.collected_count, 1);
    }
}
