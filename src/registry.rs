//! Process-local registry of live `Lock`s.
//!
//! Mirrors the source crate's `BlockRegistry`: an `Arc<RwLock<HashMap>>`
//! guarded by `parking_lot` for cheap concurrent reads and exclusive
//! writes, generalized from "blocks keyed by block id" to "locks keyed by
//! lock id". Membership is by identity (the lock's id), per the spec's
//! note that the registry must support identity membership rather than
//! structural equality.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::lock::{Lock, LockId, LockStatus, LockType};

/// Thread-safe, cloneable handle onto the set of locks a `Locker` is
/// currently tracking — from enqueue until terminal removal.
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<RwLock<HashMap<LockId, Lock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a lock to the registry, keyed by its id.
    pub fn add(&self, lock: Lock) {
        self.locks.write().insert(lock.id.clone(), lock);
    }

    /// Remove a lock by id, returning it if it was present.
    pub fn remove(&self, id: &LockId) -> Option<Lock> {
        self.locks.write().remove(id)
    }

    /// Whether a lock with this id is currently tracked.
    pub fn contains(&self, id: &LockId) -> bool {
        self.locks.read().contains_key(id)
    }

    /// Number of locks currently tracked.
    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }

    /// Snapshot clone of every tracked lock.
    pub fn all(&self) -> Vec<Lock> {
        self.locks.read().values().cloned().collect()
    }

    /// Snapshot of tracked lock ids.
    pub fn ids(&self) -> Vec<LockId> {
        self.locks.read().keys().cloned().collect()
    }

    /// Snapshot of locks with a given name.
    pub fn by_name(&self, name: &str) -> Vec<Lock> {
        self.locks
            .read()
            .values()
            .filter(|l| l.name == name)
            .cloned()
            .collect()
    }

    /// Snapshot of locks of a given type.
    pub fn by_type(&self, kind: LockType) -> Vec<Lock> {
        self.locks
            .read()
            .values()
            .filter(|l| l.kind == kind)
            .cloned()
            .collect()
    }

    /// Snapshot of locks in a given status.
    pub fn by_status(&self, status: LockStatus) -> Vec<Lock> {
        self.locks
            .read()
            .values()
            .filter(|l| l.status() == status)
            .cloned()
            .collect()
    }

    /// Look up a tracked lock's handle by id (cheap clone — shares state).
    pub fn get(&self, id: &LockId) -> Option<Lock> {
        self.locks.read().get(id).cloned()
    }

    /// Clear every tracked lock, returning what was cleared.
    pub fn clear(&self) -> Vec<Lock> {
        self.locks.write().drain().map(|(_, lock)| lock).collect()
    }
}
