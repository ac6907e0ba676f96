//! Small multi-listener event bus for `Locker`.
//!
//! Delivery is synchronous and in transition order (events are emitted
//! from the same call site that performs the transition), and a
//! panicking listener is caught so it can never break lock operations —
//! the same "one bad listener can't break the rest" guarantee the spec
//! asks for in §7/§9.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::lock::Lock;

/// Counters from one GC pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GarbageCycle {
    pub collected_count: u64,
    pub refreshed_count: u64,
    pub took_ms: f64,
}

/// Events emitted by a `Locker` on state transitions and GC cycles.
#[derive(Clone)]
pub enum Event {
    AcquiredLock(Lock),
    RejectedLock(Lock),
    ReleasedLock(Lock),
    GarbageCycle(GarbageCycle),
    Error(Arc<str>),
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Opaque handle returned by `EventBus::subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.write().retain(|(existing, _)| *existing != id);
    }

    /// Deliver an event to every listener, swallowing panics so that one
    /// misbehaving listener never aborts lock operations.
    pub fn emit(&self, event: Event) {
        let listeners = self.listeners.read();
        for (_, listener) in listeners.iter() {
            let _ = catch_unwind(AssertUnwindSafe(|| listener(&event)));
        }
    }
}
