//! rw-locker — a distributed readers-writer lock coordinated through an
//! external shared document store.
//!
//! A [`Locker`] binds an [`Adapter`] (the pluggable backend) and hands out
//! [`Lock`] handles in reader or writer mode, admitting them in FIFO order
//! per lock name. Two adapters ship in this crate: [`adapter::memory`] for
//! single-process use and testing, and [`adapter::mongo`] for coordination
//! across processes via MongoDB.

pub mod adapter;
pub mod error;
pub mod events;
pub mod lock;
pub mod locker;
pub mod registry;

pub use adapter::{Adapter, GcInput, GcOutcome, SetupInput};
pub use error::{AcquireTimeoutError, AdapterError, LockError, LockerError, WorkflowError};
pub use events::{Event, EventBus, GarbageCycle, SubscriptionId};
pub use lock::{Lock, LockId, LockOptions, LockStatus, LockType};
pub use locker::{Locker, LockerConfig};
pub use registry::LockRegistry;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
