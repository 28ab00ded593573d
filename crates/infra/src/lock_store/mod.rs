//! Distributed per-entity mutual exclusion.
//!
//! The lock store is the sole arbiter of which worker processes a given
//! entity. It is a throughput optimization layered over the event store's
//! revision check, never a substitute for it.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryLockStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use r#trait::{Lock, LockError, LockStore, LockToken};
