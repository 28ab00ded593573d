//! Infrastructure event publisher implementations.
//!
//! The publisher abstraction lives in `cairn-events`. This module provides
//! infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisEventPublisher;
