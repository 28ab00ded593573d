use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Proof of holding a lock. Only the holder knows it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LockToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A time-bounded exclusive claim on one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: String,
    pub token: LockToken,
    /// Local estimate of when the claim lapses unless renewed.
    pub expires_at: Instant,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Someone else currently holds the key.
    #[error("lock for '{key}' is held by another worker")]
    AcquisitionFailed { key: String },

    /// The token no longer matches the holder: the lock expired or was taken over.
    #[error("lock for '{key}' could not be renewed: no longer held")]
    RenewalFailed { key: String },

    #[error("lock for '{key}' is not held by this token")]
    NotHeld { key: String },

    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

impl LockError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Time-bounded mutual exclusion keyed by string.
///
/// `acquire` must be atomic across every process sharing the backing store:
/// two concurrent acquisitions of the same key never both succeed. `renew`
/// and `release` fail loudly when the token does not match the current holder.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock, LockError>;

    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Lock, LockError>;

    async fn release(&self, lock: &Lock) -> Result<(), LockError>;
}

#[async_trait]
impl<L> LockStore for Arc<L>
where
    L: LockStore + ?Sized,
{
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock, LockError> {
        (**self).acquire(key, ttl).await
    }

    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Lock, LockError> {
        (**self).renew(lock, ttl).await
    }

    async fn release(&self, lock: &Lock) -> Result<(), LockError> {
        (**self).release(lock).await
    }
}
