use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::r#trait::{Lock, LockError, LockStore, LockToken};

#[derive(Debug, Clone, Copy)]
struct Held {
    token: LockToken,
    expires_at: Instant,
}

/// Process-local lock store.
///
/// Reference implementation for tests/dev and single-process deployments.
/// Expired claims are treated as free and may be taken over.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently claimed (and not expired).
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.held
            .lock()
            .map(|h| h.get(key).is_some_and(|held| held.expires_at > now))
            .unwrap_or(false)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Held>>, LockError> {
        self.held
            .lock()
            .map_err(|_| LockError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock, LockError> {
        let now = Instant::now();
        let mut held = self.guard()?;

        if let Some(current) = held.get(key) {
            if current.expires_at > now {
                return Err(LockError::AcquisitionFailed { key: key.to_string() });
            }
        }

        let token = LockToken::new();
        let expires_at = now + ttl;
        held.insert(key.to_string(), Held { token, expires_at });

        Ok(Lock {
            key: key.to_string(),
            token,
            expires_at,
        })
    }

    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Lock, LockError> {
        let now = Instant::now();
        let mut held = self.guard()?;

        match held.get_mut(&lock.key) {
            Some(current) if current.token == lock.token && current.expires_at > now => {
                current.expires_at = now + ttl;
                Ok(Lock {
                    key: lock.key.clone(),
                    token: lock.token,
                    expires_at: current.expires_at,
                })
            }
            _ => Err(LockError::RenewalFailed { key: lock.key.clone() }),
        }
    }

    async fn release(&self, lock: &Lock) -> Result<(), LockError> {
        let mut held = self.guard()?;

        match held.get(&lock.key) {
            Some(current) if current.token == lock.token => {
                held.remove(&lock.key);
                Ok(())
            }
            _ => Err(LockError::NotHeld { key: lock.key.clone() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let store = InMemoryLockStore::new();
        let lock = store.acquire("ctx/entity/1", TTL).await.unwrap();

        let err = store.acquire("ctx/entity/1", TTL).await.unwrap_err();
        assert_eq!(err, LockError::AcquisitionFailed { key: "ctx/entity/1".to_string() });

        store.release(&lock).await.unwrap();
        store.acquire("ctx/entity/1", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquires_have_exactly_one_winner() {
        let store = Arc::new(InMemoryLockStore::new());

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.acquire("ctx/entity/1", TTL).await })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => winners += 1,
                Err(err) => assert!(matches!(err, LockError::AcquisitionFailed { .. })),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over_and_stale_holder_fails_loudly() {
        let store = InMemoryLockStore::new();
        let stale = store.acquire("k", Duration::from_millis(100)).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let fresh = store.acquire("k", TTL).await.unwrap();
        assert_ne!(fresh.token, stale.token);

        assert_eq!(
            store.renew(&stale, TTL).await.unwrap_err(),
            LockError::RenewalFailed { key: "k".to_string() }
        );
        assert_eq!(
            store.release(&stale).await.unwrap_err(),
            LockError::NotHeld { key: "k".to_string() }
        );
        assert!(store.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_expiry() {
        let store = InMemoryLockStore::new();
        let lock = store.acquire("k", Duration::from_millis(100)).await.unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        let renewed = store.renew(&lock, Duration::from_millis(100)).await.unwrap();
        assert!(renewed.expires_at > lock.expires_at);

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(store.is_locked("k"));
    }
}
