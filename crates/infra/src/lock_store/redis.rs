//! Redis-backed lock store (optional).
//!
//! Acquire is a single `SET key token NX PX ttl`, which Redis executes
//! atomically. Renew and release are compare-and-act Lua scripts so a stale
//! token can never extend or delete someone else's claim.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::time::Instant;
use tracing::instrument;

use super::r#trait::{Lock, LockError, LockStore, LockToken};

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Default namespace prefixed to every lock key.
const DEFAULT_NAMESPACE: &str = "cairn:lock:";

#[derive(Clone)]
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    namespace: String,
}

impl core::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLockStore").field("namespace", &self.namespace).finish()
    }
}

impl RedisLockStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        Ok(Self {
            conn,
            namespace: DEFAULT_NAMESPACE.to_string(),
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }
}

fn unavailable(err: redis::RedisError) -> LockError {
    LockError::Unavailable(err.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl LockStore for RedisLockStore {
    #[instrument(skip(self), err)]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock, LockError> {
        let token = LockToken::new();
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match reply {
            Some(_) => Ok(Lock {
                key: key.to_string(),
                token,
                expires_at: Instant::now() + ttl,
            }),
            None => Err(LockError::AcquisitionFailed { key: key.to_string() }),
        }
    }

    #[instrument(skip(self, lock), fields(key = %lock.key), err)]
    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Lock, LockError> {
        let mut conn = self.conn.clone();

        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(self.redis_key(&lock.key))
            .arg(lock.token.to_string())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if renewed == 1 {
            Ok(Lock {
                key: lock.key.clone(),
                token: lock.token,
                expires_at: Instant::now() + ttl,
            })
        } else {
            Err(LockError::RenewalFailed { key: lock.key.clone() })
        }
    }

    #[instrument(skip(self, lock), fields(key = %lock.key), err)]
    async fn release(&self, lock: &Lock) -> Result<(), LockError> {
        let mut conn = self.conn.clone();

        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.redis_key(&lock.key))
            .arg(lock.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if released == 1 {
            Ok(())
        } else {
            Err(LockError::NotHeld { key: lock.key.clone() })
        }
    }
}

/// These run against a live server: `CAIRN_REDIS_URL=redis://... cargo test
/// --features redis -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(5);

    async fn store() -> RedisLockStore {
        let url = std::env::var("CAIRN_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisLockStore::connect(url)
            .await
            .unwrap()
            .with_namespace(format!("cairn:test:{}:", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    #[ignore = "requires redis"]
    async fn concurrent_acquires_admit_exactly_one_holder() {
        let store = Arc::new(store().await);

        let mut attempts = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            attempts.spawn(async move { store.acquire("communication/message/1", TTL).await });
        }

        let mut held = 0;
        while let Some(result) = attempts.join_next().await {
            match result.unwrap() {
                Ok(_) => held += 1,
                Err(err) => assert!(matches!(err, LockError::AcquisitionFailed { .. })),
            }
        }
        assert_eq!(held, 1);
    }

    #[tokio::test]
    #[ignore = "requires redis"]
    async fn stale_token_cannot_renew_or_release_the_new_holder() {
        let store = store().await;
        let key = "communication/message/2";

        let stale = store.acquire(key, Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let current = store.acquire(key, TTL).await.unwrap();

        assert_eq!(
            store.renew(&stale, TTL).await.unwrap_err(),
            LockError::RenewalFailed { key: key.to_string() }
        );
        assert_eq!(
            store.release(&stale).await.unwrap_err(),
            LockError::NotHeld { key: key.to_string() }
        );
        assert!(matches!(
            store.acquire(key, TTL).await,
            Err(LockError::AcquisitionFailed { .. })
        ));

        store.renew(&current, TTL).await.unwrap();
        store.release(&current).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires redis"]
    async fn released_key_can_be_acquired_again() {
        let store = store().await;
        let key = "communication/message/3";

        let first = store.acquire(key, TTL).await.unwrap();
        store.release(&first).await.unwrap();

        let second = store.acquire(key, TTL).await.unwrap();
        assert_ne!(second.token, first.token);
        store.release(&second).await.unwrap();
    }
}
