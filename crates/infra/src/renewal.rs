//! Background renewal of leases and locks.
//!
//! One [`Renewal`] task exists per claim and captures that claim's token. It
//! never renews anything else, and [`Renewal::stop`] returns only once the
//! task is gone, so a renewal can't outlive the command that owns the claim.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::dispatcher::{CommandLeaseClient, Lease};
use crate::lock_store::{Lock, LockStore};

#[derive(Debug)]
pub struct Renewal {
    lost: watch::Receiver<Option<String>>,
    handle: JoinHandle<()>,
}

impl Renewal {
    /// Keep `lease` alive until stopped.
    pub fn lease(client: Arc<dyn CommandLeaseClient>, lease: Lease, interval: Duration) -> Self {
        Self::spawn(
            "lease",
            interval,
            lease,
            move |lease: Lease| {
                let client = client.clone();
                async move { client.renew(&lease).await }
            },
            |err: &crate::dispatcher::DispatcherError| !err.is_unavailable(),
        )
    }

    /// Keep `lock` alive until stopped, extending it by `ttl` each time.
    pub fn lock(store: Arc<dyn LockStore>, lock: Lock, ttl: Duration, interval: Duration) -> Self {
        Self::spawn(
            "lock",
            interval,
            lock,
            move |lock: Lock| {
                let store = store.clone();
                async move { store.renew(&lock, ttl).await }
            },
            |err: &crate::lock_store::LockError| !err.is_unavailable(),
        )
    }

    fn spawn<T, E, F, Fut>(
        label: &'static str,
        interval: Duration,
        mut current: T,
        renew: F,
        is_lost: fn(&E) -> bool,
    ) -> Self
    where
        T: Clone + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, lost) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match renew(current.clone()).await {
                    Ok(next) => {
                        current = next;
                        debug!(claim = label, "renewed");
                    }
                    Err(err) if is_lost(&err) => {
                        warn!(claim = label, error = %err, "claim lost, renewal stopped");
                        let _ = tx.send(Some(err.to_string()));
                        return;
                    }
                    Err(err) => {
                        warn!(claim = label, error = %err, "renewal failed, retrying next tick");
                    }
                }
            }
        });

        Self { lost, handle }
    }

    /// Reason the claim was lost, if it was.
    pub fn lost(&self) -> Option<String> {
        self.lost.borrow().clone()
    }

    /// Cancel the task and wait until it has terminated.
    pub async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Renewal {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::InMemoryDispatcher;
    use crate::lock_store::InMemoryLockStore;
    use crate::test_support::{like, message_id};

    #[tokio::test(start_paused = true)]
    async fn lease_survives_well_past_its_duration() {
        let dispatcher = Arc::new(InMemoryDispatcher::new(Duration::from_secs(1)));
        dispatcher.submit(like(&message_id())).unwrap();

        let lease = dispatcher.await_command().await.unwrap();
        let renewal = Renewal::lease(dispatcher.clone(), lease.clone(), Duration::from_millis(300));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(renewal.lost(), None);
        renewal.stop().await;

        dispatcher.acknowledge(&lease).await.unwrap();
        assert_eq!(dispatcher.acknowledged().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stolen_lock_is_reported_lost() {
        let store = Arc::new(InMemoryLockStore::new());
        let ttl = Duration::from_secs(1);
        let lock = store.acquire("communication/message/1", ttl).await.unwrap();

        let renewal = Renewal::lock(store.clone(), lock.clone(), ttl, Duration::from_millis(300));

        store.release(&lock).await.unwrap();
        let _thief = store.acquire("communication/message/1", ttl).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(renewal.lost().is_some());
        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_renewal_no_longer_extends_the_lock() {
        let store = Arc::new(InMemoryLockStore::new());
        let ttl = Duration::from_secs(1);
        let lock = store.acquire("communication/message/2", ttl).await.unwrap();

        let renewal = Renewal::lock(store.clone(), lock, ttl, Duration::from_millis(300));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.is_locked("communication/message/2"));

        renewal.stop().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.is_locked("communication/message/2"));
    }
}
