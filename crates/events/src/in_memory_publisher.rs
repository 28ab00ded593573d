//! In-memory event publisher for tests/dev.

use std::sync::{Mutex, mpsc};

use async_trait::async_trait;

use crate::event::DomainEventWithState;
use crate::publisher::{EventPublisher, PublishError, Subscription};

/// In-memory fan-out publisher.
///
/// - No IO
/// - Best-effort fan-out to live subscribers
/// - Keeps a log of everything published, in publication order, unless built
///   with [`InMemoryEventPublisher::without_history`]
#[derive(Debug)]
pub struct InMemoryEventPublisher {
    subscribers: Mutex<Vec<mpsc::Sender<DomainEventWithState>>>,
    published: Mutex<Vec<DomainEventWithState>>,
    keep_history: bool,
}

impl Default for InMemoryEventPublisher {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            keep_history: true,
        }
    }
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan out only; nothing is retained for [`published`](Self::published).
    pub fn without_history(mut self) -> Self {
        self.keep_history = false;
        self
    }

    pub fn subscribe(&self) -> Subscription<DomainEventWithState> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock leaves the subscription silent.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }

    /// Every event published so far.
    pub fn published(&self) -> Vec<DomainEventWithState> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: &DomainEventWithState) -> Result<(), PublishError> {
        if self.keep_history {
            self.published
                .lock()
                .map_err(|_| PublishError::Unavailable("lock poisoned".to_string()))?
                .push(event.clone());
        }

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| PublishError::Unavailable("lock poisoned".to_string()))?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(event.clone()).is_ok());

        Ok(())
    }
}
