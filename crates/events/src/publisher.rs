//! Event publication abstraction (mechanics only).
//!
//! Publication is the **distribution** step that follows a successful append:
//! events are stored first (the event log is the source of truth), then
//! forwarded to downstream subscribers.
//!
//! ## Delivery
//!
//! Delivery is **at-least-once**. A publish that fails is retried by the caller,
//! and a retry after a lost acknowledgement may deliver the same event twice;
//! consumers must be idempotent (keyed by event id or revision).
//!
//! Publication must never silently drop a persisted event. Callers that give
//! up on publishing treat it as fatal rather than skipping the event.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::DomainEventWithState;

#[derive(Debug, Error)]
pub enum PublishError {
    /// The distribution endpoint could not be reached.
    #[error("publisher unavailable: {0}")]
    Unavailable(String),

    /// The endpoint refused the message.
    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error("event serialization failed: {0}")]
    Serialize(String),
}

impl PublishError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A subscription to published events.
///
/// Each subscription gets a copy of every event published after it was
/// created (broadcast semantics). Intended for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Forwards newly persisted events, with the entity state around each one, to
/// a message distribution endpoint.
///
/// Implementations must be safe to share across workers (`Send + Sync`); many
/// workers publish concurrently.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEventWithState) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, event: &DomainEventWithState) -> Result<(), PublishError> {
        (**self).publish(event).await
    }
}
