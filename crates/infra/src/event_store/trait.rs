use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use cairn_core::EntityIdentifier;
use cairn_events::{DomainEvent, Snapshot};

/// Event store operation error.
///
/// These are **infrastructure errors** (concurrency, malformed appends,
/// reachability) as opposed to domain errors (validation, rejections).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// The writer's view of the entity is stale: the stored revision differs
    /// from the one the append was conditioned on. Nothing was written.
    #[error("revision conflict for {entity}: expected {expected}, found {actual}")]
    RevisionConflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// The store could not be reached at all.
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

impl EventStoreError {
    pub fn is_revision_conflict(&self) -> bool {
        matches!(self, Self::RevisionConflict { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Append-only, per-entity event log with snapshot support.
///
/// ## Append semantics
///
/// `append_events()`:
/// - requires every event to target `identifier`
/// - requires revisions `expected_revision + 1, + 2, ...` with no gaps
/// - succeeds only if the stored current revision equals `expected_revision`
/// - persists the batch atomically (all or nothing)
///
/// ## Read semantics
///
/// `read_events_since()` returns every event with `revision > since_revision`
/// in ascending order (empty if the entity has no events yet).
///
/// `read_snapshot()` returns the most recent snapshot, if any.
/// `write_snapshot()` never replaces a snapshot with an older one.
///
/// Implementations must be safe for concurrent access from many processes.
#[async_trait]
pub trait DomainEventStore: Send + Sync {
    async fn append_events(
        &self,
        identifier: &EntityIdentifier,
        expected_revision: u64,
        events: Vec<DomainEvent>,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn read_events_since(
        &self,
        identifier: &EntityIdentifier,
        since_revision: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn read_snapshot(&self, identifier: &EntityIdentifier) -> Result<Option<Snapshot>, EventStoreError>;

    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> DomainEventStore for Arc<S>
where
    S: DomainEventStore + ?Sized,
{
    async fn append_events(
        &self,
        identifier: &EntityIdentifier,
        expected_revision: u64,
        events: Vec<DomainEvent>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).append_events(identifier, expected_revision, events).await
    }

    async fn read_events_since(
        &self,
        identifier: &EntityIdentifier,
        since_revision: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).read_events_since(identifier, since_revision).await
    }

    async fn read_snapshot(&self, identifier: &EntityIdentifier) -> Result<Option<Snapshot>, EventStoreError> {
        (**self).read_snapshot(identifier).await
    }

    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        (**self).write_snapshot(snapshot).await
    }
}
