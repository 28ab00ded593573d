use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use cairn_core::EntityIdentifier;
use cairn_events::{DomainEvent, Snapshot};

use super::r#trait::{DomainEventStore, EventStoreError};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryDomainEventStore {
    streams: RwLock<HashMap<EntityIdentifier, Vec<DomainEvent>>>,
    snapshots: RwLock<HashMap<EntityIdentifier, Snapshot>>,
    snapshot_writes: AtomicUsize,
}

impl InMemoryDomainEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_revision(stream: &[DomainEvent]) -> u64 {
        stream.last().map(|e| e.revision).unwrap_or(0)
    }

    /// Number of `write_snapshot` calls accepted so far.
    pub fn snapshot_writes(&self) -> usize {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    /// Full log of one entity (test helper).
    pub fn stream(&self, identifier: &EntityIdentifier) -> Vec<DomainEvent> {
        self.streams
            .read()
            .map(|s| s.get(identifier).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DomainEventStore for InMemoryDomainEventStore {
    async fn append_events(
        &self,
        identifier: &EntityIdentifier,
        expected_revision: u64,
        events: Vec<DomainEvent>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut next = expected_revision + 1;
        for (idx, e) in events.iter().enumerate() {
            if &e.entity_identifier != identifier {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains an event for {} (index {idx})",
                    e.entity_identifier
                )));
            }
            if e.revision != next {
                return Err(EventStoreError::InvalidAppend(format!(
                    "expected revision {next} at index {idx}, found {}",
                    e.revision
                )));
            }
            next += 1;
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let stream = streams.entry(identifier.clone()).or_default();
        let current = Self::current_revision(stream);

        if current != expected_revision {
            return Err(EventStoreError::RevisionConflict {
                entity: identifier.to_string(),
                expected: expected_revision,
                actual: current,
            });
        }

        stream.extend(events.iter().cloned());
        Ok(events)
    }

    async fn read_events_since(
        &self,
        identifier: &EntityIdentifier,
        since_revision: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(streams
            .get(identifier)
            .map(|s| s.iter().filter(|e| e.revision > since_revision).cloned().collect())
            .unwrap_or_default())
    }

    async fn read_snapshot(&self, identifier: &EntityIdentifier) -> Result<Option<Snapshot>, EventStoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(snapshots.get(identifier).cloned())
    }

    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);

        match snapshots.get(&snapshot.entity_identifier) {
            Some(existing) if existing.revision >= snapshot.revision => {}
            _ => {
                snapshots.insert(snapshot.entity_identifier.clone(), snapshot);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{EntityId, Initiator};
    use cairn_events::{Command, UncommittedEvent};
    use serde_json::json;

    fn identifier() -> EntityIdentifier {
        EntityIdentifier::new("communication", "message", EntityId::new())
    }

    fn events(identifier: &EntityIdentifier, revisions: std::ops::RangeInclusive<u64>) -> Vec<DomainEvent> {
        let cmd = Command::new(identifier.clone(), "like", json!({}), Initiator::anonymous());
        revisions
            .map(|r| UncommittedEvent::new("liked", json!({ "likes": r })).commit(identifier.clone(), &cmd, r))
            .collect()
    }

    #[tokio::test]
    async fn append_then_read_in_revision_order() {
        let store = InMemoryDomainEventStore::new();
        let id = identifier();

        store.append_events(&id, 0, events(&id, 1..=2)).await.unwrap();
        store.append_events(&id, 2, events(&id, 3..=3)).await.unwrap();

        let revisions: Vec<u64> = store.read_events_since(&id, 0).await.unwrap().iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);

        let tail: Vec<u64> = store.read_events_since(&id, 2).await.unwrap().iter().map(|e| e.revision).collect();
        assert_eq!(tail, vec![3]);
    }

    #[tokio::test]
    async fn stale_expected_revision_conflicts_without_partial_append() {
        let store = InMemoryDomainEventStore::new();
        let id = identifier();
        store.append_events(&id, 0, events(&id, 1..=3)).await.unwrap();

        let err = store.append_events(&id, 2, events(&id, 3..=4)).await.unwrap_err();
        assert_eq!(
            err,
            EventStoreError::RevisionConflict {
                entity: id.to_string(),
                expected: 2,
                actual: 3
            }
        );
        assert_eq!(store.stream(&id).len(), 3);
    }

    #[tokio::test]
    async fn gaps_in_batch_are_invalid() {
        let store = InMemoryDomainEventStore::new();
        let id = identifier();

        let mut batch = events(&id, 1..=1);
        batch.extend(events(&id, 3..=3));

        let err = store.append_events(&id, 0, batch).await.unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
        assert!(store.stream(&id).is_empty());
    }

    #[tokio::test]
    async fn older_snapshot_never_replaces_newer() {
        let store = InMemoryDomainEventStore::new();
        let id = identifier();

        let snap = |revision| Snapshot {
            entity_identifier: id.clone(),
            revision,
            state: json!({ "likes": revision }),
        };

        store.write_snapshot(snap(5)).await.unwrap();
        store.write_snapshot(snap(3)).await.unwrap();

        assert_eq!(store.read_snapshot(&id).await.unwrap().unwrap().revision, 5);
        assert_eq!(store.snapshot_writes(), 2);
    }
}
