//! Entity repository: snapshot + replay on load, revision-conditioned save.
//!
//! ```text
//! load_entity:  read_snapshot ─▶ read_events_since(snapshot.revision) ─▶ replay
//! save_entity:  commit(revision + 1..) ─▶ transitions ─▶ append_events(expected = revision)
//!               └─▶ snapshot strategy ─▶ write_snapshot (best effort)
//! ```
//!
//! Snapshots are a pure optimization: a load through any valid snapshot
//! yields exactly what a full replay from revision 0 yields. A snapshot that
//! no longer decodes is ignored in favor of a full replay.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use cairn_core::EntityIdentifier;
use cairn_events::{
    Application, BehaviorError, Command, DomainEvent, DomainEventWithState, EntityBehavior, RegistryError,
    Snapshot, UncommittedEvent,
};

use crate::event_store::{DomainEventStore, EventStoreError};
use crate::lock_store::{Lock, LockError, LockStore};
use crate::snapshot::{ReplayStats, SnapshotStrategy};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Behavior(#[from] BehaviorError),

    /// The store returned events that break the per-entity log invariants.
    #[error("corrupt stream for {entity}: {reason}")]
    CorruptStream { entity: String, reason: String },
}

impl RepositoryError {
    pub fn is_revision_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_revision_conflict())
    }

    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_unavailable(),
            Self::Lock(e) => e.is_unavailable(),
            _ => false,
        }
    }
}

/// Materialized state of one entity as of `revision`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedEntity {
    pub identifier: EntityIdentifier,
    pub state: JsonValue,
    /// Revision of the last applied event (0 if none).
    pub revision: u64,
    /// Events replayed on top of the snapshot (or initial state).
    pub events_replayed: u64,
    pub replay_duration: Duration,
}

impl LoadedEntity {
    pub fn is_pristine(&self) -> bool {
        self.revision == 0
    }
}

pub struct Repository {
    application: Arc<Application>,
    event_store: Arc<dyn DomainEventStore>,
    lock_store: Arc<dyn LockStore>,
    snapshot_strategy: SnapshotStrategy,
}

impl core::fmt::Debug for Repository {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Repository")
            .field("application", &self.application)
            .field("snapshot_strategy", &self.snapshot_strategy)
            .finish_non_exhaustive()
    }
}

impl Repository {
    pub fn new(
        application: Arc<Application>,
        event_store: Arc<dyn DomainEventStore>,
        lock_store: Arc<dyn LockStore>,
        snapshot_strategy: SnapshotStrategy,
    ) -> Self {
        Self {
            application,
            event_store,
            lock_store,
            snapshot_strategy,
        }
    }

    pub fn application(&self) -> &Application {
        &self.application
    }

    pub fn lock_store(&self) -> Arc<dyn LockStore> {
        self.lock_store.clone()
    }

    /// Claim the entity for this worker.
    pub async fn lock_entity(&self, identifier: &EntityIdentifier, ttl: Duration) -> Result<Lock, RepositoryError> {
        Ok(self.lock_store.acquire(&identifier.lock_key(), ttl).await?)
    }

    pub async fn unlock_entity(&self, lock: &Lock) -> Result<(), RepositoryError> {
        Ok(self.lock_store.release(lock).await?)
    }

    #[instrument(skip(self, identifier), fields(entity = %identifier))]
    pub async fn load_entity(&self, identifier: &EntityIdentifier) -> Result<LoadedEntity, RepositoryError> {
        let behavior = self.application.behavior(identifier)?;

        if let Some(snapshot) = self.event_store.read_snapshot(identifier).await? {
            if &snapshot.entity_identifier != identifier {
                return Err(RepositoryError::CorruptStream {
                    entity: identifier.to_string(),
                    reason: format!("snapshot belongs to {}", snapshot.entity_identifier),
                });
            }

            let revision = snapshot.revision;
            match self
                .replay_from(behavior.as_ref(), identifier, snapshot.state, revision)
                .await
            {
                Err(RepositoryError::Behavior(BehaviorError::State(reason))) => {
                    warn!(revision, %reason, "snapshot unusable, replaying from the start");
                }
                other => return other,
            }
        }

        let initial = behavior.initial_state()?;
        self.replay_from(behavior.as_ref(), identifier, initial, 0).await
    }

    async fn replay_from(
        &self,
        behavior: &dyn EntityBehavior,
        identifier: &EntityIdentifier,
        state: JsonValue,
        since: u64,
    ) -> Result<LoadedEntity, RepositoryError> {
        let events = self.event_store.read_events_since(identifier, since).await?;
        validate_loaded_stream(identifier, since, &events)?;

        let started = Instant::now();
        let state = behavior.replay(state, &events)?;
        let replay_duration = started.elapsed();

        let revision = events.last().map(|e| e.revision).unwrap_or(since);
        debug!(since, revision, replayed = events.len(), "entity loaded");

        Ok(LoadedEntity {
            identifier: identifier.clone(),
            state,
            revision,
            events_replayed: events.len() as u64,
            replay_duration,
        })
    }

    /// Append `events` on top of `loaded`, conditioned on `loaded.revision`.
    ///
    /// Returns the appended events with the entity state before and after
    /// each. Fails with a revision conflict when the stored log moved on;
    /// nothing is written in that case and the caller has to reload.
    #[instrument(skip(self, loaded, command, events), fields(entity = %loaded.identifier, expected = loaded.revision))]
    pub async fn save_entity(
        &self,
        loaded: &LoadedEntity,
        command: &Command,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<DomainEventWithState>, RepositoryError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let committed: Vec<DomainEvent> = events
            .into_iter()
            .zip(loaded.revision + 1..)
            .map(|(event, revision)| event.commit(loaded.identifier.clone(), command, revision))
            .collect();

        // States are derived before writing so a failure here leaves the log untouched.
        let behavior = self.application.behavior(&loaded.identifier)?;
        let transitions = behavior.transitions(loaded.state.clone(), committed.clone())?;

        let appended = self
            .event_store
            .append_events(&loaded.identifier, loaded.revision, committed)
            .await?;

        let saved: Vec<DomainEventWithState> = appended
            .into_iter()
            .zip(transitions)
            .map(|(event, transition)| DomainEventWithState {
                event,
                state: transition.state,
            })
            .collect();

        let Some(last) = saved.last() else {
            return Ok(saved);
        };
        let stats = ReplayStats {
            events_since_snapshot: loaded.events_replayed,
            revision: last.revision(),
            replay_duration: loaded.replay_duration,
        };

        if self.snapshot_strategy.should_snapshot(&stats) {
            self.take_snapshot(&loaded.identifier, last).await;
        }

        Ok(saved)
    }

    async fn take_snapshot(&self, identifier: &EntityIdentifier, last: &DomainEventWithState) {
        let revision = last.revision();
        let snapshot = Snapshot {
            entity_identifier: identifier.clone(),
            revision,
            state: last.state.next.clone(),
        };

        match self.event_store.write_snapshot(snapshot).await {
            Ok(()) => debug!(revision, "snapshot written"),
            Err(err) => warn!(revision, error = %err, "snapshot write failed"),
        }
    }
}

/// Guard against backends returning foreign or out-of-order events.
fn validate_loaded_stream(
    identifier: &EntityIdentifier,
    since: u64,
    events: &[DomainEvent],
) -> Result<(), RepositoryError> {
    let mut expected = since + 1;
    for (idx, e) in events.iter().enumerate() {
        if &e.entity_identifier != identifier {
            return Err(RepositoryError::CorruptStream {
                entity: identifier.to_string(),
                reason: format!("event at index {idx} belongs to {}", e.entity_identifier),
            });
        }
        if e.revision != expected {
            return Err(RepositoryError::CorruptStream {
                entity: identifier.to_string(),
                reason: format!("expected revision {expected} at index {idx}, found {}", e.revision),
            });
        }
        expected += 1;
    }
    Ok(())
}
