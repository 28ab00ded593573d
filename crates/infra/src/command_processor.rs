//! Command processor: the per-worker orchestration loop.
//!
//! ```text
//! Leasing ─▶ Locking ─▶ Loading ─▶ Authorizing ─▶ Handling ─▶ Saving ─▶ Publishing ─▶ Acknowledging
//!              │           ▲                                     │
//!              │           └──────── revision conflict ──────────┘
//!              └─▶ lock held elsewhere: back off, defer
//! ```
//!
//! Every step for one command runs sequentially inside the worker. The lease
//! is renewed in the background for exactly as long as the command is being
//! processed; the entity lock likewise for as long as it is held.
//!
//! ## Outcomes
//!
//! - refused commands (unauthorized, malformed, unknown, rejected by the
//!   handler) are recorded as rejection events and acknowledged
//! - transient failures (lock contention, lost lock, unclassified errors)
//!   defer the lease
//! - permanent failures for the command instance reject the lease
//! - unreachable stores and exhausted publish retries are fatal to the worker

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use cairn_core::EventId;
use cairn_events::{
    BehaviorError, Command, Decision, DomainEventWithState, EventPublisher, PublishError, RegistryError,
    UncommittedEvent,
};

use crate::dispatcher::{CommandLeaseClient, DispatcherError, Lease};
use crate::lock_store::LockError;
use crate::renewal::Renewal;
use crate::repository::{LoadedEntity, Repository, RepositoryError};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Tick for both lease and lock renewal.
    pub lease_renew_interval: Duration,
    pub lock_ttl: Duration,
    /// Pause before deferring a command whose entity is locked elsewhere.
    pub lock_backoff: Duration,
    /// 0 retries revision conflicts without bound.
    pub max_conflict_retries: u32,
    pub publish_retry: RetryPolicy,
    pub acknowledge_retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            lease_renew_interval: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(15),
            lock_backoff: Duration::from_millis(100),
            max_conflict_retries: 0,
            publish_retry: RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10)),
            acknowledge_retry: RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("lock for '{key}' is held by another worker")]
    LockAcquisitionFailed { key: String },

    #[error("entity lock lost: {0}")]
    LockLost(String),

    #[error("command lease lost: {0}")]
    LeaseLost(String),

    #[error("Access denied.")]
    Unauthorized,

    #[error("command malformed: {0}")]
    CommandMalformed(String),

    #[error("command '{0}' not found")]
    CommandNotFound(String),

    /// Refusal by the command handler; displays the handler's reason.
    #[error("{0}")]
    Rejected(String),

    #[error("entity '{context}.{entity}' not found")]
    EntityNotFound { context: String, entity: String },

    #[error("revision conflict retries exhausted")]
    ConflictRetriesExhausted { attempts: u32 },

    #[error(transparent)]
    Repository(RepositoryError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error("publishing event {event_id} (revision {revision}) failed: {source}")]
    Publish {
        event_id: EventId,
        revision: u64,
        source: PublishError,
    },

    #[error("unknown error: {0}")]
    Unknown(String),
}

/// What the processor does with a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Record a rejection event, then acknowledge.
    Record,
    /// Reload and run the load..save span again.
    Retry,
    /// Hand the command back for redelivery.
    Defer,
    /// Mark the command permanently failed.
    Reject,
    /// Stop the worker.
    Fatal,
}

impl ProcessError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Unauthorized | Self::CommandMalformed(_) | Self::CommandNotFound(_) | Self::Rejected(_) => {
                Disposition::Record
            }
            Self::Repository(e) if e.is_revision_conflict() => Disposition::Retry,
            Self::Repository(e) if e.is_unavailable() => Disposition::Fatal,
            Self::Dispatcher(e) if e.is_unavailable() => Disposition::Fatal,
            Self::Publish { .. } => Disposition::Fatal,
            Self::EntityNotFound { .. } | Self::ConflictRetriesExhausted { .. } => Disposition::Reject,
            Self::LockAcquisitionFailed { .. }
            | Self::LockLost(_)
            | Self::LeaseLost(_)
            | Self::Repository(_)
            | Self::Dispatcher(_)
            | Self::Unknown(_) => Disposition::Defer,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Fatal
    }
}

impl From<RepositoryError> for ProcessError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Registry(e) => e.into(),
            RepositoryError::Lock(LockError::AcquisitionFailed { key }) => Self::LockAcquisitionFailed { key },
            other => Self::Repository(other),
        }
    }
}

impl From<RegistryError> for ProcessError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::EntityNotFound { context, entity } => Self::EntityNotFound { context, entity },
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<BehaviorError> for ProcessError {
    fn from(value: BehaviorError) -> Self {
        match value {
            BehaviorError::CommandNotFound(name) => Self::CommandNotFound(name),
            BehaviorError::CommandMalformed(msg) => Self::CommandMalformed(msg),
            other @ BehaviorError::State(_) => Self::Repository(RepositoryError::Behavior(other)),
        }
    }
}

/// Terminal outcome of one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    Deferred,
    Rejected,
    /// The lease was left to expire; the dispatcher redelivers it.
    Abandoned,
}

pub struct CommandProcessor {
    dispatcher: Arc<dyn CommandLeaseClient>,
    repository: Arc<Repository>,
    publisher: Arc<dyn EventPublisher>,
    config: ProcessorConfig,
}

impl core::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("repository", &self.repository)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CommandProcessor {
    pub fn new(
        dispatcher: Arc<dyn CommandLeaseClient>,
        repository: Arc<Repository>,
        publisher: Arc<dyn EventPublisher>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            dispatcher,
            repository,
            publisher,
            config,
        }
    }

    /// Lease and process commands until `shutdown` turns true (or its sender
    /// goes away). The in-flight command always reaches a terminal outcome
    /// first. Returns early only on a fatal error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProcessError> {
        info!("worker started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let leased = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                leased = self.dispatcher.await_command() => leased,
            };

            let lease = match leased {
                Ok(lease) => lease,
                Err(err) if err.is_unavailable() => {
                    error!(error = %err, "dispatcher unreachable");
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(error = %err, "awaiting command failed");
                    tokio::time::sleep(self.config.lock_backoff).await;
                    continue;
                }
            };

            self.process(lease).await?;
        }

        info!("worker stopped");
        Ok(())
    }

    /// Drive one lease to a terminal outcome.
    ///
    /// `Err` is returned only for fatal errors; the lease is then left to
    /// expire.
    #[instrument(
        skip(self, lease),
        fields(
            command_id = %lease.command.id,
            command = %lease.command.name,
            entity = %lease.command.entity_identifier,
        )
    )]
    pub async fn process(&self, lease: Lease) -> Result<Outcome, ProcessError> {
        let renewal = Renewal::lease(self.dispatcher.clone(), lease.clone(), self.config.lease_renew_interval);
        let result = self.execute(&lease.command, &renewal).await;
        let lease_lost = renewal.lost();
        renewal.stop().await;

        let err = match result {
            Ok(events) => {
                debug!(events = events.len(), "command handled");
                return Ok(self.acknowledge(&lease).await);
            }
            Err(err) => err,
        };

        match err.disposition() {
            Disposition::Fatal => {
                error!(error = %err, "fatal error while processing command");
                Err(err)
            }
            Disposition::Reject => {
                warn!(error = %err, "rejecting command");
                match self.dispatcher.reject(&lease, &err.to_string()).await {
                    Ok(()) => Ok(Outcome::Rejected),
                    Err(e) if e.is_unavailable() => Err(e.into()),
                    Err(e) => {
                        warn!(error = %e, "reject failed, command will be redelivered");
                        Ok(Outcome::Abandoned)
                    }
                }
            }
            Disposition::Defer | Disposition::Record | Disposition::Retry => {
                if let Some(reason) = lease_lost {
                    warn!(error = %err, %reason, "lease lost, command will be redelivered");
                    return Ok(Outcome::Abandoned);
                }

                if matches!(err, ProcessError::LockAcquisitionFailed { .. }) {
                    debug!(error = %err, "entity busy, deferring");
                    tokio::time::sleep(self.config.lock_backoff).await;
                } else {
                    warn!(error = %err, "deferring command");
                }

                match self.dispatcher.defer(&lease).await {
                    Ok(()) => Ok(Outcome::Deferred),
                    Err(e) if e.is_unavailable() => Err(e.into()),
                    Err(e) => {
                        warn!(error = %e, "defer failed, command will be redelivered");
                        Ok(Outcome::Abandoned)
                    }
                }
            }
        }
    }

    /// Locking..Publishing, repeated from Locking on revision conflicts.
    async fn execute(&self, command: &Command, lease: &Renewal) -> Result<Vec<DomainEventWithState>, ProcessError> {
        let identifier = &command.entity_identifier;
        let mut conflicts = 0u32;

        loop {
            let lock = self.repository.lock_entity(identifier, self.config.lock_ttl).await?;
            let lock_renewal = Renewal::lock(
                self.repository.lock_store(),
                lock.clone(),
                self.config.lock_ttl,
                self.config.lease_renew_interval,
            );

            let attempt = self.attempt(command, &lock_renewal, lease).await;

            lock_renewal.stop().await;
            if let Err(err) = self.repository.unlock_entity(&lock).await {
                warn!(error = %err, "failed to release entity lock");
            }

            match attempt {
                Err(err) if err.disposition() == Disposition::Retry => {
                    conflicts += 1;
                    if self.config.max_conflict_retries > 0 && conflicts > self.config.max_conflict_retries {
                        return Err(ProcessError::ConflictRetriesExhausted { attempts: conflicts });
                    }
                    info!(conflicts, error = %err, "revision conflict, reloading entity");
                }
                other => return other,
            }
        }
    }

    async fn attempt(
        &self,
        command: &Command,
        lock: &Renewal,
        lease: &Renewal,
    ) -> Result<Vec<DomainEventWithState>, ProcessError> {
        let loaded = self.repository.load_entity(&command.entity_identifier).await?;

        let events = match self.decide(&loaded, command) {
            Ok(events) => events,
            Err(err) if err.disposition() == Disposition::Record => {
                info!(reason = %err, "command rejected");
                vec![UncommittedEvent::rejection(&command.name, err.to_string())]
            }
            Err(err) => return Err(err),
        };

        if let Some(reason) = lock.lost() {
            return Err(ProcessError::LockLost(reason));
        }
        if let Some(reason) = lease.lost() {
            return Err(ProcessError::LeaseLost(reason));
        }

        let appended = self.repository.save_entity(&loaded, command, events).await?;
        if let Some(last) = appended.last() {
            debug!(revision = last.revision(), events = appended.len(), "events saved");
        }

        for event in &appended {
            self.publish(event).await?;
        }

        Ok(appended)
    }

    fn decide(&self, loaded: &LoadedEntity, command: &Command) -> Result<Vec<UncommittedEvent>, ProcessError> {
        let behavior = self.repository.application().behavior(&loaded.identifier)?;

        match behavior.decide(&loaded.state, loaded.revision, command)? {
            Decision::Accepted(events) => Ok(events),
            Decision::Unauthorized => Err(ProcessError::Unauthorized),
            Decision::Rejected { reason } => Err(ProcessError::Rejected(reason)),
        }
    }

    async fn publish(&self, event: &DomainEventWithState) -> Result<(), ProcessError> {
        self.config
            .publish_retry
            .run("publish", || self.publisher.publish(event))
            .await
            .map_err(|source| ProcessError::Publish {
                event_id: event.event.id,
                revision: event.revision(),
                source,
            })
    }

    async fn acknowledge(&self, lease: &Lease) -> Outcome {
        let acknowledged = self
            .config
            .acknowledge_retry
            .run_while("acknowledge", || self.dispatcher.acknowledge(lease), DispatcherError::is_unavailable)
            .await;

        match acknowledged {
            Ok(()) => Outcome::Acknowledged,
            Err(err) => {
                error!(error = %err, "acknowledge failed, command will be redelivered");
                Outcome::Abandoned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::InMemoryDispatcher;
    use crate::event_store::DomainEventStore;
    use crate::lock_store::LockStore;
    use crate::snapshot::SnapshotStrategy;
    use crate::test_support::*;
    use cairn_core::{EntityId, EntityIdentifier, Initiator};
    use cairn_events::InMemoryEventPublisher;
    use serde_json::json;

    const LEASE_DURATION: Duration = Duration::from_secs(30);

    struct Harness {
        fixture: Fixture,
        dispatcher: Arc<InMemoryDispatcher>,
        publisher: Arc<InMemoryEventPublisher>,
        processor: CommandProcessor,
    }

    fn harness(config: ProcessorConfig) -> Harness {
        let fixture = fixture(SnapshotStrategy::Never);
        let dispatcher = Arc::new(InMemoryDispatcher::new(LEASE_DURATION));
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let processor = CommandProcessor::new(
            dispatcher.clone(),
            fixture.repository.clone(),
            publisher.clone(),
            config,
        );
        Harness {
            fixture,
            dispatcher,
            publisher,
            processor,
        }
    }

    async fn lease_for(h: &Harness, command: Command) -> Lease {
        h.dispatcher.submit(command).unwrap();
        h.dispatcher.await_command().await.unwrap()
    }

    #[test]
    fn dispositions_follow_error_taxonomy() {
        assert_eq!(ProcessError::Unauthorized.disposition(), Disposition::Record);
        assert_eq!(ProcessError::CommandMalformed("x".into()).disposition(), Disposition::Record);
        assert_eq!(
            ProcessError::LockAcquisitionFailed { key: "k".into() }.disposition(),
            Disposition::Defer
        );
        assert_eq!(
            ProcessError::Repository(RepositoryError::Store(
                crate::event_store::EventStoreError::RevisionConflict {
                    entity: "e".into(),
                    expected: 2,
                    actual: 3
                }
            ))
            .disposition(),
            Disposition::Retry
        );
        assert_eq!(
            ProcessError::Repository(RepositoryError::Store(
                crate::event_store::EventStoreError::Unavailable("down".into())
            ))
            .disposition(),
            Disposition::Fatal
        );
        assert_eq!(
            ProcessError::EntityNotFound {
                context: "c".into(),
                entity: "e".into()
            }
            .disposition(),
            Disposition::Reject
        );
        assert!(ProcessError::Unknown("boom".into()).disposition() == Disposition::Defer);
    }

    #[tokio::test]
    async fn accepted_command_is_saved_published_and_acknowledged() {
        let h = harness(ProcessorConfig::default());
        let id = message_id();

        let lease = lease_for(&h, send(&id, "hello")).await;
        let outcome = h.processor.process(lease).await.unwrap();

        assert_eq!(outcome, Outcome::Acknowledged);
        let stream = h.fixture.event_store.stream(&id);
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].name, "sent");
        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(state_of(&published[0].state.previous), Message::default());
        assert_eq!(state_of(&published[0].state.next).text.as_deref(), Some("hello"));
        assert!(!h.fixture.lock_store.is_locked(&id.lock_key()));
    }

    #[tokio::test]
    async fn handler_refusal_is_recorded_and_acknowledged() {
        let h = harness(ProcessorConfig::default());
        let id = message_id();

        let lease = lease_for(&h, like(&id)).await;
        let outcome = h.processor.process(lease).await.unwrap();

        assert_eq!(outcome, Outcome::Acknowledged);
        let stream = h.fixture.event_store.stream(&id);
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].name, "likeRejected");
        assert_eq!(stream[0].data, json!({ "reason": "Message was not yet sent." }));
        assert!(stream[0].is_rejection());
    }

    #[tokio::test]
    async fn malformed_and_unknown_commands_are_recorded() {
        let h = harness(ProcessorConfig::default());
        let id = message_id();

        let malformed = Command::new(id.clone(), "send", json!({ "text": 42 }), Initiator::new("jane"));
        let lease = lease_for(&h, malformed).await;
        assert_eq!(h.processor.process(lease).await.unwrap(), Outcome::Acknowledged);

        let unknown = Command::new(id.clone(), "archive", json!({}), Initiator::new("jane"));
        let lease = lease_for(&h, unknown).await;
        assert_eq!(h.processor.process(lease).await.unwrap(), Outcome::Acknowledged);

        let names: Vec<String> = h.fixture.event_store.stream(&id).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["sendRejected", "archiveRejected"]);
    }

    #[tokio::test]
    async fn unknown_entity_type_rejects_the_lease() {
        let h = harness(ProcessorConfig::default());
        let id = EntityIdentifier::new("communication", "letter", EntityId::new());

        let lease = lease_for(&h, Command::new(id, "send", json!({}), Initiator::new("jane"))).await;
        let outcome = h.processor.process(lease).await.unwrap();

        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(h.dispatcher.rejected()[0].1, "entity 'communication.letter' not found");
    }

    #[tokio::test]
    async fn busy_entity_defers_the_lease() {
        let h = harness(ProcessorConfig {
            lock_backoff: Duration::from_millis(1),
            ..ProcessorConfig::default()
        });
        let id = message_id();
        let _held = h.fixture.lock_store.acquire(&id.lock_key(), LOCK_TTL).await.unwrap();

        let lease = lease_for(&h, send(&id, "hello")).await;
        let outcome = h.processor.process(lease).await.unwrap();

        assert_eq!(outcome, Outcome::Deferred);
        assert_eq!(h.dispatcher.deferrals(), 1);
        assert_eq!(h.dispatcher.pending_len(), 1);
        assert!(h.fixture.event_store.stream(&id).is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_while_waiting_for_a_lease() {
        let h = harness(ProcessorConfig::default());
        let (tx, rx) = watch::channel(false);

        let processor = Arc::new(h.processor);
        let worker = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(rx).await })
        };

        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        worker.await.unwrap().unwrap();
        assert_eq!(h.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn run_processes_queued_commands() {
        let h = harness(ProcessorConfig::default());
        let id = message_id();
        h.dispatcher.submit(send(&id, "hello")).unwrap();
        h.dispatcher.submit(like(&id)).unwrap();
        h.dispatcher.submit(like(&id)).unwrap();

        let (tx, rx) = watch::channel(false);
        let processor = Arc::new(h.processor);
        let worker = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(rx).await })
        };

        while h.dispatcher.acknowledged().len() < 3 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();
        worker.await.unwrap().unwrap();

        let loaded = h.fixture.repository.load_entity(&id).await.unwrap();
        assert_eq!(loaded.revision, 3);
        assert_eq!(state_of(&loaded.state).likes, 2);

        let revisions: Vec<u64> = h.publisher.published().iter().map(|e| e.revision()).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
        assert!(h.fixture.event_store.read_snapshot(&id).await.unwrap().is_none());
    }
}
