use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use cairn_core::{EntityIdentifier, EventId, Initiator};

use crate::command::Command;

/// Metadata recorded alongside every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Id of the command that produced the event.
    pub causation_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub initiator: Initiator,
    /// Marks events recording a refused command. They never change state.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub rejection: bool,
}

impl EventMetadata {
    pub fn caused_by(command: &Command) -> Self {
        Self {
            causation_id: command.id.into(),
            correlation_id: command.metadata.correlation_id,
            timestamp: Utc::now(),
            initiator: command.metadata.initiator.clone(),
            rejection: false,
        }
    }
}

/// An event decided by business logic, not yet assigned a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub name: String,
    pub data: JsonValue,
    #[serde(default)]
    pub rejection: bool,
}

impl UncommittedEvent {
    pub fn new(name: impl Into<String>, data: JsonValue) -> Self {
        Self {
            name: name.into(),
            data,
            rejection: false,
        }
    }

    /// Rejection-kind event recording why `command_name` was refused.
    ///
    /// Named `<commandName>Rejected` with `{ "reason": ... }` as data.
    pub fn rejection(command_name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: format!("{command_name}Rejected"),
            data: json!({ "reason": reason.into() }),
            rejection: true,
        }
    }

    /// Attach identity, metadata and the revision assigned by the writer.
    pub fn commit(self, entity_identifier: EntityIdentifier, command: &Command, revision: u64) -> DomainEvent {
        let mut metadata = EventMetadata::caused_by(command);
        metadata.rejection = self.rejection;
        DomainEvent {
            id: EventId::new(),
            entity_identifier,
            name: self.name,
            data: self.data,
            metadata,
            revision,
        }
    }
}

/// A persisted event in one entity's append-only log.
///
/// `revision` is the 1-based, gap-free position within the entity's log and
/// doubles as its optimistic-concurrency token. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: EventId,
    pub entity_identifier: EntityIdentifier,
    pub name: String,
    pub data: JsonValue,
    pub metadata: EventMetadata,
    pub revision: u64,
}

impl DomainEvent {
    pub fn is_rejection(&self) -> bool {
        self.metadata.rejection
    }
}

/// Entity state on either side of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub previous: JsonValue,
    pub next: JsonValue,
}

/// A persisted event together with the entity state it moved from and to.
///
/// This is what subscribers receive. For rejection events `previous` and
/// `next` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEventWithState {
    #[serde(flatten)]
    pub event: DomainEvent,
    pub state: StateTransition,
}

impl DomainEventWithState {
    pub fn revision(&self) -> u64 {
        self.event.revision
    }
}
