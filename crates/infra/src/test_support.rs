//! Fixtures shared by unit and scenario tests.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use cairn_core::{
    Aggregate, CommandContext, DomainError, DomainResult, EntityId, EntityIdentifier, Initiator,
};
use cairn_events::{Application, Command, DomainEvent, UncommittedEvent};

use crate::event_store::InMemoryDomainEventStore;
use crate::lock_store::InMemoryLockStore;
use crate::repository::Repository;
use crate::snapshot::SnapshotStrategy;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: Option<String>,
    pub likes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum MessageCommand {
    Send { text: String },
    Like,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum MessageEvent {
    Sent { text: String },
    Liked { likes: u64 },
}

impl Aggregate for Message {
    type Command = MessageCommand;
    type Event = MessageEvent;

    const CONTEXT: &'static str = "communication";
    const ENTITY: &'static str = "message";

    fn command_names() -> &'static [&'static str] {
        &["send", "like"]
    }

    fn apply(&mut self, event: &MessageEvent) {
        match event {
            MessageEvent::Sent { text } => self.text = Some(text.clone()),
            MessageEvent::Liked { likes } => self.likes = *likes,
        }
    }

    fn is_authorized(&self, command: &MessageCommand, ctx: &CommandContext) -> bool {
        match command {
            MessageCommand::Send { .. } => !ctx.initiator.is_anonymous(),
            MessageCommand::Like => true,
        }
    }

    fn handle(&self, command: &MessageCommand, _ctx: &CommandContext) -> DomainResult<Vec<MessageEvent>> {
        match command {
            MessageCommand::Send { .. } if self.text.is_some() => {
                Err(DomainError::rejected("Message was already sent."))
            }
            MessageCommand::Send { text } => Ok(vec![MessageEvent::Sent { text: text.clone() }]),
            MessageCommand::Like if self.text.is_none() => {
                Err(DomainError::rejected("Message was not yet sent."))
            }
            MessageCommand::Like => Ok(vec![MessageEvent::Liked {
                likes: self.likes + 1,
            }]),
        }
    }
}

pub fn application() -> Arc<Application> {
    Arc::new(
        Application::builder()
            .register::<Message>()
            .expect("message registers")
            .build(),
    )
}

pub fn message_id() -> EntityIdentifier {
    EntityIdentifier::new("communication", "message", EntityId::new())
}

pub fn send(identifier: &EntityIdentifier, text: &str) -> Command {
    Command::new(identifier.clone(), "send", json!({ "text": text }), Initiator::new("jane"))
}

pub fn like(identifier: &EntityIdentifier) -> Command {
    Command::new(identifier.clone(), "like", json!({}), Initiator::new("jane"))
}

/// `liked` events for revisions `from..=to`, as if each came from its own command.
pub fn liked_events(identifier: &EntityIdentifier, from: u64, to: u64) -> Vec<DomainEvent> {
    (from..=to)
        .map(|revision| {
            let cause = like(identifier);
            UncommittedEvent::new("liked", json!({ "likes": revision - 1 }))
                .commit(identifier.clone(), &cause, revision)
        })
        .collect()
}

/// A message that was sent and then liked until it reached `revision`.
pub fn seeded_events(identifier: &EntityIdentifier, revision: u64) -> Vec<DomainEvent> {
    let cause = send(identifier, "hello");
    let mut events = vec![
        UncommittedEvent::new("sent", json!({ "text": "hello" })).commit(identifier.clone(), &cause, 1),
    ];
    if revision > 1 {
        events.extend(liked_events(identifier, 2, revision));
    }
    events
}

pub fn state_of(value: &JsonValue) -> Message {
    serde_json::from_value(value.clone()).expect("message state decodes")
}

pub struct Fixture {
    pub event_store: Arc<InMemoryDomainEventStore>,
    pub lock_store: Arc<InMemoryLockStore>,
    pub repository: Arc<Repository>,
}

pub fn fixture(strategy: SnapshotStrategy) -> Fixture {
    let event_store = Arc::new(InMemoryDomainEventStore::new());
    let lock_store = Arc::new(InMemoryLockStore::new());
    let repository = Arc::new(Repository::new(
        application(),
        event_store.clone(),
        lock_store.clone(),
        strategy,
    ));
    Fixture {
        event_store,
        lock_store,
        repository,
    }
}

pub const LOCK_TTL: Duration = Duration::from_secs(15);
