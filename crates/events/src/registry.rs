//! Statically validated business-logic registry.
//!
//! Business logic is registered once at startup as a mapping from
//! `(context_name, entity_name)` to a fixed-shape [`EntityBehavior`] bundle.
//! The command processor receives the finished [`Application`] by reference;
//! nothing is loaded or resolved dynamically afterwards.
//!
//! Typed aggregates (see [`cairn_core::Aggregate`]) are adapted to the
//! object-safe, JSON-facing behavior through [`Behavior`]. Schema validation of
//! a command is the act of decoding its `data` into the aggregate's typed
//! command: anything that doesn't decode is malformed.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use cairn_core::{Aggregate, CommandContext, DomainError, EntityIdentifier};

use crate::command::Command;
use crate::event::{DomainEvent, DomainEventWithState, StateTransition, UncommittedEvent};

/// Failure inside business logic that is not a decision about the command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BehaviorError {
    #[error("command '{0}' not found")]
    CommandNotFound(String),

    #[error("command malformed: {0}")]
    CommandMalformed(String),

    /// Stored state or a stored event no longer decodes into the typed model.
    #[error("state could not be materialized: {0}")]
    State(String),
}

/// Outcome of running a command against loaded state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The command was accepted and produced zero or more events.
    Accepted(Vec<UncommittedEvent>),
    /// The authorization predicate refused the command.
    Unauthorized,
    /// The handler refused the command.
    Rejected { reason: String },
}

/// Fixed-shape handler bundle for one entity type.
pub trait EntityBehavior: Send + Sync {
    /// State before any event was applied.
    fn initial_state(&self) -> Result<JsonValue, BehaviorError>;

    /// Apply `events` (ascending revision order) on top of `state`.
    ///
    /// Rejection-kind events never change state.
    fn replay(&self, state: JsonValue, events: &[DomainEvent]) -> Result<JsonValue, BehaviorError>;

    /// Pair each event with the state before and after applying it, starting
    /// from `state`.
    fn transitions(
        &self,
        state: JsonValue,
        events: Vec<DomainEvent>,
    ) -> Result<Vec<DomainEventWithState>, BehaviorError> {
        let mut previous = state;
        let mut out = Vec::with_capacity(events.len());

        for event in events {
            let next = self.replay(previous.clone(), std::slice::from_ref(&event))?;
            out.push(DomainEventWithState {
                event,
                state: StateTransition {
                    previous,
                    next: next.clone(),
                },
            });
            previous = next;
        }

        Ok(out)
    }

    /// Authorize, validate and handle `command` against `state`.
    fn decide(&self, state: &JsonValue, revision: u64, command: &Command) -> Result<Decision, BehaviorError>;

    /// Whether a command with this name exists for the entity.
    fn handles(&self, command_name: &str) -> bool;
}

/// Adapts a typed [`Aggregate`] into an [`EntityBehavior`].
pub struct Behavior<A>(PhantomData<fn() -> A>);

impl<A> Behavior<A> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<A> Default for Behavior<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> EntityBehavior for Behavior<A> {
    fn initial_state(&self) -> Result<JsonValue, BehaviorError> {
        serde_json::to_value(A::default()).map_err(|e| BehaviorError::State(e.to_string()))
    }

    fn replay(&self, state: JsonValue, events: &[DomainEvent]) -> Result<JsonValue, BehaviorError> {
        let mut typed: A = serde_json::from_value(state).map_err(|e| BehaviorError::State(e.to_string()))?;

        for event in events.iter().filter(|e| !e.is_rejection()) {
            let ev: A::Event = decode_tagged(&event.name, &event.data).map_err(|e| {
                BehaviorError::State(format!("event '{}' at revision {}: {e}", event.name, event.revision))
            })?;
            typed.apply(&ev);
        }

        serde_json::to_value(typed).map_err(|e| BehaviorError::State(e.to_string()))
    }

    fn decide(&self, state: &JsonValue, revision: u64, command: &Command) -> Result<Decision, BehaviorError> {
        if !self.handles(&command.name) {
            return Err(BehaviorError::CommandNotFound(command.name.clone()));
        }

        let typed_command: A::Command = decode_tagged(&command.name, &command.data)
            .map_err(|e| BehaviorError::CommandMalformed(e.to_string()))?;
        let aggregate: A =
            serde_json::from_value(state.clone()).map_err(|e| BehaviorError::State(e.to_string()))?;

        let ctx = CommandContext {
            initiator: command.metadata.initiator.clone(),
            revision,
        };

        if !aggregate.is_authorized(&typed_command, &ctx) {
            return Ok(Decision::Unauthorized);
        }

        match aggregate.handle(&typed_command, &ctx) {
            Ok(events) => {
                let uncommitted = events
                    .iter()
                    .map(|ev| {
                        let (name, data) = encode_tagged(ev)?;
                        Ok(UncommittedEvent::new(name, data))
                    })
                    .collect::<Result<Vec<_>, BehaviorError>>()?;
                Ok(Decision::Accepted(uncommitted))
            }
            Err(DomainError::Unauthorized) => Ok(Decision::Unauthorized),
            Err(err) => Ok(Decision::Rejected {
                reason: err.to_string(),
            }),
        }
    }

    fn handles(&self, command_name: &str) -> bool {
        A::command_names().contains(&command_name)
    }
}

/// Decode an adjacently tagged `{ "name", "data" }` value.
///
/// Unit variants carry no `data`; clients still tend to send `{}` for them, so
/// an empty object is retried as absent.
fn decode_tagged<T: DeserializeOwned>(name: &str, data: &JsonValue) -> Result<T, serde_json::Error> {
    let tagged = |with_data: bool| {
        let mut obj = Map::new();
        obj.insert("name".to_string(), JsonValue::String(name.to_string()));
        if with_data && !data.is_null() {
            obj.insert("data".to_string(), data.clone());
        }
        JsonValue::Object(obj)
    };

    match serde_json::from_value(tagged(true)) {
        Ok(v) => Ok(v),
        Err(err) => match data.as_object() {
            Some(obj) if obj.is_empty() => serde_json::from_value(tagged(false)),
            _ => Err(err),
        },
    }
}

fn encode_tagged<T: Serialize>(value: &T) -> Result<(String, JsonValue), BehaviorError> {
    let encoded = serde_json::to_value(value).map_err(|e| BehaviorError::State(e.to_string()))?;
    let JsonValue::Object(mut obj) = encoded else {
        return Err(BehaviorError::State("event must serialize as a tagged object".to_string()));
    };

    let name = match obj.remove("name") {
        Some(JsonValue::String(name)) => name,
        _ => return Err(BehaviorError::State("event is missing its 'name' tag".to_string())),
    };
    let data = obj.remove("data").unwrap_or(JsonValue::Object(Map::new()));

    Ok((name, data))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("entity '{context}.{entity}' registered twice")]
    Duplicate { context: String, entity: String },

    #[error("entity '{context}.{entity}' not found")]
    EntityNotFound { context: String, entity: String },

    #[error("entity '{context}.{entity}' has an invalid initial state: {reason}")]
    InvalidInitialState {
        context: String,
        entity: String,
        reason: String,
    },
}

type EntityKey = (String, String);

/// The validated set of entity behaviors a process serves.
#[derive(Clone, Default)]
pub struct Application {
    entities: HashMap<EntityKey, Arc<dyn EntityBehavior>>,
}

impl core::fmt::Debug for Application {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<String> = self.entities.keys().map(|(c, e)| format!("{c}.{e}")).collect();
        keys.sort();
        f.debug_struct("Application").field("entities", &keys).finish()
    }
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::default()
    }

    /// Behavior for the entity type addressed by `identifier`.
    pub fn behavior(&self, identifier: &EntityIdentifier) -> Result<&Arc<dyn EntityBehavior>, RegistryError> {
        self.entities
            .get(&(identifier.context_name.clone(), identifier.entity_name.clone()))
            .ok_or_else(|| RegistryError::EntityNotFound {
                context: identifier.context_name.clone(),
                entity: identifier.entity_name.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Builds an [`Application`], validating each entity as it is registered.
#[derive(Default)]
pub struct ApplicationBuilder {
    entities: HashMap<EntityKey, Arc<dyn EntityBehavior>>,
}

impl ApplicationBuilder {
    /// Register a typed aggregate under its `CONTEXT`/`ENTITY` names.
    pub fn register<A: Aggregate>(self) -> Result<Self, RegistryError> {
        self.register_behavior(A::CONTEXT, A::ENTITY, Arc::new(Behavior::<A>::new()))
    }

    pub fn register_behavior(
        mut self,
        context: impl Into<String>,
        entity: impl Into<String>,
        behavior: Arc<dyn EntityBehavior>,
    ) -> Result<Self, RegistryError> {
        let key = (context.into(), entity.into());

        if self.entities.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                context: key.0,
                entity: key.1,
            });
        }

        behavior
            .initial_state()
            .map_err(|e| RegistryError::InvalidInitialState {
                context: key.0.clone(),
                entity: key.1.clone(),
                reason: e.to_string(),
            })?;

        debug!(context = %key.0, entity = %key.1, "registered entity behavior");
        self.entities.insert(key, behavior);
        Ok(self)
    }

    pub fn build(self) -> Application {
        Application {
            entities: self.entities,
        }
    }
}
