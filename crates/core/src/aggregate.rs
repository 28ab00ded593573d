//! Aggregate trait for event-sourced domain models.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DomainResult;
use crate::id::Initiator;

/// Per-command context handed to business logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub initiator: Initiator,
    /// Revision of the loaded state the command is decided against.
    pub revision: u64,
}

impl CommandContext {
    /// `true` when no event has ever been recorded for the entity.
    pub fn is_pristine(&self) -> bool {
        self.revision == 0
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Authorization**: `is_authorized(&self, cmd, ctx)` gates the command.
/// - **Decision logic**: `handle(&self, cmd, ctx)` returns events or a rejection.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// `Default` is the initial state before any event. Commands and events are
/// serde enums adjacently tagged as `{ "name": ..., "data": ... }`, so the
/// wire name of a command or event is its variant name:
///
/// ```ignore
/// #[derive(Deserialize)]
/// #[serde(tag = "name", content = "data", rename_all = "camelCase")]
/// enum MessageCommand { Send { text: String }, Like }
/// ```
///
/// Aggregates must not perform IO or side effects.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Command: DeserializeOwned + core::fmt::Debug;
    type Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug;

    /// Bounded context the aggregate belongs to (e.g. "communication").
    const CONTEXT: &'static str;

    /// Entity type name within the context (e.g. "message").
    const ENTITY: &'static str;

    /// Wire names of every command `Self::Command` can be decoded from.
    fn command_names() -> &'static [&'static str];

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Authorization predicate, checked before `handle`.
    fn is_authorized(&self, _command: &Self::Command, _ctx: &CommandContext) -> bool {
        true
    }

    /// Decide which events to emit given the current state and a command.
    ///
    /// Returning `Err` rejects the command; the rejection is recorded, not
    /// treated as a failure of the runtime.
    fn handle(&self, command: &Self::Command, ctx: &CommandContext) -> DomainResult<Vec<Self::Event>>;
}
