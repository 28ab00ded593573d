//! Commands, domain events and the business-logic registry.

pub mod command;
pub mod event;
pub mod in_memory_publisher;
pub mod publisher;
pub mod registry;
pub mod snapshot;

pub use command::{Command, CommandMetadata};
pub use event::{DomainEvent, DomainEventWithState, EventMetadata, StateTransition, UncommittedEvent};
pub use in_memory_publisher::InMemoryEventPublisher;
pub use publisher::{EventPublisher, PublishError, Subscription};
pub use registry::{
    Application, ApplicationBuilder, Behavior, BehaviorError, Decision, EntityBehavior,
    RegistryError,
};
pub use snapshot::Snapshot;
