//! Append-only domain event store boundary.
//!
//! This module defines the contract the processing core requires from the
//! event log: revision-conditioned appends, ordered reads, and snapshot
//! read/write. Storage engine internals live behind the trait.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryDomainEventStore;
pub use r#trait::{DomainEventStore, EventStoreError};
