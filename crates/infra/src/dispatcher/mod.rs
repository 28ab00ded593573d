//! Command lease client.
//!
//! Workers lease one pending command at a time from a dispatcher, renew the
//! lease while processing, and report exactly one terminal outcome:
//! acknowledge (handled), defer (redeliver later) or reject (permanently
//! failed).

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryDispatcher;
pub use r#trait::{CommandLeaseClient, DispatcherError, Lease, LeaseToken};
