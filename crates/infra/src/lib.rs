//! Write-side runtime: stores, dispatcher client, repository, command processing.

pub mod command_processor;
pub mod config;
pub mod dispatcher;
pub mod event_bus;
pub mod event_store;
pub mod lock_store;
pub mod renewal;
pub mod repository;
pub mod retry;
pub mod snapshot;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use command_processor::{CommandProcessor, Disposition, Outcome, ProcessError, ProcessorConfig};
pub use config::{ConfigError, ServerConfig};
pub use repository::{LoadedEntity, Repository, RepositoryError};
pub use snapshot::{ReplayStats, SnapshotStrategy};
pub use workers::CommandWorkerPool;
