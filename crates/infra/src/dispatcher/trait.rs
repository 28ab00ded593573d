use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use cairn_core::CommandId;
use cairn_events::Command;

/// Identity of one lease. A redelivered command gets a new token.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A time-bounded exclusive claim on a dispatched command.
///
/// Must be renewed before `expires_at`, otherwise the dispatcher may hand the
/// command to another worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub command: Command,
    pub token: LeaseToken,
    pub expires_at: Instant,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatcherError {
    #[error("lease for command {command_id} expired")]
    LeaseExpired { command_id: CommandId },

    #[error("lease renewal failed: {0}")]
    LeaseRenewalFailed(String),

    /// Defer/reject after the command was acknowledged.
    #[error("command {command_id} was already acknowledged")]
    AlreadyAcknowledged { command_id: CommandId },

    /// Any outcome after the lease was deferred or rejected.
    #[error("lease for command {command_id} was already settled")]
    AlreadySettled { command_id: CommandId },

    #[error("unknown lease {0}")]
    UnknownLease(LeaseToken),

    #[error("dispatcher unavailable: {0}")]
    Unavailable(String),
}

impl DispatcherError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Client side of the dispatcher protocol.
#[async_trait]
pub trait CommandLeaseClient: Send + Sync {
    /// Suspend the caller until a command is available, then lease it.
    async fn await_command(&self) -> Result<Lease, DispatcherError>;

    /// Extend the lease; returns the lease with its new expiry.
    async fn renew(&self, lease: &Lease) -> Result<Lease, DispatcherError>;

    /// Mark the command permanently handled. Acknowledging twice is a no-op.
    async fn acknowledge(&self, lease: &Lease) -> Result<(), DispatcherError>;

    /// Return the command for redelivery. Fails after acknowledgement.
    async fn defer(&self, lease: &Lease) -> Result<(), DispatcherError>;

    /// Mark the command permanently failed.
    async fn reject(&self, lease: &Lease, reason: &str) -> Result<(), DispatcherError>;
}

#[async_trait]
impl<D> CommandLeaseClient for Arc<D>
where
    D: CommandLeaseClient + ?Sized,
{
    async fn await_command(&self) -> Result<Lease, DispatcherError> {
        (**self).await_command().await
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, DispatcherError> {
        (**self).renew(lease).await
    }

    async fn acknowledge(&self, lease: &Lease) -> Result<(), DispatcherError> {
        (**self).acknowledge(lease).await
    }

    async fn defer(&self, lease: &Lease) -> Result<(), DispatcherError> {
        (**self).defer(lease).await
    }

    async fn reject(&self, lease: &Lease, reason: &str) -> Result<(), DispatcherError> {
        (**self).reject(lease, reason).await
    }
}
