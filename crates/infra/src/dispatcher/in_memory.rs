use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use cairn_core::CommandId;
use cairn_events::Command;

use super::r#trait::{CommandLeaseClient, DispatcherError, Lease, LeaseToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Acknowledged,
    Deferred,
    Rejected,
    Expired,
}

#[derive(Debug)]
struct Leased {
    command: Command,
    expires_at: Instant,
}

/// Settled leases remembered for idempotent acknowledge and error reporting.
const SETTLED_RETENTION: usize = 4096;

#[derive(Debug)]
struct Inner {
    pending: VecDeque<Command>,
    leased: HashMap<LeaseToken, Leased>,
    settled: HashMap<LeaseToken, (CommandId, Settlement)>,
    /// Oldest first; trimmed to `SETTLED_RETENTION`.
    settled_order: VecDeque<LeaseToken>,
    keep_history: bool,
    acknowledged: Vec<CommandId>,
    rejected: Vec<(CommandId, String)>,
    deferrals: usize,
}

impl Inner {
    fn new(keep_history: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            leased: HashMap::new(),
            settled: HashMap::new(),
            settled_order: VecDeque::new(),
            keep_history,
            acknowledged: Vec::new(),
            rejected: Vec::new(),
            deferrals: 0,
        }
    }

    fn settle(&mut self, token: LeaseToken, command_id: CommandId, settlement: Settlement) {
        if self.settled.insert(token, (command_id, settlement)).is_none() {
            self.settled_order.push_back(token);
        }
        while self.settled_order.len() > SETTLED_RETENTION {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }

    /// Move leases past their expiry back to the pending queue.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<LeaseToken> = self
            .leased
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(t, _)| *t)
            .collect();

        for token in &expired {
            if let Some(leased) = self.leased.remove(token) {
                self.settle(*token, leased.command.id, Settlement::Expired);
                self.pending.push_back(leased.command);
            }
        }

        expired.len()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leased.values().map(|l| l.expires_at).min()
    }

    fn settlement_error(&self, token: &LeaseToken) -> DispatcherError {
        match self.settled.get(token) {
            Some((command_id, Settlement::Acknowledged)) => DispatcherError::AlreadyAcknowledged {
                command_id: *command_id,
            },
            Some((command_id, Settlement::Expired)) => DispatcherError::LeaseExpired {
                command_id: *command_id,
            },
            Some((command_id, _)) => DispatcherError::AlreadySettled {
                command_id: *command_id,
            },
            None => DispatcherError::UnknownLease(*token),
        }
    }

    fn renewal_error(&self, token: &LeaseToken) -> DispatcherError {
        match self.settlement_error(token) {
            expired @ DispatcherError::LeaseExpired { .. } => expired,
            other => DispatcherError::LeaseRenewalFailed(other.to_string()),
        }
    }

    fn take_active(&mut self, token: &LeaseToken) -> Result<Leased, DispatcherError> {
        self.leased
            .remove(token)
            .ok_or_else(|| self.settlement_error(token))
    }
}

/// In-memory dispatcher with lease semantics.
///
/// Intended for tests/dev and the demo server:
/// - FIFO pending queue
/// - leases expire and their commands are redelivered under a new token
/// - acknowledge is idempotent; defer/reject after acknowledge fail loudly
/// - settled leases are remembered up to a fixed bound
///
/// Acknowledged and rejected commands are also logged for inspection unless
/// the dispatcher is built [`without_history`](Self::without_history).
#[derive(Debug)]
pub struct InMemoryDispatcher {
    inner: Mutex<Inner>,
    available: Notify,
    lease_duration: Duration,
}

impl InMemoryDispatcher {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::new(true)),
            available: Notify::new(),
            lease_duration,
        }
    }

    /// Stop logging acknowledged and rejected commands.
    pub fn without_history(self) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.keep_history = false;
        }
        self
    }

    /// Enqueue a command for delivery.
    pub fn submit(&self, command: Command) -> Result<(), DispatcherError> {
        self.lock()?.pending.push_back(command);
        self.available.notify_one();
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.lock().map(|i| i.pending.len()).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().map(|i| i.leased.len()).unwrap_or(0)
    }

    pub fn acknowledged(&self) -> Vec<CommandId> {
        self.lock().map(|i| i.acknowledged.clone()).unwrap_or_default()
    }

    pub fn rejected(&self) -> Vec<(CommandId, String)> {
        self.lock().map(|i| i.rejected.clone()).unwrap_or_default()
    }

    pub fn deferrals(&self) -> usize {
        self.lock().map(|i| i.deferrals).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DispatcherError> {
        self.inner
            .lock()
            .map_err(|_| DispatcherError::Unavailable("lock poisoned".to_string()))
    }

    fn sweep(&self, inner: &mut Inner, now: Instant) {
        for _ in 0..inner.reclaim_expired(now) {
            self.available.notify_one();
        }
    }
}

#[async_trait]
impl CommandLeaseClient for InMemoryDispatcher {
    async fn await_command(&self) -> Result<Lease, DispatcherError> {
        loop {
            let wake_at = {
                let now = Instant::now();
                let mut inner = self.lock()?;
                self.sweep(&mut inner, now);

                if let Some(command) = inner.pending.pop_front() {
                    let token = LeaseToken::new();
                    let expires_at = now + self.lease_duration;
                    inner.leased.insert(
                        token,
                        Leased {
                            command: command.clone(),
                            expires_at,
                        },
                    );

                    // Hand the wakeup on if more work is queued.
                    if !inner.pending.is_empty() {
                        self.available.notify_one();
                    }

                    return Ok(Lease {
                        command,
                        token,
                        expires_at,
                    });
                }

                inner.next_expiry()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.available.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.available.notified().await,
            }
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease, DispatcherError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        self.sweep(&mut inner, now);

        match inner.leased.get_mut(&lease.token) {
            Some(leased) => {
                leased.expires_at = now + self.lease_duration;
                Ok(Lease {
                    command: leased.command.clone(),
                    token: lease.token,
                    expires_at: leased.expires_at,
                })
            }
            None => Err(inner.renewal_error(&lease.token)),
        }
    }

    async fn acknowledge(&self, lease: &Lease) -> Result<(), DispatcherError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        self.sweep(&mut inner, now);

        if let Some((_, Settlement::Acknowledged)) = inner.settled.get(&lease.token) {
            return Ok(());
        }

        let leased = inner.take_active(&lease.token)?;
        inner.settle(lease.token, leased.command.id, Settlement::Acknowledged);
        if inner.keep_history {
            inner.acknowledged.push(leased.command.id);
        }
        Ok(())
    }

    async fn defer(&self, lease: &Lease) -> Result<(), DispatcherError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        self.sweep(&mut inner, now);

        let leased = inner.take_active(&lease.token)?;
        inner.settle(lease.token, leased.command.id, Settlement::Deferred);
        inner.deferrals += 1;
        inner.pending.push_back(leased.command);
        self.available.notify_one();
        Ok(())
    }

    async fn reject(&self, lease: &Lease, reason: &str) -> Result<(), DispatcherError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        self.sweep(&mut inner, now);

        let leased = inner.take_active(&lease.token)?;
        inner.settle(lease.token, leased.command.id, Settlement::Rejected);
        if inner.keep_history {
            inner.rejected.push((leased.command.id, reason.to_string()));
        }
        Ok(())
    }
}
