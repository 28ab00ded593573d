//! Snapshot strategy.
//!
//! A pure decision: given what the last load had to replay, should the
//! repository persist a snapshot after the save it is about to complete?

use std::time::Duration;

/// Replay statistics gathered while loading an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayStats {
    /// Events applied on top of the snapshot (or initial state).
    pub events_since_snapshot: u64,
    /// Revision the entity reached after the save.
    pub revision: u64,
    /// Wall time spent replaying.
    pub replay_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStrategy {
    Never,
    Always,
    /// Snapshot once this many events were replayed.
    Revision { limit: u64 },
    /// Snapshot once replay took at least this long.
    Duration { limit: Duration },
    /// Snapshot when either limit is reached.
    Lowest {
        revision_limit: u64,
        duration_limit: Duration,
    },
}

impl Default for SnapshotStrategy {
    fn default() -> Self {
        Self::Lowest {
            revision_limit: 100,
            duration_limit: Duration::from_millis(500),
        }
    }
}

impl SnapshotStrategy {
    pub fn should_snapshot(&self, stats: &ReplayStats) -> bool {
        match *self {
            Self::Never => false,
            Self::Always => true,
            Self::Revision { limit } => stats.events_since_snapshot >= limit,
            Self::Duration { limit } => stats.replay_duration >= limit,
            Self::Lowest {
                revision_limit,
                duration_limit,
            } => {
                stats.events_since_snapshot >= revision_limit
                    || stats.replay_duration >= duration_limit
            }
        }
    }

    /// Parse a strategy name as used in configuration.
    pub fn from_name(name: &str, revision_limit: u64, duration_limit: Duration) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "never" => Some(Self::Never),
            "always" => Some(Self::Always),
            "revision" => Some(Self::Revision {
                limit: revision_limit,
            }),
            "duration" => Some(Self::Duration {
                limit: duration_limit,
            }),
            "lowest" => Some(Self::Lowest {
                revision_limit,
                duration_limit,
            }),
            _ => None,
        }
    }
}
