//! Core types used throughout the failover buffer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Primary term for a shard. Terms grow monotonically per shard.
pub type Term = u64;

/// Identity of a (keyspace, shard) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    keyspace: String,
    shard: String,
}

impl ShardKey {
    /// Create a new shard key.
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
        }
    }

    /// Keyspace name.
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// Shard name (e.g. `-80`, `80-` or `0`).
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// The `Keyspace`/`ShardName` label pair used by every statistic.
    pub fn labels(&self) -> [&str; 2] {
        [&self.keyspace, &self.shard]
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.shard)
    }
}

impl FromStr for ShardKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((keyspace, shard))
                if !keyspace.is_empty() && !shard.is_empty() && !shard.contains('/') =>
            {
                Ok(Self::new(keyspace, shard))
            }
            _ => Err(Error::InvalidShardKey(s.to_string())),
        }
    }
}

/// State of one shard buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardState {
    /// Not buffering.
    Idle,
    /// Holding requests until a new primary is seen.
    Buffering,
    /// Releasing the requests of a finished episode.
    Draining,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Idle => write!(f, "idle"),
            ShardState::Buffering => write!(f, "buffering"),
            ShardState::Draining => write!(f, "draining"),
        }
    }
}

/// Why a buffering episode stopped. Used as the `Reason` label of `BufferStops`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    /// A newer primary term was observed.
    FailoverEndDetected,
    /// The episode ran longer than `max_failover_duration`.
    MaxDurationExceeded,
    /// The manager was shut down.
    Shutdown,
}

impl StopReason {
    /// Every stop reason, in label order.
    pub const ALL: [StopReason; 3] = [
        StopReason::FailoverEndDetected,
        StopReason::MaxDurationExceeded,
        StopReason::Shutdown,
    ];

    /// Stable label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::FailoverEndDetected => "NewMasterSeen",
            StopReason::MaxDurationExceeded => "MaxDurationExceeded",
            StopReason::Shutdown => "Shutdown",
        }
    }
}

/// Why a queued request left the buffer before a drain.
/// Used as the `Reason` label of `BufferRequestsEvicted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvictReason {
    /// The caller's context was cancelled, or the manager shut down.
    ContextDone,
    /// The queue was full and this was the oldest entry.
    BufferFull,
    /// The request was buffered longer than the configured window.
    WindowExceeded,
}

impl EvictReason {
    /// Every eviction reason, in label order.
    pub const ALL: [EvictReason; 3] = [
        EvictReason::ContextDone,
        EvictReason::BufferFull,
        EvictReason::WindowExceeded,
    ];

    /// Stable label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::ContextDone => "ContextDone",
            EvictReason::BufferFull => "BufferFull",
            EvictReason::WindowExceeded => "WindowExceeded",
        }
    }
}

/// Why a request was never queued.
/// Used as the `Reason` label of `BufferRequestsSkipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// No slot could be freed or acquired for the request.
    BufferFull,
    /// Buffering is disabled for this keyspace/shard.
    Disabled,
    /// The manager is shut down.
    Shutdown,
    /// A reparent was observed within `min_time_between_failovers`.
    LastReparentTooRecent,
    /// A failover ended within `min_time_between_failovers`.
    LastFailoverTooRecent,
}

impl SkipReason {
    /// Every skip reason, in label order.
    pub const ALL: [SkipReason; 5] = [
        SkipReason::BufferFull,
        SkipReason::Disabled,
        SkipReason::Shutdown,
        SkipReason::LastReparentTooRecent,
        SkipReason::LastFailoverTooRecent,
    ];

    /// Stable label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::BufferFull => "BufferFull",
            SkipReason::Disabled => "Disabled",
            SkipReason::Shutdown => "Shutdown",
            SkipReason::LastReparentTooRecent => "LastReparentTooRecent",
            SkipReason::LastFailoverTooRecent => "LastFailoverTooRecent",
        }
    }
}

macro_rules! display_as_label {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

display_as_label!(StopReason, EvictReason, SkipReason);

/// Why a call returned without the request having been buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotBufferedCause {
    /// Buffering is switched off by configuration.
    BufferingDisabled,
    /// The failure was not a primary-unavailable condition.
    NotPrimaryUnavailable,
    /// The shard is in a dry-run episode; the request was only counted.
    DryRun,
    /// The buffer declined the request.
    Skipped(SkipReason),
    /// The release signal was lost. Never expected.
    Fault,
}

/// What a caller of `wait_for_failover_end` should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    /// Proceed as if buffering did not exist: surface the original failure.
    NotBuffered(NotBufferedCause),
    /// The failover is believed to be over: retry the request now.
    Released,
    /// The request was queued but left early. Treated like `NotBuffered`.
    Evicted(EvictReason),
}

impl WaitOutcome {
    /// Whether the caller should retry its request.
    pub fn should_retry(&self) -> bool {
        matches!(self, WaitOutcome::Released)
    }

    /// Whether the caller must fall back to its normal failure handling.
    pub fn is_not_buffered(&self) -> bool {
        !self.should_retry()
    }

    /// The skip reason, if the request was skipped.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            WaitOutcome::NotBuffered(NotBufferedCause::Skipped(reason)) => Some(*reason),
            _ => None,
        }
    }
}

impl From<SkipReason> for WaitOutcome {
    fn from(reason: SkipReason) -> Self {
        WaitOutcome::NotBuffered(NotBufferedCause::Skipped(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_key_parse() {
        let key: ShardKey = "commerce/-80".parse().unwrap();
        assert_eq!(key.keyspace(), "commerce");
        assert_eq!(key.shard(), "-80");
        assert_eq!(key.to_string(), "commerce/-80");
        assert_eq!(key.labels(), ["commerce", "-80"]);

        assert!("commerce".parse::<ShardKey>().is_err());
        assert!("/0".parse::<ShardKey>().is_err());
        assert!("commerce/".parse::<ShardKey>().is_err());
        assert!("a/b/c".parse::<ShardKey>().is_err());
    }

    #[test]
    fn test_reason_labels_are_stable() {
        let stops: Vec<_> = StopReason::ALL.iter().map(|r| r.as_str()).collect();
        assert_eq!(stops, ["NewMasterSeen", "MaxDurationExceeded", "Shutdown"]);

        let evicts: Vec<_> = EvictReason::ALL.iter().map(|r| r.as_str()).collect();
        assert_eq!(evicts, ["ContextDone", "BufferFull", "WindowExceeded"]);

        let skips: Vec<_> = SkipReason::ALL.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            skips,
            [
                "BufferFull",
                "Disabled",
                "Shutdown",
                "LastReparentTooRecent",
                "LastFailoverTooRecent"
            ]
        );
    }

    #[test]
    fn test_wait_outcome() {
        assert!(WaitOutcome::Released.should_retry());
        assert!(WaitOutcome::Evicted(EvictReason::BufferFull).is_not_buffered());

        let skipped = WaitOutcome::from(SkipReason::LastFailoverTooRecent);
        assert!(!skipped.should_retry());
        assert_eq!(skipped.skip_reason(), Some(SkipReason::LastFailoverTooRecent));
        assert_eq!(
            WaitOutcome::NotBuffered(NotBufferedCause::DryRun).skip_reason(),
            None
        );
    }

    #[test]
    fn test_outcomes_serde_round_trip() {
        let outcomes = [
            WaitOutcome::Released,
            WaitOutcome::Evicted(EvictReason::WindowExceeded),
            WaitOutcome::NotBuffered(NotBufferedCause::Skipped(SkipReason::LastReparentTooRecent)),
            WaitOutcome::NotBuffered(NotBufferedCause::Fault),
        ];
        let json = serde_json::to_string(&outcomes).unwrap();
        let decoded: Vec<WaitOutcome> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, outcomes);

        let key = ShardKey::new("commerce", "-80");
        let json = serde_json::to_string(&key).unwrap();
        let decoded: ShardKey = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, key);
    }
}
