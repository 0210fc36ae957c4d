//! Cooldown between failovers.
//!
//! Re-entering buffering right after a failover ended, or right after a
//! reparent, makes a flapping shard oscillate between holding and releasing
//! traffic. The tracker remembers both timestamps per shard and tells the
//! enqueue path when to skip instead.

use crate::types::{ShardKey, SkipReason};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
struct CooldownEntry {
    last_failover_end: Option<Instant>,
    last_reparent_seen: Option<Instant>,
}

/// Per-shard record of the last failover end and the last reparent.
///
/// Written by the drain and primary-observation paths, read by the enqueue
/// path. A read may miss a write made during the same drain cycle. Entries
/// are sharded by key, so shards do not contend with each other.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    shards: DashMap<ShardKey, CooldownEntry>,
}

impl CooldownTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a buffering episode for `key` ended at `now`.
    pub fn record_failover_end(&self, key: &ShardKey, now: Instant) {
        self.shards.entry(key.clone()).or_default().last_failover_end = Some(now);
    }

    /// Record that a new primary was observed for `key` outside of buffering.
    pub fn record_reparent_seen(&self, key: &ShardKey, now: Instant) {
        self.shards.entry(key.clone()).or_default().last_reparent_seen = Some(now);
    }

    /// Whether a new episode for `key` must be skipped at `now`.
    ///
    /// The failover end is checked before the reparent.
    pub fn should_skip(
        &self,
        key: &ShardKey,
        now: Instant,
        min_time_between_failovers: Duration,
    ) -> Option<SkipReason> {
        let entry = *self.shards.get(key)?;
        let too_recent = |at: Option<Instant>| {
            at.is_some_and(|at| now.saturating_duration_since(at) < min_time_between_failovers)
        };

        if too_recent(entry.last_failover_end) {
            Some(SkipReason::LastFailoverTooRecent)
        } else if too_recent(entry.last_reparent_seen) {
            Some(SkipReason::LastReparentTooRecent)
        } else {
            None
        }
    }

    /// When the last episode for `key` ended.
    pub fn last_failover_end(&self, key: &ShardKey) -> Option<Instant> {
        self.shards.get(key)?.last_failover_end
    }

    /// When the last reparent for `key` was observed.
    pub fn last_reparent_seen(&self, key: &ShardKey) -> Option<Instant> {
        self.shards.get(key)?.last_reparent_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_TIME: Duration = Duration::from_secs(1);

    #[test]
    fn test_unknown_shard_is_not_skipped() {
        let tracker = CooldownTracker::new();
        let key = ShardKey::new("ks", "0");
        assert_eq!(tracker.should_skip(&key, Instant::now(), MIN_TIME), None);
        assert!(tracker.last_failover_end(&key).is_none());
    }

    #[test]
    fn test_failover_end_window() {
        let tracker = CooldownTracker::new();
        let key = ShardKey::new("ks", "0");
        let ended = Instant::now();
        tracker.record_failover_end(&key, ended);

        let almost = ended + MIN_TIME - Duration::from_millis(1);
        assert_eq!(
            tracker.should_skip(&key, almost, MIN_TIME),
            Some(SkipReason::LastFailoverTooRecent)
        );
        assert_eq!(tracker.should_skip(&key, ended + MIN_TIME, MIN_TIME), None);
        assert_eq!(tracker.last_failover_end(&key), Some(ended));

        // Other shards are unaffected.
        let other = ShardKey::new("ks", "1");
        assert_eq!(tracker.should_skip(&other, almost, MIN_TIME), None);
    }

    #[test]
    fn test_reparent_window() {
        let tracker = CooldownTracker::new();
        let key = ShardKey::new("ks", "0");
        let seen = Instant::now();
        tracker.record_reparent_seen(&key, seen);

        assert_eq!(
            tracker.should_skip(&key, seen + Duration::from_millis(500), MIN_TIME),
            Some(SkipReason::LastReparentTooRecent)
        );
        assert_eq!(
            tracker.should_skip(&key, seen + Duration::from_millis(1200), MIN_TIME),
            None
        );
    }

    #[test]
    fn test_failover_end_checked_first() {
        let tracker = CooldownTracker::new();
        let key = ShardKey::new("ks", "0");
        let now = Instant::now();
        tracker.record_reparent_seen(&key, now);
        tracker.record_failover_end(&key, now);

        assert_eq!(
            tracker.should_skip(&key, now, MIN_TIME),
            Some(SkipReason::LastFailoverTooRecent)
        );
        assert_eq!(tracker.should_skip(&key, now, Duration::ZERO), None);
    }

    #[test]
    fn test_concurrent_shards_keep_their_own_entries() {
        let tracker = CooldownTracker::new();
        let now = Instant::now();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let tracker = &tracker;
                scope.spawn(move || {
                    let key = ShardKey::new("ks", i.to_string());
                    for _ in 0..100 {
                        if i % 2 == 0 {
                            tracker.record_failover_end(&key, now);
                        } else {
                            tracker.record_reparent_seen(&key, now);
                        }
                        let _ = tracker.should_skip(&key, now, MIN_TIME);
                    }
                });
            }
        });

        for i in 0..8 {
            let key = ShardKey::new("ks", i.to_string());
            let expected = if i % 2 == 0 {
                SkipReason::LastFailoverTooRecent
            } else {
                SkipReason::LastReparentTooRecent
            };
            assert_eq!(tracker.should_skip(&key, now, MIN_TIME), Some(expected));
        }
    }
}
