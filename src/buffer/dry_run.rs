//! Dry-run decisions.
//!
//! Every new episode asks a [`DryRunPolicy`] whether the shard should buffer
//! for real, only measure, or not buffer at all. Dry-run episodes go through
//! the same start/stop bookkeeping as live ones but never park a caller, so
//! operators can size the buffer before turning it on.

use crate::config::BufferConfig;
use crate::types::ShardKey;

/// How a shard handles one buffering episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Queue requests until the failover ends.
    Live,
    /// Count would-be buffered requests, never delay them.
    DryRun,
    /// Skip every request with reason `Disabled`.
    Disabled,
}

/// Completed episodes of one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeHistory {
    /// Live episodes that have ended.
    pub live_episodes: u64,
    /// Dry-run episodes that have ended.
    pub dry_run_episodes: u64,
}

/// Decides the [`BufferMode`] of a new episode.
pub trait DryRunPolicy: Send + Sync + std::fmt::Debug {
    /// Mode for the episode about to start on `key`.
    fn decide(&self, key: &ShardKey, config: &BufferConfig, history: &EpisodeHistory)
        -> BufferMode;
}

/// Mode taken straight from configuration.
///
/// Targets listed in `live_keyspace_shards` buffer live. Everything else is
/// dry-run when `dry_run` is set, live when the list is empty, and disabled
/// otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigDryRunPolicy;

impl DryRunPolicy for ConfigDryRunPolicy {
    fn decide(
        &self,
        key: &ShardKey,
        config: &BufferConfig,
        _history: &EpisodeHistory,
    ) -> BufferMode {
        if config.is_live_target(key) {
            BufferMode::Live
        } else if config.dry_run {
            BufferMode::DryRun
        } else if config.live_keyspace_shards.is_empty() {
            BufferMode::Live
        } else {
            BufferMode::Disabled
        }
    }
}

/// Measure the first `episodes` failovers of each shard, then buffer live.
#[derive(Debug, Clone, Copy)]
pub struct PromoteAfterEpisodes {
    episodes: u64,
}

impl PromoteAfterEpisodes {
    /// Promote a shard once it has completed `episodes` dry-run episodes.
    pub fn new(episodes: u64) -> Self {
        Self { episodes }
    }
}

impl DryRunPolicy for PromoteAfterEpisodes {
    fn decide(
        &self,
        key: &ShardKey,
        config: &BufferConfig,
        history: &EpisodeHistory,
    ) -> BufferMode {
        if config.is_live_target(key) || history.dry_run_episodes >= self.episodes {
            BufferMode::Live
        } else {
            BufferMode::DryRun
        }
    }
}
