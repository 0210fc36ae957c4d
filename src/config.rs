//! Configuration types for the failover buffer.

use crate::error::{Error, Result};
use crate::types::ShardKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for every configured duration.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// What to do with a new request when the shard's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FullBufferPolicy {
    /// Evict the oldest queued request to make room.
    #[default]
    EvictOldest,
    /// Keep the queue as is and skip the new request.
    RejectNew,
}

/// Buffer configuration for one keyspace, or for all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Global kill switch. When off, nothing is buffered or counted.
    pub enabled: bool,

    /// Run episodes in dry-run mode: count would-be buffered requests
    /// without delaying any caller.
    pub dry_run: bool,

    /// Keyspaces (`ks`) or shards (`ks/shard`) that buffer for real.
    ///
    /// With `dry_run` on, these are the targets promoted to live buffering.
    /// With `dry_run` off, a non-empty list restricts buffering to them.
    pub live_keyspace_shards: Vec<String>,

    /// Maximum number of requests queued per shard.
    pub max_buffer_size: usize,

    /// Maximum time a single request stays buffered.
    pub window: Duration,

    /// Maximum duration of one buffering episode before it is force-drained.
    pub max_failover_duration: Duration,

    /// Minimum time after a failover end or reparent before buffering again.
    pub min_time_between_failovers: Duration,

    /// Maximum number of shards buffering live at the same time.
    /// Only read from the global configuration.
    pub max_buffering_shards: Option<usize>,

    /// Behaviour when a shard's queue is full.
    pub full_buffer_policy: FullBufferPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            live_keyspace_shards: Vec::new(),
            max_buffer_size: 10,
            window: Duration::from_secs(10),
            max_failover_duration: Duration::from_secs(20),
            min_time_between_failovers: Duration::from_secs(60),
            max_buffering_shards: None,
            full_buffer_policy: FullBufferPolicy::EvictOldest,
        }
    }
}

impl BufferConfig {
    /// Create a configuration with buffering enabled and default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration that never buffers.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the keyspaces/shards that buffer live.
    pub fn with_live_keyspace_shards<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.live_keyspace_shards = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-shard queue size.
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set the per-request buffering window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the maximum failover duration.
    pub fn with_max_failover_duration(mut self, duration: Duration) -> Self {
        self.max_failover_duration = duration;
        self
    }

    /// Set the cooldown between failovers.
    pub fn with_min_time_between_failovers(mut self, duration: Duration) -> Self {
        self.min_time_between_failovers = duration;
        self
    }

    /// Cap the number of shards that may buffer live concurrently.
    pub fn with_max_buffering_shards(mut self, max: usize) -> Self {
        self.max_buffering_shards = Some(max);
        self
    }

    /// Set the full-buffer policy.
    pub fn with_full_buffer_policy(mut self, policy: FullBufferPolicy) -> Self {
        self.full_buffer_policy = policy;
        self
    }

    /// Whether `key` is listed in `live_keyspace_shards`.
    pub fn is_live_target(&self, key: &ShardKey) -> bool {
        self.live_keyspace_shards.iter().any(|target| {
            match target.split_once('/') {
                Some((keyspace, shard)) => keyspace == key.keyspace() && shard == key.shard(),
                None => target == key.keyspace(),
            }
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(Error::config("max_buffer_size", "must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(Error::config("window", "must be greater than 0"));
        }
        for (field, value) in [
            ("window", self.window),
            ("max_failover_duration", self.max_failover_duration),
            ("min_time_between_failovers", self.min_time_between_failovers),
        ] {
            if value > MAX_CONFIG_DURATION {
                return Err(Error::config(
                    field,
                    format!("{value:?} exceeds the maximum of {MAX_CONFIG_DURATION:?}"),
                ));
            }
        }
        if self.max_failover_duration < self.window {
            return Err(Error::config(
                "max_failover_duration",
                format!(
                    "{:?} must not be shorter than window {:?}",
                    self.max_failover_duration, self.window
                ),
            ));
        }
        if self.max_buffering_shards == Some(0) {
            return Err(Error::config("max_buffering_shards", "must be greater than 0"));
        }
        if !self.live_keyspace_shards.is_empty() && !self.enabled {
            return Err(Error::config(
                "live_keyspace_shards",
                "set while buffering is disabled",
            ));
        }
        for target in &self.live_keyspace_shards {
            let valid = if target.contains('/') {
                target.parse::<ShardKey>().is_ok()
            } else {
                !target.is_empty()
            };
            if !valid {
                return Err(Error::config(
                    "live_keyspace_shards",
                    format!(
                        "invalid entry {target:?}, expected \"keyspace\" or \"keyspace/shard\""
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Source of buffer configuration, consulted on every buffering decision.
pub trait ConfigProvider: Send + Sync + std::fmt::Debug {
    /// Configuration that applies to `key`.
    fn config_for(&self, key: &ShardKey) -> Arc<BufferConfig>;

    /// Process-wide configuration (used for global limits).
    fn global(&self) -> Arc<BufferConfig>;
}

/// A default configuration plus per-keyspace overrides.
///
/// Both can be replaced at runtime; buffers pick the change up at their next
/// decision. A running episode keeps the queue size it started with.
#[derive(Debug)]
pub struct KeyspaceConfigs {
    default: RwLock<Arc<BufferConfig>>,
    keyspaces: RwLock<HashMap<String, Arc<BufferConfig>>>,
}

impl KeyspaceConfigs {
    /// Create a provider with a validated default configuration.
    pub fn new(default: BufferConfig) -> Result<Self> {
        default.validate()?;
        Ok(Self {
            default: RwLock::new(Arc::new(default)),
            keyspaces: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the default configuration.
    pub fn set_default(&self, config: BufferConfig) -> Result<()> {
        config.validate()?;
        *self.default.write() = Arc::new(config);
        Ok(())
    }

    /// Set an override for one keyspace.
    pub fn set_keyspace(&self, keyspace: impl Into<String>, config: BufferConfig) -> Result<()> {
        config.validate()?;
        self.keyspaces
            .write()
            .insert(keyspace.into(), Arc::new(config));
        Ok(())
    }

    /// Remove a keyspace override. Returns whether one existed.
    pub fn remove_keyspace(&self, keyspace: &str) -> bool {
        self.keyspaces.write().remove(keyspace).is_some()
    }
}

impl ConfigProvider for KeyspaceConfigs {
    fn config_for(&self, key: &ShardKey) -> Arc<BufferConfig> {
        if let Some(config) = self.keyspaces.read().get(key.keyspace()) {
            return config.clone();
        }
        self.default.read().clone()
    }

    fn global(&self) -> Arc<BufferConfig> {
        self.default.read().clone()
    }
}
