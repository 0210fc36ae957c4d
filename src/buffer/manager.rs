//! Process-wide entry point: routes requests and primary observations to the
//! right shard buffer.

use super::classify::FailureClass;
use super::cooldown::CooldownTracker;
use super::dry_run::{ConfigDryRunPolicy, DryRunPolicy};
use super::shard::{ShardBuffer, ShardBufferStatus};
use crate::config::{BufferConfig, ConfigProvider, KeyspaceConfigs};
use crate::error::Result;
use crate::metrics::{BufferEvent, NoopStats, StatsSink};
use crate::types::{NotBufferedCause, ShardKey, ShardState, SkipReason, Term, WaitOutcome};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State shared by the manager and every shard buffer.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: Arc<dyn ConfigProvider>,
    pub(crate) stats: Arc<dyn StatsSink>,
    pub(crate) policy: Arc<dyn DryRunPolicy>,
    pub(crate) cooldown: CooldownTracker,
    /// Live buffering slots, when the number of buffering shards is capped.
    slots: Option<Arc<Semaphore>>,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        config: Arc<dyn ConfigProvider>,
        stats: Arc<dyn StatsSink>,
        policy: Arc<dyn DryRunPolicy>,
    ) -> Self {
        let slots = config
            .global()
            .max_buffering_shards
            .map(|max| Arc::new(Semaphore::new(max)));
        Self {
            config,
            stats,
            policy,
            cooldown: CooldownTracker::new(),
            slots,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Take a live buffering slot. `Ok(None)` when slots are unlimited.
    pub(crate) fn acquire_slot(
        &self,
    ) -> std::result::Result<Option<OwnedSemaphorePermit>, TryAcquireError> {
        match &self.slots {
            Some(slots) => slots.clone().try_acquire_owned().map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Builder for [`BufferManager`].
#[derive(Debug)]
pub struct BufferManagerBuilder {
    config: Arc<dyn ConfigProvider>,
    stats: Arc<dyn StatsSink>,
    policy: Arc<dyn DryRunPolicy>,
}

impl BufferManagerBuilder {
    /// Report statistics to `stats` instead of discarding them.
    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    /// Decide dry-run versus live buffering with `policy`.
    pub fn with_dry_run_policy(mut self, policy: Arc<dyn DryRunPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Validate the global configuration and build the manager.
    pub fn build(self) -> Result<BufferManager> {
        let global = self.config.global();
        global.validate()?;
        info!(
            enabled = global.enabled,
            dry_run = global.dry_run,
            max_buffer_size = global.max_buffer_size,
            window = ?global.window,
            max_failover_duration = ?global.max_failover_duration,
            min_time_between_failovers = ?global.min_time_between_failovers,
            max_buffering_shards = ?global.max_buffering_shards,
            "Created failover buffer"
        );
        Ok(BufferManager {
            shared: Arc::new(Shared::new(self.config, self.stats, self.policy)),
            buffers: DashMap::new(),
        })
    }
}

/// Holds requests to shards that are failing over until a new primary is
/// seen, then lets them retry.
///
/// Buffers are created lazily, one per (keyspace, shard), and live as long
/// as the manager.
#[derive(Debug)]
pub struct BufferManager {
    shared: Arc<Shared>,
    buffers: DashMap<ShardKey, Arc<ShardBuffer>>,
}

impl BufferManager {
    /// Create a manager with one configuration for every keyspace.
    pub fn new(config: BufferConfig, stats: Arc<dyn StatsSink>) -> Result<Self> {
        Self::builder(Arc::new(KeyspaceConfigs::new(config)?))
            .with_stats(stats)
            .build()
    }

    /// Start building a manager on top of a configuration provider.
    pub fn builder(config: Arc<dyn ConfigProvider>) -> BufferManagerBuilder {
        BufferManagerBuilder {
            config,
            stats: Arc::new(NoopStats),
            policy: Arc::new(ConfigDryRunPolicy),
        }
    }

    /// Wait for the failover of `key` to end before the caller retries.
    ///
    /// Returns immediately with [`WaitOutcome::NotBuffered`] when the failure
    /// is not a primary outage or the request is not buffered. Otherwise the
    /// caller parks until the shard is drained, the request is evicted, or
    /// `cancel` fires.
    pub async fn wait_for_failover_end(
        &self,
        key: &ShardKey,
        failure: FailureClass,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        if !failure.is_primary_unavailable() {
            return WaitOutcome::NotBuffered(NotBufferedCause::NotPrimaryUnavailable);
        }
        if !self.shared.config.config_for(key).enabled {
            return WaitOutcome::NotBuffered(NotBufferedCause::BufferingDisabled);
        }
        if self.is_shut_down() {
            self.shared
                .stats
                .incr(key, BufferEvent::RequestSkipped(SkipReason::Shutdown));
            return SkipReason::Shutdown.into();
        }

        self.get_or_create(key).enqueue_and_wait(cancel).await
    }

    /// Report the primary term currently serving `key`.
    ///
    /// A term newer than any seen before ends a running episode. Returns
    /// true if this call drained the shard.
    pub fn record_primary_observed(&self, key: &ShardKey, term: Term) -> bool {
        if self.is_shut_down() {
            debug!(%key, term, "Ignoring primary observation after shutdown");
            return false;
        }
        self.get_or_create(key).record_primary_observed(term)
    }

    /// Stop all buffering. Queued requests are evicted and later requests
    /// are skipped. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let buffers: Vec<_> = self.buffers.iter().map(|e| e.value().clone()).collect();
        for buffer in &buffers {
            buffer.shutdown();
        }
        info!(shards = buffers.len(), "Failover buffer shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Status of one shard, if it has been seen.
    pub fn shard_status(&self, key: &ShardKey) -> Option<ShardBufferStatus> {
        self.buffers.get(key).map(|buffer| buffer.status())
    }

    /// Status of every known shard, ordered by key.
    pub fn statuses(&self) -> Vec<ShardBufferStatus> {
        let mut statuses: Vec<_> = self.buffers.iter().map(|e| e.value().status()).collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Shards currently buffering (live or dry-run).
    pub fn buffering_shards(&self) -> Vec<ShardKey> {
        let mut keys: Vec<_> = self
            .buffers
            .iter()
            .filter(|e| e.value().state() == ShardState::Buffering)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Cooldown timestamps of every shard.
    pub fn cooldown(&self) -> &CooldownTracker {
        &self.shared.cooldown
    }

    fn get_or_create(&self, key: &ShardKey) -> Arc<ShardBuffer> {
        if let Some(buffer) = self.buffers.get(key) {
            return buffer.clone();
        }
        self.buffers
            .entry(key.clone())
            .or_insert_with(|| {
                self.shared.stats.init_shard(key);
                debug!(%key, "Created shard buffer");
                Arc::new(ShardBuffer::new(key.clone(), self.shared.clone()))
            })
            .clone()
    }
}
