use crate::buffer::{BufferManager, FailureClass};
use crate::config::BufferConfig;
use crate::metrics::{BufferMetrics, ShardStatsSnapshot};
use crate::types::{ShardKey, ShardState, WaitOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// A manager wired to in-process metrics.
pub(crate) struct TestBuffer {
    pub(crate) manager: Arc<BufferManager>,
    pub(crate) metrics: Arc<BufferMetrics>,
}

impl TestBuffer {
    pub(crate) fn new(config: BufferConfig) -> Self {
        let metrics = Arc::new(BufferMetrics::new());
        let manager = BufferManager::new(config, metrics.clone()).unwrap();
        Self {
            manager: Arc::new(manager),
            metrics,
        }
    }

    pub(crate) fn with_manager(manager: BufferManager, metrics: Arc<BufferMetrics>) -> Self {
        Self {
            manager: Arc::new(manager),
            metrics,
        }
    }

    /// Report a primary-unavailable failure and wait in the background.
    pub(crate) fn spawn_request(&self, key: &ShardKey) -> JoinHandle<WaitOutcome> {
        self.spawn_request_with(key, CancellationToken::new())
    }

    pub(crate) fn spawn_request_with(
        &self,
        key: &ShardKey,
        cancel: CancellationToken,
    ) -> JoinHandle<WaitOutcome> {
        let manager = self.manager.clone();
        let key = key.clone();
        tokio::spawn(async move {
            manager
                .wait_for_failover_end(&key, FailureClass::PrimaryUnavailable, &cancel)
                .await
        })
    }

    /// Report a primary-unavailable failure and wait inline.
    pub(crate) async fn request(&self, key: &ShardKey) -> WaitOutcome {
        self.manager
            .wait_for_failover_end(
                key,
                FailureClass::PrimaryUnavailable,
                &CancellationToken::new(),
            )
            .await
    }

    pub(crate) fn state(&self, key: &ShardKey) -> ShardState {
        self.manager
            .shard_status(key)
            .map(|s| s.state)
            .unwrap_or(ShardState::Idle)
    }

    pub(crate) fn queued(&self, key: &ShardKey) -> usize {
        self.manager.shard_status(key).map(|s| s.queued).unwrap_or(0)
    }

    pub(crate) fn stats(&self, key: &ShardKey) -> ShardStatsSnapshot {
        self.metrics.shard_snapshot(key)
    }
}

/// Let spawned tasks run until they park.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Wait for a condition with timeout
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}
