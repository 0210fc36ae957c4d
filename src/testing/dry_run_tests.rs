#[cfg(test)]
pub(crate) mod dry_run_tests {
    use crate::buffer::PromoteAfterEpisodes;
    use crate::config::{BufferConfig, KeyspaceConfigs};
    use crate::metrics::BufferMetrics;
    use crate::testing::utils::{settle, TestBuffer};
    use crate::types::{NotBufferedCause, ShardKey, ShardState, SkipReason, StopReason, WaitOutcome};
    use crate::BufferManager;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio::time::Instant;

    #[test(tokio::test(start_paused = true))]
    async fn test_dry_run_never_blocks() {
        let buffer = TestBuffer::new(
            BufferConfig::new()
                .with_dry_run(true)
                .with_max_buffer_size(4),
        );
        let key = ShardKey::new("commerce", "0");

        let started = Instant::now();
        for _ in 0..3 {
            let outcome = buffer.request(&key).await;
            assert_eq!(outcome, WaitOutcome::NotBuffered(NotBufferedCause::DryRun));
        }
        assert_eq!(started.elapsed(), Duration::ZERO);

        let status = buffer.manager.shard_status(&key).unwrap();
        assert_eq!(status.state, ShardState::Buffering);
        assert!(status.dry_run);
        assert_eq!(status.queued, 0);

        assert!(buffer.manager.record_primary_observed(&key, 1));
        assert_eq!(buffer.state(&key), ShardState::Idle);

        let stats = buffer.stats(&key);
        assert_eq!(stats.starts, 1);
        assert_eq!(stats.requests_buffered_dry_run, 3);
        assert_eq!(stats.requests_buffered, 0);
        assert_eq!(stats.stops(StopReason::FailoverEndDetected), 1);
        assert_eq!(stats.last_requests_dry_run_max, 3);
        assert_eq!(stats.utilization_dry_run_sum, 75);
        assert_eq!(stats.utilization_sum, 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_dry_run_can_exceed_buffer_size() {
        let buffer = TestBuffer::new(
            BufferConfig::new()
                .with_dry_run(true)
                .with_max_buffer_size(2),
        );
        let key = ShardKey::new("commerce", "0");

        for _ in 0..5 {
            assert!(buffer.request(&key).await.is_not_buffered());
        }
        buffer.manager.record_primary_observed(&key, 1);

        let stats = buffer.stats(&key);
        assert_eq!(stats.requests_buffered_dry_run, 5);
        assert_eq!(stats.utilization_dry_run_sum, 250);
        assert_eq!(stats.skipped(SkipReason::BufferFull), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_live_targets_override_dry_run() {
        let config = BufferConfig::new()
            .with_dry_run(true)
            .with_live_keyspace_shards(["commerce/-80"]);
        let buffer = TestBuffer::new(config);
        let live = ShardKey::new("commerce", "-80");
        let dry = ShardKey::new("commerce", "80-");

        let parked = buffer.spawn_request(&live);
        settle().await;
        assert_eq!(buffer.queued(&live), 1);

        let outcome = buffer.request(&dry).await;
        assert_eq!(outcome, WaitOutcome::NotBuffered(NotBufferedCause::DryRun));

        buffer.manager.record_primary_observed(&live, 1);
        assert_eq!(parked.await.unwrap(), WaitOutcome::Released);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_unlisted_shards_are_disabled() {
        let buffer = TestBuffer::new(BufferConfig::new().with_live_keyspace_shards(["commerce"]));
        let key = ShardKey::new("customer", "0");

        let outcome = buffer.request(&key).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::Disabled));
        assert_eq!(buffer.state(&key), ShardState::Idle);
        assert_eq!(buffer.stats(&key).skipped(SkipReason::Disabled), 1);
        assert_eq!(buffer.stats(&key).starts, 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_promotion_after_dry_run_episodes() {
        let metrics = Arc::new(BufferMetrics::new());
        let config = BufferConfig::new().with_min_time_between_failovers(Duration::from_secs(1));
        let manager = BufferManager::builder(Arc::new(KeyspaceConfigs::new(config).unwrap()))
            .with_stats(metrics.clone())
            .with_dry_run_policy(Arc::new(PromoteAfterEpisodes::new(1)))
            .build()
            .unwrap();
        let buffer = TestBuffer::with_manager(manager, metrics);
        let key = ShardKey::new("commerce", "0");

        let outcome = buffer.request(&key).await;
        assert_eq!(outcome, WaitOutcome::NotBuffered(NotBufferedCause::DryRun));
        buffer.manager.record_primary_observed(&key, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let parked = buffer.spawn_request(&key);
        settle().await;
        let status = buffer.manager.shard_status(&key).unwrap();
        assert!(!status.dry_run);
        assert_eq!(status.queued, 1);
        assert_eq!(status.dry_run_episodes, 1);

        buffer.manager.record_primary_observed(&key, 2);
        assert_eq!(parked.await.unwrap(), WaitOutcome::Released);
        let status = buffer.manager.shard_status(&key).unwrap();
        assert_eq!(status.live_episodes, 1);
    }
}
