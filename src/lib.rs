//! Request buffering for shards that are failing over.
//!
//! When a shard loses its write-primary, requests routed to it fail until a
//! new primary is promoted. This crate lets a query router hold those
//! requests for a short while and retry them once the new primary is seen,
//! so a planned failover is invisible to clients.
//!
//! # Features
//!
//! - Per-shard FIFO buffers with a bounded queue and per-request window
//! - Episodes end on a newer primary term or after a maximum duration
//! - Cooldown after a failover end or reparent to avoid flapping
//! - Dry-run mode that measures buffering without delaying anyone
//! - Optional cap on the number of shards buffering at once
//! - Labeled counters and gauges with Prometheus output
//!
//! # Example
//!
//! ```rust,no_run
//! use failover_buffer::{BufferConfig, BufferManager, FailureClass, ShardKey, WaitOutcome};
//! use failover_buffer::metrics::BufferMetrics;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BufferConfig::new()
//!         .with_max_buffer_size(100)
//!         .with_window(Duration::from_secs(5))
//!         .with_max_failover_duration(Duration::from_secs(10));
//!     let metrics = Arc::new(BufferMetrics::new());
//!     let buffer = Arc::new(BufferManager::new(config, metrics.clone())?);
//!
//!     let key: ShardKey = "commerce/-80".parse()?;
//!     let cancel = CancellationToken::new();
//!
//!     // A request failed with "no healthy tablet".
//!     let failure = FailureClass::from_error_message("no healthy tablet available");
//!     match buffer.wait_for_failover_end(&key, failure, &cancel).await {
//!         WaitOutcome::Released => { /* retry against the new primary */ }
//!         WaitOutcome::Evicted(reason) => println!("gave up waiting: {reason}"),
//!         WaitOutcome::NotBuffered(cause) => println!("not buffered: {cause:?}"),
//!     }
//!
//!     println!("{}", metrics.to_prometheus());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Query router                   │
//! └─────────────────────────────────────────────┘
//!          │ failed request          │ health check
//!          ▼                         ▼
//! ┌─────────────────────────────────────────────┐
//! │               BufferManager                  │
//! │  • wait_for_failover_end(key, class, cancel) │
//! │  • record_primary_observed(key, term)        │
//! │  • shutdown()                                │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Shard   │   │ Cooldown │   │  Stats   │
//! │ buffers  │   │ tracker  │   │  sink    │
//! └──────────┘   └──────────┘   └──────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use buffer::{
    BufferManager, BufferManagerBuilder, BufferMode, ConfigDryRunPolicy, CooldownTracker,
    DryRunPolicy, EpisodeHistory, FailureClass, PromoteAfterEpisodes, ShardBufferStatus,
};
pub use config::{BufferConfig, ConfigProvider, FullBufferPolicy, KeyspaceConfigs};
pub use error::{Error, Result};
pub use types::{
    EvictReason, NotBufferedCause, ShardKey, ShardState, SkipReason, StopReason, Term,
    WaitOutcome,
};

// Re-export metrics types
pub use metrics::{BufferEvent, BufferMetrics, NoopStats, Observation, StatsSink};
