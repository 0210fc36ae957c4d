//! Failover buffering.
//!
//! While a shard fails over, requests to it fail with a "primary unavailable"
//! error. Instead of returning that error, the router can park the request
//! here and retry once a new primary is seen.
//!
//! # Architecture
//!
//! ```text
//!                     ┌───────────────────────────────────────────┐
//!  request failed ──▶ │               BufferManager               │
//!  primary observed ─▶│  DashMap<ShardKey, Arc<ShardBuffer>>      │
//!                     └──────┬───────────────────────┬────────────┘
//!                            │                       │
//!                  ┌─────────▼────────┐    ┌─────────▼────────┐
//!                  │ ShardBuffer ks/0 │    │ ShardBuffer ks/1 │  ...
//!                  │ Idle/Buffering/  │    │                  │
//!                  │ Draining + queue │    │                  │
//!                  └─────────┬────────┘    └─────────┬────────┘
//!                            └──────────┬────────────┘
//!                  ┌────────────────────▼──────────────────────┐
//!                  │ Shared: ConfigProvider, StatsSink,         │
//!                  │ DryRunPolicy, CooldownTracker, slot cap    │
//!                  └────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use failover_buffer::{BufferConfig, BufferManager, FailureClass, ShardKey};
//! use failover_buffer::metrics::NoopStats;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> failover_buffer::Result<()> {
//! let buffer = BufferManager::new(BufferConfig::new(), Arc::new(NoopStats))?;
//! let key = ShardKey::new("commerce", "0");
//!
//! // The request to commerce/0 failed.
//! let failure = FailureClass::from_error_message("no healthy tablet available");
//! let outcome = buffer
//!     .wait_for_failover_end(&key, failure, &CancellationToken::new())
//!     .await;
//! if outcome.should_retry() {
//!     // retry the request
//! }
//!
//! // Elsewhere, health checks report the new primary.
//! buffer.record_primary_observed(&key, 42);
//! # Ok(())
//! # }
//! ```

mod classify;
mod cooldown;
mod dry_run;
mod entry;
mod manager;
mod shard;

pub use classify::FailureClass;
pub use cooldown::CooldownTracker;
pub use dry_run::{
    BufferMode, ConfigDryRunPolicy, DryRunPolicy, EpisodeHistory, PromoteAfterEpisodes,
};
pub use manager::{BufferManager, BufferManagerBuilder};
pub use shard::ShardBufferStatus;
