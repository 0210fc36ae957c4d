//! Scenario tests for the failover buffer.
//!
//! Each test drives a [`BufferManager`](crate::BufferManager) the way a query
//! router would: failed requests park through `wait_for_failover_end`, a
//! health-check path reports primaries through `record_primary_observed`,
//! and assertions read the outcomes and the per-shard counters.
//!
//! Most tests run on a paused tokio clock so windows, failover durations and
//! cooldowns elapse deterministically.

mod dry_run_tests;
mod utils;
