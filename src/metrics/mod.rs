//! Statistics for monitoring the failover buffer.
//!
//! The buffer reports through the [`StatsSink`] trait and never touches
//! process-wide state. [`BufferMetrics`] is the in-process implementation:
//! every counter is keyed by `Keyspace` and `ShardName`, and stop, eviction
//! and skip counters carry an extra `Reason` label.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  incr / observe   ┌──────────────────────────────────┐
//! │ ShardBuffer  │ ────────────────▶ │           BufferMetrics          │
//! │ BufferManager│                   │  LabeledCounter  (starts, stops, │
//! └──────────────┘                   │                   requests ...)  │
//!                                    │  LabeledGauge    (last episode)  │
//!                                    │  LabeledHistogram(duration, util)│
//!                                    └──────────────────────────────────┘
//! ```
//!
//! Per shard, `Buffered` and `Skipped` together cover every request that
//! reached the buffer, and `Drained + Evicted == Buffered` once no episode
//! is running.
//!
//! # Example
//!
//! ```rust
//! use failover_buffer::metrics::{BufferEvent, BufferMetrics, StatsSink};
//! use failover_buffer::{ShardKey, StopReason};
//!
//! let metrics = BufferMetrics::new();
//! let key = ShardKey::new("commerce", "0");
//!
//! metrics.init_shard(&key);
//! metrics.incr(&key, BufferEvent::Started);
//! metrics.incr(&key, BufferEvent::Stopped(StopReason::FailoverEndDetected));
//!
//! let snapshot = metrics.shard_snapshot(&key);
//! assert_eq!(snapshot.starts, 1);
//! assert!(metrics.to_prometheus().contains("BufferStops"));
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::LabeledCounter;
pub use gauges::LabeledGauge;
pub use histograms::{
    Histogram, HistogramSnapshot, LabeledHistogram, FAILOVER_DURATION_BUCKETS,
    UTILIZATION_BUCKETS,
};

use crate::types::{EvictReason, ShardKey, SkipReason, StopReason};
use std::fmt::Write as _;
use std::time::Duration;

const SHARD_LABELS: [&str; 2] = ["Keyspace", "ShardName"];
const REASON_LABELS: [&str; 3] = ["Keyspace", "ShardName", "Reason"];

/// A countable buffer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEvent {
    /// An episode started, live or dry-run.
    Started,
    /// An episode stopped.
    Stopped(StopReason),
    /// A request was queued.
    RequestBuffered,
    /// A request would have been queued (dry-run).
    RequestBufferedDryRun,
    /// A queued request was released by a drain.
    RequestDrained,
    /// A queued request left the buffer early.
    RequestEvicted(EvictReason),
    /// A request was not queued.
    RequestSkipped(SkipReason),
}

/// A measured value reported once per episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Configured queue size in effect for the episode.
    BufferSize(usize),
    /// How long the episode lasted.
    FailoverDuration(Duration),
    /// Peak requests relative to the queue size, in percent.
    Utilization { percent: u64, dry_run: bool },
    /// Peak queued requests (live) or requests seen (dry-run).
    PeakRequests { count: usize, dry_run: bool },
}

/// Destination for buffer statistics.
pub trait StatsSink: Send + Sync + std::fmt::Debug {
    /// Publish zero values for every series of a newly seen shard.
    fn init_shard(&self, _key: &ShardKey) {}

    /// Add `n` to the counter for `event`.
    fn incr_by(&self, key: &ShardKey, event: BufferEvent, n: u64);

    /// Add one to the counter for `event`.
    fn incr(&self, key: &ShardKey, event: BufferEvent) {
        self.incr_by(key, event, 1);
    }

    /// Record a measured value.
    fn observe(&self, key: &ShardKey, observation: Observation);
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn incr_by(&self, _key: &ShardKey, _event: BufferEvent, _n: u64) {}

    fn observe(&self, _key: &ShardKey, _observation: Observation) {}
}

/// In-process buffer statistics.
#[derive(Debug)]
pub struct BufferMetrics {
    /// Episodes started, including dry-run.
    pub starts: LabeledCounter<2>,
    /// Episodes stopped, by reason, including dry-run.
    pub stops: LabeledCounter<3>,
    /// Cumulative failover duration in milliseconds.
    pub failover_duration_sum_ms: LabeledCounter<2>,
    /// Cumulative peak utilization (percent) of live episodes.
    pub utilization_sum: LabeledCounter<2>,
    /// Cumulative theoretical utilization (percent) of dry-run episodes.
    pub utilization_dry_run_sum: LabeledCounter<2>,
    /// Requests added to a queue.
    pub requests_buffered: LabeledCounter<2>,
    /// Requests that would have been added to a queue.
    pub requests_buffered_dry_run: LabeledCounter<2>,
    /// Requests released by a drain.
    pub requests_drained: LabeledCounter<2>,
    /// Requests evicted early, by reason.
    pub requests_evicted: LabeledCounter<3>,
    /// Requests not buffered, by reason.
    pub requests_skipped: LabeledCounter<3>,

    /// Queue size of the last episode.
    pub buffer_size: LabeledGauge<2>,
    /// Duration of the last episode.
    pub last_failover_duration_ms: LabeledGauge<2>,
    /// Peak queued requests of the last live episode.
    pub last_requests_in_flight_max: LabeledGauge<2>,
    /// Requests seen during the last dry-run episode.
    pub last_requests_dry_run_max: LabeledGauge<2>,

    /// Failover duration distribution.
    pub failover_duration: LabeledHistogram<2>,
    /// Utilization distribution (live episodes).
    pub utilization: LabeledHistogram<2>,
}

impl BufferMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            starts: LabeledCounter::new(
                "BufferStarts",
                "How many times we started buffering, including dry-run",
                SHARD_LABELS,
            ),
            stops: LabeledCounter::new(
                "BufferStops",
                "How many times we triggered a buffering to stop, including dry-runs",
                REASON_LABELS,
            ),
            failover_duration_sum_ms: LabeledCounter::new(
                "BufferFailoverDurationSumMs",
                "Cumulative sum of all failover durations",
                SHARD_LABELS,
            ),
            utilization_sum: LabeledCounter::new(
                "BufferUtilizationSum",
                "Cumulative sum of the max buffer utilization (in %) during each failover",
                SHARD_LABELS,
            ),
            utilization_dry_run_sum: LabeledCounter::new(
                "BufferUtilizationDryRunSum",
                "Cumulative sum of the max *theoretical* buffer util (in %) during each failover",
                SHARD_LABELS,
            ),
            requests_buffered: LabeledCounter::new(
                "BufferRequestsBuffered",
                "How many requests were added to the buffer",
                SHARD_LABELS,
            ),
            requests_buffered_dry_run: LabeledCounter::new(
                "BufferRequestsBufferedDryRun",
                "How many requests would've been added to the buffer (dry-run)",
                SHARD_LABELS,
            ),
            requests_drained: LabeledCounter::new(
                "BufferRequestsDrained",
                "How many requests drained from the buffer",
                SHARD_LABELS,
            ),
            requests_evicted: LabeledCounter::new(
                "BufferRequestsEvicted",
                "How many requests were evicted early from the buffer",
                REASON_LABELS,
            ),
            requests_skipped: LabeledCounter::new(
                "BufferRequestsSkipped",
                "How many requests would've been buffered but were skipped (incl. dry-run)",
                REASON_LABELS,
            ),
            buffer_size: LabeledGauge::new(
                "BufferSize",
                "Configured per-shard buffer size",
                SHARD_LABELS,
            ),
            last_failover_duration_ms: LabeledGauge::new(
                "BufferLastFailoverDurationMs",
                "How long requests were buffered during the last failover",
                SHARD_LABELS,
            ),
            last_requests_in_flight_max: LabeledGauge::new(
                "BufferLastRequestsInFlightMax",
                "The max value of buffered requests in flight of the last failover",
                SHARD_LABELS,
            ),
            last_requests_dry_run_max: LabeledGauge::new(
                "BufferLastRequestsDryRunMax",
                "Max # of requests which were seen during a dry-run buffering of the last failover",
                SHARD_LABELS,
            ),
            failover_duration: LabeledHistogram::with_buckets(
                "BufferFailoverDurationSeconds",
                "Failover duration distribution",
                SHARD_LABELS,
                FAILOVER_DURATION_BUCKETS.to_vec(),
            ),
            utilization: LabeledHistogram::with_buckets(
                "BufferUtilizationPercent",
                "Max buffer utilization (in %) distribution",
                SHARD_LABELS,
                UTILIZATION_BUCKETS.to_vec(),
            ),
        }
    }

    /// Get the counters of one shard.
    pub fn shard_snapshot(&self, key: &ShardKey) -> ShardStatsSnapshot {
        let labels = key.labels();
        let [keyspace, shard] = labels;
        ShardStatsSnapshot {
            starts: self.starts.get(labels),
            stops: StopReason::ALL
                .iter()
                .map(|r| (*r, self.stops.get([keyspace, shard, r.as_str()])))
                .collect(),
            failover_duration_sum_ms: self.failover_duration_sum_ms.get(labels),
            utilization_sum: self.utilization_sum.get(labels),
            utilization_dry_run_sum: self.utilization_dry_run_sum.get(labels),
            requests_buffered: self.requests_buffered.get(labels),
            requests_buffered_dry_run: self.requests_buffered_dry_run.get(labels),
            requests_drained: self.requests_drained.get(labels),
            requests_evicted: EvictReason::ALL
                .iter()
                .map(|r| (*r, self.requests_evicted.get([keyspace, shard, r.as_str()])))
                .collect(),
            requests_skipped: SkipReason::ALL
                .iter()
                .map(|r| (*r, self.requests_skipped.get([keyspace, shard, r.as_str()])))
                .collect(),
            last_failover_duration_ms: self.last_failover_duration_ms.get(labels),
            last_requests_in_flight_max: self.last_requests_in_flight_max.get(labels),
            last_requests_dry_run_max: self.last_requests_dry_run_max.get(labels),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_family {
            ($metric:expr, $kind:literal) => {{
                let _ = write!(
                    output,
                    "# HELP {name} {help}\n# TYPE {name} {kind}\n",
                    name = $metric.name(),
                    help = $metric.help(),
                    kind = $kind,
                );
                for (values, value) in $metric.get_all() {
                    let _ = writeln!(
                        output,
                        "{}{{{}}} {}",
                        $metric.name(),
                        render_labels($metric.label_names(), &values),
                        value
                    );
                }
            }};
        }

        add_family!(self.starts, "counter");
        add_family!(self.stops, "counter");
        add_family!(self.failover_duration_sum_ms, "counter");
        add_family!(self.utilization_sum, "counter");
        add_family!(self.utilization_dry_run_sum, "counter");
        add_family!(self.requests_buffered, "counter");
        add_family!(self.requests_buffered_dry_run, "counter");
        add_family!(self.requests_drained, "counter");
        add_family!(self.requests_evicted, "counter");
        add_family!(self.requests_skipped, "counter");

        add_family!(self.buffer_size, "gauge");
        add_family!(self.last_failover_duration_ms, "gauge");
        add_family!(self.last_requests_in_flight_max, "gauge");
        add_family!(self.last_requests_dry_run_max, "gauge");

        for histogram in [&self.failover_duration, &self.utilization] {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} histogram\n",
                name = histogram.name(),
                help = histogram.help(),
            );
            for (values, snapshot) in histogram.get_all() {
                let labels = render_labels(histogram.label_names(), &values);
                for (upper, count) in snapshot.buckets.iter().zip(&snapshot.bucket_counts) {
                    let _ = writeln!(
                        output,
                        "{}_bucket{{{},le=\"{}\"}} {}",
                        histogram.name(),
                        labels,
                        upper,
                        count
                    );
                }
                let _ = writeln!(
                    output,
                    "{}_bucket{{{},le=\"+Inf\"}} {}",
                    histogram.name(),
                    labels,
                    snapshot.count
                );
                let _ = writeln!(output, "{}_sum{{{}}} {}", histogram.name(), labels, snapshot.sum);
                let _ = writeln!(
                    output,
                    "{}_count{{{}}} {}",
                    histogram.name(),
                    labels,
                    snapshot.count
                );
            }
        }

        output
    }
}

impl Default for BufferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink for BufferMetrics {
    fn init_shard(&self, key: &ShardKey) {
        let labels = key.labels();
        let [keyspace, shard] = labels;

        self.starts.set(labels, 0);
        for reason in StopReason::ALL {
            self.stops.set([keyspace, shard, reason.as_str()], 0);
        }
        self.failover_duration_sum_ms.set(labels, 0);
        self.utilization_sum.set(labels, 0);
        self.utilization_dry_run_sum.set(labels, 0);
        self.requests_buffered.set(labels, 0);
        self.requests_buffered_dry_run.set(labels, 0);
        self.requests_drained.set(labels, 0);
        for reason in EvictReason::ALL {
            self.requests_evicted.set([keyspace, shard, reason.as_str()], 0);
        }
        for reason in SkipReason::ALL {
            self.requests_skipped.set([keyspace, shard, reason.as_str()], 0);
        }
    }

    fn incr_by(&self, key: &ShardKey, event: BufferEvent, n: u64) {
        let labels = key.labels();
        let [keyspace, shard] = labels;
        match event {
            BufferEvent::Started => self.starts.inc_by(labels, n),
            BufferEvent::Stopped(reason) => {
                self.stops.inc_by([keyspace, shard, reason.as_str()], n)
            }
            BufferEvent::RequestBuffered => self.requests_buffered.inc_by(labels, n),
            BufferEvent::RequestBufferedDryRun => self.requests_buffered_dry_run.inc_by(labels, n),
            BufferEvent::RequestDrained => self.requests_drained.inc_by(labels, n),
            BufferEvent::RequestEvicted(reason) => {
                self.requests_evicted
                    .inc_by([keyspace, shard, reason.as_str()], n)
            }
            BufferEvent::RequestSkipped(reason) => {
                self.requests_skipped
                    .inc_by([keyspace, shard, reason.as_str()], n)
            }
        }
    }

    fn observe(&self, key: &ShardKey, observation: Observation) {
        let labels = key.labels();
        match observation {
            Observation::BufferSize(size) => self.buffer_size.set(labels, size as i64),
            Observation::FailoverDuration(duration) => {
                let ms = duration.as_millis() as u64;
                self.failover_duration_sum_ms.inc_by(labels, ms);
                self.last_failover_duration_ms.set(labels, ms as i64);
                self.failover_duration.observe(labels, duration.as_secs_f64());
            }
            Observation::Utilization { percent, dry_run } => {
                if dry_run {
                    self.utilization_dry_run_sum.inc_by(labels, percent);
                } else {
                    self.utilization_sum.inc_by(labels, percent);
                    self.utilization.observe(labels, percent as f64);
                }
            }
            Observation::PeakRequests { count, dry_run } => {
                if dry_run {
                    self.last_requests_dry_run_max.set(labels, count as i64);
                } else {
                    self.last_requests_in_flight_max.set(labels, count as i64);
                }
            }
        }
    }
}

/// Counters of one shard at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatsSnapshot {
    pub starts: u64,
    pub stops: Vec<(StopReason, u64)>,
    pub failover_duration_sum_ms: u64,
    pub utilization_sum: u64,
    pub utilization_dry_run_sum: u64,
    pub requests_buffered: u64,
    pub requests_buffered_dry_run: u64,
    pub requests_drained: u64,
    pub requests_evicted: Vec<(EvictReason, u64)>,
    pub requests_skipped: Vec<(SkipReason, u64)>,
    pub last_failover_duration_ms: i64,
    pub last_requests_in_flight_max: i64,
    pub last_requests_dry_run_max: i64,
}

impl ShardStatsSnapshot {
    /// Stops recorded for `reason`.
    pub fn stops(&self, reason: StopReason) -> u64 {
        lookup(&self.stops, reason)
    }

    /// Evictions recorded for `reason`.
    pub fn evicted(&self, reason: EvictReason) -> u64 {
        lookup(&self.requests_evicted, reason)
    }

    /// Skips recorded for `reason`.
    pub fn skipped(&self, reason: SkipReason) -> u64 {
        lookup(&self.requests_skipped, reason)
    }

    /// Evictions across all reasons.
    pub fn evicted_total(&self) -> u64 {
        self.requests_evicted.iter().map(|(_, n)| n).sum()
    }

    /// Skips across all reasons.
    pub fn skipped_total(&self) -> u64 {
        self.requests_skipped.iter().map(|(_, n)| n).sum()
    }

    /// Stops across all reasons.
    pub fn stops_total(&self) -> u64 {
        self.stops.iter().map(|(_, n)| n).sum()
    }
}

fn lookup<R: PartialEq>(values: &[(R, u64)], reason: R) -> u64 {
    values
        .iter()
        .find(|(r, _)| *r == reason)
        .map(|(_, n)| *n)
        .unwrap_or(0)
}

fn render_labels<const N: usize>(names: &[&'static str; N], values: &[String; N]) -> String {
    names
        .iter()
        .zip(values.iter())
        .map(|(name, value)| format!("{name}=\"{}\"", escape_label_value(value)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Escapes a label value for the text exposition format.
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_shard_publishes_zeroes() {
        let metrics = BufferMetrics::new();
        let key = ShardKey::new("commerce", "-80");

        metrics.init_shard(&key);

        assert!(metrics.starts.contains(["commerce", "-80"]));
        for reason in SkipReason::ALL {
            assert!(metrics
                .requests_skipped
                .contains(["commerce", "-80", reason.as_str()]));
        }
        assert_eq!(metrics.requests_evicted.get_all().len(), EvictReason::ALL.len());
        assert_eq!(metrics.stops.get_all().len(), StopReason::ALL.len());

        let snapshot = metrics.shard_snapshot(&key);
        assert_eq!(snapshot.starts, 0);
        assert_eq!(snapshot.skipped_total(), 0);
    }

    #[test]
    fn test_events_and_observations() {
        let metrics = BufferMetrics::new();
        let key = ShardKey::new("commerce", "0");

        metrics.incr(&key, BufferEvent::Started);
        metrics.incr(&key, BufferEvent::RequestBuffered);
        metrics.incr(&key, BufferEvent::RequestBuffered);
        metrics.incr(&key, BufferEvent::RequestEvicted(EvictReason::BufferFull));
        metrics.incr_by(&key, BufferEvent::RequestDrained, 1);
        metrics.incr(&key, BufferEvent::RequestSkipped(SkipReason::Disabled));
        metrics.incr(&key, BufferEvent::Stopped(StopReason::MaxDurationExceeded));
        metrics.observe(&key, Observation::FailoverDuration(Duration::from_millis(1500)));
        metrics.observe(&key, Observation::Utilization { percent: 40, dry_run: false });
        metrics.observe(&key, Observation::Utilization { percent: 150, dry_run: true });
        metrics.observe(&key, Observation::PeakRequests { count: 4, dry_run: false });

        let snapshot = metrics.shard_snapshot(&key);
        assert_eq!(snapshot.starts, 1);
        assert_eq!(snapshot.requests_buffered, 2);
        assert_eq!(snapshot.evicted(EvictReason::BufferFull), 1);
        assert_eq!(snapshot.requests_drained, 1);
        assert_eq!(snapshot.skipped(SkipReason::Disabled), 1);
        assert_eq!(snapshot.stops(StopReason::MaxDurationExceeded), 1);
        assert_eq!(snapshot.stops_total(), 1);
        assert_eq!(snapshot.failover_duration_sum_ms, 1500);
        assert_eq!(snapshot.last_failover_duration_ms, 1500);
        assert_eq!(snapshot.utilization_sum, 40);
        assert_eq!(snapshot.utilization_dry_run_sum, 150);
        assert_eq!(snapshot.last_requests_in_flight_max, 4);
        assert_eq!(
            snapshot.requests_drained + snapshot.evicted_total(),
            snapshot.requests_buffered
        );

        let durations = metrics.failover_duration.snapshot(key.labels()).unwrap();
        assert_eq!(durations.count, 1);
        assert!((durations.mean() - 1.5).abs() < 0.001);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = BufferMetrics::new();
        let key = ShardKey::new("commerce", "0");
        metrics.incr(&key, BufferEvent::Stopped(StopReason::FailoverEndDetected));
        metrics.observe(&key, Observation::FailoverDuration(Duration::from_secs(2)));

        let output = metrics.to_prometheus();

        assert!(output.contains("# TYPE BufferStops counter"));
        assert!(output.contains(
            "BufferStops{Keyspace=\"commerce\",ShardName=\"0\",Reason=\"NewMasterSeen\"} 1"
        ));
        assert!(output.contains(
            "BufferLastFailoverDurationMs{Keyspace=\"commerce\",ShardName=\"0\"} 2000"
        ));
        assert!(output.contains(
            "BufferFailoverDurationSeconds_count{Keyspace=\"commerce\",ShardName=\"0\"} 1"
        ));
        assert!(output.contains(
            "BufferFailoverDurationSeconds_bucket{Keyspace=\"commerce\",ShardName=\"0\",le=\"2\"} 1"
        ));
        assert!(output.contains(
            "BufferFailoverDurationSeconds_bucket{Keyspace=\"commerce\",ShardName=\"0\",le=\"1\"} 0"
        ));
        assert!(output.contains("HELP"));
    }

    #[test]
    fn test_prometheus_escapes_label_values() {
        let metrics = BufferMetrics::new();
        let key = ShardKey::new("ks\"a", "0\\1\n");
        metrics.incr(&key, BufferEvent::Started);

        let output = metrics.to_prometheus();

        assert!(output.contains(r#"BufferStarts{Keyspace="ks\"a",ShardName="0\\1\n"} 1"#));
        for line in output.lines().filter(|line| line.starts_with("BufferStarts{")) {
            assert!(line.ends_with(" 1") || line.ends_with(" 0"), "{line}");
        }
    }

    #[test]
    fn test_noop_stats() {
        let stats = NoopStats;
        let key = ShardKey::new("ks", "0");
        stats.init_shard(&key);
        stats.incr(&key, BufferEvent::Started);
        stats.observe(&key, Observation::BufferSize(10));
    }
}
