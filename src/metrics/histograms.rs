//! Histogram metrics for per-episode distributions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Failover duration buckets (in seconds).
pub const FAILOVER_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0];

/// Buffer utilization buckets (in percent). Dry-run episodes can exceed 100.
pub const UTILIZATION_BUCKETS: &[f64] = &[10.0, 25.0, 50.0, 75.0, 100.0, 150.0, 200.0, 500.0];

/// A histogram for measuring distributions.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64, // Store as bits
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with custom buckets.
    pub fn with_buckets(mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.total_cmp(b));
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        // Update sum (using CAS for float)
        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let new_sum = f64::from_bits(current) + value;
            if self
                .sum
                .compare_exchange_weak(
                    current,
                    new_sum.to_bits(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        for (i, &upper) in self.buckets.iter().enumerate() {
            if value <= upper {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get a snapshot of the histogram data.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of histogram data.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Bucket boundaries.
    pub buckets: Vec<f64>,
    /// Count of observations <= each bucket boundary.
    pub bucket_counts: Vec<u64>,
    /// Sum of all observations.
    pub sum: f64,
    /// Total count of observations.
    pub count: u64,
}

impl HistogramSnapshot {
    /// Calculate the mean.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// A histogram with labels.
#[derive(Debug)]
pub struct LabeledHistogram<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    buckets: Vec<f64>,
    histograms: RwLock<HashMap<[String; N], Histogram>>,
}

impl<const N: usize> LabeledHistogram<N> {
    /// Create a new labeled histogram with custom buckets.
    pub fn with_buckets(
        name: &'static str,
        help: &'static str,
        label_names: [&'static str; N],
        buckets: Vec<f64>,
    ) -> Self {
        Self {
            name,
            help,
            label_names,
            buckets,
            histograms: RwLock::new(HashMap::new()),
        }
    }

    /// Get the histogram name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the histogram help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Observe a value with the given labels.
    pub fn observe(&self, labels: [&str; N], value: f64) {
        let key: [String; N] = labels.map(|s| s.to_string());

        {
            let histograms = self.histograms.read();
            if let Some(h) = histograms.get(&key) {
                h.observe(value);
                return;
            }
        }

        let mut histograms = self.histograms.write();
        histograms
            .entry(key)
            .or_insert_with(|| Histogram::with_buckets(self.buckets.clone()))
            .observe(value);
    }

    /// Get a snapshot for specific labels.
    pub fn snapshot(&self, labels: [&str; N]) -> Option<HistogramSnapshot> {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.histograms.read().get(&key).map(|h| h.snapshot())
    }

    /// Get all snapshots with their labels, sorted by labels.
    pub fn get_all(&self) -> Vec<([String; N], HistogramSnapshot)> {
        let mut all: Vec<_> = self
            .histograms
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
