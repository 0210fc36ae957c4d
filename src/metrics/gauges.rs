//! Gauge metrics for values that are overwritten rather than accumulated.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// A gauge with labels for dimensional metrics.
#[derive(Debug)]
pub struct LabeledGauge<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    gauges: RwLock<HashMap<[String; N], AtomicI64>>,
}

impl<const N: usize> LabeledGauge<N> {
    /// Create a new labeled gauge.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            gauges: RwLock::new(HashMap::new()),
        }
    }

    /// Get the gauge name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the gauge help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Set the gauge with the given labels.
    pub fn set(&self, labels: [&str; N], value: i64) {
        let key: [String; N] = labels.map(|s| s.to_string());

        {
            let gauges = self.gauges.read();
            if let Some(gauge) = gauges.get(&key) {
                gauge.store(value, Ordering::Relaxed);
                return;
            }
        }

        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Get the value for specific labels.
    pub fn get(&self, labels: [&str; N]) -> i64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.gauges
            .read()
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all values with their labels, sorted by labels.
    pub fn get_all(&self) -> Vec<([String; N], i64)> {
        let mut all: Vec<_> = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
