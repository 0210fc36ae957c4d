//! Counter metrics for monotonically increasing values.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter with labels for dimensional metrics.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Increment the counter with the given labels.
    pub fn inc(&self, labels: [&str; N]) {
        self.inc_by(labels, 1);
    }

    /// Increment the counter by a specific amount with the given labels.
    pub fn inc_by(&self, labels: [&str; N], n: u64) {
        let key: [String; N] = labels.map(|s| s.to_string());

        // Try to read first
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }

        let mut counters = self.counters.write();
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Set the value for the given labels, creating the series if needed.
    ///
    /// Used to publish an explicit zero before the first increment.
    pub fn set(&self, labels: [&str; N], value: u64) {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Get the value for specific labels.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Whether a series exists for the given labels.
    pub fn contains(&self, labels: [&str; N]) -> bool {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.counters.read().contains_key(&key)
    }

    /// Get all values with their labels, sorted by labels.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        let mut all: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::<3>::new(
            "BufferStops",
            "Buffer stops",
            ["Keyspace", "ShardName", "Reason"],
        );

        counter.inc(["ks", "0", "NewMasterSeen"]);
        counter.inc(["ks", "0", "NewMasterSeen"]);
        counter.inc_by(["ks", "-80", "Shutdown"], 3);

        assert_eq!(counter.get(["ks", "0", "NewMasterSeen"]), 2);
        assert_eq!(counter.get(["ks", "-80", "Shutdown"]), 3);
        assert_eq!(counter.get(["ks", "0", "Shutdown"]), 0);

        let all = counter.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0[1], "-80");
    }

    #[test]
    fn test_labeled_counter_set_zero() {
        let counter = LabeledCounter::<2>::new("BufferStarts", "Starts", ["Keyspace", "ShardName"]);

        assert!(!counter.contains(["ks", "0"]));
        counter.set(["ks", "0"], 0);
        assert!(counter.contains(["ks", "0"]));
        assert_eq!(counter.get(["ks", "0"]), 0);

        counter.inc(["ks", "0"]);
        assert_eq!(counter.get(["ks", "0"]), 1);
    }
}
