//! Count metric aggregation
//!
//! Per what-dimension, an i64 counter in the current bucket. Increments are
//! gated by the metric's condition. Partial buckets (app-upgrade splits)
//! accumulate into `current_full_counters`, which is handed to anomaly
//! trackers only when a full bucket boundary closes, so a split bucket
//! merges with its predecessor for anomaly purposes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::anomaly::AnomalyTracker;
use crate::types::dimension::MetricDimensionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CountMetricState {
    /// Working counters for the current (possibly partial) bucket.
    current: HashMap<MetricDimensionKey, i64>,
    /// Counters accumulated since the last full bucket boundary.
    current_full_counters: HashMap<MetricDimensionKey, i64>,
    pub past_buckets: HashMap<MetricDimensionKey, Vec<CountBucket>>,
}

impl CountMetricState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimension_count(&self) -> usize {
        self.current.len().max(self.past_buckets.len())
    }

    pub fn has_dimension(&self, key: &MetricDimensionKey) -> bool {
        self.current.contains_key(key) || self.past_buckets.contains_key(key)
    }

    /// Count one matched event; returns the full-bucket counter value used
    /// for anomaly detection.
    pub fn count(&mut self, key: &MetricDimensionKey) -> i64 {
        let counter = self.current.entry(key.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        let full = self.current_full_counters.get(key).copied().unwrap_or(0);
        full.saturating_add(*counter)
    }

    /// Close the working bucket at `bucket_end_ns`. When `full_boundary`
    /// is set the accumulated full-bucket counters go to the anomaly
    /// trackers under `bucket_num` and reset; otherwise they keep
    /// accumulating across the split.
    pub fn flush_current_bucket(
        &mut self,
        bucket_start_ns: i64,
        bucket_end_ns: i64,
        full_boundary: bool,
        bucket_num: i64,
        anomaly_trackers: &mut [AnomalyTracker],
    ) {
        for (key, count) in self.current.drain() {
            if count != 0 {
                self.past_buckets
                    .entry(key.clone())
                    .or_default()
                    .push(CountBucket {
                        bucket_start_ns,
                        bucket_end_ns,
                        count,
                    });
            }
            *self.current_full_counters.entry(key).or_insert(0) += count;
        }

        if full_boundary {
            let full = std::mem::take(&mut self.current_full_counters);
            for tracker in anomaly_trackers.iter_mut() {
                tracker.add_past_bucket(full.clone(), bucket_num);
            }
        }
    }

    pub fn clear_past_buckets(&mut self) {
        self.past_buckets.clear();
    }

    pub fn byte_size(&self) -> usize {
        self.past_buckets
            .values()
            .map(|v| v.len() * std::mem::size_of::<CountBucket>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_key() -> MetricDimensionKey {
        MetricDimensionKey::default()
    }

    #[test]
    fn test_counts_accumulate_and_flush() {
        let mut state = CountMetricState::new();
        let key = default_key();
        assert_eq!(state.count(&key), 1);
        assert_eq!(state.count(&key), 2);

        state.flush_current_bucket(10, 70, true, 0, &mut []);
        let buckets = &state.past_buckets[&key];
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].bucket_start_ns, 10);
        assert_eq!(buckets[0].bucket_end_ns, 70);

        // Working counter reset.
        assert_eq!(state.count(&key), 1);
    }

    #[test]
    fn test_partial_buckets_merge_for_anomaly() {
        let mut state = CountMetricState::new();
        let key = default_key();
        state.count(&key);
        // Partial split: no anomaly handoff yet.
        state.flush_current_bucket(10, 40, false, 0, &mut []);
        // Counter continues in the split remainder; full counter carries.
        assert_eq!(state.count(&key), 2);
        state.flush_current_bucket(40, 70, true, 0, &mut []);

        // Two past buckets recorded, each with its own partial count.
        let buckets = &state.past_buckets[&key];
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].count, 1);
        assert_eq!(buckets[1].count, 1);
    }
}
