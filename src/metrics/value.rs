//! Value metric aggregation
//!
//! Each matched sample contributes a numeric value extracted from a
//! configured field. Pushed atoms record the value itself; pulled atoms
//! establish a base at bucket start and contribute `end - base` pairs at
//! bucket boundaries. A bucket whose pull failed (or whose clock went
//! backwards) is emitted tainted, with the flag but no trusted value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::anomaly::AnomalyTracker;
use crate::config::ValueAggregation;
use crate::types::dimension::MetricDimensionKey;
use crate::types::event::{Event, FieldPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub value: i64,
    pub tainted: bool,
}

/// Working accumulator for one dimension in the current bucket.
#[derive(Debug, Clone, Default)]
pub struct ValueInterval {
    /// (start_value, end_value) pairs; pushed samples use start 0.
    pub raw: Vec<(i64, i64)>,
    /// Base established by the bucket-start pull, for pulled atoms.
    base: Option<i64>,
    pub tainted: bool,
}

#[derive(Debug, Clone)]
pub struct ValueMetricState {
    value_field: FieldPath,
    aggregation: ValueAggregation,
    /// Set when the metric's what-atom is pulled.
    pub pull_atom_id: Option<i32>,
    current: HashMap<MetricDimensionKey, ValueInterval>,
    pub past_buckets: HashMap<MetricDimensionKey, Vec<ValueBucket>>,
}

impl ValueMetricState {
    pub fn new(
        value_field: FieldPath,
        aggregation: ValueAggregation,
        pull_atom_id: Option<i32>,
    ) -> Self {
        Self {
            value_field,
            aggregation,
            pull_atom_id,
            current: HashMap::new(),
            past_buckets: HashMap::new(),
        }
    }

    pub fn dimension_count(&self) -> usize {
        self.current.len().max(self.past_buckets.len())
    }

    pub fn has_dimension(&self, key: &MetricDimensionKey) -> bool {
        self.current.contains_key(key) || self.past_buckets.contains_key(key)
    }

    fn sample_value(&self, event: &Event) -> Option<i64> {
        event.value_at(&self.value_field).and_then(|v| v.as_long())
    }

    /// Record one pushed sample.
    pub fn note_pushed(&mut self, key: &MetricDimensionKey, event: &Event) {
        let Some(value) = self.sample_value(event) else {
            warn!("Value metric sample missing numeric value field");
            return;
        };
        let interval = self.current.entry(key.clone()).or_default();
        interval.raw.push((0, value));
    }

    /// Record a pulled sample: the first pull of a bucket establishes the
    /// base, later pulls close a (base, end) pair and re-base.
    pub fn note_pulled(&mut self, key: &MetricDimensionKey, event: &Event) {
        let Some(value) = self.sample_value(event) else {
            return;
        };
        let interval = self.current.entry(key.clone()).or_default();
        match interval.base {
            None => interval.base = Some(value),
            Some(base) => {
                if value < base {
                    // Counter reset upstream; the diff is meaningless.
                    interval.tainted = true;
                }
                interval.raw.push((base, value));
                interval.base = Some(value);
            }
        }
    }

    /// Mark every open interval tainted (pull failure).
    pub fn taint_current(&mut self) {
        for interval in self.current.values_mut() {
            interval.tainted = true;
        }
    }

    fn aggregate_interval(aggregation: ValueAggregation, interval: &ValueInterval) -> Option<i64> {
        let contributions: Vec<i64> = interval
            .raw
            .iter()
            .map(|(start, end)| end.saturating_sub(*start))
            .collect();
        if contributions.is_empty() {
            return None;
        }
        Some(match aggregation {
            ValueAggregation::Sum => contributions
                .iter()
                .fold(0i64, |acc, v| acc.saturating_add(*v)),
            ValueAggregation::Max => contributions.iter().copied().max().unwrap_or(0),
            ValueAggregation::Min => contributions.iter().copied().min().unwrap_or(0),
            ValueAggregation::Avg => {
                let sum: i64 = contributions
                    .iter()
                    .fold(0i64, |acc, v| acc.saturating_add(*v));
                sum / contributions.len() as i64
            }
        })
    }

    /// Close the working bucket. Tainted intervals emit the taint flag and
    /// no value. Pulled bases survive across full boundaries so the next
    /// bucket diffs from the last observed sample.
    pub fn flush_current_bucket(
        &mut self,
        bucket_start_ns: i64,
        bucket_end_ns: i64,
        full_boundary: bool,
        bucket_num: i64,
        anomaly_trackers: &mut [AnomalyTracker],
    ) {
        let keys: Vec<MetricDimensionKey> = self.current.keys().cloned().collect();
        let mut bucket_values: HashMap<MetricDimensionKey, i64> = HashMap::new();
        let aggregation = self.aggregation;
        for key in keys {
            let (tainted, aggregate, had_samples, keep) = {
                let Some(interval) = self.current.get_mut(&key) else {
                    continue;
                };
                let tainted = interval.tainted;
                let aggregate = if tainted {
                    None
                } else {
                    Self::aggregate_interval(aggregation, interval)
                };
                let had_samples = !interval.raw.is_empty() || tainted;
                interval.raw.clear();
                interval.tainted = false;
                (tainted, aggregate, had_samples, interval.base.is_some())
            };

            if had_samples {
                let value = aggregate.unwrap_or(0);
                self.past_buckets
                    .entry(key.clone())
                    .or_default()
                    .push(ValueBucket {
                        bucket_start_ns,
                        bucket_end_ns,
                        value,
                        tainted,
                    });
                if !tainted {
                    bucket_values.insert(key.clone(), value);
                }
            }

            // Pushed keys are done once flushed; pulled keys keep their base.
            if !keep {
                self.current.remove(&key);
            }
        }

        if full_boundary && !bucket_values.is_empty() {
            for tracker in anomaly_trackers.iter_mut() {
                tracker.add_past_bucket(bucket_values.clone(), bucket_num);
            }
        }
    }

    pub fn clear_past_buckets(&mut self) {
        self.past_buckets.clear();
    }

    pub fn byte_size(&self) -> usize {
        self.past_buckets
            .values()
            .map(|v| v.len() * std::mem::size_of::<ValueBucket>())
            .sum()
    }
}
