//! Gauge metric: atom snapshots per bucket.
//!
//! Three sampling modes: ON_TRIGGER (a trigger matcher fires),
//! ON_CONDITION_CHANGED (condition transitions to true), FIRST_N_SAMPLES
//! (keep the first N samples of each bucket). Pulled gauges request
//! samples from the puller and route them back through the normal matched-
//! event path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::GaugeSamplingType;
use crate::types::dimension::MetricDimensionKey;
use crate::types::event::{Event, EventField};

/// One sampled field tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeAtom {
    pub elapsed_timestamp_ns: i64,
    pub fields: Vec<EventField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub atoms: Vec<GaugeAtom>,
}

#[derive(Debug, Clone)]
pub struct GaugeMetricState {
    pub sampling: GaugeSamplingType,
    pub trigger_matcher_index: Option<usize>,
    pub max_atoms_per_bucket: usize,
    /// Set when the what-atom is pulled.
    pub pull_atom_id: Option<i32>,
    /// Pushed ON_CONDITION_CHANGED mode: the condition just turned true
    /// and the next arriving atom should be sampled.
    pub pending_sample: bool,
    current: HashMap<MetricDimensionKey, Vec<GaugeAtom>>,
    pub past_buckets: HashMap<MetricDimensionKey, Vec<GaugeBucket>>,
}

impl GaugeMetricState {
    pub fn new(
        sampling: GaugeSamplingType,
        trigger_matcher_index: Option<usize>,
        max_atoms_per_bucket: usize,
        pull_atom_id: Option<i32>,
    ) -> Self {
        Self {
            sampling,
            trigger_matcher_index,
            max_atoms_per_bucket,
            pull_atom_id,
            pending_sample: false,
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

    /// Keep a sample unless the bucket's cap is reached.
    pub fn sample(&mut self, key: &MetricDimensionKey, event: &Event) {
        let atoms = self.current.entry(key.clone()).or_default();
        if atoms.len() >= self.max_atoms_per_bucket {
            return;
        }
        atoms.push(GaugeAtom {
            elapsed_timestamp_ns: event.elapsed_timestamp_ns,
            fields: event.fields.clone(),
        });
    }

    pub fn flush_current_bucket(&mut self, bucket_start_ns: i64, bucket_end_ns: i64) {
        for (key, atoms) in self.current.drain() {
            if atoms.is_empty() {
                continue;
            }
            self.past_buckets
                .entry(key)
                .or_default()
                .push(GaugeBucket {
                    bucket_start_ns,
                    bucket_end_ns,
                    atoms,
                });
        }
    }

    pub fn clear_past_buckets(&mut self) {
        self.past_buckets.clear();
    }

    pub fn byte_size(&self) -> usize {
        self.past_buckets
            .values()
            .flat_map(|buckets| buckets.iter())
            .map(|b| b.atoms.iter().map(|a| a.fields.len() * 32 + 16).sum::<usize>())
            .sum()
    }
}
