//! Duration metric: start/stop timing per what-dimension.
//!
//! The metric's `what` is a predicate; its start/stop/stop-all matchers
//! drive a [`DurationTracker`] per what-dimension. Instances within a
//! dimension (distinct wakelocks of one package) are keyed by the
//! predicate's output dimensions. Anomaly detection uses the duration
//! variant with predicted-crossing alarms.

use std::collections::HashMap;

use crate::anomaly::DurationAnomalyTracker;
use crate::condition::ConditionWizard;
use crate::config::{Dimensions, DurationAggregation};
use crate::types::dimension::{HashableDimensionKey, MetricDimensionKey};

use super::duration_trackers::{
    DurationBucket, DurationTracker, MaxDurationTracker, OringDurationTracker,
};

#[derive(Debug, Clone)]
pub struct DurationMetricState {
    pub aggregation: DurationAggregation,
    /// Count nested starts (from the predicate config).
    pub nested: bool,
    pub start_index: usize,
    pub stop_index: Option<usize>,
    pub stop_all_index: Option<usize>,
    /// Instance key selectors: the predicate's output dimensions.
    pub internal_dimensions: Dimensions,
    trackers: HashMap<MetricDimensionKey, DurationTracker>,
    pub past_buckets: HashMap<MetricDimensionKey, Vec<DurationBucket>>,
    pub anomaly_trackers: Vec<DurationAnomalyTracker>,
}

impl DurationMetricState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregation: DurationAggregation,
        nested: bool,
        start_index: usize,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        internal_dimensions: Dimensions,
    ) -> Self {
        Self {
            aggregation,
            nested,
            start_index,
            stop_index,
            stop_all_index,
            internal_dimensions,
            trackers: HashMap::new(),
            past_buckets: HashMap::new(),
            anomaly_trackers: Vec::new(),
        }
    }

    pub fn dimension_count(&self) -> usize {
        self.trackers.len().max(self.past_buckets.len())
    }

    pub fn has_dimension(&self, key: &MetricDimensionKey) -> bool {
        self.trackers.contains_key(key) || self.past_buckets.contains_key(key)
    }

    fn make_tracker(&self, bucket_start_ns: i64, bucket_size_ns: i64) -> DurationTracker {
        match self.aggregation {
            DurationAggregation::Sum => DurationTracker::Oring(OringDurationTracker::new(
                self.nested,
                bucket_start_ns,
                bucket_size_ns,
            )),
            DurationAggregation::MaxSparse => DurationTracker::Max(MaxDurationTracker::new(
                false,
                bucket_start_ns,
                bucket_size_ns,
            )),
            DurationAggregation::MinSparse => DurationTracker::Max(MaxDurationTracker::new(
                true,
                bucket_start_ns,
                bucket_size_ns,
            )),
        }
    }

    /// Start timing one instance under `key`.
    #[allow(clippy::too_many_arguments)]
    pub fn note_start(
        &mut self,
        key: &MetricDimensionKey,
        internal_key: &HashableDimensionKey,
        condition: bool,
        condition_key: HashableDimensionKey,
        event_time_ns: i64,
        bucket_start_ns: i64,
        bucket_size_ns: i64,
    ) {
        if !self.trackers.contains_key(key) {
            let tracker = self.make_tracker(bucket_start_ns, bucket_size_ns);
            self.trackers.insert(key.clone(), tracker);
        }
        if let Some(tracker) = self.trackers.get_mut(key) {
            tracker.note_start(internal_key, condition, event_time_ns, condition_key);
        }
        self.reschedule_alarms(key, event_time_ns);
    }

    pub fn note_stop(
        &mut self,
        key: &MetricDimensionKey,
        internal_key: &HashableDimensionKey,
        event_time_ns: i64,
    ) {
        if let Some(tracker) = self.trackers.get_mut(key) {
            tracker.note_stop(internal_key, event_time_ns, false);
        }
        self.reschedule_alarms(key, event_time_ns);
    }

    pub fn note_stop_all(&mut self, event_time_ns: i64) {
        let keys: Vec<MetricDimensionKey> = self.trackers.keys().cloned().collect();
        for key in &keys {
            if let Some(tracker) = self.trackers.get_mut(key) {
                tracker.note_stop_all(event_time_ns);
            }
            self.reschedule_alarms(key, event_time_ns);
        }
    }

    /// Reprogram predicted-crossing alarms for `key` after a state change.
    fn reschedule_alarms(&mut self, key: &MetricDimensionKey, now_ns: i64) {
        let Some(tracker) = self.trackers.get(key) else {
            return;
        };
        let running = tracker.has_started();
        let predictions: Vec<i64> = self
            .anomaly_trackers
            .iter()
            .map(|a| tracker.predict_anomaly_timestamp_ns(a.inner(), key, now_ns))
            .collect();
        for (anomaly, predicted) in self.anomaly_trackers.iter_mut().zip(predictions) {
            if running && predicted < i64::MAX {
                anomaly.start_alarm(key, predicted);
            } else {
                anomaly.stop_alarm(key);
            }
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        let keys: Vec<MetricDimensionKey> = self.trackers.keys().cloned().collect();
        for key in &keys {
            if let Some(tracker) = self.trackers.get_mut(key) {
                tracker.on_condition_changed(condition, timestamp_ns);
            }
            self.reschedule_alarms(key, timestamp_ns);
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        wizard: ConditionWizard<'_>,
        condition_index: usize,
        timestamp_ns: i64,
    ) {
        let keys: Vec<MetricDimensionKey> = self.trackers.keys().cloned().collect();
        for key in &keys {
            if let Some(tracker) = self.trackers.get_mut(key) {
                tracker.on_sliced_condition_may_change(wizard, condition_index, timestamp_ns);
            }
            self.reschedule_alarms(key, timestamp_ns);
        }
    }

    /// Flush whole buckets on every tracker; emitted buckets land in
    /// `past_buckets` and their sums feed the anomaly ring.
    pub fn flush_if_needed(&mut self, event_time_ns: i64, time_base_ns: i64, bucket_size_ns: i64) {
        let keys: Vec<MetricDimensionKey> = self.trackers.keys().cloned().collect();
        for key in keys {
            let mut out = Vec::new();
            let remove = self
                .trackers
                .get_mut(&key)
                .is_some_and(|t| t.flush_if_needed(event_time_ns, &mut out));
            self.commit_buckets(&key, out, time_base_ns, bucket_size_ns);
            if remove {
                self.trackers.remove(&key);
                for anomaly in self.anomaly_trackers.iter_mut() {
                    anomaly.stop_alarm(&key);
                }
            }
        }
    }

    /// Partial split: close every tracker's bucket at `event_time_ns`.
    pub fn flush_current_bucket(
        &mut self,
        event_time_ns: i64,
        next_bucket_start_ns: i64,
        time_base_ns: i64,
        bucket_size_ns: i64,
    ) {
        let keys: Vec<MetricDimensionKey> = self.trackers.keys().cloned().collect();
        for key in keys {
            let mut out = Vec::new();
            let remove = self
                .trackers
                .get_mut(&key)
                .is_some_and(|t| t.flush_current_bucket(event_time_ns, next_bucket_start_ns, &mut out));
            self.commit_buckets(&key, out, time_base_ns, bucket_size_ns);
            if remove {
                self.trackers.remove(&key);
                for anomaly in self.anomaly_trackers.iter_mut() {
                    anomaly.stop_alarm(&key);
                }
            }
        }
    }

    fn commit_buckets(
        &mut self,
        key: &MetricDimensionKey,
        buckets: Vec<DurationBucket>,
        time_base_ns: i64,
        bucket_size_ns: i64,
    ) {
        if buckets.is_empty() {
            return;
        }
        for bucket in &buckets {
            let bucket_num = (bucket.bucket_start_ns - time_base_ns) / bucket_size_ns;
            for anomaly in self.anomaly_trackers.iter_mut() {
                anomaly
                    .inner_mut()
                    .add_past_bucket_value(key, bucket.duration_ns, bucket_num);
            }
        }
        self.past_buckets.entry(key.clone()).or_default().extend(buckets);
    }

    /// Expired-alarm sweep, driven by the alarm service through the
    /// manager.
    pub fn inform_alarms_fired(
        &mut self,
        timestamp_ns: i64,
        fired: &mut std::collections::HashSet<u64>,
    ) {
        for anomaly in self.anomaly_trackers.iter_mut() {
            anomaly.inform_alarms_fired(timestamp_ns, fired);
        }
    }

    pub fn clear_past_buckets(&mut self) {
        self.past_buckets.clear();
    }

    /// Take over the live trackers of the state this one replaces across a
    /// config update.
    pub fn adopt_trackers(&mut self, old: DurationMetricState) {
        self.trackers = old.trackers;
    }

    pub fn byte_size(&self) -> usize {
        self.past_buckets
            .values()
            .map(|v| v.len() * std::mem::size_of::<DurationBucket>())
            .sum()
    }
}
