//! Duration trackers
//!
//! Per-what-dimension state machines converting start/stop events plus a
//! condition signal into accumulated durations. Two variants:
//!
//! - [`OringDurationTracker`]: reports the union of all "any instance
//!   started" intervals per bucket, with nest counting. Used for SUM
//!   aggregation, where overlapping instances must not double count.
//! - [`MaxDurationTracker`]: tracks each instance separately and reports
//!   the extreme (max, or min for sparse-min aggregation) accumulated
//!   duration observed in the bucket.
//!
//! Instances inside one what-dimension are distinguished by an internal
//! key (the predicate's output dimension). Each instance walks
//! Stopped -> Started -> Paused transitions; a paused instance has started
//! but its condition is currently false.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::anomaly::AnomalyTracker;
use crate::condition::ConditionWizard;
use crate::types::condition::ConditionState;
use crate::types::dimension::{HashableDimensionKey, MetricDimensionKey};

/// One emitted duration bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBucket {
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub duration_ns: i64,
}

/// Lifecycle of one tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationState {
    Stopped,
    Started,
    Paused,
}

// ============================================================================
// OringDurationTracker
// ============================================================================

/// Union-of-intervals duration tracker with nest counting.
#[derive(Debug, Clone)]
pub struct OringDurationTracker {
    nested: bool,
    bucket_size_ns: i64,
    current_bucket_start_ns: i64,
    /// Nest count per started instance.
    started: HashMap<HashableDimensionKey, i64>,
    /// Nest count per instance waiting on its condition.
    paused: HashMap<HashableDimensionKey, i64>,
    /// Condition key recorded per instance for sliced-condition queries.
    condition_keys: HashMap<HashableDimensionKey, HashableDimensionKey>,
    /// Start of the current "something is running" interval.
    last_start_time_ns: i64,
    /// Duration banked in the current bucket.
    duration_ns: i64,
}

impl OringDurationTracker {
    pub fn new(nested: bool, current_bucket_start_ns: i64, bucket_size_ns: i64) -> Self {
        Self {
            nested,
            bucket_size_ns,
            current_bucket_start_ns,
            started: HashMap::new(),
            paused: HashMap::new(),
            condition_keys: HashMap::new(),
            last_start_time_ns: 0,
            duration_ns: 0,
        }
    }

    pub fn has_started(&self) -> bool {
        !self.started.is_empty()
    }

    /// Whether the tracker holds nothing worth keeping.
    pub fn is_idle(&self) -> bool {
        self.started.is_empty() && self.paused.is_empty() && self.duration_ns == 0
    }

    pub fn note_start(
        &mut self,
        key: &HashableDimensionKey,
        condition: bool,
        event_time_ns: i64,
        condition_key: HashableDimensionKey,
    ) {
        self.condition_keys.insert(key.clone(), condition_key);
        if condition {
            if self.started.is_empty() {
                self.last_start_time_ns = event_time_ns;
            }
            let entry = self.started.entry(key.clone()).or_insert(0);
            if self.nested || *entry == 0 {
                *entry += 1;
            }
        } else {
            let entry = self.paused.entry(key.clone()).or_insert(0);
            if self.nested || *entry == 0 {
                *entry += 1;
            }
        }
    }

    pub fn note_stop(&mut self, key: &HashableDimensionKey, event_time_ns: i64, stop_all: bool) {
        if let Some(count) = self.started.get_mut(key) {
            if !self.nested || stop_all {
                *count = 0;
            } else {
                *count -= 1;
            }
            if *count <= 0 {
                self.started.remove(key);
                self.condition_keys.remove(key);
                if self.started.is_empty() {
                    // The union interval ends here.
                    self.duration_ns += event_time_ns - self.last_start_time_ns;
                    debug!(duration_ns = self.duration_ns, "Oring interval closed");
                }
            }
        }
        if let Some(count) = self.paused.get_mut(key) {
            if !self.nested || stop_all {
                *count = 0;
            } else {
                *count -= 1;
            }
            if *count <= 0 {
                self.paused.remove(key);
                self.condition_keys.remove(key);
            }
        }
    }

    pub fn note_stop_all(&mut self, event_time_ns: i64) {
        let keys: Vec<HashableDimensionKey> = self
            .started
            .keys()
            .chain(self.paused.keys())
            .cloned()
            .collect();
        for key in keys {
            self.note_stop(&key, event_time_ns, true);
        }
    }

    /// Unsliced condition flipped for every instance at once.
    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        if condition {
            if !self.paused.is_empty() {
                if self.started.is_empty() {
                    self.last_start_time_ns = timestamp_ns;
                }
                let paused = std::mem::take(&mut self.paused);
                for (key, count) in paused {
                    *self.started.entry(key).or_insert(0) += count;
                }
            }
        } else if !self.started.is_empty() {
            self.duration_ns += timestamp_ns - self.last_start_time_ns;
            let started = std::mem::take(&mut self.started);
            for (key, count) in started {
                *self.paused.entry(key).or_insert(0) += count;
            }
        }
    }

    /// Sliced condition may have flipped per instance; re-query each one.
    pub fn on_sliced_condition_may_change(
        &mut self,
        wizard: ConditionWizard<'_>,
        condition_index: usize,
        timestamp_ns: i64,
    ) {
        // Started instances whose condition went false pause.
        let started_keys: Vec<HashableDimensionKey> = self.started.keys().cloned().collect();
        for key in started_keys {
            let condition_key = self.condition_keys.get(&key).cloned().unwrap_or_default();
            if wizard.query(condition_index, &condition_key) != ConditionState::True {
                if let Some(count) = self.started.remove(&key) {
                    if self.started.is_empty() {
                        self.duration_ns += timestamp_ns - self.last_start_time_ns;
                    }
                    *self.paused.entry(key).or_insert(0) += count;
                }
            }
        }
        // Paused instances whose condition went true resume.
        let paused_keys: Vec<HashableDimensionKey> = self.paused.keys().cloned().collect();
        for key in paused_keys {
            let condition_key = self.condition_keys.get(&key).cloned().unwrap_or_default();
            if wizard.query(condition_index, &condition_key) == ConditionState::True {
                if let Some(count) = self.paused.remove(&key) {
                    if self.started.is_empty() {
                        self.last_start_time_ns = timestamp_ns;
                    }
                    *self.started.entry(key).or_insert(0) += count;
                }
            }
        }
    }

    /// Close out whole buckets up to `event_time_ns`. Returns true when the
    /// tracker is idle afterwards and can be dropped.
    pub fn flush_if_needed(&mut self, event_time_ns: i64, out: &mut Vec<DurationBucket>) -> bool {
        let bucket_end = self.current_bucket_start_ns + self.bucket_size_ns;
        if event_time_ns < bucket_end {
            return false;
        }
        let num_buckets_forward = (event_time_ns - self.current_bucket_start_ns) / self.bucket_size_ns;

        if !self.started.is_empty() {
            self.duration_ns += bucket_end - self.last_start_time_ns;
        }
        if self.duration_ns > 0 {
            out.push(DurationBucket {
                bucket_start_ns: self.current_bucket_start_ns,
                bucket_end_ns: bucket_end,
                duration_ns: self.duration_ns,
            });
        }
        // A still-running interval spans every bucket in between.
        if !self.started.is_empty() {
            for i in 1..num_buckets_forward {
                out.push(DurationBucket {
                    bucket_start_ns: self.current_bucket_start_ns + i * self.bucket_size_ns,
                    bucket_end_ns: bucket_end + i * self.bucket_size_ns,
                    duration_ns: self.bucket_size_ns,
                });
            }
        }

        self.current_bucket_start_ns += num_buckets_forward * self.bucket_size_ns;
        self.last_start_time_ns = self.current_bucket_start_ns;
        self.duration_ns = 0;
        self.started.is_empty() && self.paused.is_empty()
    }

    /// Force a partial bucket ending at `event_time_ns`; the next bucket
    /// starts at `next_bucket_start_ns`.
    pub fn flush_current_bucket(
        &mut self,
        event_time_ns: i64,
        next_bucket_start_ns: i64,
        out: &mut Vec<DurationBucket>,
    ) -> bool {
        if !self.started.is_empty() {
            self.duration_ns += event_time_ns - self.last_start_time_ns;
        }
        if self.duration_ns > 0 {
            out.push(DurationBucket {
                bucket_start_ns: self.current_bucket_start_ns,
                bucket_end_ns: event_time_ns,
                duration_ns: self.duration_ns,
            });
        }
        self.current_bucket_start_ns = next_bucket_start_ns;
        self.last_start_time_ns = next_bucket_start_ns;
        self.duration_ns = 0;
        self.started.is_empty() && self.paused.is_empty()
    }

    /// Earliest future timestamp at which the alert's windowed sum would
    /// cross its threshold, assuming the current started interval runs on.
    pub fn predict_anomaly_timestamp_ns(
        &self,
        anomaly: &AnomalyTracker,
        event_key: &MetricDimensionKey,
        now_ns: i64,
    ) -> i64 {
        if self.started.is_empty() {
            return i64::MAX;
        }
        let current = self.duration_ns + (now_ns - self.last_start_time_ns);
        let sum = anomaly.sum_over_past_buckets(event_key) + current;
        let remaining = anomaly.threshold().saturating_sub(sum).max(0);
        now_ns.saturating_add(remaining).saturating_add(1)
    }
}

// ============================================================================
// MaxDurationTracker
// ============================================================================

/// Per-instance duration tracker reporting the extreme accumulated
/// duration in each bucket.
#[derive(Debug, Clone)]
pub struct MaxDurationTracker {
    /// Minimize instead of maximize (sparse-min aggregation).
    minimize: bool,
    bucket_size_ns: i64,
    current_bucket_start_ns: i64,
    infos: HashMap<HashableDimensionKey, DurationInfo>,
    /// Extreme duration recorded in the current bucket; `None` until any
    /// instance completes or flushes.
    extreme_ns: Option<i64>,
}

#[derive(Debug, Clone)]
struct DurationInfo {
    state: DurationState,
    last_start_time_ns: i64,
    last_duration_ns: i64,
    condition_key: HashableDimensionKey,
}

impl MaxDurationTracker {
    pub fn new(minimize: bool, current_bucket_start_ns: i64, bucket_size_ns: i64) -> Self {
        Self {
            minimize,
            bucket_size_ns,
            current_bucket_start_ns,
            infos: HashMap::new(),
            extreme_ns: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.infos.is_empty() && self.extreme_ns.is_none()
    }

    pub fn has_started(&self) -> bool {
        self.infos.values().any(|i| i.state == DurationState::Started)
    }

    fn fold(&mut self, candidate_ns: i64) {
        self.extreme_ns = Some(match self.extreme_ns {
            None => candidate_ns,
            Some(current) => {
                if self.minimize {
                    current.min(candidate_ns)
                } else {
                    current.max(candidate_ns)
                }
            }
        });
    }

    pub fn note_start(
        &mut self,
        key: &HashableDimensionKey,
        condition: bool,
        event_time_ns: i64,
        condition_key: HashableDimensionKey,
    ) {
        let info = self.infos.entry(key.clone()).or_insert(DurationInfo {
            state: DurationState::Stopped,
            last_start_time_ns: 0,
            last_duration_ns: 0,
            condition_key: HashableDimensionKey::default_key(),
        });
        info.condition_key = condition_key;
        match info.state {
            // Nesting is not counted here; a repeated start is the same
            // instance still running.
            DurationState::Started | DurationState::Paused => {}
            DurationState::Stopped => {
                if condition {
                    info.state = DurationState::Started;
                    info.last_start_time_ns = event_time_ns;
                } else {
                    info.state = DurationState::Paused;
                }
            }
        }
    }

    pub fn note_stop(&mut self, key: &HashableDimensionKey, event_time_ns: i64, _stop_all: bool) {
        let Some(info) = self.infos.get_mut(key) else {
            return;
        };
        match info.state {
            DurationState::Stopped => {}
            DurationState::Started => {
                info.last_duration_ns += event_time_ns - info.last_start_time_ns;
                info.state = DurationState::Stopped;
            }
            DurationState::Paused => {
                info.state = DurationState::Stopped;
            }
        }
        let final_duration = info.last_duration_ns;
        if final_duration > 0 {
            self.fold(final_duration);
        }
        // A finished instance is forgotten; a new start with the same key
        // is a distinct instance.
        self.infos.remove(key);
    }

    pub fn note_stop_all(&mut self, event_time_ns: i64) {
        let keys: Vec<HashableDimensionKey> = self.infos.keys().cloned().collect();
        for key in keys {
            self.note_stop(&key, event_time_ns, true);
        }
    }

    fn note_condition_changed(
        info: &mut DurationInfo,
        condition: bool,
        timestamp_ns: i64,
    ) {
        match info.state {
            DurationState::Started => {
                if !condition {
                    info.state = DurationState::Paused;
                    info.last_duration_ns += timestamp_ns - info.last_start_time_ns;
                }
            }
            DurationState::Paused => {
                if condition {
                    info.state = DurationState::Started;
                    info.last_start_time_ns = timestamp_ns;
                }
            }
            DurationState::Stopped => {}
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        for info in self.infos.values_mut() {
            Self::note_condition_changed(info, condition, timestamp_ns);
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        wizard: ConditionWizard<'_>,
        condition_index: usize,
        timestamp_ns: i64,
    ) {
        for info in self.infos.values_mut() {
            if info.state == DurationState::Stopped {
                continue;
            }
            let met = wizard.query(condition_index, &info.condition_key) == ConditionState::True;
            Self::note_condition_changed(info, met, timestamp_ns);
        }
    }

    /// Close out whole buckets up to `event_time_ns`. Returns true when no
    /// pending instance remains.
    pub fn flush_if_needed(&mut self, event_time_ns: i64, out: &mut Vec<DurationBucket>) -> bool {
        let bucket_end = self.current_bucket_start_ns + self.bucket_size_ns;
        if event_time_ns < bucket_end {
            return false;
        }
        let num_buckets_forward = (event_time_ns - self.current_bucket_start_ns) / self.bucket_size_ns;
        let old_bucket_start = self.current_bucket_start_ns;
        self.current_bucket_start_ns += num_buckets_forward * self.bucket_size_ns;

        let mut has_ongoing_started = false;
        let mut has_pending = false;
        let keys: Vec<HashableDimensionKey> = self.infos.keys().cloned().collect();
        for key in keys {
            let Some(info) = self.infos.get_mut(&key) else {
                continue;
            };
            let mut final_duration = info.last_duration_ns;
            if info.state == DurationState::Started {
                final_duration += bucket_end - info.last_start_time_ns;
                has_ongoing_started = true;
            }
            if final_duration > 0 {
                let minimize = self.minimize;
                let extreme = &mut self.extreme_ns;
                *extreme = Some(match *extreme {
                    None => final_duration,
                    Some(current) => {
                        if minimize {
                            current.min(final_duration)
                        } else {
                            current.max(final_duration)
                        }
                    }
                });
            }
            if info.state == DurationState::Stopped {
                self.infos.remove(&key);
            } else {
                has_pending = true;
                info.last_start_time_ns = self.current_bucket_start_ns;
                info.last_duration_ns = 0;
            }
        }

        if let Some(extreme) = self.extreme_ns.take() {
            out.push(DurationBucket {
                bucket_start_ns: old_bucket_start,
                bucket_end_ns: bucket_end,
                duration_ns: extreme,
            });
        }
        // A still-running instance spans every bucket in between.
        if has_ongoing_started {
            for i in 1..num_buckets_forward {
                out.push(DurationBucket {
                    bucket_start_ns: old_bucket_start + i * self.bucket_size_ns,
                    bucket_end_ns: bucket_end + i * self.bucket_size_ns,
                    duration_ns: self.bucket_size_ns,
                });
            }
        }
        !has_pending
    }

    /// Force a partial bucket ending at `event_time_ns`.
    pub fn flush_current_bucket(
        &mut self,
        event_time_ns: i64,
        next_bucket_start_ns: i64,
        out: &mut Vec<DurationBucket>,
    ) -> bool {
        let old_bucket_start = self.current_bucket_start_ns;
        let mut has_pending = false;
        let keys: Vec<HashableDimensionKey> = self.infos.keys().cloned().collect();
        for key in keys {
            let Some(info) = self.infos.get_mut(&key) else {
                continue;
            };
            let mut final_duration = info.last_duration_ns;
            if info.state == DurationState::Started {
                final_duration += event_time_ns - info.last_start_time_ns;
            }
            if final_duration > 0 {
                let minimize = self.minimize;
                let extreme = &mut self.extreme_ns;
                *extreme = Some(match *extreme {
                    None => final_duration,
                    Some(current) => {
                        if minimize {
                            current.min(final_duration)
                        } else {
                            current.max(final_duration)
                        }
                    }
                });
            }
            if info.state == DurationState::Stopped {
                self.infos.remove(&key);
            } else {
                has_pending = true;
                info.last_start_time_ns = next_bucket_start_ns;
                info.last_duration_ns = 0;
            }
        }
        if let Some(extreme) = self.extreme_ns.take() {
            out.push(DurationBucket {
                bucket_start_ns: old_bucket_start,
                bucket_end_ns: event_time_ns,
                duration_ns: extreme,
            });
        }
        self.current_bucket_start_ns = next_bucket_start_ns;
        !has_pending
    }

    /// Earliest future crossing among still-running instances.
    pub fn predict_anomaly_timestamp_ns(
        &self,
        anomaly: &AnomalyTracker,
        event_key: &MetricDimensionKey,
        now_ns: i64,
    ) -> i64 {
        let threshold = anomaly.threshold();
        let past = anomaly.sum_over_past_buckets(event_key);
        self.infos
            .values()
            .filter(|i| i.state == DurationState::Started)
            .map(|i| {
                let running = i.last_duration_ns + (now_ns - i.last_start_time_ns);
                let remaining = threshold.saturating_sub(past + running).max(0);
                now_ns.saturating_add(remaining).saturating_add(1)
            })
            .min()
            .unwrap_or(i64::MAX)
    }
}

// ============================================================================
// Dispatch enum
// ============================================================================

/// Tracker variant selected by the metric's aggregation type.
#[derive(Debug, Clone)]
pub enum DurationTracker {
    Oring(OringDurationTracker),
    Max(MaxDurationTracker),
}

impl DurationTracker {
    pub fn note_start(
        &mut self,
        key: &HashableDimensionKey,
        condition: bool,
        event_time_ns: i64,
        condition_key: HashableDimensionKey,
    ) {
        match self {
            DurationTracker::Oring(t) => t.note_start(key, condition, event_time_ns, condition_key),
            DurationTracker::Max(t) => t.note_start(key, condition, event_time_ns, condition_key),
        }
    }

    pub fn note_stop(&mut self, key: &HashableDimensionKey, event_time_ns: i64, stop_all: bool) {
        match self {
            DurationTracker::Oring(t) => t.note_stop(key, event_time_ns, stop_all),
            DurationTracker::Max(t) => t.note_stop(key, event_time_ns, stop_all),
        }
    }

    pub fn note_stop_all(&mut self, event_time_ns: i64) {
        match self {
            DurationTracker::Oring(t) => t.note_stop_all(event_time_ns),
            DurationTracker::Max(t) => t.note_stop_all(event_time_ns),
        }
    }

    pub fn on_condition_changed(&mut self, condition: bool, timestamp_ns: i64) {
        match self {
            DurationTracker::Oring(t) => t.on_condition_changed(condition, timestamp_ns),
            DurationTracker::Max(t) => t.on_condition_changed(condition, timestamp_ns),
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        wizard: ConditionWizard<'_>,
        condition_index: usize,
        timestamp_ns: i64,
    ) {
        match self {
            DurationTracker::Oring(t) => {
                t.on_sliced_condition_may_change(wizard, condition_index, timestamp_ns)
            }
            DurationTracker::Max(t) => {
                t.on_sliced_condition_may_change(wizard, condition_index, timestamp_ns)
            }
        }
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64, out: &mut Vec<DurationBucket>) -> bool {
        match self {
            DurationTracker::Oring(t) => t.flush_if_needed(event_time_ns, out),
            DurationTracker::Max(t) => t.flush_if_needed(event_time_ns, out),
        }
    }

    pub fn flush_current_bucket(
        &mut self,
        event_time_ns: i64,
        next_bucket_start_ns: i64,
        out: &mut Vec<DurationBucket>,
    ) -> bool {
        match self {
            DurationTracker::Oring(t) => {
                t.flush_current_bucket(event_time_ns, next_bucket_start_ns, out)
            }
            DurationTracker::Max(t) => {
                t.flush_current_bucket(event_time_ns, next_bucket_start_ns, out)
            }
        }
    }

    pub fn has_started(&self) -> bool {
        match self {
            DurationTracker::Oring(t) => t.has_started(),
            DurationTracker::Max(t) => t.has_started(),
        }
    }

    pub fn predict_anomaly_timestamp_ns(
        &self,
        anomaly: &AnomalyTracker,
        event_key: &MetricDimensionKey,
        now_ns: i64,
    ) -> i64 {
        match self {
            DurationTracker::Oring(t) => t.predict_anomaly_timestamp_ns(anomaly, event_key, now_ns),
            DurationTracker::Max(t) => t.predict_anomaly_timestamp_ns(anomaly, event_key, now_ns),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
