//! Anomaly trackers
//!
//! An alert watches one metric: it retains the last `num_buckets - 1`
//! per-dimension bucket sums in a circular array, keeps a rolling
//! `sum_over_past_buckets` map (zero entries pruned), and fires when the
//! rolling sum plus the current bucket's value exceeds the threshold. A
//! fired dimension key enters a refractory period during which further
//! declarations are suppressed.
//!
//! The duration-metric variant additionally schedules absolute-time alarms
//! through the injected [`AlarmMonitor`] so a long-running duration can
//! fire without waiting for the next event. Periodic alarms configured
//! directly (not through a metric) are handled by [`AlarmTracker`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Alarm, Alert, ConfigError, ConfigKey, Subscription};
use crate::external::{AlarmMonitor, ScheduledAlarm, SubscriberSink};
use crate::types::dimension::MetricDimensionKey;

pub const NS_PER_SEC: i64 = 1_000_000_000;

/// Per-dimension values a metric reported for one bucket.
pub type DimToValMap = HashMap<MetricDimensionKey, i64>;

// ============================================================================
// AnomalyTracker
// ============================================================================

/// Sliding-window threshold detector over a metric's past buckets.
#[derive(Clone)]
pub struct AnomalyTracker {
    alert: Alert,
    config_key: ConfigKey,
    /// Ring of the last `num_buckets - 1` bucket maps; length 0 when the
    /// alert watches only the current bucket.
    past_buckets: Vec<Option<DimToValMap>>,
    /// Rolling per-key sum across the retained buckets. Keys whose sum
    /// reaches zero are pruned.
    sum_over_past: HashMap<MetricDimensionKey, i64>,
    most_recent_bucket_num: i64,
    /// Second at which each key's refractory period ends.
    refractory_ends_sec: HashMap<MetricDimensionKey, i64>,
    subscriptions: Vec<Subscription>,
    sink: Arc<dyn SubscriberSink>,
}

impl std::fmt::Debug for AnomalyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyTracker")
            .field("alert", &self.alert.id)
            .field("most_recent_bucket_num", &self.most_recent_bucket_num)
            .field("tracked_keys", &self.sum_over_past.len())
            .finish()
    }
}

impl AnomalyTracker {
    /// Validates the alert and builds a tracker. A missing threshold or a
    /// non-positive bucket count rejects the alert.
    pub fn new(
        alert: Alert,
        config_key: ConfigKey,
        sink: Arc<dyn SubscriberSink>,
    ) -> Result<Self, ConfigError> {
        if alert.trigger_if_sum_gt.is_none() {
            return Err(ConfigError::MissingThreshold { id: alert.id });
        }
        if alert.num_buckets <= 0 {
            return Err(ConfigError::InvalidNumBuckets {
                id: alert.id,
                num_buckets: alert.num_buckets,
            });
        }
        let num_past_buckets = (alert.num_buckets - 1) as usize;
        Ok(Self {
            alert,
            config_key,
            past_buckets: vec![None; num_past_buckets],
            sum_over_past: HashMap::new(),
            most_recent_bucket_num: -1,
            refractory_ends_sec: HashMap::new(),
            subscriptions: Vec::new(),
            sink,
        })
    }

    pub fn alert_id(&self) -> i64 {
        self.alert.id
    }

    pub fn metric_id(&self) -> i64 {
        self.alert.metric_id
    }

    pub fn threshold(&self) -> i64 {
        self.alert.trigger_if_sum_gt.unwrap_or(i64::MAX)
    }

    pub fn num_past_buckets(&self) -> usize {
        self.past_buckets.len()
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn reset(&mut self) {
        let len = self.past_buckets.len();
        self.past_buckets.clear();
        self.past_buckets.resize(len, None);
        self.sum_over_past.clear();
        self.most_recent_bucket_num = -1;
    }

    fn index(&self, bucket_num: i64) -> usize {
        // Callers guard the ring being non-empty.
        (bucket_num as u64 % self.past_buckets.len() as u64) as usize
    }

    /// Rolling sum for one key across the retained buckets.
    pub fn sum_over_past_buckets(&self, key: &MetricDimensionKey) -> i64 {
        self.sum_over_past.get(key).copied().unwrap_or(0)
    }

    /// Value the ring holds for (key, bucket_num), for tests and reports.
    pub fn past_bucket_value(&self, key: &MetricDimensionKey, bucket_num: i64) -> i64 {
        if self.past_buckets.is_empty() {
            return 0;
        }
        self.past_buckets[self.index(bucket_num)]
            .as_ref()
            .and_then(|b| b.get(key).copied())
            .unwrap_or(0)
    }

    fn subtract_bucket_from_sum(
        sum: &mut HashMap<MetricDimensionKey, i64>,
        bucket: &Option<DimToValMap>,
    ) {
        let Some(bucket) = bucket else { return };
        for (key, value) in bucket {
            if let Some(entry) = sum.get_mut(key) {
                *entry -= value;
                if *entry == 0 {
                    sum.remove(key);
                }
            }
        }
    }

    fn add_bucket_to_sum(&mut self, bucket: &Option<DimToValMap>) {
        let Some(bucket) = bucket else { return };
        for (key, value) in bucket {
            *self.sum_over_past.entry(key.clone()).or_insert(0) += value;
        }
    }

    /// Retire ring slots that `latest_past_bucket_num` is about to step
    /// over, keeping the rolling sum consistent.
    fn flush_past_buckets(&mut self, latest_past_bucket_num: i64) -> bool {
        let n = self.past_buckets.len() as i64;
        if n == 0 {
            // Current-bucket-only alert: nothing retained.
            return false;
        }
        if latest_past_bucket_num <= self.most_recent_bucket_num - n {
            warn!(
                alert = self.alert.id,
                bucket = latest_past_bucket_num,
                "Ignoring past bucket too far in the past"
            );
            return false;
        }

        if latest_past_bucket_num - self.most_recent_bucket_num >= n {
            // The whole ring is stale.
            let len = self.past_buckets.len();
            self.past_buckets.clear();
            self.past_buckets.resize(len, None);
            self.sum_over_past.clear();
        } else {
            let from = (self.most_recent_bucket_num - n + 1).max(0);
            for i in from..=(latest_past_bucket_num - n) {
                let idx = self.index(i);
                let old = self.past_buckets[idx].take();
                Self::subtract_bucket_from_sum(&mut self.sum_over_past, &old);
            }
        }

        // Overwriting a retained slot is an update: back out its old values.
        if latest_past_bucket_num <= self.most_recent_bucket_num
            && latest_past_bucket_num > self.most_recent_bucket_num - n
        {
            let idx = self.index(latest_past_bucket_num);
            let old = self.past_buckets[idx].take();
            Self::subtract_bucket_from_sum(&mut self.sum_over_past, &old);
        }
        true
    }

    /// Install a full bucket map at `bucket_num`.
    pub fn add_past_bucket(&mut self, bucket: DimToValMap, bucket_num: i64) {
        if self.past_buckets.is_empty() {
            self.most_recent_bucket_num = self.most_recent_bucket_num.max(bucket_num);
            return;
        }
        if !self.flush_past_buckets(bucket_num) {
            return;
        }
        let idx = self.index(bucket_num);
        let bucket = Some(bucket);
        self.add_bucket_to_sum(&bucket);
        self.past_buckets[idx] = bucket;
        self.most_recent_bucket_num = self.most_recent_bucket_num.max(bucket_num);
    }

    /// Merge a single key's value into the bucket at `bucket_num`.
    pub fn add_past_bucket_value(
        &mut self,
        key: &MetricDimensionKey,
        value: i64,
        bucket_num: i64,
    ) {
        if self.past_buckets.is_empty() {
            self.most_recent_bucket_num = self.most_recent_bucket_num.max(bucket_num);
            return;
        }
        // A second value for the bucket we just installed merges in place;
        // anything else goes through the flush path.
        if bucket_num == self.most_recent_bucket_num
            && self.past_buckets[self.index(bucket_num)].is_some()
        {
            let idx = self.index(bucket_num);
            if let Some(bucket) = self.past_buckets[idx].as_mut() {
                *bucket.entry(key.clone()).or_insert(0) += value;
            }
            *self.sum_over_past.entry(key.clone()).or_insert(0) += value;
            if self.sum_over_past.get(key) == Some(&0) {
                self.sum_over_past.remove(key);
            }
            return;
        }
        if !self.flush_past_buckets(bucket_num) {
            return;
        }
        let idx = self.index(bucket_num);
        let mut bucket = DimToValMap::new();
        bucket.insert(key.clone(), value);
        let bucket = Some(bucket);
        self.add_bucket_to_sum(&bucket);
        self.past_buckets[idx] = bucket;
        self.most_recent_bucket_num = self.most_recent_bucket_num.max(bucket_num);
    }

    /// Whether any key's rolling sum plus its current-bucket value crosses
    /// the threshold. A gap since the last reported bucket inserts a null
    /// bucket so stale ring slots retire.
    pub fn detect_anomaly(&mut self, current_bucket_num: i64, current_bucket: &DimToValMap) -> bool {
        if current_bucket_num > self.most_recent_bucket_num + 1 {
            self.add_past_bucket(DimToValMap::new(), current_bucket_num - 1);
        }
        let threshold = self.threshold();
        current_bucket
            .iter()
            .any(|(key, value)| value + self.sum_over_past_buckets(key) > threshold)
            || self.sum_over_past.values().any(|&sum| sum > threshold)
    }

    /// Single-key variant of [`Self::detect_anomaly`].
    pub fn detect_anomaly_for_key(
        &mut self,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current_bucket_value: i64,
    ) -> bool {
        if current_bucket_num > self.most_recent_bucket_num + 1 {
            self.add_past_bucket(DimToValMap::new(), current_bucket_num - 1);
        }
        self.sum_over_past_buckets(key) + current_bucket_value > self.threshold()
    }

    /// Second at which `key`'s refractory period ends (0 = never fired).
    pub fn refractory_period_end_sec(&self, key: &MetricDimensionKey) -> i64 {
        self.refractory_ends_sec.get(key).copied().unwrap_or(0)
    }

    /// Snapshot of every key's refractory end, for dump reports.
    pub fn refractory_snapshot(&self) -> Vec<(MetricDimensionKey, i64)> {
        self.refractory_ends_sec
            .iter()
            .map(|(key, &end)| (key.clone(), end))
            .collect()
    }

    /// Declare an anomaly for `key` at `timestamp_ns`. Suppressed inside
    /// the key's refractory period; otherwise the refractory end advances
    /// and every subscription is notified. Returns whether it fired.
    pub fn declare_anomaly(&mut self, timestamp_ns: i64, key: &MetricDimensionKey) -> bool {
        let timestamp_sec = timestamp_ns / NS_PER_SEC;
        if let Some(&end_sec) = self.refractory_ends_sec.get(key) {
            if timestamp_sec <= end_sec {
                debug!(
                    alert = self.alert.id,
                    dimension = %key,
                    "Anomaly suppressed inside refractory period"
                );
                return false;
            }
        }
        self.refractory_ends_sec
            .insert(key.clone(), timestamp_sec + self.alert.refractory_period_secs);

        info!(
            alert = self.alert.id,
            metric = self.alert.metric_id,
            dimension = %key,
            timestamp_ns,
            "Anomaly declared"
        );
        for subscription in &self.subscriptions {
            self.sink.notify(self.config_key, subscription, key);
        }
        true
    }

    /// Detect-then-declare convenience used by producers on every
    /// aggregation step.
    pub fn detect_and_declare(
        &mut self,
        timestamp_ns: i64,
        current_bucket_num: i64,
        key: &MetricDimensionKey,
        current_bucket_value: i64,
    ) -> bool {
        if self.detect_anomaly_for_key(current_bucket_num, key, current_bucket_value) {
            self.declare_anomaly(timestamp_ns, key)
        } else {
            false
        }
    }
}

// ============================================================================
// Duration-metric variant
// ============================================================================

/// Anomaly tracker for duration metrics: adds absolute-time alarms at the
/// predicted threshold-crossing timestamp of a still-running duration.
#[derive(Clone)]
pub struct DurationAnomalyTracker {
    tracker: AnomalyTracker,
    alarms: HashMap<MetricDimensionKey, Arc<ScheduledAlarm>>,
    monitor: Arc<dyn AlarmMonitor>,
}

impl std::fmt::Debug for DurationAnomalyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurationAnomalyTracker")
            .field("tracker", &self.tracker)
            .field("alarms", &self.alarms.len())
            .finish()
    }
}

impl DurationAnomalyTracker {
    pub fn new(
        alert: Alert,
        config_key: ConfigKey,
        sink: Arc<dyn SubscriberSink>,
        monitor: Arc<dyn AlarmMonitor>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            tracker: AnomalyTracker::new(alert, config_key, sink)?,
            alarms: HashMap::new(),
            monitor,
        })
    }

    pub fn inner(&self) -> &AnomalyTracker {
        &self.tracker
    }

    pub fn inner_mut(&mut self) -> &mut AnomalyTracker {
        &mut self.tracker
    }

    pub fn threshold(&self) -> i64 {
        self.tracker.threshold()
    }

    /// Schedule (or reschedule) the alarm predicting `key`'s crossing.
    pub fn start_alarm(&mut self, key: &MetricDimensionKey, timestamp_ns: i64) {
        // A prediction at or before the refractory end would be suppressed
        // anyway; push it past the end.
        let timestamp_sec = (timestamp_ns / NS_PER_SEC).max(
            self.tracker.refractory_period_end_sec(key),
        );
        let alarm = ScheduledAlarm::at(timestamp_sec as u32);
        if let Some(old) = self.alarms.insert(key.clone(), alarm.clone()) {
            self.monitor.remove(&old);
        }
        self.monitor.add(alarm);
    }

    /// Cancel the alarm for `key`, if any.
    pub fn stop_alarm(&mut self, key: &MetricDimensionKey) {
        if let Some(alarm) = self.alarms.remove(key) {
            self.monitor.remove(&alarm);
        }
    }

    pub fn cancel_all_alarms(&mut self) {
        let keys: Vec<MetricDimensionKey> = self.alarms.keys().cloned().collect();
        for key in keys {
            self.stop_alarm(&key);
        }
    }

    /// Declare if `key`'s alarm has expired by `timestamp_ns`. The alarm
    /// entry is validated before it is removed.
    pub fn declare_anomaly_if_alarm_expired(
        &mut self,
        key: &MetricDimensionKey,
        timestamp_ns: i64,
    ) -> bool {
        let expired = self
            .alarms
            .get(key)
            .is_some_and(|alarm| (timestamp_ns / NS_PER_SEC) as u32 >= alarm.timestamp_sec);
        if !expired {
            return false;
        }
        self.stop_alarm(key);
        self.tracker.declare_anomaly(timestamp_ns, key)
    }

    /// The alarm service fired: declare for every scheduled key whose alarm
    /// handle is in `fired`, consuming those handles.
    pub fn inform_alarms_fired(&mut self, timestamp_ns: i64, fired: &mut HashSet<u64>) {
        if fired.is_empty() || self.alarms.is_empty() {
            return;
        }
        let hit: Vec<MetricDimensionKey> = self
            .alarms
            .iter()
            .filter(|(_, alarm)| fired.contains(&alarm.handle()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in hit {
            if let Some(alarm) = self.alarms.remove(&key) {
                fired.remove(&alarm.handle());
            }
            self.tracker.declare_anomaly(timestamp_ns, &key);
        }
    }
}

// ============================================================================
// Periodic alarms
// ============================================================================

/// Tracker for a configured wall-clock periodic alarm, independent of any
/// metric. Fires its subscriptions each period.
pub struct AlarmTracker {
    config: Alarm,
    config_key: ConfigKey,
    subscriptions: Vec<Subscription>,
    /// Next firing, in seconds.
    next_sec: i64,
    scheduled: Option<Arc<ScheduledAlarm>>,
    monitor: Arc<dyn AlarmMonitor>,
    sink: Arc<dyn SubscriberSink>,
}

impl std::fmt::Debug for AlarmTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmTracker")
            .field("alarm", &self.config.id)
            .field("next_sec", &self.next_sec)
            .finish()
    }
}

impl AlarmTracker {
    pub fn new(
        config: Alarm,
        config_key: ConfigKey,
        start_time_sec: i64,
        monitor: Arc<dyn AlarmMonitor>,
        sink: Arc<dyn SubscriberSink>,
    ) -> Result<Self, ConfigError> {
        if config.period_millis <= 0 {
            return Err(ConfigError::InvalidAlarmPeriod {
                id: config.id,
                period_millis: config.period_millis,
            });
        }
        let next_sec = start_time_sec + config.offset_millis / 1000;
        let mut tracker = Self {
            config,
            config_key,
            subscriptions: Vec::new(),
            next_sec,
            scheduled: None,
            monitor,
            sink,
        };
        tracker.schedule();
        Ok(tracker)
    }

    pub fn alarm_id(&self) -> i64 {
        self.config.id
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    fn schedule(&mut self) {
        let alarm = ScheduledAlarm::at(self.next_sec.max(0) as u32);
        if let Some(old) = self.scheduled.replace(alarm.clone()) {
            self.monitor.remove(&old);
        }
        self.monitor.add(alarm);
    }

    /// Handle fired alarms; advances past `timestamp_ns` and reschedules.
    pub fn inform_alarms_fired(&mut self, timestamp_ns: i64, fired: &mut HashSet<u64>) {
        let Some(current) = &self.scheduled else {
            return;
        };
        if !fired.contains(&current.handle()) {
            return;
        }
        fired.remove(&current.handle());
        self.scheduled = None;

        let default_key = MetricDimensionKey::default();
        for subscription in &self.subscriptions {
            self.sink.notify(self.config_key, subscription, &default_key);
        }

        let period_sec = (self.config.period_millis / 1000).max(1);
        let now_sec = timestamp_ns / NS_PER_SEC;
        while self.next_sec <= now_sec {
            self.next_sec += period_sec;
        }
        self.schedule();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InertAlarmMonitor, RecordingSubscriberSink};
    use crate::types::dimension::HashableDimensionKey;
    use crate::types::event::{FieldPath, FieldValue};

    fn alert(num_buckets: i64, threshold: i64, refractory_secs: i64) -> Alert {
        Alert {
            id: 200,
            metric_id: 100,
            num_buckets,
            refractory_period_secs: refractory_secs,
            trigger_if_sum_gt: Some(threshold),
        }
    }

    fn key(n: i64) -> MetricDimensionKey {
        MetricDimensionKey::new(
            HashableDimensionKey::new(vec![(FieldPath::leaf(1), FieldValue::Long(n))]),
            HashableDimensionKey::default_key(),
        )
    }

    fn tracker(num_buckets: i64, threshold: i64, refractory: i64) -> AnomalyTracker {
        AnomalyTracker::new(
            alert(num_buckets, threshold, refractory),
            ConfigKey::new(0, 1),
            Arc::new(RecordingSubscriberSink::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_alerts_rejected() {
        let sink: Arc<dyn SubscriberSink> = Arc::new(RecordingSubscriberSink::default());
        let mut no_threshold = alert(3, 0, 0);
        no_threshold.trigger_if_sum_gt = None;
        assert!(matches!(
            AnomalyTracker::new(no_threshold, ConfigKey::new(0, 1), sink.clone()),
            Err(ConfigError::MissingThreshold { .. })
        ));
        assert!(matches!(
            AnomalyTracker::new(alert(0, 1, 0), ConfigKey::new(0, 1), sink),
            Err(ConfigError::InvalidNumBuckets { .. })
        ));
    }

    #[test]
    fn test_rolling_sum_matches_ring_contents() {
        let mut t = tracker(3, 100, 0);
        let k = key(1);

        t.add_past_bucket_value(&k, 60, 0);
        assert_eq!(t.sum_over_past_buckets(&k), 60);
        t.add_past_bucket_value(&k, 50, 1);
        assert_eq!(t.sum_over_past_buckets(&k), 110);

        // Ring holds 2 buckets; bucket 2 evicts bucket 0.
        t.add_past_bucket_value(&k, 40, 2);
        assert_eq!(t.sum_over_past_buckets(&k), 90);
        assert_eq!(t.past_bucket_value(&k, 1), 50);
        assert_eq!(t.past_bucket_value(&k, 2), 40);
    }

    #[test]
    fn test_zero_sums_are_pruned() {
        let mut t = tracker(2, 100, 0);
        let k = key(1);
        t.add_past_bucket_value(&k, 5, 0);
        assert_eq!(t.sum_over_past_buckets(&k), 5);
        // Next bucket evicts the only retained one.
        t.add_past_bucket_value(&key(2), 1, 1);
        assert_eq!(t.sum_over_past_buckets(&k), 0);
        assert!(t.sum_over_past.is_empty() || !t.sum_over_past.contains_key(&k));
    }

    #[test]
    fn test_stale_ring_cleared_on_large_gap() {
        let mut t = tracker(3, 100, 0);
        let k = key(1);
        t.add_past_bucket_value(&k, 60, 0);
        t.add_past_bucket_value(&k, 50, 1);
        // Jump far ahead: everything retained is stale.
        t.add_past_bucket_value(&k, 10, 10);
        assert_eq!(t.sum_over_past_buckets(&k), 10);
    }

    #[test]
    fn test_too_old_bucket_ignored() {
        let mut t = tracker(3, 100, 0);
        let k = key(1);
        t.add_past_bucket_value(&k, 60, 5);
        t.add_past_bucket_value(&k, 99, 3); // <= 5 - 2
        assert_eq!(t.sum_over_past_buckets(&k), 60);
    }

    #[test]
    fn test_detect_anomaly_with_gap_inserts_null_bucket() {
        let mut t = tracker(3, 100, 0);
        let k = key(1);
        t.add_past_bucket_value(&k, 60, 0);
        t.add_past_bucket_value(&k, 50, 1);
        assert!(t.detect_anomaly_for_key(2, &k, 0));

        // A distant current bucket retires the ring first.
        let mut t2 = tracker(3, 100, 0);
        t2.add_past_bucket_value(&k, 60, 0);
        t2.add_past_bucket_value(&k, 50, 1);
        assert!(!t2.detect_anomaly_for_key(8, &k, 0));
    }

    #[test]
    fn test_num_buckets_one_watches_current_bucket_only() {
        let mut t = tracker(1, 100, 0);
        let k = key(1);
        assert_eq!(t.num_past_buckets(), 0);
        // Past values never retained.
        t.add_past_bucket_value(&k, 1000, 0);
        assert_eq!(t.sum_over_past_buckets(&k), 0);
        assert!(!t.detect_anomaly_for_key(1, &k, 100));
        assert!(t.detect_anomaly_for_key(2, &k, 101));
    }

    #[test]
    fn test_refractory_requires_strictly_greater_gap() {
        let mut t = tracker(3, 100, 60);
        let k = key(1);
        let t0 = 1_000 * NS_PER_SEC;
        assert!(t.declare_anomaly(t0, &k));
        // Exactly refractory seconds later: suppressed.
        assert!(!t.declare_anomaly(t0 + 60 * NS_PER_SEC, &k));
        // Strictly beyond: fires.
        assert!(t.declare_anomaly(t0 + 120 * NS_PER_SEC, &k));
    }

    #[test]
    fn test_refractory_is_per_dimension() {
        let mut t = tracker(3, 100, 60);
        let t0 = 1_000 * NS_PER_SEC;
        assert!(t.declare_anomaly(t0, &key(1)));
        assert!(t.declare_anomaly(t0 + NS_PER_SEC, &key(2)));
        assert!(!t.declare_anomaly(t0 + NS_PER_SEC, &key(1)));
    }

    #[test]
    fn test_subscriptions_notified_on_declare() {
        let sink = Arc::new(RecordingSubscriberSink::default());
        let mut t = AnomalyTracker::new(
            alert(3, 100, 0),
            ConfigKey::new(0, 1),
            sink.clone() as Arc<dyn SubscriberSink>,
        )
        .unwrap();
        t.add_subscription(Subscription { id: 300, rule_id: 200 });
        t.declare_anomaly(NS_PER_SEC, &key(1));
        let notes = sink.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, 300);
    }

    #[test]
    fn test_duration_tracker_alarm_lifecycle() {
        let monitor = Arc::new(InertAlarmMonitor::default());
        let sink = Arc::new(RecordingSubscriberSink::default());
        let mut t = DurationAnomalyTracker::new(
            alert(3, 100, 0),
            ConfigKey::new(0, 1),
            sink as Arc<dyn SubscriberSink>,
            monitor.clone() as Arc<dyn AlarmMonitor>,
        )
        .unwrap();

        let k = key(1);
        t.start_alarm(&k, 500 * NS_PER_SEC);
        assert_eq!(monitor.registered_count(), 1);

        // Not yet expired.
        assert!(!t.declare_anomaly_if_alarm_expired(&k, 400 * NS_PER_SEC));
        assert_eq!(monitor.registered_count(), 1);

        // Expired: declares and removes the alarm.
        assert!(t.declare_anomaly_if_alarm_expired(&k, 500 * NS_PER_SEC));
        assert_eq!(monitor.registered_count(), 0);
    }

    #[test]
    fn test_duration_tracker_inform_alarms_fired() {
        let monitor = Arc::new(InertAlarmMonitor::default());
        let sink = Arc::new(RecordingSubscriberSink::default());
        let mut t = DurationAnomalyTracker::new(
            alert(3, 100, 0),
            ConfigKey::new(0, 1),
            sink.clone() as Arc<dyn SubscriberSink>,
            monitor as Arc<dyn AlarmMonitor>,
        )
        .unwrap();
        t.inner_mut()
            .add_subscription(Subscription { id: 300, rule_id: 200 });

        let k = key(1);
        t.start_alarm(&k, 500 * NS_PER_SEC);
        let handle = t.alarms[&k].handle();

        let mut fired: HashSet<u64> = [handle, 999].into_iter().collect();
        t.inform_alarms_fired(500 * NS_PER_SEC, &mut fired);
        // Our handle is consumed; the unknown one is left for other trackers.
        assert!(!fired.contains(&handle));
        assert!(fired.contains(&999));
        assert_eq!(sink.notifications().len(), 1);
    }

    #[test]
    fn test_periodic_alarm_tracker() {
        let monitor = Arc::new(InertAlarmMonitor::default());
        let sink = Arc::new(RecordingSubscriberSink::default());
        let mut t = AlarmTracker::new(
            Alarm {
                id: 400,
                offset_millis: 5_000,
                period_millis: 60_000,
            },
            ConfigKey::new(0, 1),
            100,
            monitor.clone() as Arc<dyn AlarmMonitor>,
            sink.clone() as Arc<dyn SubscriberSink>,
        )
        .unwrap();
        t.add_subscription(Subscription { id: 301, rule_id: 400 });
        assert_eq!(monitor.earliest_sec(), Some(105));

        let handle = t.scheduled.as_ref().map(|a| a.handle()).unwrap_or(0);
        let mut fired: HashSet<u64> = [handle].into_iter().collect();
        t.inform_alarms_fired(105 * NS_PER_SEC, &mut fired);
        assert_eq!(sink.notifications().len(), 1);
        // Rescheduled one period out.
        assert_eq!(monitor.registered_count(), 1);
        assert_eq!(t.next_sec, 165);
    }

    #[test]
    fn test_period_must_be_positive() {
        let monitor = Arc::new(InertAlarmMonitor::default());
        let sink = Arc::new(RecordingSubscriberSink::default());
        assert!(matches!(
            AlarmTracker::new(
                Alarm {
                    id: 400,
                    offset_millis: 0,
                    period_millis: 0,
                },
                ConfigKey::new(0, 1),
                0,
                monitor as Arc<dyn AlarmMonitor>,
                sink as Arc<dyn SubscriberSink>,
            ),
            Err(ConfigError::InvalidAlarmPeriod { .. })
        ));
    }
}
