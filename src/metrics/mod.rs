//! Metric producers
//!
//! One [`MetricProducer`] per configured metric. Shared state (bucket
//! clock, condition linkage, activations, dimension guardrail, anomaly
//! trackers) lives on the producer struct; the five aggregation strategies
//! live behind the [`MetricKind`] variant and a match-based dispatch.
//!
//! Entry points lock per producer through the manager's `Mutex` wrapper;
//! nothing here blocks and nothing holds a lock across an external call.

pub mod count;
pub mod duration;
pub mod duration_trackers;
pub mod event;
pub mod gauge;
pub mod value;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::anomaly::{AnomalyTracker, DurationAnomalyTracker};
use crate::condition::ConditionWizard;
use crate::config::{
    ActivationType, Alert, ConfigError, ConfigKey, Dimensions, GaugeSamplingType,
    MetricConditionLink,
};
use crate::dimensions::{extract_dimension_key, extract_dimension_keys, extract_link_key};
use crate::external::{AlarmMonitor, PullerRegistry, SubscriberSink};
use crate::report::{AlertState, DimensionData, MetricData, MetricReport};
use crate::state::StateManager;
use crate::types::condition::ConditionState;
use crate::types::dimension::{HashableDimensionKey, MetricDimensionKey};
use crate::types::event::Event;

use count::CountMetricState;
use duration::DurationMetricState;
use event::EventMetricState;
use gauge::GaugeMetricState;
use value::ValueMetricState;

/// Hard cap on per-metric dimension cardinality. New dimensions beyond it
/// are silently dropped and counted.
pub const DIMENSION_GUARDRAIL: usize = 500;

/// Matcher-index sentinel for samples the producer pulled itself.
pub const PULLED_MATCHER_INDEX: usize = usize::MAX;

/// Time budget of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpLatency {
    /// No pulls allowed; report only already-materialized state.
    Fast,
    /// Synchronous pulls permitted.
    NoTimeConstraints,
}

/// Everything a producer may consult while processing an event. Borrowed
/// from the manager for the duration of one call; the wizard takes no
/// locks of its own.
pub struct ProducerContext<'a> {
    pub wizard: ConditionWizard<'a>,
    pub states: &'a StateManager,
    pub pullers: &'a dyn PullerRegistry,
}

// ============================================================================
// Activations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    NotActive,
    Active,
    ActiveOnBoot,
}

/// One time-bounded activation, driven by an activator atom and optionally
/// cancelled by a deactivator atom.
#[derive(Debug, Clone)]
pub struct Activation {
    pub ttl_ns: i64,
    pub start_ns: i64,
    pub state: ActivationState,
    pub activation_type: ActivationType,
}

/// Still-active activation state persisted across restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedActivation {
    pub activation_index: usize,
    pub remaining_ttl_ns: i64,
    pub active_on_boot: bool,
}

// ============================================================================
// Producer
// ============================================================================

/// Per-kind aggregation state.
#[derive(Debug, Clone)]
pub enum MetricKind {
    Count(CountMetricState),
    Event(EventMetricState),
    Value(ValueMetricState),
    Gauge(GaugeMetricState),
    Duration(DurationMetricState),
}

/// Shared construction parameters for every metric kind.
#[derive(Debug, Clone)]
pub struct MetricCore {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    pub metric_hash: u64,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub condition_tracker_index: Option<usize>,
    pub condition_sliced: bool,
    pub links: Vec<MetricConditionLink>,
    /// Condition tracker index per link, resolved by the builder.
    pub link_condition_indices: Vec<usize>,
    pub dimensions_in_what: Dimensions,
    pub dimensions_in_condition: Dimensions,
    /// State atom ids this metric slices by.
    pub slice_by_state_atoms: Vec<i32>,
}

pub struct MetricProducer {
    metric_id: i64,
    config_key: ConfigKey,
    metric_hash: u64,
    time_base_ns: i64,
    bucket_size_ns: i64,
    current_bucket_start_ns: i64,
    current_bucket_num: i64,
    condition: ConditionState,
    condition_tracker_index: Option<usize>,
    condition_sliced: bool,
    links: Vec<MetricConditionLink>,
    link_condition_indices: Vec<usize>,
    dimensions_in_what: Dimensions,
    dimensions_in_condition: Dimensions,
    slice_by_state_atoms: Vec<i32>,
    activations: Vec<Activation>,
    /// Activator matcher index -> activation index.
    event_activation_map: HashMap<usize, usize>,
    /// Deactivator matcher index -> activation indices it cancels.
    event_deactivation_map: HashMap<usize, Vec<usize>>,
    is_active: bool,
    /// Guardrail drops since the last report.
    skipped_samples: u64,
    anomaly_trackers: Vec<AnomalyTracker>,
    kind: MetricKind,
}

impl std::fmt::Debug for MetricProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricProducer")
            .field("metric_id", &self.metric_id)
            .field("current_bucket_num", &self.current_bucket_num)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl MetricProducer {
    pub fn new(core: MetricCore, kind: MetricKind) -> Self {
        // Without a condition the metric is unconditionally on; with one it
        // starts unknown until the condition first evaluates.
        let condition = if core.condition_tracker_index.is_some() {
            ConditionState::Unknown
        } else {
            ConditionState::True
        };
        Self {
            metric_id: core.metric_id,
            config_key: core.config_key,
            metric_hash: core.metric_hash,
            time_base_ns: core.time_base_ns,
            bucket_size_ns: core.bucket_size_ns,
            current_bucket_start_ns: core.time_base_ns,
            current_bucket_num: 0,
            condition,
            condition_tracker_index: core.condition_tracker_index,
            condition_sliced: core.condition_sliced,
            links: core.links,
            link_condition_indices: core.link_condition_indices,
            dimensions_in_what: core.dimensions_in_what,
            dimensions_in_condition: core.dimensions_in_condition,
            slice_by_state_atoms: core.slice_by_state_atoms,
            activations: Vec::new(),
            event_activation_map: HashMap::new(),
            event_deactivation_map: HashMap::new(),
            is_active: true,
            skipped_samples: 0,
            anomaly_trackers: Vec::new(),
            kind,
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.metric_id
    }

    pub fn metric_hash(&self) -> u64 {
        self.metric_hash
    }

    pub fn bucket_size_ns(&self) -> i64 {
        self.bucket_size_ns
    }

    pub fn time_base_ns(&self) -> i64 {
        self.time_base_ns
    }

    pub fn current_bucket_num(&self) -> i64 {
        self.current_bucket_num
    }

    pub fn condition_tracker_index(&self) -> Option<usize> {
        self.condition_tracker_index
    }

    /// Condition tracker index per link, for dispatch registration.
    pub fn link_condition_indices(&self) -> &[usize] {
        &self.link_condition_indices
    }

    pub fn is_condition_sliced(&self) -> bool {
        self.condition_sliced
    }

    pub fn kind(&self) -> &MetricKind {
        &self.kind
    }

    fn current_bucket_end_ns(&self) -> i64 {
        self.time_base_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// Register one activation. Called at build time; the first activation
    /// flips the producer to not-active until an activator fires.
    pub fn add_activation(
        &mut self,
        activation_matcher_index: usize,
        activation_type: ActivationType,
        ttl_seconds: i64,
        deactivation_matcher_index: Option<usize>,
    ) {
        let index = self.activations.len();
        self.activations.push(Activation {
            ttl_ns: ttl_seconds.saturating_mul(1_000_000_000),
            start_ns: 0,
            state: ActivationState::NotActive,
            activation_type,
        });
        self.event_activation_map
            .insert(activation_matcher_index, index);
        if let Some(deactivation) = deactivation_matcher_index {
            self.event_deactivation_map
                .entry(deactivation)
                .or_default()
                .push(index);
        }
        self.is_active = false;
    }

    pub fn has_activations(&self) -> bool {
        !self.activations.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    fn recompute_is_active(&mut self) {
        self.is_active = self.activations.is_empty()
            || self
                .activations
                .iter()
                .any(|a| a.state == ActivationState::Active);
    }

    /// An activator matcher fired: (re)start its activation's TTL.
    pub fn activate(&mut self, activation_matcher_index: usize, event_time_ns: i64) {
        let Some(&index) = self.event_activation_map.get(&activation_matcher_index) else {
            return;
        };
        let activation = &mut self.activations[index];
        match activation.activation_type {
            ActivationType::ActivateImmediately => {
                activation.start_ns = event_time_ns;
                activation.state = ActivationState::Active;
            }
            ActivationType::ActivateOnBoot => {
                if activation.state == ActivationState::NotActive {
                    activation.state = ActivationState::ActiveOnBoot;
                }
                // Already active: refresh the TTL like an immediate one.
                if activation.state == ActivationState::Active {
                    activation.start_ns = event_time_ns;
                }
            }
        }
        let was_active = self.is_active;
        self.recompute_is_active();
        if !was_active && self.is_active {
            debug!(metric = self.metric_id, "Metric activated");
        }
    }

    /// A deactivator matcher fired: cancel the activations it governs.
    pub fn cancel_event_activation(&mut self, deactivation_matcher_index: usize, event_time_ns: i64) {
        let Some(indices) = self
            .event_deactivation_map
            .get(&deactivation_matcher_index)
            .cloned()
        else {
            return;
        };
        for index in indices {
            self.activations[index].state = ActivationState::NotActive;
        }
        let was_active = self.is_active;
        self.recompute_is_active();
        if was_active && !self.is_active {
            self.on_active_state_changed(event_time_ns);
        }
    }

    /// Expire overdue activations. Returns true when the active state
    /// flipped.
    pub fn evaluate_active_state(&mut self, event_time_ns: i64) -> bool {
        let was_active = self.is_active;
        for activation in &mut self.activations {
            if activation.state == ActivationState::Active
                && event_time_ns >= activation.start_ns + activation.ttl_ns
            {
                activation.state = ActivationState::NotActive;
            }
        }
        self.recompute_is_active();
        let changed = was_active != self.is_active;
        if changed && !self.is_active {
            self.on_active_state_changed(event_time_ns);
        }
        changed
    }

    fn on_active_state_changed(&mut self, event_time_ns: i64) {
        // Going inactive flushes so the report carries what was gathered.
        if !self.is_active {
            debug!(metric = self.metric_id, "Metric deactivated, flushing");
            self.flush(event_time_ns);
        }
    }

    /// Still-active activations with their remaining TTL, for the
    /// persisted blob.
    pub fn saved_activations(&self, current_time_ns: i64) -> Vec<SavedActivation> {
        self.activations
            .iter()
            .enumerate()
            .filter(|(_, a)| a.state != ActivationState::NotActive)
            .map(|(activation_index, a)| SavedActivation {
                activation_index,
                remaining_ttl_ns: match a.state {
                    ActivationState::Active => (a.start_ns + a.ttl_ns - current_time_ns).max(0),
                    _ => a.ttl_ns,
                },
                active_on_boot: a.state == ActivationState::ActiveOnBoot
                    || a.activation_type == ActivationType::ActivateOnBoot,
            })
            .collect()
    }

    /// Restore activations from the persisted blob at startup.
    pub fn load_activations(&mut self, saved: &[SavedActivation], current_time_ns: i64) {
        for entry in saved {
            let Some(activation) = self.activations.get_mut(entry.activation_index) else {
                continue;
            };
            activation.state = ActivationState::Active;
            activation.start_ns = current_time_ns;
            // The persisted remaining TTL caps the restored window.
            if entry.remaining_ttl_ns > 0 && entry.remaining_ttl_ns < activation.ttl_ns {
                activation.start_ns = current_time_ns + entry.remaining_ttl_ns - activation.ttl_ns;
            }
        }
        self.recompute_is_active();
    }

    // ========================================================================
    // Anomaly trackers
    // ========================================================================

    /// Create and register an anomaly tracker for `alert`. Event and gauge
    /// metrics have no scalar bucket value to sum and reject alerts.
    pub fn add_anomaly_tracker(
        &mut self,
        alert: Alert,
        sink: std::sync::Arc<dyn SubscriberSink>,
        monitor: std::sync::Arc<dyn AlarmMonitor>,
        subscriptions: Vec<crate::config::Subscription>,
    ) -> Result<(), ConfigError> {
        match &mut self.kind {
            MetricKind::Event(_) | MetricKind::Gauge(_) => {
                warn!(
                    metric = self.metric_id,
                    alert = alert.id,
                    "Alerts are not supported on event/gauge metrics; alert ignored"
                );
                Ok(())
            }
            MetricKind::Duration(state) => {
                let mut tracker =
                    DurationAnomalyTracker::new(alert, self.config_key, sink, monitor)?;
                for subscription in subscriptions {
                    tracker.inner_mut().add_subscription(subscription);
                }
                state.anomaly_trackers.push(tracker);
                Ok(())
            }
            MetricKind::Count(_) | MetricKind::Value(_) => {
                let mut tracker = AnomalyTracker::new(alert, self.config_key, sink)?;
                for subscription in subscriptions {
                    tracker.add_subscription(subscription);
                }
                self.anomaly_trackers.push(tracker);
                Ok(())
            }
        }
    }

    pub fn inform_alarms_fired(
        &mut self,
        timestamp_ns: i64,
        fired: &mut std::collections::HashSet<u64>,
    ) {
        if let MetricKind::Duration(state) = &mut self.kind {
            state.inform_alarms_fired(timestamp_ns, fired);
        }
    }

    // ========================================================================
    // Event path
    // ========================================================================

    /// Resolve the metric's condition and condition-dimension key for one
    /// event.
    fn resolve_condition(
        &self,
        event: &Event,
        ctx: &ProducerContext<'_>,
    ) -> (bool, HashableDimensionKey) {
        let Some(condition_index) = self.condition_tracker_index else {
            return (true, HashableDimensionKey::default_key());
        };
        if !self.condition_sliced {
            return (
                self.condition == ConditionState::True,
                HashableDimensionKey::default_key(),
            );
        }
        if self.links.is_empty() {
            // Without links the condition key comes straight from the
            // metric's condition dimensions on this event.
            let key = extract_dimension_key(&self.dimensions_in_condition, event);
            let state = ctx.wizard.query(condition_index, &key);
            return (state == ConditionState::True, key);
        }
        let mut all_true = true;
        let mut condition_key = HashableDimensionKey::default_key();
        for (link, &link_index) in self.links.iter().zip(&self.link_condition_indices) {
            let key = extract_link_key(link, event);
            if ctx.wizard.query(link_index, &key) != ConditionState::True {
                all_true = false;
            }
            for (path, value) in key.values() {
                condition_key.push(*path, value.clone());
            }
        }
        (all_true, condition_key)
    }

    /// Whether adding `key` would breach the dimension guardrail.
    fn hits_guardrail(&self, key: &MetricDimensionKey) -> bool {
        let (count, known) = match &self.kind {
            MetricKind::Count(state) => (state.dimension_count(), state.has_dimension(key)),
            MetricKind::Event(_) => return false,
            MetricKind::Value(state) => (state.dimension_count(), state.has_dimension(key)),
            MetricKind::Gauge(state) => (state.dimension_count(), state.has_dimension(key)),
            MetricKind::Duration(state) => (state.dimension_count(), state.has_dimension(key)),
        };
        !known && count >= DIMENSION_GUARDRAIL
    }

    /// Consume one event that matched this metric's `what` (or a related
    /// start/stop/trigger matcher).
    pub fn on_matched_log_event(
        &mut self,
        matcher_index: usize,
        event: &Event,
        ctx: &ProducerContext<'_>,
    ) {
        if !self.is_active {
            return;
        }
        // Events from before this producer existed are dropped silently.
        if event.elapsed_timestamp_ns < self.time_base_ns {
            return;
        }
        let event_time_ns = event.elapsed_timestamp_ns;
        self.flush_if_needed(event_time_ns);

        // A triggered pulled gauge converts the trigger into pulled
        // samples and re-drives them through this path.
        let trigger_pull: Option<i32> = match &self.kind {
            MetricKind::Gauge(state)
                if state.sampling == GaugeSamplingType::OnTrigger
                    && state.trigger_matcher_index == Some(matcher_index) =>
            {
                state.pull_atom_id
            }
            _ => None,
        };
        if let Some(pull_atom_id) = trigger_pull {
            match ctx.pullers.pull(pull_atom_id) {
                Some(samples) => {
                    for mut sample in samples {
                        sample.elapsed_timestamp_ns = event_time_ns;
                        self.on_matched_log_event(PULLED_MATCHER_INDEX, &sample, ctx);
                    }
                }
                None => warn!(
                    metric = self.metric_id,
                    atom = pull_atom_id,
                    "Gauge trigger pull failed"
                ),
            }
            return;
        }

        let (condition, condition_key) = self.resolve_condition(event, ctx);

        let mut what_keys = extract_dimension_keys(&self.dimensions_in_what, event);
        // Slice-by-state folds each state's current value into the key,
        // resolved for the entity this event carries (per-uid states look
        // up the uid's own value; global states use the empty key).
        if !self.slice_by_state_atoms.is_empty() {
            for what in what_keys.iter_mut() {
                for &atom_id in &self.slice_by_state_atoms {
                    let primary = ctx.states.primary_key_for(atom_id, event);
                    let (path, value) = ctx.states.state_key_entry(atom_id, &primary);
                    what.push(path, value);
                }
            }
        }

        for what in what_keys {
            let key = MetricDimensionKey::new(what, condition_key.clone());
            if self.hits_guardrail(&key) {
                self.skipped_samples += 1;
                continue;
            }
            self.on_matched_internal(matcher_index, &key, condition, &condition_key, event, ctx);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_matched_internal(
        &mut self,
        matcher_index: usize,
        key: &MetricDimensionKey,
        condition: bool,
        condition_key: &HashableDimensionKey,
        event: &Event,
        _ctx: &ProducerContext<'_>,
    ) {
        let event_time_ns = event.elapsed_timestamp_ns;
        let current_bucket_num = self.current_bucket_num;
        let current_bucket_start_ns = self.current_bucket_start_ns;
        let bucket_size_ns = self.bucket_size_ns;
        match &mut self.kind {
            MetricKind::Count(state) => {
                if !condition {
                    return;
                }
                let full_count = state.count(key);
                for tracker in self.anomaly_trackers.iter_mut() {
                    tracker.detect_and_declare(event_time_ns, current_bucket_num, key, full_count);
                }
            }
            MetricKind::Event(state) => {
                if condition {
                    state.record(event);
                }
            }
            MetricKind::Value(state) => {
                if !condition {
                    return;
                }
                if state.pull_atom_id == Some(event.atom_id) {
                    state.note_pulled(key, event);
                } else {
                    state.note_pushed(key, event);
                }
            }
            MetricKind::Gauge(state) => match state.sampling {
                GaugeSamplingType::FirstNSamples => {
                    if condition {
                        state.sample(key, event);
                    }
                }
                GaugeSamplingType::OnTrigger => {
                    // Pushed triggered gauges sample the redriven pulled
                    // atoms; the trigger itself was consumed above.
                    if matcher_index == PULLED_MATCHER_INDEX && condition {
                        state.sample(key, event);
                    }
                }
                GaugeSamplingType::OnConditionChanged => {
                    if state.pending_sample && condition {
                        state.sample(key, event);
                        state.pending_sample = false;
                    }
                }
            },
            MetricKind::Duration(state) => {
                if state.stop_all_index == Some(matcher_index) {
                    state.note_stop_all(event_time_ns);
                    return;
                }
                let internal_key = extract_dimension_key(&state.internal_dimensions, event);
                if state.start_index == matcher_index {
                    state.note_start(
                        key,
                        &internal_key,
                        condition,
                        condition_key.clone(),
                        event_time_ns,
                        current_bucket_start_ns,
                        bucket_size_ns,
                    );
                } else if state.stop_index == Some(matcher_index) {
                    state.note_stop(key, &internal_key, event_time_ns);
                }
            }
        }
    }

    /// The metric's (unsliced) condition changed.
    pub fn on_condition_changed(
        &mut self,
        condition: ConditionState,
        event_time_ns: i64,
        ctx: &ProducerContext<'_>,
    ) {
        if !self.is_active {
            self.condition = condition;
            return;
        }
        self.flush_if_needed(event_time_ns);
        let became_true = self.condition != ConditionState::True && condition == ConditionState::True;
        self.condition = condition;

        if let MetricKind::Duration(state) = &mut self.kind {
            state.on_condition_changed(condition == ConditionState::True, event_time_ns);
            return;
        }

        // Gauge ON_CONDITION_CHANGED samples on the rising edge: pulled
        // gauges pull and re-drive, pushed gauges arm a one-shot sample.
        let gauge_edge: Option<Option<i32>> = match &self.kind {
            MetricKind::Gauge(state)
                if state.sampling == GaugeSamplingType::OnConditionChanged && became_true =>
            {
                Some(state.pull_atom_id)
            }
            _ => None,
        };
        if let Some(maybe_pull) = gauge_edge {
            match maybe_pull {
                Some(pull_atom_id) => match ctx.pullers.pull(pull_atom_id) {
                    Some(samples) => {
                        for mut sample in samples {
                            sample.elapsed_timestamp_ns = event_time_ns;
                            self.on_matched_log_event(PULLED_MATCHER_INDEX, &sample, ctx);
                        }
                    }
                    None => warn!(metric = self.metric_id, "Gauge condition-change pull failed"),
                },
                None => {
                    if let MetricKind::Gauge(state) = &mut self.kind {
                        state.pending_sample = true;
                    }
                }
            }
            return;
        }

        // Pulled value metrics re-base on condition edges so the next diff
        // starts from the current reading.
        if let MetricKind::Value(state) = &mut self.kind {
            if let Some(pull_atom_id) = state.pull_atom_id {
                match ctx.pullers.pull(pull_atom_id) {
                    Some(samples) => {
                        for sample in samples {
                            let keys = extract_dimension_keys(&self.dimensions_in_what, &sample);
                            for what in keys {
                                let key = MetricDimensionKey::new(
                                    what,
                                    HashableDimensionKey::default_key(),
                                );
                                state.note_pulled(&key, &sample);
                            }
                        }
                    }
                    None => state.taint_current(),
                }
            }
        }
    }

    /// A state this metric slices by changed for some entity. Count
    /// aggregation attributes each event at delivery time, so the new
    /// value applies to subsequent events; the bucket clock still advances
    /// past the state event so the change lands in the right bucket.
    pub fn on_state_changed(&mut self, state_atom_id: i32, event_time_ns: i64) {
        if !self.is_active {
            return;
        }
        debug!(
            metric = self.metric_id,
            state_atom = state_atom_id,
            "Sliced state changed"
        );
        self.flush_if_needed(event_time_ns);
    }

    /// A sliced condition this metric links to may have changed per
    /// dimension.
    pub fn on_sliced_condition_may_change(&mut self, event_time_ns: i64, ctx: &ProducerContext<'_>) {
        if !self.is_active {
            return;
        }
        self.flush_if_needed(event_time_ns);
        let Some(condition_index) = self.condition_tracker_index else {
            return;
        };
        if let MetricKind::Duration(state) = &mut self.kind {
            state.on_sliced_condition_may_change(ctx.wizard, condition_index, event_time_ns);
        }
    }

    // ========================================================================
    // Bucket clock
    // ========================================================================

    /// Advance the bucket clock past `event_time_ns`, closing zero or more
    /// whole buckets.
    pub fn flush_if_needed(&mut self, event_time_ns: i64) {
        let bucket_end = self.current_bucket_end_ns();
        if event_time_ns < bucket_end {
            return;
        }
        let num_buckets_forward = 1 + (event_time_ns - bucket_end) / self.bucket_size_ns;
        let next_start = bucket_end + (num_buckets_forward - 1) * self.bucket_size_ns;

        if let MetricKind::Duration(state) = &mut self.kind {
            // Duration trackers fill gap buckets themselves.
            state.flush_if_needed(event_time_ns, self.time_base_ns, self.bucket_size_ns);
            self.current_bucket_num += num_buckets_forward;
            self.current_bucket_start_ns = next_start;
            return;
        }

        self.flush_current_bucket(event_time_ns, next_start);
        self.current_bucket_num += num_buckets_forward;
    }

    /// Close the working bucket at `event_time_ns` (or at the full bucket
    /// boundary if `event_time_ns` lies beyond it) and restart it at
    /// `next_bucket_start_ns`. Does not advance the bucket number: partial
    /// splits keep their number so anomaly trackers can merge them.
    pub fn flush_current_bucket(&mut self, event_time_ns: i64, next_bucket_start_ns: i64) {
        let full_end = self.current_bucket_end_ns();
        let (bucket_end, full_boundary) = if event_time_ns >= full_end {
            (full_end, true)
        } else {
            (event_time_ns, false)
        };
        let bucket_start = self.current_bucket_start_ns;
        let bucket_num = self.current_bucket_num;

        match &mut self.kind {
            MetricKind::Count(state) => state.flush_current_bucket(
                bucket_start,
                bucket_end,
                full_boundary,
                bucket_num,
                &mut self.anomaly_trackers,
            ),
            MetricKind::Event(_) => {}
            MetricKind::Value(state) => state.flush_current_bucket(
                bucket_start,
                bucket_end,
                full_boundary,
                bucket_num,
                &mut self.anomaly_trackers,
            ),
            MetricKind::Gauge(state) => state.flush_current_bucket(bucket_start, bucket_end),
            MetricKind::Duration(state) => state.flush_current_bucket(
                event_time_ns,
                next_bucket_start_ns,
                self.time_base_ns,
                self.bucket_size_ns,
            ),
        }
        self.current_bucket_start_ns = next_bucket_start_ns;
    }

    /// Flush everything including the current partial bucket.
    fn flush(&mut self, event_time_ns: i64) {
        self.flush_if_needed(event_time_ns);
        self.flush_current_bucket(event_time_ns, event_time_ns);
    }

    /// An app upgrade or removal splits the current bucket at
    /// `event_time_ns` without advancing the bucket number.
    pub fn notify_app_upgrade(&mut self, event_time_ns: i64) {
        if event_time_ns > self.current_bucket_end_ns() {
            self.flush_if_needed(event_time_ns);
        }
        self.flush_current_bucket(event_time_ns, event_time_ns);
    }

    // ========================================================================
    // Reports and data management
    // ========================================================================

    /// Produce this metric's report section.
    pub fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        dump_latency: DumpLatency,
        ctx: &ProducerContext<'_>,
    ) -> MetricReport {
        // Pulled value metrics may take a synchronous reading when time
        // permits, so the report covers up to the dump instant.
        if dump_latency == DumpLatency::NoTimeConstraints && include_current_partial_bucket {
            if let MetricKind::Value(state) = &mut self.kind {
                if let Some(pull_atom_id) = state.pull_atom_id {
                    match ctx.pullers.pull(pull_atom_id) {
                        Some(samples) => {
                            for sample in samples {
                                let keys =
                                    extract_dimension_keys(&self.dimensions_in_what, &sample);
                                for what in keys {
                                    let key = MetricDimensionKey::new(
                                        what,
                                        HashableDimensionKey::default_key(),
                                    );
                                    state.note_pulled(&key, &sample);
                                }
                            }
                        }
                        None => state.taint_current(),
                    }
                }
            }
        }

        if include_current_partial_bucket {
            self.flush(dump_time_ns);
        } else {
            self.flush_if_needed(dump_time_ns);
        }

        let data = match &self.kind {
            MetricKind::Count(state) => MetricData::Count(
                state
                    .past_buckets
                    .iter()
                    .map(|(dimension, buckets)| DimensionData {
                        dimension: dimension.clone(),
                        buckets: buckets.clone(),
                    })
                    .collect(),
            ),
            MetricKind::Event(state) => MetricData::Event(state.records.clone()),
            MetricKind::Value(state) => MetricData::Value(
                state
                    .past_buckets
                    .iter()
                    .map(|(dimension, buckets)| DimensionData {
                        dimension: dimension.clone(),
                        buckets: buckets.clone(),
                    })
                    .collect(),
            ),
            MetricKind::Gauge(state) => MetricData::Gauge(
                state
                    .past_buckets
                    .iter()
                    .map(|(dimension, buckets)| DimensionData {
                        dimension: dimension.clone(),
                        buckets: buckets.clone(),
                    })
                    .collect(),
            ),
            MetricKind::Duration(state) => MetricData::Duration(
                state
                    .past_buckets
                    .iter()
                    .map(|(dimension, buckets)| DimensionData {
                        dimension: dimension.clone(),
                        buckets: buckets.clone(),
                    })
                    .collect(),
            ),
        };

        let mut alert_states: Vec<AlertState> = self
            .anomaly_trackers
            .iter()
            .map(|t| AlertState {
                alert_id: t.alert_id(),
                refractory_ends_sec: t.refractory_snapshot(),
            })
            .collect();
        if let MetricKind::Duration(state) = &self.kind {
            alert_states.extend(state.anomaly_trackers.iter().map(|t| AlertState {
                alert_id: t.inner().alert_id(),
                refractory_ends_sec: t.inner().refractory_snapshot(),
            }));
        }

        let report = MetricReport {
            metric_id: self.metric_id,
            is_active: self.is_active,
            skipped_samples: self.skipped_samples,
            start_report_ns: self.time_base_ns,
            end_report_ns: dump_time_ns,
            data,
            alert_states,
        };

        if erase_data {
            self.clear_past_buckets();
            self.skipped_samples = 0;
        }
        report
    }

    pub fn clear_past_buckets(&mut self) {
        match &mut self.kind {
            MetricKind::Count(state) => state.clear_past_buckets(),
            MetricKind::Event(state) => state.clear(),
            MetricKind::Value(state) => state.clear_past_buckets(),
            MetricKind::Gauge(state) => state.clear_past_buckets(),
            MetricKind::Duration(state) => state.clear_past_buckets(),
        }
    }

    /// Memory-pressure escape hatch: flush (informing anomaly trackers),
    /// then release all past-bucket storage. The current working bucket
    /// stays valid.
    pub fn drop_data(&mut self, drop_time_ns: i64) {
        self.flush(drop_time_ns);
        self.clear_past_buckets();
    }

    /// Carry aggregation history from the producer this one replaces
    /// across a config update. Only called when the metric's identity hash
    /// (metric + activation + referenced matcher/predicate bytes) is
    /// unchanged, so the shapes agree; resolved indices stay the new
    /// build's.
    pub fn adopt_history(&mut self, old: MetricProducer) {
        self.time_base_ns = old.time_base_ns;
        self.current_bucket_start_ns = old.current_bucket_start_ns;
        self.current_bucket_num = old.current_bucket_num;
        self.condition = old.condition;
        self.skipped_samples = old.skipped_samples;
        if self.activations.len() == old.activations.len() {
            self.activations = old.activations;
            self.recompute_is_active();
        }
        match (&mut self.kind, old.kind) {
            (MetricKind::Count(new), MetricKind::Count(old)) => *new = old,
            (MetricKind::Event(new), MetricKind::Event(old)) => *new = old,
            (MetricKind::Value(new), MetricKind::Value(old)) => *new = old,
            (MetricKind::Gauge(new), MetricKind::Gauge(old_state)) => {
                // Trigger and pull indices were re-resolved; keep them.
                let trigger = new.trigger_matcher_index;
                let pull = new.pull_atom_id;
                *new = old_state;
                new.trigger_matcher_index = trigger;
                new.pull_atom_id = pull;
            }
            (MetricKind::Duration(new), MetricKind::Duration(old_state)) => {
                // Matcher indices and anomaly trackers come from the new
                // build; timing state carries over.
                new.past_buckets = old_state.past_buckets.clone();
                new.adopt_trackers(old_state);
            }
            _ => {}
        }
    }

    /// Rough in-memory footprint, for guardrail accounting.
    pub fn byte_size(&self) -> usize {
        match &self.kind {
            MetricKind::Count(state) => state.byte_size(),
            MetricKind::Event(state) => state.byte_size(),
            MetricKind::Value(state) => state.byte_size(),
            MetricKind::Gauge(state) => state.byte_size(),
            MetricKind::Duration(state) => state.byte_size(),
        }
    }
}
