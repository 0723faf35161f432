//! Metrics manager: the executable evaluation pipeline for one config.
//!
//! Built once per installed configuration by `crate::builder`, immutable in
//! topology afterwards. Each delivered event flows matchers -> conditions
//! -> producers in that order, through per-event memoization caches, so
//! every node sees consistent values and evaluates at most once.
//!
//! The manager is driven on a single thread by the transport. Producer
//! entry points additionally take the producer's own mutex, which is never
//! held across an external call.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::anomaly::AlarmTracker;
use crate::condition::{evaluate_condition, ConditionTracker, ConditionWizard};
use crate::config::ConfigKey;
use crate::external::{PackageResolver, PullerRegistry};
use crate::matchers::{evaluate_matcher, AtomMatchingTracker, MatchingState};
use crate::metrics::{DumpLatency, MetricProducer, ProducerContext};
use crate::report::{ConfigReport, DumpReportReason, ReportWriter};
use crate::state::StateManager;
use crate::storage::{ActiveActivationBlob, ActiveConfigBlob, ActiveMetricBlob};
use crate::types::condition::ConditionState;
use crate::types::event::Event;

pub struct MetricsManager {
    config_key: ConfigKey,
    time_base_ns: i64,
    pub(crate) atom_matchers: Vec<AtomMatchingTracker>,
    pub(crate) conditions: Vec<ConditionTracker>,
    pub(crate) producers: Vec<Mutex<MetricProducer>>,
    pub(crate) states: StateManager,
    pub(crate) alarm_trackers: Vec<AlarmTracker>,

    // Dispatch maps, all by index.
    pub(crate) tag_ids: HashSet<i32>,
    pub(crate) tracker_to_metric: HashMap<usize, Vec<usize>>,
    pub(crate) condition_to_metric: HashMap<usize, Vec<usize>>,
    pub(crate) tracker_to_activation: HashMap<usize, Vec<usize>>,
    pub(crate) tracker_to_deactivation: HashMap<usize, Vec<usize>>,
    pub(crate) condition_id_to_index: HashMap<i64, usize>,
    pub(crate) metric_id_to_index: HashMap<i64, usize>,
    pub(crate) no_report_metric_ids: HashSet<i64>,

    // Event admission.
    pub(crate) allowed_source_uids: HashSet<i32>,
    pub(crate) allowed_source_packages: Vec<String>,

    // Injected collaborators.
    pub(crate) resolver: Arc<dyn PackageResolver>,
    pub(crate) pullers: Arc<dyn PullerRegistry>,

    events_processed: u64,
    events_rejected: u64,
    last_event_time_ns: i64,
}

impl std::fmt::Debug for MetricsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsManager")
            .field("config", &self.config_key)
            .field("matchers", &self.atom_matchers.len())
            .field("conditions", &self.conditions.len())
            .field("metrics", &self.producers.len())
            .finish()
    }
}

impl MetricsManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config_key: ConfigKey,
        time_base_ns: i64,
        atom_matchers: Vec<AtomMatchingTracker>,
        conditions: Vec<ConditionTracker>,
        states: StateManager,
        resolver: Arc<dyn PackageResolver>,
        pullers: Arc<dyn PullerRegistry>,
    ) -> Self {
        let tag_ids = atom_matchers
            .iter()
            .flat_map(|m| m.atom_ids().iter().copied())
            .collect();
        Self {
            config_key,
            time_base_ns,
            atom_matchers,
            conditions,
            producers: Vec::new(),
            states,
            alarm_trackers: Vec::new(),
            tag_ids,
            tracker_to_metric: HashMap::new(),
            condition_to_metric: HashMap::new(),
            tracker_to_activation: HashMap::new(),
            tracker_to_deactivation: HashMap::new(),
            condition_id_to_index: HashMap::new(),
            metric_id_to_index: HashMap::new(),
            no_report_metric_ids: HashSet::new(),
            allowed_source_uids: HashSet::new(),
            allowed_source_packages: Vec::new(),
            resolver,
            pullers,
            events_processed: 0,
            events_rejected: 0,
            last_event_time_ns: 0,
        }
    }

    pub fn config_key(&self) -> ConfigKey {
        self.config_key
    }

    pub fn time_base_ns(&self) -> i64 {
        self.time_base_ns
    }

    pub fn metric_count(&self) -> usize {
        self.producers.len()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Timestamp of the newest event delivered, for shutdown dumps.
    pub fn last_event_time_ns(&self) -> i64 {
        self.last_event_time_ns
    }

    /// Run a closure against one producer, by metric id. Test hook and
    /// admin-surface helper.
    pub fn with_producer<R>(
        &self,
        metric_id: i64,
        f: impl FnOnce(&mut MetricProducer) -> R,
    ) -> Option<R> {
        let &index = self.metric_id_to_index.get(&metric_id)?;
        let mut producer = self.producers[index].lock().ok()?;
        Some(f(&mut producer))
    }

    fn source_allowed(&self, event: &Event) -> bool {
        if self.allowed_source_uids.is_empty() && self.allowed_source_packages.is_empty() {
            return true;
        }
        if self.allowed_source_uids.contains(&event.uid) {
            return true;
        }
        if !self.allowed_source_packages.is_empty() {
            let names = self.resolver.app_names_from_uid(event.uid, true);
            if self
                .allowed_source_packages
                .iter()
                .any(|pkg| names.contains(pkg))
            {
                return true;
            }
        }
        false
    }

    /// Deliver one event through the evaluation pipeline.
    pub fn deliver_event(&mut self, event: &Event) {
        if !self.source_allowed(event) {
            self.events_rejected += 1;
            debug!(uid = event.uid, atom = event.atom_id, "Event source not allowed");
            return;
        }

        // Keep state trackers current regardless of matcher interest;
        // producers slicing by a changed state are notified the same way
        // condition changes are dispatched below.
        if let Some(listeners) = self.states.on_event(event) {
            for producer_index in listeners {
                if let Ok(mut producer) = self.producers[producer_index].lock() {
                    producer.on_state_changed(event.atom_id, event.elapsed_timestamp_ns);
                }
            }
        }

        if !self.tag_ids.contains(&event.atom_id) {
            return;
        }
        self.events_processed += 1;
        let event_time_ns = event.elapsed_timestamp_ns;
        self.last_event_time_ns = self.last_event_time_ns.max(event_time_ns);

        // 1. Matchers, memoized per event.
        let mut matcher_cache = vec![MatchingState::NotComputed; self.atom_matchers.len()];
        for index in 0..self.atom_matchers.len() {
            if self.atom_matchers[index].atom_ids().contains(&event.atom_id) {
                evaluate_matcher(
                    &self.atom_matchers,
                    index,
                    event,
                    self.resolver.as_ref(),
                    &mut matcher_cache,
                );
            }
        }

        // 2. Activations driven by matched activators/deactivators.
        for (index, &state) in matcher_cache.iter().enumerate() {
            if state != MatchingState::Matched {
                continue;
            }
            if let Some(producer_indices) = self.tracker_to_activation.get(&index) {
                for &producer_index in producer_indices {
                    if let Ok(mut producer) = self.producers[producer_index].lock() {
                        producer.activate(index, event_time_ns);
                    }
                }
            }
            if let Some(producer_indices) = self.tracker_to_deactivation.get(&index) {
                for &producer_index in producer_indices {
                    if let Ok(mut producer) = self.producers[producer_index].lock() {
                        producer.cancel_event_activation(index, event_time_ns);
                    }
                }
            }
        }
        // TTL expiry check for activated metrics.
        for producer in &self.producers {
            if let Ok(mut producer) = producer.lock() {
                if producer.has_activations() {
                    producer.evaluate_active_state(event_time_ns);
                }
            }
        }

        // 3. Conditions whose input matchers fired re-evaluate.
        let mut condition_cache = vec![ConditionState::NotEvaluated; self.conditions.len()];
        let mut changed_cache = vec![false; self.conditions.len()];
        for index in 0..self.conditions.len() {
            evaluate_condition(
                &mut self.conditions,
                index,
                event,
                &matcher_cache,
                &mut condition_cache,
                &mut changed_cache,
            );
        }

        // 4. Producers: condition changes first, then matched events, so a
        // sample in the same event sees the fresh condition.
        let ctx = ProducerContext {
            wizard: ConditionWizard::new(&self.conditions),
            states: &self.states,
            pullers: self.pullers.as_ref(),
        };
        for (condition_index, &changed) in changed_cache.iter().enumerate() {
            if !changed {
                continue;
            }
            let Some(producer_indices) = self.condition_to_metric.get(&condition_index) else {
                continue;
            };
            for &producer_index in producer_indices {
                let Ok(mut producer) = self.producers[producer_index].lock() else {
                    continue;
                };
                if producer.is_condition_sliced() {
                    producer.on_sliced_condition_may_change(event_time_ns, &ctx);
                } else {
                    producer.on_condition_changed(
                        condition_cache[condition_index],
                        event_time_ns,
                        &ctx,
                    );
                }
            }
        }

        for (matcher_index, &state) in matcher_cache.iter().enumerate() {
            if state != MatchingState::Matched {
                continue;
            }
            let Some(producer_indices) = self.tracker_to_metric.get(&matcher_index) else {
                continue;
            };
            for &producer_index in producer_indices {
                if let Ok(mut producer) = self.producers[producer_index].lock() {
                    producer.on_matched_log_event(matcher_index, event, &ctx);
                }
            }
        }
    }

    /// Externally pushed condition, for predicates driven by a
    /// collaborator rather than by atoms.
    pub fn push_condition(&mut self, condition_id: i64, state: ConditionState, event_time_ns: i64) {
        let Some(&condition_index) = self.condition_id_to_index.get(&condition_id) else {
            warn!(condition = condition_id, "Pushed state for unknown condition");
            return;
        };
        if !self.conditions[condition_index].force_state(state) {
            return;
        }
        let ctx = ProducerContext {
            wizard: ConditionWizard::new(&self.conditions),
            states: &self.states,
            pullers: self.pullers.as_ref(),
        };
        if let Some(producer_indices) = self.condition_to_metric.get(&condition_index) {
            for &producer_index in producer_indices {
                if let Ok(mut producer) = self.producers[producer_index].lock() {
                    producer.on_condition_changed(state, event_time_ns, &ctx);
                }
            }
        }
    }

    /// App upgrade: every producer splits its current bucket at
    /// `event_time_ns`.
    pub fn notify_app_upgrade(&mut self, event_time_ns: i64, pkg: &str, uid: i32, version: i64) {
        info!(pkg, uid, version, "App upgraded; splitting partial buckets");
        for producer in &self.producers {
            if let Ok(mut producer) = producer.lock() {
                producer.notify_app_upgrade(event_time_ns);
            }
        }
    }

    pub fn notify_app_removed(&mut self, event_time_ns: i64, pkg: &str, uid: i32) {
        info!(pkg, uid, "App removed; splitting partial buckets");
        for producer in &self.producers {
            if let Ok(mut producer) = producer.lock() {
                producer.notify_app_upgrade(event_time_ns);
            }
        }
    }

    /// The alarm service fired; route to duration anomaly trackers and
    /// periodic alarm trackers.
    pub fn inform_alarms_fired(&mut self, timestamp_ns: i64, fired: &mut HashSet<u64>) {
        for producer in &self.producers {
            if let Ok(mut producer) = producer.lock() {
                producer.inform_alarms_fired(timestamp_ns, fired);
            }
        }
        for tracker in self.alarm_trackers.iter_mut() {
            tracker.inform_alarms_fired(timestamp_ns, fired);
        }
    }

    /// Produce and write a report for this config.
    pub fn on_dump_report(
        &self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        dump_latency: DumpLatency,
        reason: DumpReportReason,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        let ctx = ProducerContext {
            wizard: ConditionWizard::new(&self.conditions),
            states: &self.states,
            pullers: self.pullers.as_ref(),
        };
        let mut metrics = Vec::with_capacity(self.producers.len());
        for producer in &self.producers {
            let Ok(mut producer) = producer.lock() else {
                continue;
            };
            if self.no_report_metric_ids.contains(&producer.metric_id()) {
                // Still flushed so state stays bounded, just not reported.
                producer.on_dump_report(
                    dump_time_ns,
                    include_current_partial_bucket,
                    erase_data,
                    DumpLatency::Fast,
                    &ctx,
                );
                continue;
            }
            metrics.push(producer.on_dump_report(
                dump_time_ns,
                include_current_partial_bucket,
                erase_data,
                dump_latency,
                &ctx,
            ));
        }

        let report = ConfigReport {
            config_id: self.config_key.id,
            config_uid: self.config_key.uid,
            reason,
            wall_clock: Utc::now(),
            dump_time_ns,
            metrics,
        };
        ReportWriter::new(out).write(&report)
    }

    /// Memory-pressure escape hatch.
    pub fn drop_data(&mut self, drop_time_ns: i64) {
        info!(config = %self.config_key, "Dropping past-bucket data");
        for producer in &self.producers {
            if let Ok(mut producer) = producer.lock() {
                producer.drop_data(drop_time_ns);
            }
        }
    }

    pub fn byte_size(&self) -> usize {
        self.producers
            .iter()
            .filter_map(|p| p.lock().ok().map(|p| p.byte_size()))
            .sum()
    }

    // ========================================================================
    // Activation persistence
    // ========================================================================

    /// Snapshot still-active activations for the persisted blob.
    pub fn collect_active_blob(&self, current_time_ns: i64) -> ActiveConfigBlob {
        let mut metrics = Vec::new();
        for producer in &self.producers {
            let Ok(producer) = producer.lock() else {
                continue;
            };
            if !producer.has_activations() {
                continue;
            }
            let activations: Vec<ActiveActivationBlob> = producer
                .saved_activations(current_time_ns)
                .into_iter()
                .map(|a| ActiveActivationBlob {
                    activation_index: a.activation_index,
                    remaining_ttl_ns: a.remaining_ttl_ns,
                    active_on_boot: a.active_on_boot,
                })
                .collect();
            if !activations.is_empty() {
                metrics.push(ActiveMetricBlob {
                    metric_id: producer.metric_id(),
                    activations,
                });
            }
        }
        ActiveConfigBlob {
            config_id: self.config_key.id,
            config_uid: self.config_key.uid,
            metrics,
        }
    }

    /// Restore activations from the persisted blob at startup.
    pub fn load_active_blob(&self, blob: &ActiveConfigBlob, current_time_ns: i64) {
        if blob.config_id != self.config_key.id {
            return;
        }
        for metric_blob in &blob.metrics {
            let Some(&index) = self.metric_id_to_index.get(&metric_blob.metric_id) else {
                continue;
            };
            let Ok(mut producer) = self.producers[index].lock() else {
                continue;
            };
            let saved: Vec<crate::metrics::SavedActivation> = metric_blob
                .activations
                .iter()
                .map(|a| crate::metrics::SavedActivation {
                    activation_index: a.activation_index,
                    remaining_ttl_ns: a.remaining_ttl_ns,
                    active_on_boot: a.active_on_boot,
                })
                .collect();
            producer.load_activations(&saved, current_time_ns);
        }
    }
}
