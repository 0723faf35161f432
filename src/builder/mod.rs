//! Config parser / builder
//!
//! Turns a declarative [`AggregationConfig`] into an executable
//! [`MetricsManager`], in a fixed pass order: matchers, predicates, states,
//! metrics, activations, alerts, alarms, then state registration. Every id
//! reference resolves to an index here; cycles and malformed nodes reject
//! the whole document before any runtime state is touched, so the
//! previously installed config stays active on failure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::anomaly::AlarmTracker;
use crate::condition::{
    collect_condition_components, init_condition, is_changed_dimension_trackable, ConditionTracker,
};
use crate::config::{
    AggregationConfig, ConfigError, ConfigKey, CountMetric, Dimensions, DurationMetric,
    EventMetric, GaugeMetric, GaugeSamplingType, MetricActivation, MetricConditionLink,
    PredicateSpec, ValueMetric,
};
use crate::external::{AlarmMonitor, PackageResolver, PullerRegistry, SubscriberSink};
use crate::hash::stable_hash;
use crate::manager::MetricsManager;
use crate::matchers::{init_matcher, AtomMatchingTracker};
use crate::metrics::count::CountMetricState;
use crate::metrics::duration::DurationMetricState;
use crate::metrics::event::EventMetricState;
use crate::metrics::gauge::GaugeMetricState;
use crate::metrics::value::ValueMetricState;
use crate::metrics::{MetricCore, MetricKind, MetricProducer};
use crate::state::StateManager;

/// Everything the build needs besides the config document itself.
pub struct BuildParams {
    pub config_key: ConfigKey,
    /// Origin of every metric's bucket clock.
    pub time_base_ns: i64,
    /// Wall-clock seconds at install, used to phase periodic alarms.
    pub start_time_sec: i64,
    pub resolver: Arc<dyn PackageResolver>,
    pub pullers: Arc<dyn PullerRegistry>,
    pub alarm_monitor: Arc<dyn AlarmMonitor>,
    pub subscriber_sink: Arc<dyn SubscriberSink>,
}

/// Bucket "size" given to event metrics, which have no bucket clock; large
/// enough that the clock never advances.
const EVENT_METRIC_BUCKET_NS: i64 = i64::MAX / 4;

/// Build an executable manager from a config document. All-or-nothing: on
/// error no partial state escapes.
pub fn build(config: &AggregationConfig, params: &BuildParams) -> Result<MetricsManager, ConfigError> {
    let mut builder = Builder::new(config, params)?;
    builder.init_metrics()?;
    builder.init_activations()?;
    builder.init_alerts()?;
    builder.init_alarms()?;
    let manager = builder.finish();
    info!(
        config = %params.config_key,
        matchers = manager.atom_matchers.len(),
        conditions = manager.conditions.len(),
        metrics = manager.metric_count(),
        "Config installed"
    );
    Ok(manager)
}

/// Build a manager for an updated config, carrying aggregation history
/// from `old` for every metric whose identity hash is unchanged. On
/// failure the old manager is handed back untouched so the previous config
/// stays active.
pub fn build_with_history(
    config: &AggregationConfig,
    params: &BuildParams,
    old: MetricsManager,
) -> Result<MetricsManager, (ConfigError, MetricsManager)> {
    let new = match build(config, params) {
        Ok(new) => new,
        Err(e) => return Err((e, old)),
    };

    // Index the old producers by identity hash, consuming the old manager.
    let mut old_by_hash: HashMap<u64, MetricProducer> = HashMap::new();
    for producer in old.producers {
        if let Ok(producer) = producer.into_inner() {
            old_by_hash.insert(producer.metric_hash(), producer);
        }
    }

    let mut preserved = 0usize;
    for producer in &new.producers {
        let Ok(mut producer) = producer.lock() else {
            continue;
        };
        if let Some(old_producer) = old_by_hash.remove(&producer.metric_hash()) {
            producer.adopt_history(old_producer);
            preserved += 1;
        }
    }
    info!(
        config = %params.config_key,
        preserved,
        reset = new.producers.len() - preserved,
        "Config updated"
    );
    Ok(new)
}

struct Builder<'a> {
    config: &'a AggregationConfig,
    params: &'a BuildParams,
    matcher_id_to_index: HashMap<i64, usize>,
    condition_id_to_index: HashMap<i64, usize>,
    activation_by_metric: HashMap<i64, &'a MetricActivation>,
    manager: MetricsManager,
}

impl<'a> Builder<'a> {
    /// Passes 1-3: matchers, predicates, states.
    fn new(config: &'a AggregationConfig, params: &'a BuildParams) -> Result<Self, ConfigError> {
        // Pass 1: atom matchers.
        let mut matchers: Vec<AtomMatchingTracker> = Vec::with_capacity(config.atom_matchers.len());
        let mut matcher_id_to_index = HashMap::new();
        for (index, matcher_config) in config.atom_matchers.iter().enumerate() {
            if matcher_id_to_index
                .insert(matcher_config.id, index)
                .is_some()
            {
                return Err(ConfigError::DuplicateId {
                    kind: "matcher",
                    id: matcher_config.id,
                });
            }
            matchers.push(AtomMatchingTracker::new(matcher_config)?);
        }
        let mut stack = vec![false; matchers.len()];
        for index in 0..matchers.len() {
            init_matcher(&mut matchers, index, &matcher_id_to_index, &mut stack)?;
        }

        // Pass 2: predicates.
        let mut conditions: Vec<ConditionTracker> = Vec::with_capacity(config.predicates.len());
        let mut condition_id_to_index = HashMap::new();
        for (index, predicate_config) in config.predicates.iter().enumerate() {
            if condition_id_to_index
                .insert(predicate_config.id, index)
                .is_some()
            {
                return Err(ConfigError::DuplicateId {
                    kind: "predicate",
                    id: predicate_config.id,
                });
            }
            conditions.push(ConditionTracker::new(
                predicate_config,
                &matcher_id_to_index,
            )?);
        }
        let mut stack = vec![false; conditions.len()];
        for index in 0..conditions.len() {
            init_condition(&mut conditions, index, &condition_id_to_index, &mut stack)?;
        }

        // Pass 3: states.
        let mut seen_states = HashMap::new();
        for state in &config.states {
            if seen_states.insert(state.id, ()).is_some() {
                return Err(ConfigError::DuplicateId {
                    kind: "state",
                    id: state.id,
                });
            }
        }
        let states = StateManager::new(&config.states);

        let mut manager = MetricsManager::new(
            params.config_key,
            params.time_base_ns,
            matchers,
            conditions,
            states,
            params.resolver.clone(),
            params.pullers.clone(),
        );
        manager.condition_id_to_index = condition_id_to_index.clone();
        manager.no_report_metric_ids = config.no_report_metrics.iter().copied().collect();
        for source in &config.allowed_log_sources {
            match source.parse::<i32>() {
                Ok(uid) => {
                    manager.allowed_source_uids.insert(uid);
                }
                Err(_) => manager.allowed_source_packages.push(source.clone()),
            }
        }

        let activation_by_metric = config
            .metric_activations
            .iter()
            .map(|a| (a.metric_id, a))
            .collect();

        Ok(Self {
            config,
            params,
            matcher_id_to_index,
            condition_id_to_index,
            activation_by_metric,
            manager,
        })
    }

    fn matcher_index(&self, metric_id: i64, matcher_id: i64) -> Result<usize, ConfigError> {
        self.matcher_id_to_index
            .get(&matcher_id)
            .copied()
            .ok_or(ConfigError::UnknownReference {
                kind: "metric",
                from_id: metric_id,
                to_kind: "matcher",
                to_id: matcher_id,
            })
    }

    /// Resolve a metric's condition id and links into tracker indices and
    /// the condition-sliced flag.
    fn resolve_condition(
        &self,
        metric_id: i64,
        condition: Option<i64>,
        links: &[MetricConditionLink],
    ) -> Result<(Option<usize>, bool, Vec<usize>), ConfigError> {
        let Some(condition_id) = condition else {
            if !links.is_empty() {
                return Err(ConfigError::MissingField {
                    kind: "metric",
                    id: metric_id,
                    field: "condition (required by links)",
                });
            }
            return Ok((None, false, Vec::new()));
        };
        let condition_index = self.condition_id_to_index.get(&condition_id).copied().ok_or(
            ConfigError::UnknownReference {
                kind: "metric",
                from_id: metric_id,
                to_kind: "predicate",
                to_id: condition_id,
            },
        )?;
        // Links may only target the metric's condition or a component of
        // it; a link to an unrelated predicate would be queried but never
        // influence the metric's gate.
        let mut components = HashSet::new();
        collect_condition_components(&self.manager.conditions, condition_index, &mut components);

        let mut link_indices = Vec::with_capacity(links.len());
        for link in links {
            let link_index = self.condition_id_to_index.get(&link.condition).copied().ok_or(
                ConfigError::UnknownReference {
                    kind: "metric",
                    from_id: metric_id,
                    to_kind: "predicate",
                    to_id: link.condition,
                },
            )?;
            if !components.contains(&link_index) {
                return Err(ConfigError::UnlinkedCondition {
                    metric_id,
                    condition_id: link.condition,
                });
            }
            link_indices.push(link_index);
        }
        let sliced =
            !links.is_empty() || self.manager.conditions[condition_index].is_sliced();
        Ok((Some(condition_index), sliced, link_indices))
    }

    /// Resolve `slice_by_states` into atom ids, rejecting whitelisted
    /// atoms.
    fn resolve_state_slices(
        &self,
        metric_id: i64,
        slice_by_states: &[i64],
    ) -> Result<Vec<i32>, ConfigError> {
        let mut atoms = Vec::with_capacity(slice_by_states.len());
        for &state_id in slice_by_states {
            let atom_id = self.manager.states.atom_id_for_state(state_id).ok_or(
                ConfigError::UnknownReference {
                    kind: "metric",
                    from_id: metric_id,
                    to_kind: "state",
                    to_id: state_id,
                },
            )?;
            if self.config.whitelisted_atom_ids.contains(&atom_id) {
                return Err(ConfigError::StateSliceNotAllowed { metric_id, atom_id });
            }
            atoms.push(atom_id);
        }
        Ok(atoms)
    }

    fn register_metric(
        &mut self,
        producer: MetricProducer,
        what_matchers: &[usize],
        slice_atoms: &[i32],
    ) -> Result<usize, ConfigError> {
        let metric_id = producer.metric_id();
        let index = self.manager.producers.len();
        if self
            .manager
            .metric_id_to_index
            .insert(metric_id, index)
            .is_some()
        {
            return Err(ConfigError::DuplicateId {
                kind: "metric",
                id: metric_id,
            });
        }
        // Register under the main condition and under every linked
        // condition: a sliced child can change per-dimension without
        // flipping the combination's summary state.
        let mut condition_indices: Vec<usize> = producer
            .condition_tracker_index()
            .into_iter()
            .chain(producer.link_condition_indices().iter().copied())
            .collect();
        condition_indices.sort_unstable();
        condition_indices.dedup();
        for condition_index in condition_indices {
            self.manager
                .condition_to_metric
                .entry(condition_index)
                .or_default()
                .push(index);
        }
        for &matcher_index in what_matchers {
            self.manager
                .tracker_to_metric
                .entry(matcher_index)
                .or_default()
                .push(index);
        }
        for &atom_id in slice_atoms {
            self.manager.states.register_listener(atom_id, index);
        }
        self.manager.producers.push(Mutex::new(producer));
        Ok(index)
    }

    /// Identity hash binding the metric config, its activation, and the
    /// content of the nodes it references. Any byte change resets producer
    /// state across updates.
    fn identity_hash(
        &self,
        metric_hash: u64,
        metric_id: i64,
        what_hash: u64,
        condition_index: Option<usize>,
    ) -> u64 {
        let mut hash = metric_hash ^ what_hash.rotate_left(17);
        if let Some(index) = condition_index {
            hash ^= self.manager.conditions[index].proto_hash().rotate_left(34);
        }
        if let Some(activation) = self.activation_by_metric.get(&metric_id) {
            hash ^= stable_hash(activation).rotate_left(51);
        }
        hash
    }

    fn core(
        &self,
        metric_id: i64,
        metric_hash: u64,
        bucket_size_ns: i64,
        condition_index: Option<usize>,
        condition_sliced: bool,
        links: Vec<MetricConditionLink>,
        link_indices: Vec<usize>,
        dimensions_in_what: Dimensions,
        dimensions_in_condition: Dimensions,
        slice_atoms: Vec<i32>,
    ) -> MetricCore {
        MetricCore {
            metric_id,
            config_key: self.params.config_key,
            metric_hash,
            time_base_ns: self.params.time_base_ns,
            bucket_size_ns,
            condition_tracker_index: condition_index,
            condition_sliced,
            links,
            link_condition_indices: link_indices,
            dimensions_in_what,
            dimensions_in_condition,
            slice_by_state_atoms: slice_atoms,
        }
    }

    // ========================================================================
    // Pass 4: metrics
    // ========================================================================

    fn init_metrics(&mut self) -> Result<(), ConfigError> {
        let config = self.config;
        for metric in &config.count_metrics {
            self.init_count_metric(metric)?;
        }
        for metric in &config.event_metrics {
            self.init_event_metric(metric)?;
        }
        for metric in &config.value_metrics {
            self.init_value_metric(metric)?;
        }
        for metric in &config.gauge_metrics {
            self.init_gauge_metric(metric)?;
        }
        for metric in &config.duration_metrics {
            self.init_duration_metric(metric)?;
        }
        Ok(())
    }

    fn init_count_metric(&mut self, metric: &CountMetric) -> Result<(), ConfigError> {
        let what_index = self.matcher_index(metric.id, metric.what)?;
        let (condition_index, sliced, link_indices) =
            self.resolve_condition(metric.id, metric.condition, &metric.links)?;
        let slice_atoms = self.resolve_state_slices(metric.id, &metric.slice_by_states)?;
        let hash = self.identity_hash(
            stable_hash(metric),
            metric.id,
            self.manager.atom_matchers[what_index].proto_hash(),
            condition_index,
        );
        let core = self.core(
            metric.id,
            hash,
            metric.bucket.bucket_size_ns(),
            condition_index,
            sliced,
            metric.links.clone(),
            link_indices,
            metric.dimensions_in_what.clone(),
            metric.dimensions_in_condition.clone(),
            slice_atoms.clone(),
        );
        let producer = MetricProducer::new(core, MetricKind::Count(CountMetricState::new()));
        self.register_metric(producer, &[what_index], &slice_atoms)?;
        Ok(())
    }

    fn init_event_metric(&mut self, metric: &EventMetric) -> Result<(), ConfigError> {
        let what_index = self.matcher_index(metric.id, metric.what)?;
        let (condition_index, sliced, link_indices) =
            self.resolve_condition(metric.id, metric.condition, &metric.links)?;
        let hash = self.identity_hash(
            stable_hash(metric),
            metric.id,
            self.manager.atom_matchers[what_index].proto_hash(),
            condition_index,
        );
        let core = self.core(
            metric.id,
            hash,
            EVENT_METRIC_BUCKET_NS,
            condition_index,
            sliced,
            metric.links.clone(),
            link_indices,
            Dimensions::default(),
            Dimensions::default(),
            Vec::new(),
        );
        let producer = MetricProducer::new(core, MetricKind::Event(EventMetricState::new()));
        self.register_metric(producer, &[what_index], &[])?;
        Ok(())
    }

    /// The pull atom for a metric's what-matcher, when a puller serves its
    /// (single) atom id.
    fn pull_atom_for(&self, what_index: usize) -> Option<i32> {
        let atom_ids = self.manager.atom_matchers[what_index].atom_ids();
        if atom_ids.len() != 1 {
            return None;
        }
        let atom_id = atom_ids.iter().next().copied()?;
        if self.params.pullers.puller_for_atom_exists(atom_id) {
            Some(atom_id)
        } else {
            None
        }
    }

    fn init_value_metric(&mut self, metric: &ValueMetric) -> Result<(), ConfigError> {
        let what_index = self.matcher_index(metric.id, metric.what)?;
        let (condition_index, sliced, link_indices) =
            self.resolve_condition(metric.id, metric.condition, &metric.links)?;
        let pull_atom_id = self.pull_atom_for(what_index);
        if let Some(atom_id) = pull_atom_id {
            self.params
                .pullers
                .register_receiver(atom_id, metric.bucket.bucket_size_ns() / 1_000_000);
        }
        let hash = self.identity_hash(
            stable_hash(metric),
            metric.id,
            self.manager.atom_matchers[what_index].proto_hash(),
            condition_index,
        );
        let core = self.core(
            metric.id,
            hash,
            metric.bucket.bucket_size_ns(),
            condition_index,
            sliced,
            metric.links.clone(),
            link_indices,
            metric.dimensions_in_what.clone(),
            metric.dimensions_in_condition.clone(),
            Vec::new(),
        );
        let state = ValueMetricState::new(metric.value_field, metric.aggregation_type, pull_atom_id);
        let producer = MetricProducer::new(core, MetricKind::Value(state));
        self.register_metric(producer, &[what_index], &[])?;
        Ok(())
    }

    fn init_gauge_metric(&mut self, metric: &GaugeMetric) -> Result<(), ConfigError> {
        let what_index = self.matcher_index(metric.id, metric.what)?;
        let (condition_index, sliced, link_indices) =
            self.resolve_condition(metric.id, metric.condition, &metric.links)?;
        let trigger_index = match metric.trigger_event {
            None => None,
            Some(trigger_id) => Some(self.matcher_index(metric.id, trigger_id)?),
        };
        if metric.sampling_type == GaugeSamplingType::OnTrigger && trigger_index.is_none() {
            return Err(ConfigError::MissingField {
                kind: "metric",
                id: metric.id,
                field: "trigger_event",
            });
        }
        let pull_atom_id = self.pull_atom_for(what_index);
        if metric.sampling_type == GaugeSamplingType::OnTrigger && pull_atom_id.is_none() {
            warn!(
                metric = metric.id,
                "Triggered gauge without a puller never samples"
            );
        }
        let hash = self.identity_hash(
            stable_hash(metric),
            metric.id,
            self.manager.atom_matchers[what_index].proto_hash(),
            condition_index,
        );
        let core = self.core(
            metric.id,
            hash,
            metric.bucket.bucket_size_ns(),
            condition_index,
            sliced,
            metric.links.clone(),
            link_indices,
            metric.dimensions_in_what.clone(),
            metric.dimensions_in_condition.clone(),
            Vec::new(),
        );
        let state = GaugeMetricState::new(
            metric.sampling_type,
            trigger_index,
            metric.max_num_gauge_atoms_per_bucket,
            pull_atom_id,
        );
        let producer = MetricProducer::new(core, MetricKind::Gauge(state));
        let mut what_matchers = vec![what_index];
        if let Some(trigger) = trigger_index {
            what_matchers.push(trigger);
        }
        self.register_metric(producer, &what_matchers, &[])?;
        Ok(())
    }

    fn init_duration_metric(&mut self, metric: &DurationMetric) -> Result<(), ConfigError> {
        // The duration metric's `what` is a simple predicate.
        let predicate_index = self.condition_id_to_index.get(&metric.what).copied().ok_or(
            ConfigError::UnknownReference {
                kind: "metric",
                from_id: metric.id,
                to_kind: "predicate",
                to_id: metric.what,
            },
        )?;
        let predicate_config = self
            .config
            .predicates
            .iter()
            .find(|p| p.id == metric.what)
            .ok_or(ConfigError::UnknownReference {
                kind: "metric",
                from_id: metric.id,
                to_kind: "predicate",
                to_id: metric.what,
            })?;
        let PredicateSpec::Simple(simple) = &predicate_config.spec else {
            return Err(ConfigError::MissingField {
                kind: "metric",
                id: metric.id,
                field: "what (must be a simple predicate)",
            });
        };

        let start_index = match simple.start {
            Some(start_id) => self.matcher_index(metric.id, start_id)?,
            None => {
                return Err(ConfigError::MissingField {
                    kind: "metric",
                    id: metric.id,
                    field: "what.start",
                })
            }
        };
        let stop_index = match simple.stop {
            Some(stop_id) => Some(self.matcher_index(metric.id, stop_id)?),
            None => None,
        };
        let stop_all_index = match simple.stop_all {
            Some(stop_all_id) => Some(self.matcher_index(metric.id, stop_all_id)?),
            None => None,
        };

        let (condition_index, sliced, link_indices) =
            self.resolve_condition(metric.id, metric.condition, &metric.links)?;
        // A sliced condition must be queryable per dimension key. Simple
        // unsliced conditions answer any key with their plain state and
        // need no check.
        if sliced {
            if let Some(condition_index) = condition_index {
                let tracker = &self.manager.conditions[condition_index];
                let needs_check = tracker.is_sliced() || !tracker.is_simple();
                if needs_check
                    && !is_changed_dimension_trackable(&self.manager.conditions, condition_index)
                {
                    return Err(ConfigError::UntrackableDimensions {
                        id: tracker.id(),
                    });
                }
            }
        }

        let hash = self.identity_hash(
            stable_hash(metric),
            metric.id,
            self.manager.conditions[predicate_index].proto_hash(),
            condition_index,
        );
        let core = self.core(
            metric.id,
            hash,
            metric.bucket.bucket_size_ns(),
            condition_index,
            sliced,
            metric.links.clone(),
            link_indices,
            metric.dimensions_in_what.clone(),
            metric.dimensions_in_condition.clone(),
            Vec::new(),
        );
        let state = DurationMetricState::new(
            metric.aggregation_type,
            simple.count_nesting,
            start_index,
            stop_index,
            stop_all_index,
            simple.dimensions.clone().unwrap_or_default(),
        );
        let producer = MetricProducer::new(core, MetricKind::Duration(state));

        let mut what_matchers = vec![start_index];
        what_matchers.extend(stop_index);
        what_matchers.extend(stop_all_index);
        self.register_metric(producer, &what_matchers, &[])?;
        Ok(())
    }

    // ========================================================================
    // Pass 5: activations
    // ========================================================================

    fn init_activations(&mut self) -> Result<(), ConfigError> {
        let config = self.config;
        for activation in &config.metric_activations {
            let &producer_index = self
                .manager
                .metric_id_to_index
                .get(&activation.metric_id)
                .ok_or(ConfigError::UnknownReference {
                    kind: "activation",
                    from_id: activation.metric_id,
                    to_kind: "metric",
                    to_id: activation.metric_id,
                })?;
            for event_activation in &activation.event_activations {
                if event_activation.ttl_seconds <= 0 {
                    return Err(ConfigError::InvalidActivationTtl {
                        metric_id: activation.metric_id,
                        ttl_seconds: event_activation.ttl_seconds,
                    });
                }
                let activation_index = self
                    .matcher_id_to_index
                    .get(&event_activation.atom_matcher_id)
                    .copied()
                    .ok_or(ConfigError::UnknownReference {
                        kind: "activation",
                        from_id: activation.metric_id,
                        to_kind: "matcher",
                        to_id: event_activation.atom_matcher_id,
                    })?;
                let deactivation_index = match event_activation.deactivation_atom_matcher_id {
                    None => None,
                    Some(matcher_id) => Some(
                        self.matcher_id_to_index.get(&matcher_id).copied().ok_or(
                            ConfigError::UnknownReference {
                                kind: "activation",
                                from_id: activation.metric_id,
                                to_kind: "matcher",
                                to_id: matcher_id,
                            },
                        )?,
                    ),
                };

                if let Ok(mut producer) = self.manager.producers[producer_index].lock() {
                    producer.add_activation(
                        activation_index,
                        event_activation.activation_type,
                        event_activation.ttl_seconds,
                        deactivation_index,
                    );
                }
                self.manager
                    .tracker_to_activation
                    .entry(activation_index)
                    .or_default()
                    .push(producer_index);
                if let Some(deactivation_index) = deactivation_index {
                    self.manager
                        .tracker_to_deactivation
                        .entry(deactivation_index)
                        .or_default()
                        .push(producer_index);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Pass 6: alerts
    // ========================================================================

    fn init_alerts(&mut self) -> Result<(), ConfigError> {
        let config = self.config;
        for alert in &config.alerts {
            let &producer_index = self
                .manager
                .metric_id_to_index
                .get(&alert.metric_id)
                .ok_or(ConfigError::UnknownReference {
                    kind: "alert",
                    from_id: alert.id,
                    to_kind: "metric",
                    to_id: alert.metric_id,
                })?;
            let subscriptions: Vec<_> = config
                .subscriptions
                .iter()
                .filter(|s| s.rule_id == alert.id)
                .cloned()
                .collect();
            let Ok(mut producer) = self.manager.producers[producer_index].lock() else {
                continue;
            };
            match producer.add_anomaly_tracker(
                alert.clone(),
                self.params.subscriber_sink.clone(),
                self.params.alarm_monitor.clone(),
                subscriptions,
            ) {
                Ok(()) => {}
                // A structurally invalid alert is dropped, not fatal.
                Err(
                    e @ (ConfigError::MissingThreshold { .. }
                    | ConfigError::InvalidNumBuckets { .. }),
                ) => {
                    warn!(alert = alert.id, error = %e, "Ignoring invalid alert");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Pass 7: periodic alarms
    // ========================================================================

    fn init_alarms(&mut self) -> Result<(), ConfigError> {
        let config = self.config;
        for alarm in &config.alarms {
            let mut tracker = AlarmTracker::new(
                alarm.clone(),
                self.params.config_key,
                self.params.start_time_sec,
                self.params.alarm_monitor.clone(),
                self.params.subscriber_sink.clone(),
            )?;
            for subscription in config
                .subscriptions
                .iter()
                .filter(|s| s.rule_id == alarm.id)
            {
                tracker.add_subscription(subscription.clone());
            }
            self.manager.alarm_trackers.push(tracker);
        }
        Ok(())
    }

    fn finish(self) -> MetricsManager {
        self.manager
    }
}
