//! Value and gauge metric scenarios, including pulled atoms through a
//! scripted puller and source-allowlist admission.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pulsed::builder::{build, BuildParams};
use pulsed::config::{AggregationConfig, ConfigKey};
use pulsed::external::{
    EmptyPackageResolver, InertAlarmMonitor, LogSubscriberSink, NoPullers, PackageResolver,
    PullerRegistry,
};
use pulsed::report::{ConfigReport, DumpReportReason, MetricData};
use pulsed::types::{Event, FieldValue};
use pulsed::{DumpLatency, MetricsManager};

const BUCKET_NS: i64 = 60_000_000_000;
const TIME_BASE_NS: i64 = 10_000_000_000;

/// Puller that hands out scripted readings for one atom, in order.
struct ScriptedPuller {
    atom_id: i32,
    readings: Mutex<Vec<Option<i64>>>,
}

impl ScriptedPuller {
    fn new(atom_id: i32, readings: Vec<Option<i64>>) -> Self {
        Self {
            atom_id,
            readings: Mutex::new(readings),
        }
    }
}

impl PullerRegistry for ScriptedPuller {
    fn pull(&self, atom_id: i32) -> Option<Vec<Event>> {
        if atom_id != self.atom_id {
            return None;
        }
        let mut readings = self.readings.lock().ok()?;
        if readings.is_empty() {
            return None;
        }
        let value = readings.remove(0)?;
        Some(vec![Event::new(self.atom_id, 0)
            .with_value(1, FieldValue::Long(value))
            .normalized()])
    }

    fn register_receiver(&self, _atom_id: i32, _bucket_millis: i64) {}

    fn puller_for_atom_exists(&self, atom_id: i32) -> bool {
        atom_id == self.atom_id
    }
}

fn params_with(pullers: Arc<dyn PullerRegistry>) -> BuildParams {
    BuildParams {
        config_key: ConfigKey::new(1000, 12345),
        time_base_ns: TIME_BASE_NS,
        start_time_sec: 0,
        resolver: Arc::new(EmptyPackageResolver),
        pullers,
        alarm_monitor: Arc::new(InertAlarmMonitor::default()),
        subscriber_sink: Arc::new(LogSubscriberSink),
    }
}

fn install_with(json: &str, pullers: Arc<dyn PullerRegistry>) -> MetricsManager {
    let config: AggregationConfig = serde_json::from_str(json).expect("config parses");
    build(&config, &params_with(pullers)).expect("config installs")
}

fn dump(manager: &MetricsManager, dump_time_ns: i64, latency: DumpLatency) -> ConfigReport {
    let mut out = Vec::new();
    manager
        .on_dump_report(
            dump_time_ns,
            true,
            false,
            latency,
            DumpReportReason::GetDataCalled,
            &mut out,
        )
        .expect("dump succeeds");
    serde_json::from_slice(&out).expect("report parses")
}

const PUSHED_VALUE_CONFIG: &str = r#"{
    "id": 12345,
    "atom_matchers": [ { "id": 1, "simple": { "atom_id": 5 } } ],
    "value_metrics": [
        { "id": 400, "what": 1, "value_field": [1],
          "aggregation_type": "SUM", "bucket_size_millis": 60000 }
    ]
}"#;

fn value_buckets(report: &ConfigReport, metric_id: i64) -> Vec<(i64, bool)> {
    let metric = report
        .metrics
        .iter()
        .find(|m| m.metric_id == metric_id)
        .expect("metric in report");
    match &metric.data {
        MetricData::Value(dims) => dims
            .iter()
            .flat_map(|d| d.buckets.iter())
            .map(|b| (b.value, b.tainted))
            .collect(),
        other => panic!("expected value data, got {other:?}"),
    }
}

#[test]
fn pushed_values_sum_per_bucket() {
    let mut manager = install_with(PUSHED_VALUE_CONFIG, Arc::new(NoPullers));
    for (t, v) in [(1, 5), (2, 7), (3, 10)] {
        let event = Event::new(5, TIME_BASE_NS + t)
            .with_value(1, FieldValue::Long(v))
            .normalized();
        manager.deliver_event(&event);
    }
    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS, DumpLatency::Fast);
    assert_eq!(value_buckets(&report, 400), vec![(22, false)]);
}

#[test]
fn pulled_value_reports_diff_between_pulls() {
    // Readings: 100 at install-ish (condition edge), 160 at dump.
    let puller = Arc::new(ScriptedPuller::new(5, vec![Some(100), Some(160)]));
    let config = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "simple": { "atom_id": 5 } },
            { "id": 2, "simple": { "atom_id": 3 } },
            { "id": 3, "simple": { "atom_id": 4 } }
        ],
        "predicates": [
            { "id": 10, "simple": { "start": 2, "stop": 3, "count_nesting": false } }
        ],
        "value_metrics": [
            { "id": 400, "what": 1, "value_field": [1], "condition": 10,
              "aggregation_type": "SUM", "bucket_size_millis": 60000 }
        ]
    }"#;
    let mut manager = install_with(config, puller);

    // Condition turns true: the producer pulls and establishes the base.
    manager.deliver_event(&Event::new(3, TIME_BASE_NS + 10).normalized());

    // Dump with time to spare: pulls the end reading, reports the diff.
    let report = dump(
        &manager,
        TIME_BASE_NS + BUCKET_NS,
        DumpLatency::NoTimeConstraints,
    );
    assert_eq!(value_buckets(&report, 400), vec![(60, false)]);
}

#[test]
fn fast_dump_never_pulls() {
    let puller = Arc::new(ScriptedPuller::new(5, vec![Some(100), Some(160)]));
    let config = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "simple": { "atom_id": 5 } },
            { "id": 2, "simple": { "atom_id": 3 } }
        ],
        "predicates": [
            { "id": 10, "simple": { "start": 2, "count_nesting": false } }
        ],
        "value_metrics": [
            { "id": 400, "what": 1, "value_field": [1], "condition": 10,
              "aggregation_type": "SUM", "bucket_size_millis": 60000 }
        ]
    }"#;
    let mut manager = install_with(config, puller.clone());
    manager.deliver_event(&Event::new(3, TIME_BASE_NS + 10).normalized());

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS, DumpLatency::Fast);
    // Only the base was ever pulled; no closed pair, so no value bucket.
    assert!(value_buckets(&report, 400).is_empty());
    // The second scripted reading is still unconsumed.
    assert_eq!(puller.readings.lock().unwrap().len(), 1);
}

#[test]
fn failed_pull_taints_the_bucket() {
    let puller = Arc::new(ScriptedPuller::new(5, vec![Some(100), None]));
    let config = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "simple": { "atom_id": 5 } },
            { "id": 2, "simple": { "atom_id": 3 } },
            { "id": 3, "simple": { "atom_id": 4 } }
        ],
        "predicates": [
            { "id": 10, "simple": { "start": 2, "stop": 3, "count_nesting": false } }
        ],
        "value_metrics": [
            { "id": 400, "what": 1, "value_field": [1], "condition": 10,
              "aggregation_type": "SUM", "bucket_size_millis": 60000 }
        ]
    }"#;
    let mut manager = install_with(config, puller);
    manager.deliver_event(&Event::new(3, TIME_BASE_NS + 10).normalized());
    // Condition falls: the edge pull fails and taints the open interval.
    manager.deliver_event(&Event::new(4, TIME_BASE_NS + 20).normalized());

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS, DumpLatency::Fast);
    let buckets = value_buckets(&report, 400);
    assert_eq!(buckets.len(), 1);
    assert!(buckets[0].1, "bucket should carry the taint flag");
}

const GAUGE_CONFIG: &str = r#"{
    "id": 12345,
    "atom_matchers": [ { "id": 1, "simple": { "atom_id": 5 } } ],
    "gauge_metrics": [
        { "id": 500, "what": 1, "sampling_type": "FIRST_N_SAMPLES",
          "max_num_gauge_atoms_per_bucket": 2, "bucket_size_millis": 60000 }
    ]
}"#;

#[test]
fn gauge_keeps_first_n_samples_per_bucket() {
    let mut manager = install_with(GAUGE_CONFIG, Arc::new(NoPullers));
    for t in 1..=5 {
        let event = Event::new(5, TIME_BASE_NS + t)
            .with_value(1, FieldValue::Long(t))
            .normalized();
        manager.deliver_event(&event);
    }
    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS, DumpLatency::Fast);
    let metric = &report.metrics[0];
    match &metric.data {
        MetricData::Gauge(dims) => {
            assert_eq!(dims.len(), 1);
            assert_eq!(dims[0].buckets.len(), 1);
            assert_eq!(dims[0].buckets[0].atoms.len(), 2);
        }
        other => panic!("expected gauge data, got {other:?}"),
    }
}

#[test]
fn triggered_gauge_pulls_and_samples() {
    let puller = Arc::new(ScriptedPuller::new(5, vec![Some(42)]));
    let config = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "simple": { "atom_id": 5 } },
            { "id": 2, "simple": { "atom_id": 7 } }
        ],
        "gauge_metrics": [
            { "id": 500, "what": 1, "sampling_type": "ON_TRIGGER",
              "trigger_event": 2, "bucket_size_millis": 60000 }
        ]
    }"#;
    let mut manager = install_with(config, puller);

    manager.deliver_event(&Event::new(7, TIME_BASE_NS + 5).normalized());

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS, DumpLatency::Fast);
    let metric = &report.metrics[0];
    match &metric.data {
        MetricData::Gauge(dims) => {
            assert_eq!(dims.len(), 1);
            let atom = &dims[0].buckets[0].atoms[0];
            assert_eq!(atom.fields[0].value, FieldValue::Long(42));
            // The pulled sample is stamped with the trigger's timestamp.
            assert_eq!(atom.elapsed_timestamp_ns, TIME_BASE_NS + 5);
        }
        other => panic!("expected gauge data, got {other:?}"),
    }
}

#[test]
fn disallowed_log_sources_are_rejected() {
    struct OnePackage;
    impl PackageResolver for OnePackage {
        fn app_names_from_uid(&self, uid: i32, _normalize: bool) -> HashSet<String> {
            let mut names = HashSet::new();
            if uid == 10001 {
                names.insert("com.example.allowed".to_string());
            }
            names
        }
    }

    let config_json = r#"{
        "id": 12345,
        "atom_matchers": [ { "id": 1, "simple": { "atom_id": 2 } } ],
        "count_metrics": [ { "id": 100, "what": 1, "bucket_size_millis": 60000 } ],
        "allowed_log_sources": ["1000", "com.example.allowed"]
    }"#;
    let config: AggregationConfig = serde_json::from_str(config_json).unwrap();
    let mut params = params_with(Arc::new(NoPullers));
    params.resolver = Arc::new(OnePackage);
    let mut manager = build(&config, &params).unwrap();

    let mut from = |uid: i32, t: i64| {
        let mut event = Event::new(2, TIME_BASE_NS + t).normalized();
        event.uid = uid;
        manager.deliver_event(&event);
    };
    from(1000, 1); // allowed by uid
    from(10001, 2); // allowed by package
    from(4444, 3); // rejected
    drop(from);

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS, DumpLatency::Fast);
    match &report.metrics[0].data {
        MetricData::Count(dims) => {
            assert_eq!(dims[0].buckets[0].count, 2);
        }
        other => panic!("expected count data, got {other:?}"),
    }
}
