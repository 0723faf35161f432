//! Config lifecycle: atomic install/reject, update with state
//! preservation, activations with persistence, partial bucket splits.

use std::sync::Arc;

use pulsed::builder::{build, build_with_history, BuildParams};
use pulsed::config::{AggregationConfig, ConfigError, ConfigKey};
use pulsed::external::{EmptyPackageResolver, InertAlarmMonitor, LogSubscriberSink, NoPullers};
use pulsed::report::{ConfigReport, DumpReportReason, MetricData};
use pulsed::storage::{load_active_configs, save_active_configs, ActiveConfigsBlob};
use pulsed::types::Event;
use pulsed::{DumpLatency, MetricsManager};

const BUCKET_NS: i64 = 60_000_000_000;
const TIME_BASE_NS: i64 = 10_000_000_000;

fn params() -> BuildParams {
    BuildParams {
        config_key: ConfigKey::new(1000, 12345),
        time_base_ns: TIME_BASE_NS,
        start_time_sec: 0,
        resolver: Arc::new(EmptyPackageResolver),
        pullers: Arc::new(NoPullers),
        alarm_monitor: Arc::new(InertAlarmMonitor::default()),
        subscriber_sink: Arc::new(LogSubscriberSink),
    }
}

fn install(json: &str) -> MetricsManager {
    let config: AggregationConfig = serde_json::from_str(json).expect("config parses");
    build(&config, &params()).expect("config installs")
}

fn dump(manager: &MetricsManager, dump_time_ns: i64) -> ConfigReport {
    let mut out = Vec::new();
    manager
        .on_dump_report(
            dump_time_ns,
            true,
            false,
            DumpLatency::Fast,
            DumpReportReason::GetDataCalled,
            &mut out,
        )
        .expect("dump succeeds");
    serde_json::from_slice(&out).expect("report parses")
}

fn total_count(report: &ConfigReport, metric_id: i64) -> i64 {
    report
        .metrics
        .iter()
        .find(|m| m.metric_id == metric_id)
        .map(|m| match &m.data {
            MetricData::Count(dims) => dims
                .iter()
                .flat_map(|d| d.buckets.iter())
                .map(|b| b.count)
                .sum(),
            _ => 0,
        })
        .unwrap_or(0)
}

const BASE_CONFIG: &str = r#"{
    "id": 12345,
    "atom_matchers": [ { "id": 1, "simple": { "atom_id": 2 } } ],
    "count_metrics": [ { "id": 100, "what": 1, "bucket_size_millis": 60000 } ]
}"#;

#[test]
fn identical_update_preserves_past_buckets() {
    let mut manager = install(BASE_CONFIG);
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 1).normalized());
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 2).normalized());
    // Close bucket 0.
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + BUCKET_NS + 1).normalized());

    let config: AggregationConfig = serde_json::from_str(BASE_CONFIG).unwrap();
    let manager = build_with_history(&config, &params(), manager).expect("update succeeds");

    let report = dump(&manager, TIME_BASE_NS + 2 * BUCKET_NS);
    // Bucket 0 (2 counts) and bucket 1 (1 count) both survived.
    assert_eq!(total_count(&report, 100), 3);
}

#[test]
fn changed_matcher_bytes_reset_producer_state() {
    let mut manager = install(BASE_CONFIG);
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 1).normalized());
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + BUCKET_NS + 1).normalized());

    // Same ids, but the matcher now constrains a field: its bytes changed.
    let changed: &str = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "simple": { "atom_id": 2,
              "field_value_matchers": [ { "field": 1, "eq_int": 2 } ] } }
        ],
        "count_metrics": [ { "id": 100, "what": 1, "bucket_size_millis": 60000 } ]
    }"#;
    let config: AggregationConfig = serde_json::from_str(changed).unwrap();
    let manager = build_with_history(&config, &params(), manager).expect("update succeeds");

    let report = dump(&manager, TIME_BASE_NS + 2 * BUCKET_NS);
    assert_eq!(total_count(&report, 100), 0);
}

#[test]
fn rejected_update_keeps_previous_config_active() {
    let mut manager = install(BASE_CONFIG);
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 1).normalized());

    // Metric references a missing matcher: the whole document is rejected.
    let broken = r#"{
        "id": 12345,
        "atom_matchers": [ { "id": 1, "simple": { "atom_id": 2 } } ],
        "count_metrics": [ { "id": 100, "what": 99, "bucket_size_millis": 60000 } ]
    }"#;
    let config: AggregationConfig = serde_json::from_str(broken).unwrap();
    let (error, mut manager) = match build_with_history(&config, &params(), manager) {
        Err(pair) => pair,
        Ok(_) => panic!("broken config must be rejected"),
    };
    assert!(matches!(error, ConfigError::UnknownReference { .. }));

    // The old pipeline keeps processing.
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 2).normalized());
    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    assert_eq!(total_count(&report, 100), 2);
}

#[test]
fn cyclic_matcher_graph_is_rejected() {
    let cyclic = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "combination": { "operation": "AND", "matchers": [2] } },
            { "id": 2, "combination": { "operation": "AND", "matchers": [1] } }
        ]
    }"#;
    let config: AggregationConfig = serde_json::from_str(cyclic).unwrap();
    assert!(matches!(
        build(&config, &params()),
        Err(ConfigError::Cycle { .. })
    ));
}

#[test]
fn duplicate_metric_ids_are_rejected() {
    let duplicated = r#"{
        "id": 12345,
        "atom_matchers": [ { "id": 1, "simple": { "atom_id": 2 } } ],
        "count_metrics": [
            { "id": 100, "what": 1 },
            { "id": 100, "what": 1 }
        ]
    }"#;
    let config: AggregationConfig = serde_json::from_str(duplicated).unwrap();
    assert!(matches!(
        build(&config, &params()),
        Err(ConfigError::DuplicateId { kind: "metric", .. })
    ));
}

#[test]
fn link_to_condition_outside_the_metrics_condition_is_rejected() {
    // Condition 11 exists but is unrelated to the metric's condition 10:
    // the link would be queried without ever gating the metric.
    let config_json = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "simple": { "atom_id": 2 } },
            { "id": 2, "simple": { "atom_id": 3 } },
            { "id": 3, "simple": { "atom_id": 4 } },
            { "id": 4, "simple": { "atom_id": 5 } },
            { "id": 5, "simple": { "atom_id": 6 } }
        ],
        "predicates": [
            { "id": 10, "simple": { "start": 2, "stop": 3, "count_nesting": false,
              "dimensions": { "fields": [ { "field": [1] } ] } } },
            { "id": 11, "simple": { "start": 4, "stop": 5, "count_nesting": false,
              "dimensions": { "fields": [ { "field": [1] } ] } } }
        ],
        "count_metrics": [
            { "id": 100, "what": 1, "condition": 10, "bucket_size_millis": 60000,
              "links": [ { "condition": 11,
                "fields_in_what": { "fields": [ { "field": [1] } ] },
                "fields_in_condition": { "fields": [ { "field": [1] } ] } } ] }
        ]
    }"#;
    let config: AggregationConfig = serde_json::from_str(config_json).unwrap();
    assert!(matches!(
        build(&config, &params()),
        Err(ConfigError::UnlinkedCondition { .. })
    ));

    // The same link is fine when the combination condition contains the
    // linked predicate as a component.
    let combined_json = r#"{
        "id": 12345,
        "atom_matchers": [
            { "id": 1, "simple": { "atom_id": 2 } },
            { "id": 2, "simple": { "atom_id": 3 } },
            { "id": 3, "simple": { "atom_id": 4 } },
            { "id": 4, "simple": { "atom_id": 5 } },
            { "id": 5, "simple": { "atom_id": 6 } }
        ],
        "predicates": [
            { "id": 10, "simple": { "start": 2, "stop": 3, "count_nesting": false } },
            { "id": 11, "simple": { "start": 4, "stop": 5, "count_nesting": false,
              "dimensions": { "fields": [ { "field": [1] } ] } } },
            { "id": 12, "combination": { "operation": "AND", "predicates": [10, 11] } }
        ],
        "count_metrics": [
            { "id": 100, "what": 1, "condition": 12, "bucket_size_millis": 60000,
              "links": [ { "condition": 11,
                "fields_in_what": { "fields": [ { "field": [1] } ] },
                "fields_in_condition": { "fields": [ { "field": [1] } ] } } ] }
        ]
    }"#;
    let config: AggregationConfig = serde_json::from_str(combined_json).unwrap();
    assert!(build(&config, &params()).is_ok());
}

#[test]
fn invalid_alert_is_ignored_not_fatal() {
    let config_json = r#"{
        "id": 12345,
        "atom_matchers": [ { "id": 1, "simple": { "atom_id": 2 } } ],
        "count_metrics": [ { "id": 100, "what": 1, "bucket_size_millis": 60000 } ],
        "alerts": [ { "id": 200, "metric_id": 100, "num_buckets": 3 } ]
    }"#;
    let config: AggregationConfig = serde_json::from_str(config_json).unwrap();
    // Missing threshold: alert dropped, config still installs.
    assert!(build(&config, &params()).is_ok());
}

const ACTIVATION_CONFIG: &str = r#"{
    "id": 12345,
    "atom_matchers": [
        { "id": 1, "simple": { "atom_id": 2 } },
        { "id": 5, "simple": { "atom_id": 50 } },
        { "id": 6, "simple": { "atom_id": 51 } }
    ],
    "count_metrics": [ { "id": 100, "what": 1, "bucket_size_millis": 60000 } ],
    "metric_activations": [
        { "metric_id": 100, "event_activations": [
            { "atom_matcher_id": 5, "ttl_seconds": 60,
              "deactivation_atom_matcher_id": 6 }
        ] }
    ]
}"#;

#[test]
fn metric_counts_only_while_activated() {
    let mut manager = install(ACTIVATION_CONFIG);

    // Not yet activated: events are ignored.
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 1).normalized());

    // Activator arrives; the metric counts for ttl_seconds.
    manager.deliver_event(&Event::new(50, TIME_BASE_NS + 10).normalized());
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 20).normalized());

    // Deactivator cancels.
    manager.deliver_event(&Event::new(51, TIME_BASE_NS + 30).normalized());
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 40).normalized());

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    assert_eq!(total_count(&report, 100), 1);
}

#[test]
fn activation_expires_after_ttl() {
    let mut manager = install(ACTIVATION_CONFIG);
    manager.deliver_event(&Event::new(50, TIME_BASE_NS).normalized());
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 1).normalized());

    // 61 seconds later the activation has timed out.
    let late = TIME_BASE_NS + 61_000_000_000;
    manager.deliver_event(&Event::new(2, late).normalized());

    let report = dump(&manager, TIME_BASE_NS + 2 * BUCKET_NS);
    assert_eq!(total_count(&report, 100), 1);
}

#[test]
fn activations_survive_restart_via_blob() {
    let dir = tempfile::tempdir().unwrap();
    let blob_path = dir.path().join("active_configs.json");

    let mut manager = install(ACTIVATION_CONFIG);
    manager.deliver_event(&Event::new(50, TIME_BASE_NS).normalized());

    // Shutdown at +10s: 50s of TTL left.
    let shutdown_ns = TIME_BASE_NS + 10_000_000_000;
    let blob = ActiveConfigsBlob {
        configs: vec![manager.collect_active_blob(shutdown_ns)],
    };
    assert_eq!(blob.configs[0].metrics.len(), 1);
    save_active_configs(&blob_path, &blob).unwrap();

    // Fresh process: load the blob and keep counting without a new
    // activator event.
    let manager2 = install(ACTIVATION_CONFIG);
    let loaded = load_active_configs(&blob_path).unwrap();
    for config_blob in &loaded.configs {
        manager2.load_active_blob(config_blob, shutdown_ns);
    }
    let mut manager2 = manager2;
    manager2.deliver_event(&Event::new(2, shutdown_ns + 1).normalized());

    let report = dump(&manager2, TIME_BASE_NS + BUCKET_NS);
    assert_eq!(total_count(&report, 100), 1);
}

#[test]
fn app_upgrade_splits_partial_bucket_at_event_time() {
    let mut manager = install(BASE_CONFIG);
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 1).normalized());

    let split_time = TIME_BASE_NS + 30_000_000_000;
    manager.notify_app_upgrade(split_time, "com.example.app", 10001, 2);
    manager.deliver_event(&Event::new(2, split_time + 1).normalized());

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    let metric = &report.metrics[0];
    match &metric.data {
        MetricData::Count(dims) => {
            let mut buckets: Vec<(i64, i64, i64)> = dims
                .iter()
                .flat_map(|d| d.buckets.iter())
                .map(|b| (b.bucket_start_ns, b.bucket_end_ns, b.count))
                .collect();
            buckets.sort();
            // Split bucket ends at the upgrade; the remainder ends on the
            // normal boundary.
            assert_eq!(
                buckets,
                vec![
                    (TIME_BASE_NS, split_time, 1),
                    (split_time, TIME_BASE_NS + BUCKET_NS, 1),
                ]
            );
        }
        other => panic!("expected count data, got {other:?}"),
    }
}

#[test]
fn no_report_metrics_are_evaluated_but_omitted() {
    let config_json = r#"{
        "id": 12345,
        "atom_matchers": [ { "id": 1, "simple": { "atom_id": 2 } } ],
        "count_metrics": [ { "id": 100, "what": 1, "bucket_size_millis": 60000 } ],
        "no_report_metrics": [100]
    }"#;
    let mut manager = install(config_json);
    manager.deliver_event(&Event::new(2, TIME_BASE_NS + 1).normalized());
    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    assert!(report.metrics.is_empty());
}
