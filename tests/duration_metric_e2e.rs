//! End-to-end duration metric scenarios: wakelock-style start/stop pairs
//! driven through the full pipeline.

use std::sync::Arc;

use pulsed::builder::{build, BuildParams};
use pulsed::config::{AggregationConfig, ConfigKey};
use pulsed::external::{EmptyPackageResolver, InertAlarmMonitor, LogSubscriberSink, NoPullers};
use pulsed::report::{ConfigReport, DumpReportReason, MetricData};
use pulsed::types::{Event, FieldValue};
use pulsed::{DumpLatency, MetricsManager};

const BUCKET_NS: i64 = 60_000_000_000;
const TIME_BASE_NS: i64 = 10_000_000_000;

const ACQUIRE_ATOM: i32 = 10;
const RELEASE_ATOM: i32 = 11;

fn install(json: &str) -> MetricsManager {
    let config: AggregationConfig = serde_json::from_str(json).expect("config parses");
    let params = BuildParams {
        config_key: ConfigKey::new(1000, 12345),
        time_base_ns: TIME_BASE_NS,
        start_time_sec: 0,
        resolver: Arc::new(EmptyPackageResolver),
        pullers: Arc::new(NoPullers),
        alarm_monitor: Arc::new(InertAlarmMonitor::default()),
        subscriber_sink: Arc::new(LogSubscriberSink),
    };
    build(&config, &params).expect("config installs")
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

fn duration_buckets(report: &ConfigReport, metric_id: i64) -> Vec<(i64, i64, i64)> {
    let metric = report
        .metrics
        .iter()
        .find(|m| m.metric_id == metric_id)
        .expect("metric in report");
    match &metric.data {
        MetricData::Duration(dims) => {
            let mut buckets: Vec<(i64, i64, i64)> = dims
                .iter()
                .flat_map(|d| d.buckets.iter())
                .map(|b| (b.bucket_start_ns, b.bucket_end_ns, b.duration_ns))
                .collect();
            buckets.sort();
            buckets
        }
        other => panic!("expected duration data, got {other:?}"),
    }
}

fn acquire(uid: i64, name: &str, t: i64) -> Event {
    Event::new(ACQUIRE_ATOM, t)
        .with_value(1, FieldValue::Long(uid))
        .with_value(2, FieldValue::Str(name.to_string()))
        .normalized()
}

fn release(uid: i64, name: &str, t: i64) -> Event {
    Event::new(RELEASE_ATOM, t)
        .with_value(1, FieldValue::Long(uid))
        .with_value(2, FieldValue::Str(name.to_string()))
        .normalized()
}

/// Wakelock predicate sliced by (uid, name); metric dimension is the uid.
fn wakelock_config(aggregation: &str) -> String {
    format!(
        r#"{{
        "id": 12345,
        "atom_matchers": [
            {{ "id": 1, "simple": {{ "atom_id": {ACQUIRE_ATOM} }} }},
            {{ "id": 2, "simple": {{ "atom_id": {RELEASE_ATOM} }} }}
        ],
        "predicates": [
            {{ "id": 10, "simple": {{
                "start": 1, "stop": 2, "count_nesting": true,
                "dimensions": {{ "fields": [ {{ "field": [1] }}, {{ "field": [2] }} ] }}
            }} }}
        ],
        "duration_metrics": [
            {{ "id": 300, "what": 10, "aggregation_type": "{aggregation}",
              "bucket_size_millis": 60000,
              "dimensions_in_what": {{ "fields": [ {{ "field": [1] }} ] }} }}
        ]
    }}"#
    )
}

#[test]
fn oring_tracker_unions_overlapping_wakelocks() {
    let mut manager = install(&wakelock_config("SUM"));

    // Two wakelocks of the same package overlap: union is 40ns.
    manager.deliver_event(&acquire(1, "wl1", TIME_BASE_NS));
    manager.deliver_event(&acquire(1, "wl2", TIME_BASE_NS + 10));
    manager.deliver_event(&release(1, "wl1", TIME_BASE_NS + 20));
    manager.deliver_event(&release(1, "wl2", TIME_BASE_NS + 40));

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    assert_eq!(
        duration_buckets(&report, 300),
        vec![(TIME_BASE_NS, TIME_BASE_NS + BUCKET_NS, 40)]
    );
}

#[test]
fn oring_duration_never_exceeds_bucket_size() {
    let mut manager = install(&wakelock_config("SUM"));
    manager.deliver_event(&acquire(1, "wl1", TIME_BASE_NS + 1));
    // Still held at dump time two buckets later.
    let report = dump(&manager, TIME_BASE_NS + 2 * BUCKET_NS);
    for (_, _, duration) in duration_buckets(&report, 300) {
        assert!(duration <= BUCKET_NS);
    }
}

#[test]
fn nested_acquires_keep_the_lock_held() {
    let mut manager = install(&wakelock_config("SUM"));

    manager.deliver_event(&acquire(1, "wl1", TIME_BASE_NS));
    manager.deliver_event(&acquire(1, "wl1", TIME_BASE_NS + 10));
    // First release does not end the hold; nesting is counted.
    manager.deliver_event(&release(1, "wl1", TIME_BASE_NS + 20));
    manager.deliver_event(&release(1, "wl1", TIME_BASE_NS + 50));

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    assert_eq!(
        duration_buckets(&report, 300),
        vec![(TIME_BASE_NS, TIME_BASE_NS + BUCKET_NS, 50)]
    );
}

#[test]
fn max_tracker_spans_bucket_boundaries_with_gap_fill() {
    let mut manager = install(&wakelock_config("MAX_SPARSE"));

    manager.deliver_event(&acquire(1, "wl1", TIME_BASE_NS + 1));
    // Stop lands 20ns into the third bucket.
    let stop_time = TIME_BASE_NS + 2 * BUCKET_NS + 20;
    manager.deliver_event(&release(1, "wl1", stop_time));

    let report = dump(&manager, TIME_BASE_NS + 3 * BUCKET_NS);
    assert_eq!(
        duration_buckets(&report, 300),
        vec![
            (TIME_BASE_NS, TIME_BASE_NS + BUCKET_NS, BUCKET_NS - 1),
            (TIME_BASE_NS + BUCKET_NS, TIME_BASE_NS + 2 * BUCKET_NS, BUCKET_NS),
            (TIME_BASE_NS + 2 * BUCKET_NS, TIME_BASE_NS + 3 * BUCKET_NS, 20),
        ]
    );
}

#[test]
fn max_tracker_reports_largest_instance_per_dimension() {
    let mut manager = install(&wakelock_config("MAX_SPARSE"));

    manager.deliver_event(&acquire(1, "short", TIME_BASE_NS));
    manager.deliver_event(&acquire(1, "long", TIME_BASE_NS));
    manager.deliver_event(&release(1, "short", TIME_BASE_NS + 10));
    manager.deliver_event(&release(1, "long", TIME_BASE_NS + 500));

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    assert_eq!(
        duration_buckets(&report, 300),
        vec![(TIME_BASE_NS, TIME_BASE_NS + BUCKET_NS, 500)]
    );
}

#[test]
fn separate_packages_get_separate_dimensions() {
    let mut manager = install(&wakelock_config("SUM"));

    manager.deliver_event(&acquire(1, "wl", TIME_BASE_NS));
    manager.deliver_event(&acquire(2, "wl", TIME_BASE_NS));
    manager.deliver_event(&release(1, "wl", TIME_BASE_NS + 10));
    manager.deliver_event(&release(2, "wl", TIME_BASE_NS + 30));

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    let metric = report
        .metrics
        .iter()
        .find(|m| m.metric_id == 300)
        .expect("metric in report");
    match &metric.data {
        MetricData::Duration(dims) => {
            assert_eq!(dims.len(), 2);
            let mut durations: Vec<i64> = dims
                .iter()
                .map(|d| d.buckets.iter().map(|b| b.duration_ns).sum())
                .collect();
            durations.sort();
            assert_eq!(durations, vec![10, 30]);
        }
        other => panic!("expected duration data, got {other:?}"),
    }
}

/// Duration metric gated by an unsliced condition pauses while the
/// condition is false.
#[test]
fn duration_pauses_while_condition_false() {
    let config = format!(
        r#"{{
        "id": 12345,
        "atom_matchers": [
            {{ "id": 1, "simple": {{ "atom_id": {ACQUIRE_ATOM} }} }},
            {{ "id": 2, "simple": {{ "atom_id": {RELEASE_ATOM} }} }},
            {{ "id": 3, "simple": {{ "atom_id": 20 }} }},
            {{ "id": 4, "simple": {{ "atom_id": 21 }} }}
        ],
        "predicates": [
            {{ "id": 10, "simple": {{
                "start": 1, "stop": 2, "count_nesting": true,
                "dimensions": {{ "fields": [ {{ "field": [1] }} ] }}
            }} }},
            {{ "id": 11, "simple": {{ "start": 3, "stop": 4, "count_nesting": false }} }}
        ],
        "duration_metrics": [
            {{ "id": 300, "what": 10, "condition": 11,
              "bucket_size_millis": 60000,
              "dimensions_in_what": {{ "fields": [ {{ "field": [1] }} ] }} }}
        ]
    }}"#
    );
    let mut manager = install(&config);

    // Condition on, wakelock held for 10ns, condition off for 20ns, on
    // again for 5ns until release.
    manager.deliver_event(&Event::new(20, TIME_BASE_NS).normalized());
    manager.deliver_event(&acquire(1, "wl", TIME_BASE_NS + 10));
    manager.deliver_event(&Event::new(21, TIME_BASE_NS + 20).normalized());
    manager.deliver_event(&Event::new(20, TIME_BASE_NS + 40).normalized());
    manager.deliver_event(&release(1, "wl", TIME_BASE_NS + 45));

    let report = dump(&manager, TIME_BASE_NS + BUCKET_NS);
    assert_eq!(
        duration_buckets(&report, 300),
        vec![(TIME_BASE_NS, TIME_BASE_NS + BUCKET_NS, 15)]
    );
}
