//! Report output
//!
//! Dump reports serialize straight into a caller-provided writer, one JSON
//! document per dump. Each metric contributes its per-dimension bucket
//! vectors plus the skipped-dimension counter; alerts contribute their
//! refractory-period state. Reading a report never moves aggregation
//! state; clearing is the caller's `erase_data` decision.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::count::CountBucket;
use crate::metrics::duration_trackers::DurationBucket;
use crate::metrics::event::EventRecord;
use crate::metrics::gauge::GaugeBucket;
use crate::metrics::value::ValueBucket;
use crate::types::dimension::MetricDimensionKey;

/// Why a report was produced; recorded in the report header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DumpReportReason {
    DeviceShutdown,
    ConfigUpdated,
    ConfigRemoved,
    GetDataCalled,
    AdbDump,
    TerminationSignal,
}

/// Bucket vectors for one dimension of one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionData<B> {
    pub dimension: MetricDimensionKey,
    pub buckets: Vec<B>,
}

/// Per-kind payload of a metric report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricData {
    Count(Vec<DimensionData<CountBucket>>),
    Event(Vec<EventRecord>),
    Value(Vec<DimensionData<ValueBucket>>),
    Gauge(Vec<DimensionData<GaugeBucket>>),
    Duration(Vec<DimensionData<DurationBucket>>),
}

impl MetricData {
    pub fn is_empty(&self) -> bool {
        match self {
            MetricData::Count(d) => d.is_empty(),
            MetricData::Event(d) => d.is_empty(),
            MetricData::Value(d) => d.is_empty(),
            MetricData::Gauge(d) => d.is_empty(),
            MetricData::Duration(d) => d.is_empty(),
        }
    }
}

/// Refractory-period state of one alert at dump time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertState {
    pub alert_id: i64,
    /// (dimension, second the refractory period ends).
    pub refractory_ends_sec: Vec<(MetricDimensionKey, i64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub is_active: bool,
    /// Samples dropped by the dimension guardrail since the last report.
    pub skipped_samples: u64,
    pub start_report_ns: i64,
    pub end_report_ns: i64,
    pub data: MetricData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alert_states: Vec<AlertState>,
}

/// One dump of one config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigReport {
    pub config_id: i64,
    pub config_uid: i32,
    pub reason: DumpReportReason,
    /// Wall clock at dump time, for humans; the core runs on elapsed ns.
    pub wall_clock: DateTime<Utc>,
    pub dump_time_ns: i64,
    pub metrics: Vec<MetricReport>,
}

/// Streaming report sink: one JSON document per line.
pub struct ReportWriter<'a> {
    out: &'a mut dyn Write,
}

impl<'a> ReportWriter<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self { out }
    }

    pub fn write(&mut self, report: &ConfigReport) -> std::io::Result<()> {
        serde_json::to_writer(&mut *self.out, report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.out.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_round_trips_as_json() {
        let report = ConfigReport {
            config_id: 12345,
            config_uid: 1000,
            reason: DumpReportReason::GetDataCalled,
            wall_clock: Utc::now(),
            dump_time_ns: 130_000_000_000,
            metrics: vec![MetricReport {
                metric_id: 100,
                is_active: true,
                skipped_samples: 0,
                start_report_ns: 10_000_000_000,
                end_report_ns: 130_000_000_000,
                data: MetricData::Count(vec![DimensionData {
                    dimension: MetricDimensionKey::default(),
                    buckets: vec![CountBucket {
                        bucket_start_ns: 10_000_000_000,
                        bucket_end_ns: 70_000_000_000,
                        count: 2,
                    }],
                }]),
                alert_states: Vec::new(),
            }],
        };

        let mut buffer = Vec::new();
        ReportWriter::new(&mut buffer).write(&report).unwrap();
        assert!(buffer.ends_with(b"\n"));
        let parsed: ConfigReport = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(parsed.config_id, 12345);
        match &parsed.metrics[0].data {
            MetricData::Count(dims) => assert_eq!(dims[0].buckets[0].count, 2),
            _ => panic!("expected count data"),
        }
    }
}
