//! Injected collaborator interfaces
//!
//! The evaluation core never talks to the operating system directly. The
//! package database, the puller framework, the alarm service and the
//! anomaly subscription transport are all injected behind the traits here;
//! the daemon shell wires real implementations, tests wire fakes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::{ConfigKey, Subscription};
use crate::types::{Event, MetricDimensionKey};

// ============================================================================
// Package database
// ============================================================================

/// Read-only view of the package/uid database. String matchers against
/// uid-annotated fields resolve through this.
pub trait PackageResolver: Send + Sync {
    /// All package names installed under `uid`. `normalize` lowercases and
    /// strips versioning decorations the way report output does.
    fn app_names_from_uid(&self, uid: i32, normalize: bool) -> HashSet<String>;
}

/// Resolver with no package database attached; uid fields then only match
/// through the symbolic AID table.
#[derive(Debug, Default)]
pub struct EmptyPackageResolver;

impl PackageResolver for EmptyPackageResolver {
    fn app_names_from_uid(&self, _uid: i32, _normalize: bool) -> HashSet<String> {
        HashSet::new()
    }
}

/// Fixed symbolic names for well-known system uids, matched before the
/// package database is consulted.
pub const AID_TABLE: &[(&str, i32)] = &[
    ("AID_ROOT", 0),
    ("AID_SYSTEM", 1000),
    ("AID_RADIO", 1001),
    ("AID_BLUETOOTH", 1002),
    ("AID_GRAPHICS", 1003),
    ("AID_AUDIO", 1005),
    ("AID_CAMERA", 1006),
    ("AID_LOG", 1007),
    ("AID_WIFI", 1010),
    ("AID_ADB", 1011),
    ("AID_MEDIA", 1013),
    ("AID_GPS", 1021),
    ("AID_NFC", 1027),
    ("AID_SHELL", 2000),
];

/// Numeric uid for an `AID_*` symbolic name, if known.
pub fn aid_to_uid(name: &str) -> Option<i32> {
    AID_TABLE
        .iter()
        .find(|(aid, _)| *aid == name)
        .map(|(_, uid)| *uid)
}

// ============================================================================
// Pullers
// ============================================================================

/// On-demand sample source for pulled atoms.
pub trait PullerRegistry: Send + Sync {
    /// Synchronously pull current samples for `atom_id`. `None` signals a
    /// pull failure; the affected bucket is marked tainted.
    fn pull(&self, atom_id: i32) -> Option<Vec<Event>>;

    /// Arrange periodic pulls at roughly `bucket_millis` cadence.
    fn register_receiver(&self, atom_id: i32, bucket_millis: i64);

    fn puller_for_atom_exists(&self, atom_id: i32) -> bool;
}

/// Registry with no pullers; every atom is treated as pushed.
#[derive(Debug, Default)]
pub struct NoPullers;

impl PullerRegistry for NoPullers {
    fn pull(&self, atom_id: i32) -> Option<Vec<Event>> {
        warn!(atom_id, "Pull requested but no puller registry is attached");
        None
    }

    fn register_receiver(&self, _atom_id: i32, _bucket_millis: i64) {}

    fn puller_for_atom_exists(&self, _atom_id: i32) -> bool {
        false
    }
}

// ============================================================================
// Alarm monitor
// ============================================================================

/// An absolute-time alarm registered with the external alarm service.
///
/// Identity is by handle so a specific registration can be removed even
/// when several alarms share a timestamp.
#[derive(Debug)]
pub struct ScheduledAlarm {
    pub timestamp_sec: u32,
    handle: u64,
}

static NEXT_ALARM_HANDLE: AtomicU64 = AtomicU64::new(1);

impl ScheduledAlarm {
    pub fn at(timestamp_sec: u32) -> Arc<Self> {
        Arc::new(Self {
            timestamp_sec,
            handle: NEXT_ALARM_HANDLE.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }
}

/// The external service that wakes the daemon at absolute timestamps, used
/// for duration-anomaly prediction and periodic alarms.
pub trait AlarmMonitor: Send + Sync {
    fn add(&self, alarm: Arc<ScheduledAlarm>);
    fn remove(&self, alarm: &Arc<ScheduledAlarm>);
}

/// Monitor that records registrations but never fires; useful as a default
/// and in tests.
#[derive(Debug, Default)]
pub struct InertAlarmMonitor {
    registered: Mutex<Vec<Arc<ScheduledAlarm>>>,
}

impl InertAlarmMonitor {
    pub fn registered_count(&self) -> usize {
        self.registered.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Earliest registered alarm timestamp, for test assertions.
    pub fn earliest_sec(&self) -> Option<u32> {
        self.registered
            .lock()
            .ok()
            .and_then(|r| r.iter().map(|a| a.timestamp_sec).min())
    }
}

impl AlarmMonitor for InertAlarmMonitor {
    fn add(&self, alarm: Arc<ScheduledAlarm>) {
        if let Ok(mut registered) = self.registered.lock() {
            registered.push(alarm);
        }
    }

    fn remove(&self, alarm: &Arc<ScheduledAlarm>) {
        if let Ok(mut registered) = self.registered.lock() {
            registered.retain(|a| a.handle() != alarm.handle());
        }
    }
}

// ============================================================================
// Anomaly subscriptions
// ============================================================================

/// Receiver of anomaly declarations for registered subscriptions.
pub trait SubscriberSink: Send + Sync {
    fn notify(
        &self,
        config_key: ConfigKey,
        subscription: &Subscription,
        dimension_key: &MetricDimensionKey,
    );
}

/// Sink that logs declarations through tracing.
#[derive(Debug, Default)]
pub struct LogSubscriberSink;

impl SubscriberSink for LogSubscriberSink {
    fn notify(
        &self,
        config_key: ConfigKey,
        subscription: &Subscription,
        dimension_key: &MetricDimensionKey,
    ) {
        info!(
            config = %config_key,
            subscription = subscription.id,
            rule = subscription.rule_id,
            dimension = %dimension_key,
            "Anomaly subscription fired"
        );
    }
}

/// Sink that accumulates notifications, for tests.
#[derive(Debug, Default)]
pub struct RecordingSubscriberSink {
    notified: Mutex<Vec<(i64, MetricDimensionKey)>>,
}

impl RecordingSubscriberSink {
    pub fn notifications(&self) -> Vec<(i64, MetricDimensionKey)> {
        self.notified.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

impl SubscriberSink for RecordingSubscriberSink {
    fn notify(
        &self,
        _config_key: ConfigKey,
        subscription: &Subscription,
        dimension_key: &MetricDimensionKey,
    ) {
        if let Ok(mut notified) = self.notified.lock() {
            notified.push((subscription.id, dimension_key.clone()));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
