//! Declarative Metrics Configuration
//!
//! The daemon is driven by a declarative document describing atom matchers,
//! predicates, states, metrics of five kinds, activations, alerts, alarms
//! and admission lists. The document deserializes from JSON (primary, the
//! wire form) or TOML, selected by file extension.
//!
//! All cross-references between config nodes are by `i64` id. The builder
//! (`crate::builder`) resolves ids into indices, validates the graph and
//! rejects the whole document on the first error; nothing here mutates
//! runtime state.
//!
//! ## Loading
//!
//! ```ignore
//! let config = AggregationConfig::load(Path::new("metrics.json"))?;
//! ```

mod error;

pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::types::event::FieldPath;

fn default_true() -> bool {
    true
}

fn default_max_gauge_atoms() -> usize {
    GAUGE_ATOMS_PER_BUCKET_DEFAULT
}

/// Default cap on gauge samples kept per bucket.
pub const GAUGE_ATOMS_PER_BUCKET_DEFAULT: usize = 10;

// ============================================================================
// Config Key
// ============================================================================

/// Identity of one installed configuration: the uid that installed it and
/// the config's own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    pub uid: i32,
    pub id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.uid, self.id)
    }
}

// ============================================================================
// Shared vocabulary
// ============================================================================

/// Logical operation for matcher and predicate combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
    Nand,
    Nor,
}

/// Positional selector over repeated fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Position {
    First,
    Last,
    Any,
    All,
}

/// Bucket granularity. `bucket_size_millis` on the metric overrides this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    OneMinute,
    FiveMinutes,
    TenMinutes,
    ThirtyMinutes,
    OneHour,
    ThreeHours,
    SixHours,
    TwelveHours,
    OneDay,
}

impl TimeUnit {
    pub fn to_millis(self) -> i64 {
        match self {
            TimeUnit::OneMinute => 60_000,
            TimeUnit::FiveMinutes => 5 * 60_000,
            TimeUnit::TenMinutes => 10 * 60_000,
            TimeUnit::ThirtyMinutes => 30 * 60_000,
            TimeUnit::OneHour => 3_600_000,
            TimeUnit::ThreeHours => 3 * 3_600_000,
            TimeUnit::SixHours => 6 * 3_600_000,
            TimeUnit::TwelveHours => 12 * 3_600_000,
            TimeUnit::OneDay => 24 * 3_600_000,
        }
    }
}

/// Bucket settings shared by every aggregating metric kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<TimeUnit>,
    /// Exact override, mainly for tests and fine-grained configs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size_millis: Option<i64>,
}

impl BucketConfig {
    /// Resolved bucket size in nanoseconds. Defaults to one hour.
    pub fn bucket_size_ns(&self) -> i64 {
        if let Some(ms) = self.bucket_size_millis {
            return ms.saturating_mul(1_000_000);
        }
        self.bucket
            .unwrap_or(TimeUnit::OneHour)
            .to_millis()
            .saturating_mul(1_000_000)
    }
}

/// One field selector: a path into the atom schema plus an optional
/// positional refinement for repeated fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    pub field: FieldPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl FieldSelector {
    pub fn at(positions: &[u8]) -> Option<Self> {
        FieldPath::new(positions).map(|field| Self {
            field,
            position: None,
        })
    }
}

/// Field selectors a metric groups its aggregation by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    #[serde(default)]
    pub fields: Vec<FieldSelector>,
}

impl Dimensions {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_position(&self, position: Position) -> bool {
        self.fields.iter().any(|f| f.position == Some(position))
    }
}

// ============================================================================
// Atom matchers
// ============================================================================

/// Constraint on one field of an atom. Exactly one value matcher applies;
/// `matches_tuple` recurses into nested fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcher {
    /// 1-based position at the current depth.
    pub field: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(flatten)]
    pub value: ValueMatcher,
}

/// The value constraint of a [`FieldValueMatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatcher {
    EqBool(bool),
    EqInt(i64),
    LtInt(i64),
    GtInt(i64),
    LteInt(i64),
    GteInt(i64),
    LtFloat(f32),
    GtFloat(f32),
    EqString(String),
    EqAnyString(Vec<String>),
    NeqAnyString(Vec<String>),
    MatchesTuple(Vec<FieldValueMatcher>),
}

/// Leaf matcher: an atom id plus field constraints, all of which must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAtomMatcher {
    pub atom_id: i32,
    #[serde(default)]
    pub field_value_matchers: Vec<FieldValueMatcher>,
}

/// Matcher node body: a leaf or a logical combination of other matchers
/// (referenced by id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomMatcherSpec {
    Simple(SimpleAtomMatcher),
    Combination {
        operation: LogicalOperation,
        #[serde(default)]
        matchers: Vec<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomMatcher {
    pub id: i64,
    #[serde(flatten)]
    pub spec: AtomMatcherSpec,
}

// ============================================================================
// Predicates
// ============================================================================

/// Condition state before any input arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialValue {
    #[default]
    Unknown,
    False,
}

/// Start/stop driven predicate, optionally sliced by output dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplePredicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_all: Option<i64>,
    /// Count nested starts; a stop only ends the condition when the count
    /// returns to zero.
    #[serde(default = "default_true")]
    pub count_nesting: bool,
    #[serde(default)]
    pub initial_value: InitialValue,
    /// Slices the condition per dimension key extracted from start/stop
    /// events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateSpec {
    Simple(SimplePredicate),
    Combination {
        operation: LogicalOperation,
        #[serde(default)]
        predicates: Vec<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: i64,
    #[serde(flatten)]
    pub spec: PredicateSpec,
}

// ============================================================================
// States
// ============================================================================

/// Mapping from raw state values to a coarser group id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateGroup {
    pub group_id: i64,
    #[serde(default)]
    pub values: Vec<i64>,
}

/// A state atom whose value metrics may slice by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    pub id: i64,
    pub atom_id: i32,
    /// Field carrying the state value (default: top-level field 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_field: Option<FieldPath>,
    /// Fields identifying the stateful entity (e.g. a uid); empty for
    /// global states.
    #[serde(default)]
    pub primary_fields: Vec<FieldSelector>,
    #[serde(default)]
    pub groups: Vec<StateGroup>,
}

// ============================================================================
// Metrics
// ============================================================================

/// Maps `what`-dimension fields onto condition-dimension fields so a sliced
/// condition can be queried for the right key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConditionLink {
    pub condition: i64,
    #[serde(default)]
    pub fields_in_what: Dimensions,
    #[serde(default)]
    pub fields_in_condition: Dimensions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountMetric {
    pub id: i64,
    pub what: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Dimensions,
    #[serde(default)]
    pub dimensions_in_condition: Dimensions,
    #[serde(flatten)]
    pub bucket: BucketConfig,
    #[serde(default)]
    pub slice_by_states: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetric {
    pub id: i64,
    pub what: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
}

/// Aggregation applied to a value metric's samples within a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueAggregation {
    #[default]
    Sum,
    Max,
    Min,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetric {
    pub id: i64,
    pub what: i64,
    /// Field the numeric sample is extracted from.
    pub value_field: FieldPath,
    #[serde(default)]
    pub aggregation_type: ValueAggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Dimensions,
    #[serde(default)]
    pub dimensions_in_condition: Dimensions,
    #[serde(flatten)]
    pub bucket: BucketConfig,
}

/// When a gauge metric snapshots the atom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GaugeSamplingType {
    /// Sample whenever the trigger matcher fires.
    OnTrigger,
    /// Sample when the condition transitions to true.
    OnConditionChanged,
    /// Keep the first N samples of each bucket.
    #[default]
    FirstNSamples,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeMetric {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub sampling_type: GaugeSamplingType,
    /// Matcher that triggers a sample in `OnTrigger` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<i64>,
    #[serde(default = "default_max_gauge_atoms")]
    pub max_num_gauge_atoms_per_bucket: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Dimensions,
    #[serde(default)]
    pub dimensions_in_condition: Dimensions,
    #[serde(flatten)]
    pub bucket: BucketConfig,
}

/// Aggregation applied to a duration metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurationAggregation {
    /// Union of started intervals per dimension.
    #[default]
    Sum,
    /// Maximum single-key accumulated duration per bucket.
    MaxSparse,
    /// Minimum single-key accumulated duration per bucket.
    MinSparse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMetric {
    pub id: i64,
    /// The predicate whose start/stop pair this metric times.
    pub what: i64,
    #[serde(default)]
    pub aggregation_type: DurationAggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Dimensions,
    #[serde(default)]
    pub dimensions_in_condition: Dimensions,
    #[serde(flatten)]
    pub bucket: BucketConfig,
}

// ============================================================================
// Activations
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationType {
    #[default]
    ActivateImmediately,
    ActivateOnBoot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventActivation {
    pub atom_matcher_id: i64,
    pub ttl_seconds: i64,
    #[serde(default)]
    pub activation_type: ActivationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivation_atom_matcher_id: Option<i64>,
}

/// Time-bounded enabling of a metric, driven by activator atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricActivation {
    pub metric_id: i64,
    #[serde(default)]
    pub event_activations: Vec<EventActivation>,
}

// ============================================================================
// Alerts, subscriptions, alarms
// ============================================================================

/// Threshold alert over a metric's sliding window of buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub metric_id: i64,
    pub num_buckets: i64,
    #[serde(default)]
    pub refractory_period_secs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_if_sum_gt: Option<i64>,
}

/// Binds a notification target to an alert or periodic alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    /// Alert id or alarm id this subscription listens to.
    pub rule_id: i64,
}

/// Wall-clock periodic alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: i64,
    pub offset_millis: i64,
    pub period_millis: i64,
}

/// Per-atom pull package allowance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullAtomPackages {
    pub atom_id: i32,
    #[serde(default)]
    pub packages: Vec<String>,
}

// ============================================================================
// Top-level config
// ============================================================================

/// The full declarative configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub atom_matchers: Vec<AtomMatcher>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub states: Vec<StateConfig>,
    #[serde(default)]
    pub count_metrics: Vec<CountMetric>,
    #[serde(default)]
    pub event_metrics: Vec<EventMetric>,
    #[serde(default)]
    pub value_metrics: Vec<ValueMetric>,
    #[serde(default)]
    pub gauge_metrics: Vec<GaugeMetric>,
    #[serde(default)]
    pub duration_metrics: Vec<DurationMetric>,
    #[serde(default)]
    pub metric_activations: Vec<MetricActivation>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub alarms: Vec<Alarm>,
    /// Uids or package names allowed to push events. Empty = allow all.
    #[serde(default)]
    pub allowed_log_sources: Vec<String>,
    #[serde(default)]
    pub default_pull_packages: Vec<String>,
    #[serde(default)]
    pub pull_atom_packages: Vec<PullAtomPackages>,
    /// Metrics evaluated but omitted from dump reports.
    #[serde(default)]
    pub no_report_metrics: Vec<i64>,
    /// Atom ids that may not be used with `slice_by_states`.
    #[serde(default)]
    pub whitelisted_atom_ids: Vec<i32>,
}

impl AggregationConfig {
    /// Load a configuration document from a JSON or TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&raw)?,
            _ => serde_json::from_str(&raw)?,
        };
        info!(path = %path.display(), "Loaded metrics configuration");
        Ok(config)
    }

    pub fn metric_count(&self) -> usize {
        self.count_metrics.len()
            + self.event_metrics.len()
            + self.value_metrics.len()
            + self.gauge_metrics.len()
            + self.duration_metrics.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
