//! Config rejection reasons.
//!
//! Every build-time failure maps to a named kind here. A failed build
//! rejects the whole document before any runtime state is touched; the
//! previously installed config stays active.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: i64 },

    #[error("{kind} {id} is missing required field {field}")]
    MissingField {
        kind: &'static str,
        id: i64,
        field: &'static str,
    },

    #[error("{kind} {from_id} references unknown {to_kind} {to_id}")]
    UnknownReference {
        kind: &'static str,
        from_id: i64,
        to_kind: &'static str,
        to_id: i64,
    },

    #[error("cycle detected in {kind} graph at id {id}")]
    Cycle { kind: &'static str, id: i64 },

    #[error("{kind} {id}: NOT combination must have exactly one child")]
    BadNotArity { kind: &'static str, id: i64 },

    #[error("matcher {id}: field matcher exceeds maximum nesting depth")]
    DepthExceeded { id: i64 },

    #[error("matcher {id}: position ALL is not supported in value matchers")]
    UnsupportedPosition { id: i64 },

    #[error("alert {id}: missing trigger threshold")]
    MissingThreshold { id: i64 },

    #[error("alert {id}: num_buckets must be positive, got {num_buckets}")]
    InvalidNumBuckets { id: i64, num_buckets: i64 },

    #[error("alarm {id}: period must be positive, got {period_millis}")]
    InvalidAlarmPeriod { id: i64, period_millis: i64 },

    #[error("metric {metric_id}: activation ttl must be positive, got {ttl_seconds}")]
    InvalidActivationTtl { metric_id: i64, ttl_seconds: i64 },

    #[error("metric {metric_id}: may not slice by whitelisted atom {atom_id}")]
    StateSliceNotAllowed { metric_id: i64, atom_id: i32 },

    #[error(
        "metric {metric_id}: link targets condition {condition_id}, which is not part of the metric's condition"
    )]
    UnlinkedCondition { metric_id: i64, condition_id: i64 },

    #[error(
        "condition {id}: combination queried with dimensions must have exactly one sliced child"
    )]
    UntrackableDimensions { id: i64 },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse config TOML: {0}")]
    Toml(#[from] toml::de::Error),
}
