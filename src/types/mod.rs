//! Core data model: events, dimension keys, condition states.

pub mod condition;
pub mod dimension;
pub mod event;

pub use condition::{evaluate_combination, ConditionState};
pub use dimension::{HashableDimensionKey, MetricDimensionKey};
pub use event::{AtomId, Event, EventField, FieldPath, FieldValue, MAX_FIELD_DEPTH};
