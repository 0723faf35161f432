//! Event metric: a filter plus serializer.
//!
//! No aggregation and no dimensioning; each matched event's field tree is
//! recorded verbatim, gated by the metric's condition, and emitted on dump.

use serde::{Deserialize, Serialize};

use crate::types::event::{Event, EventField};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub elapsed_timestamp_ns: i64,
    pub atom_id: i32,
    pub fields: Vec<EventField>,
}

#[derive(Debug, Clone, Default)]
pub struct EventMetricState {
    pub records: Vec<EventRecord>,
}

impl EventMetricState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &Event) {
        self.records.push(EventRecord {
            elapsed_timestamp_ns: event.elapsed_timestamp_ns,
            atom_id: event.atom_id,
            fields: event.fields.clone(),
        });
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn byte_size(&self) -> usize {
        self.records
            .iter()
            .map(|r| std::mem::size_of::<EventRecord>() + r.fields.len() * 32)
            .sum()
    }
}
