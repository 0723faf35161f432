//! State tracking for slice-by-state metrics
//!
//! A state atom reports the current value of some device state (screen
//! state, process importance). Metrics declaring `slice_by_states` fold the
//! state's current value into their what-dimension at event time. The
//! manager is created once per daemon instance and threaded explicitly
//! through construction; producers register at config install and the
//! whole registration is dropped with the config.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::{Dimensions, StateConfig};
use crate::dimensions::extract_dimension_key;
use crate::types::dimension::HashableDimensionKey;
use crate::types::event::{Event, FieldPath, FieldValue};

/// Value reported for a state that has not been observed yet.
pub const STATE_UNKNOWN: i64 = -1;

/// Tracks one state atom's current value per primary key.
#[derive(Debug, Clone)]
struct StateTracker {
    state_id: i64,
    atom_id: i32,
    value_path: FieldPath,
    primary_fields: Dimensions,
    /// Raw value -> group id folding.
    group_of: HashMap<i64, i64>,
    /// Current (possibly group-folded) value per primary key.
    current: HashMap<HashableDimensionKey, i64>,
    /// Metric producer indices listening to this state.
    listeners: HashSet<usize>,
}

impl StateTracker {
    fn new(config: &StateConfig) -> Self {
        let mut group_of = HashMap::new();
        for group in &config.groups {
            for &value in &group.values {
                group_of.insert(value, group.group_id);
            }
        }
        Self {
            state_id: config.id,
            atom_id: config.atom_id,
            value_path: config.value_field.unwrap_or_else(|| FieldPath::leaf(1)),
            primary_fields: Dimensions {
                fields: config.primary_fields.clone(),
            },
            group_of,
            current: HashMap::new(),
            listeners: HashSet::new(),
        }
    }

    fn fold(&self, raw: i64) -> i64 {
        self.group_of.get(&raw).copied().unwrap_or(raw)
    }
}

/// Per-daemon registry of state trackers.
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    /// Keyed by state atom id.
    trackers: HashMap<i32, StateTracker>,
    /// State config id -> atom id, resolved during the build's state pass.
    state_id_to_atom: HashMap<i64, i32>,
}

impl StateManager {
    pub fn new(states: &[StateConfig]) -> Self {
        let mut trackers = HashMap::new();
        let mut state_id_to_atom = HashMap::new();
        for config in states {
            state_id_to_atom.insert(config.id, config.atom_id);
            trackers.insert(config.atom_id, StateTracker::new(config));
        }
        Self {
            trackers,
            state_id_to_atom,
        }
    }

    pub fn atom_id_for_state(&self, state_id: i64) -> Option<i32> {
        self.state_id_to_atom.get(&state_id).copied()
    }

    /// Atom ids the manager needs delivered to stay current.
    pub fn state_atom_ids(&self) -> HashSet<i32> {
        self.trackers.keys().copied().collect()
    }

    /// Register a metric producer as listener on a state atom.
    pub fn register_listener(&mut self, atom_id: i32, producer_index: usize) {
        if let Some(tracker) = self.trackers.get_mut(&atom_id) {
            tracker.listeners.insert(producer_index);
        }
    }

    pub fn unregister_all(&mut self) {
        for tracker in self.trackers.values_mut() {
            tracker.listeners.clear();
        }
    }

    /// Update state from an incoming event. Returns the producer indices
    /// listening to this atom when the tracked value actually changed.
    pub fn on_event(&mut self, event: &Event) -> Option<HashSet<usize>> {
        let tracker = self.trackers.get_mut(&event.atom_id)?;
        let raw = event.value_at(&tracker.value_path)?.as_long()?;
        let value = tracker.fold(raw);
        let primary = extract_dimension_key(&tracker.primary_fields, event);
        let previous = tracker.current.insert(primary, value);
        if previous == Some(value) {
            return None;
        }
        debug!(
            state = tracker.state_id,
            atom = tracker.atom_id,
            value,
            "State changed"
        );
        Some(tracker.listeners.clone())
    }

    /// Current (group-folded) value of a state for one primary key.
    pub fn state_value(&self, atom_id: i32, primary: &HashableDimensionKey) -> i64 {
        self.trackers
            .get(&atom_id)
            .and_then(|t| t.current.get(primary).copied())
            .unwrap_or(STATE_UNKNOWN)
    }

    /// Primary key identifying the stateful entity in `event`'s fields,
    /// using the same selectors `on_event` applies to the state atom
    /// itself. Empty for global states.
    pub fn primary_key_for(&self, atom_id: i32, event: &Event) -> HashableDimensionKey {
        self.trackers
            .get(&atom_id)
            .map(|t| extract_dimension_key(&t.primary_fields, event))
            .unwrap_or_default()
    }

    /// Dimension entry appended to a what-key for a slice-by-state metric:
    /// the state's value field path paired with its current value.
    pub fn state_key_entry(
        &self,
        atom_id: i32,
        primary: &HashableDimensionKey,
    ) -> (FieldPath, FieldValue) {
        let path = self
            .trackers
            .get(&atom_id)
            .map(|t| t.value_path)
            .unwrap_or_else(|| FieldPath::leaf(1));
        (path, FieldValue::Long(self.state_value(atom_id, primary)))
    }
}

// ============================================================================
// Tests
// ============================================================================
