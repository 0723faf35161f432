//! Condition wizard
//!
//! Read-only facade metric producers use to consult conditions without
//! holding a reference into the tracker array's storage. Borrowed per
//! evaluation step; it takes no locks of its own and forwards every query.

use std::collections::HashSet;

use crate::config::Dimensions;
use crate::types::condition::ConditionState;
use crate::types::dimension::HashableDimensionKey;

use super::{is_changed_dimension_trackable, query_condition, ConditionTracker};

/// Borrowing facade over the condition tracker array.
#[derive(Clone, Copy)]
pub struct ConditionWizard<'a> {
    conditions: &'a [ConditionTracker],
}

impl<'a> ConditionWizard<'a> {
    pub fn new(conditions: &'a [ConditionTracker]) -> Self {
        Self { conditions }
    }

    /// Current state of the condition at `index`, keyed for sliced
    /// predicates by `condition_key`.
    pub fn query(&self, index: usize, condition_key: &HashableDimensionKey) -> ConditionState {
        query_condition(self.conditions, index, condition_key)
    }

    /// Dimensions that flipped to true during the current event.
    pub fn changed_to_true_dimensions(&self, index: usize) -> &'a HashSet<HashableDimensionKey> {
        self.conditions[index].changed_to_true_dimensions()
    }

    /// Dimensions that flipped to false during the current event.
    pub fn changed_to_false_dimensions(&self, index: usize) -> &'a HashSet<HashableDimensionKey> {
        self.conditions[index].changed_to_false_dimensions()
    }

    pub fn is_simple_condition(&self, index: usize) -> bool {
        self.conditions[index].is_simple()
    }

    pub fn is_sliced(&self, index: usize) -> bool {
        self.conditions[index].is_sliced()
    }

    pub fn is_changed_dimension_trackable(&self, index: usize) -> bool {
        is_changed_dimension_trackable(self.conditions, index)
    }

    /// Whether the condition's output slicing equals `dimensions`, which
    /// lets duration metrics reuse changed-dimension sets directly.
    pub fn equal_output_dimensions(&self, index: usize, dimensions: &Dimensions) -> bool {
        self.conditions[index]
            .output_dimensions()
            .is_some_and(|d| d == dimensions)
    }
}
