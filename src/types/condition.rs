//! Three-valued condition state
//!
//! Conditions carry `Unknown` until their first input arrives (unless the
//! config pins the initial value to `False`). Combination predicates apply
//! logical operations over the three-valued domain: any `Unknown` child
//! makes the combination `Unknown`.

use serde::{Deserialize, Serialize};

use crate::config::LogicalOperation;

/// State of a condition. `NotEvaluated` only ever appears in per-event
/// evaluation caches, never as a tracker's stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionState {
    NotEvaluated,
    Unknown,
    False,
    True,
}

impl ConditionState {
    pub fn from_bool(value: bool) -> Self {
        if value {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }

    /// Strict truth: `Unknown` and `NotEvaluated` are not true.
    pub fn is_true(&self) -> bool {
        matches!(self, ConditionState::True)
    }
}

impl std::fmt::Display for ConditionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionState::NotEvaluated => write!(f, "NOT_EVALUATED"),
            ConditionState::Unknown => write!(f, "UNKNOWN"),
            ConditionState::False => write!(f, "FALSE"),
            ConditionState::True => write!(f, "TRUE"),
        }
    }
}

/// Three-valued combination over already-evaluated child states.
///
/// Any `Unknown` child forces `Unknown`. NOT takes its sole child;
/// the caller guarantees arity at build time.
pub fn evaluate_combination(
    children: &[usize],
    operation: LogicalOperation,
    condition_cache: &[ConditionState],
) -> ConditionState {
    let mut has_false = false;
    let mut has_true = false;

    for &child in children {
        match condition_cache[child] {
            ConditionState::Unknown | ConditionState::NotEvaluated => {
                return ConditionState::Unknown;
            }
            ConditionState::False => has_false = true,
            ConditionState::True => has_true = true,
        }
    }

    match operation {
        LogicalOperation::And => ConditionState::from_bool(!has_false),
        LogicalOperation::Or => ConditionState::from_bool(has_true),
        LogicalOperation::Not => match children.first().map(|&c| condition_cache[c]) {
            Some(ConditionState::False) => ConditionState::True,
            _ => ConditionState::False,
        },
        LogicalOperation::Nand => ConditionState::from_bool(has_false),
        LogicalOperation::Nor => ConditionState::from_bool(!has_true),
    }
}
