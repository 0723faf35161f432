//! Condition trackers
//!
//! A predicate holds a three-valued state (unknown/false/true) derived from
//! start/stop/stop-all matcher firings, optionally sliced per dimension
//! key, and composable through logical operations. Evaluation runs once per
//! event through a memoizing cache, with priority stop-all > stop > start
//! when several inputs fire in the same event.

pub mod wizard;

pub use wizard::ConditionWizard;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::{
    ConfigError, Dimensions, InitialValue, LogicalOperation, Predicate, PredicateSpec,
    SimplePredicate,
};
use crate::dimensions::extract_dimension_key;
use crate::hash::stable_hash;
use crate::matchers::MatchingState;
use crate::types::condition::{evaluate_combination, ConditionState};
use crate::types::dimension::HashableDimensionKey;
use crate::types::event::Event;

/// Runtime state of a simple (start/stop driven) predicate.
#[derive(Debug, Clone)]
struct SimpleState {
    start_index: Option<usize>,
    stop_index: Option<usize>,
    stop_all_index: Option<usize>,
    count_nesting: bool,
    initial: ConditionState,
    output_dimensions: Option<Dimensions>,
    /// Unsliced state; for sliced predicates this summarizes "any key true".
    state: ConditionState,
    /// Unsliced nesting counter.
    nesting: i64,
    /// Per-dimension nesting counters; keys leave the map at zero.
    sliced: HashMap<HashableDimensionKey, i64>,
}

impl SimpleState {
    fn is_sliced(&self) -> bool {
        self.output_dimensions.is_some()
    }
}

#[derive(Debug, Clone)]
enum ConditionNode {
    Simple(SimpleState),
    Combination {
        operation: LogicalOperation,
        child_ids: Vec<i64>,
        children: Vec<usize>,
    },
}

/// One node of the condition graph.
#[derive(Debug, Clone)]
pub struct ConditionTracker {
    id: i64,
    proto_hash: u64,
    node: ConditionNode,
    /// Matcher indices this condition (transitively) consumes.
    tracker_indices: HashSet<usize>,
    /// Dimensions that flipped to true/false during the current event.
    changed_to_true: HashSet<HashableDimensionKey>,
    changed_to_false: HashSet<HashableDimensionKey>,
    /// Last computed state of a combination node; combinations derive state
    /// from children and need it only for change detection.
    last_combination_state: Option<ConditionState>,
    initialized: bool,
}

/// Which role an incoming event played for a simple predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fired {
    StopAll,
    Stop,
    Start,
}

impl ConditionTracker {
    /// Build an uninitialized tracker; matcher references resolve here,
    /// condition references resolve in `init_condition`.
    pub fn new(
        config: &Predicate,
        matcher_id_to_index: &HashMap<i64, usize>,
    ) -> Result<Self, ConfigError> {
        let proto_hash = stable_hash(config);
        let node = match &config.spec {
            PredicateSpec::Simple(simple) => {
                ConditionNode::Simple(Self::build_simple(config.id, simple, matcher_id_to_index)?)
            }
            PredicateSpec::Combination {
                operation,
                predicates,
            } => {
                if predicates.is_empty() {
                    return Err(ConfigError::MissingField {
                        kind: "predicate",
                        id: config.id,
                        field: "predicates",
                    });
                }
                if *operation == LogicalOperation::Not && predicates.len() != 1 {
                    return Err(ConfigError::BadNotArity {
                        kind: "predicate",
                        id: config.id,
                    });
                }
                ConditionNode::Combination {
                    operation: *operation,
                    child_ids: predicates.clone(),
                    children: Vec::new(),
                }
            }
        };

        let mut tracker = Self {
            id: config.id,
            proto_hash,
            node,
            tracker_indices: HashSet::new(),
            changed_to_true: HashSet::new(),
            changed_to_false: HashSet::new(),
            last_combination_state: None,
            initialized: false,
        };
        if let ConditionNode::Simple(simple) = &tracker.node {
            tracker.tracker_indices.extend(
                [simple.start_index, simple.stop_index, simple.stop_all_index]
                    .into_iter()
                    .flatten(),
            );
        }
        Ok(tracker)
    }

    fn build_simple(
        id: i64,
        config: &SimplePredicate,
        matcher_id_to_index: &HashMap<i64, usize>,
    ) -> Result<SimpleState, ConfigError> {
        let resolve = |matcher_id: Option<i64>| -> Result<Option<usize>, ConfigError> {
            match matcher_id {
                None => Ok(None),
                Some(matcher_id) => matcher_id_to_index
                    .get(&matcher_id)
                    .copied()
                    .map(Some)
                    .ok_or(ConfigError::UnknownReference {
                        kind: "predicate",
                        from_id: id,
                        to_kind: "matcher",
                        to_id: matcher_id,
                    }),
            }
        };

        if config.start.is_none() && config.stop.is_none() && config.stop_all.is_none() {
            return Err(ConfigError::MissingField {
                kind: "predicate",
                id,
                field: "start/stop",
            });
        }

        let initial = match config.initial_value {
            InitialValue::Unknown => ConditionState::Unknown,
            InitialValue::False => ConditionState::False,
        };

        Ok(SimpleState {
            start_index: resolve(config.start)?,
            stop_index: resolve(config.stop)?,
            stop_all_index: resolve(config.stop_all)?,
            count_nesting: config.count_nesting,
            initial,
            output_dimensions: config.dimensions.clone(),
            state: initial,
            nesting: 0,
            sliced: HashMap::new(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn proto_hash(&self) -> u64 {
        self.proto_hash
    }

    /// Matcher indices whose results feed this condition.
    pub fn tracker_indices(&self) -> &HashSet<usize> {
        &self.tracker_indices
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.node, ConditionNode::Simple(_))
    }

    pub fn is_sliced(&self) -> bool {
        match &self.node {
            ConditionNode::Simple(simple) => simple.is_sliced(),
            ConditionNode::Combination { .. } => false,
        }
    }

    /// Output slicing dimensions of a simple sliced predicate.
    pub fn output_dimensions(&self) -> Option<&Dimensions> {
        match &self.node {
            ConditionNode::Simple(simple) => simple.output_dimensions.as_ref(),
            ConditionNode::Combination { .. } => None,
        }
    }

    pub fn changed_to_true_dimensions(&self) -> &HashSet<HashableDimensionKey> {
        &self.changed_to_true
    }

    pub fn changed_to_false_dimensions(&self) -> &HashSet<HashableDimensionKey> {
        &self.changed_to_false
    }

    /// Externally pushed condition state (conditions driven by a
    /// collaborator rather than by atom matchers). Only meaningful for
    /// simple unsliced predicates; returns whether the state changed.
    pub fn force_state(&mut self, state: ConditionState) -> bool {
        let ConditionNode::Simple(simple) = &mut self.node else {
            debug!(condition = self.id, "Ignoring pushed state on combination predicate");
            return false;
        };
        if simple.is_sliced() {
            debug!(condition = self.id, "Ignoring pushed state on sliced predicate");
            return false;
        }
        if simple.state == state {
            return false;
        }
        simple.state = state;
        simple.nesting = if state == ConditionState::True { 1 } else { 0 };
        true
    }
}

/// Recursively initialize the condition at `index`: resolve child ids with
/// cycle detection and union matcher-index sets upward.
pub fn init_condition(
    conditions: &mut [ConditionTracker],
    index: usize,
    id_to_index: &HashMap<i64, usize>,
    stack: &mut [bool],
) -> Result<(), ConfigError> {
    if conditions[index].initialized {
        return Ok(());
    }
    let condition_id = conditions[index].id;

    let child_ids: Option<Vec<i64>> = match &conditions[index].node {
        ConditionNode::Simple(_) => None,
        ConditionNode::Combination { child_ids, .. } => Some(child_ids.clone()),
    };

    if let Some(child_ids) = child_ids {
        stack[index] = true;
        let mut children = Vec::with_capacity(child_ids.len());
        let mut tracker_indices: HashSet<usize> = HashSet::new();
        for child_id in child_ids {
            let &child_index =
                id_to_index
                    .get(&child_id)
                    .ok_or(ConfigError::UnknownReference {
                        kind: "predicate",
                        from_id: condition_id,
                        to_kind: "predicate",
                        to_id: child_id,
                    })?;
            if stack[child_index] {
                return Err(ConfigError::Cycle {
                    kind: "predicate",
                    id: condition_id,
                });
            }
            init_condition(conditions, child_index, id_to_index, stack)?;
            tracker_indices.extend(conditions[child_index].tracker_indices.iter().copied());
            children.push(child_index);
        }
        stack[index] = false;
        conditions[index].tracker_indices = tracker_indices;
        if let ConditionNode::Combination { children: slot, .. } = &mut conditions[index].node {
            *slot = children;
        }
    }

    conditions[index].initialized = true;
    Ok(())
}

/// Collect `index` and every predicate reachable from it, the set of
/// components a metric's condition links may legitimately target.
pub fn collect_condition_components(
    conditions: &[ConditionTracker],
    index: usize,
    out: &mut HashSet<usize>,
) {
    if !out.insert(index) {
        return;
    }
    if let ConditionNode::Combination { children, .. } = &conditions[index].node {
        for &child in children {
            collect_condition_components(conditions, child, out);
        }
    }
}

/// A combination can answer dimensioned queries only when exactly one child
/// is sliced and the operation is AND.
pub fn is_changed_dimension_trackable(conditions: &[ConditionTracker], index: usize) -> bool {
    match &conditions[index].node {
        ConditionNode::Simple(simple) => simple.is_sliced(),
        ConditionNode::Combination {
            operation,
            children,
            ..
        } => {
            *operation == LogicalOperation::And
                && children
                    .iter()
                    .filter(|&&c| conditions[c].is_sliced())
                    .count()
                    == 1
        }
    }
}

/// Evaluate the condition at `index` for one event.
///
/// `matcher_cache` holds this event's matcher results; `condition_cache`
/// and `changed_cache` are per-event memoization slots shared by all
/// conditions. Sliced transitions land in the tracker's changed-dimension
/// sets, which stay valid until the next event.
pub fn evaluate_condition(
    conditions: &mut [ConditionTracker],
    index: usize,
    event: &Event,
    matcher_cache: &[MatchingState],
    condition_cache: &mut [ConditionState],
    changed_cache: &mut [bool],
) {
    if condition_cache[index] != ConditionState::NotEvaluated {
        return;
    }

    let children: Option<Vec<usize>> = match &conditions[index].node {
        ConditionNode::Simple(_) => None,
        ConditionNode::Combination { children, .. } => Some(children.clone()),
    };

    match children {
        None => evaluate_simple(conditions, index, event, matcher_cache, condition_cache, changed_cache),
        Some(children) => {
            for &child in &children {
                evaluate_condition(
                    conditions,
                    child,
                    event,
                    matcher_cache,
                    condition_cache,
                    changed_cache,
                );
            }
            let operation = match &conditions[index].node {
                ConditionNode::Combination { operation, .. } => *operation,
                ConditionNode::Simple(_) => return,
            };
            let new_state = evaluate_combination(&children, operation, condition_cache);
            let old_state = conditions[index]
                .last_combination_state
                .unwrap_or(ConditionState::Unknown);
            let changed = old_state != new_state;
            conditions[index].last_combination_state = Some(new_state);
            condition_cache[index] = new_state;
            changed_cache[index] = changed;
        }
    }
}

fn evaluate_simple(
    conditions: &mut [ConditionTracker],
    index: usize,
    event: &Event,
    matcher_cache: &[MatchingState],
    condition_cache: &mut [ConditionState],
    changed_cache: &mut [bool],
) {
    let tracker = &mut conditions[index];
    tracker.changed_to_true.clear();
    tracker.changed_to_false.clear();
    let ConditionNode::Simple(simple) = &mut tracker.node else {
        return;
    };

    let matched = |idx: Option<usize>| {
        idx.is_some_and(|i| matcher_cache.get(i) == Some(&MatchingState::Matched))
    };

    // Priority: stop-all > stop > start.
    let fired = if matched(simple.stop_all_index) {
        Some(Fired::StopAll)
    } else if matched(simple.stop_index) {
        Some(Fired::Stop)
    } else if matched(simple.start_index) {
        Some(Fired::Start)
    } else {
        None
    };

    let Some(fired) = fired else {
        condition_cache[index] = simple.state;
        changed_cache[index] = false;
        return;
    };

    let mut changed = false;

    match fired {
        Fired::StopAll => {
            // Everything false, regardless of nesting.
            for (key, _) in simple.sliced.drain() {
                tracker.changed_to_false.insert(key);
            }
            simple.nesting = 0;
            if simple.state == ConditionState::True {
                changed = true;
            } else if simple.state == ConditionState::Unknown {
                changed = true;
            }
            simple.state = ConditionState::False;
            if changed && !simple.is_sliced() {
                tracker
                    .changed_to_false
                    .insert(HashableDimensionKey::default_key());
            }
        }
        Fired::Start | Fired::Stop => {
            if simple.is_sliced() {
                let dims = simple
                    .output_dimensions
                    .clone()
                    .unwrap_or_default();
                let key = extract_dimension_key(&dims, event);
                let counter = simple.sliced.entry(key.clone()).or_insert(0);
                if fired == Fired::Start {
                    let was_zero = *counter == 0;
                    *counter = if simple.count_nesting {
                        counter.saturating_add(1)
                    } else {
                        1
                    };
                    if was_zero {
                        tracker.changed_to_true.insert(key);
                        changed = true;
                    }
                } else {
                    // Never drive the counter below zero.
                    let was_positive = *counter > 0;
                    *counter = if simple.count_nesting {
                        (*counter - 1).max(0)
                    } else {
                        0
                    };
                    if was_positive && *counter == 0 {
                        simple.sliced.remove(&key);
                        tracker.changed_to_false.insert(key);
                        changed = true;
                    } else if !was_positive {
                        simple.sliced.remove(&key);
                    }
                }
                let any_true = !simple.sliced.is_empty();
                let new_state = ConditionState::from_bool(any_true);
                if new_state != simple.state {
                    simple.state = new_state;
                }
            } else {
                let new_state = if fired == Fired::Start {
                    if simple.count_nesting {
                        simple.nesting = simple.nesting.saturating_add(1);
                    } else {
                        simple.nesting = 1;
                    }
                    ConditionState::True
                } else {
                    if simple.count_nesting {
                        simple.nesting = (simple.nesting - 1).max(0);
                    } else {
                        simple.nesting = 0;
                    }
                    if simple.nesting > 0 {
                        ConditionState::True
                    } else {
                        ConditionState::False
                    }
                };
                if new_state != simple.state {
                    changed = true;
                    simple.state = new_state;
                    let key = HashableDimensionKey::default_key();
                    if new_state == ConditionState::True {
                        tracker.changed_to_true.insert(key);
                    } else {
                        tracker.changed_to_false.insert(key);
                    }
                }
            }
        }
    }

    debug!(
        condition = tracker.id,
        state = %simple.state,
        changed,
        "Simple condition evaluated"
    );
    condition_cache[index] = simple.state;
    changed_cache[index] = changed;
}

/// Query the current value of the condition at `index`, optionally with a
/// condition dimension key for sliced predicates. Missing keys answer with
/// the predicate's initial value.
pub fn query_condition(
    conditions: &[ConditionTracker],
    index: usize,
    condition_key: &HashableDimensionKey,
) -> ConditionState {
    match &conditions[index].node {
        ConditionNode::Simple(simple) => {
            if !simple.is_sliced() || condition_key.is_empty() {
                return simple.state;
            }
            match simple.sliced.get(condition_key) {
                Some(counter) if *counter > 0 => ConditionState::True,
                Some(_) => ConditionState::False,
                None => {
                    if simple.sliced.is_empty() && simple.state == ConditionState::Unknown {
                        simple.initial
                    } else {
                        ConditionState::False
                    }
                }
            }
        }
        ConditionNode::Combination {
            operation,
            children,
            ..
        } => {
            let mut states = vec![ConditionState::NotEvaluated; conditions.len()];
            for &child in children {
                states[child] = query_condition(conditions, child, condition_key);
            }
            evaluate_combination(children, *operation, &states)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
