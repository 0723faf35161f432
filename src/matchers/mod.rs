//! Atom matching trackers
//!
//! A config's matchers form a DAG: leaves test a single event against an
//! atom id plus field constraints, combinations apply a logical operation
//! over child matchers referenced by index. Each incoming event is run
//! through the trackers once, memoized through a per-event result cache so
//! no node evaluates twice.

pub mod field_matcher;

pub use field_matcher::matches_simple;

use std::collections::HashSet;

use crate::config::{
    AtomMatcher, AtomMatcherSpec, ConfigError, LogicalOperation, Position, SimpleAtomMatcher,
    ValueMatcher,
};
use crate::external::PackageResolver;
use crate::hash::stable_hash;
use crate::types::event::{Event, MAX_FIELD_DEPTH};

/// Per-event matcher result cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingState {
    NotComputed,
    Matched,
    NotMatched,
}

/// Short-circuit combination over already-computed child results.
pub fn combination_match(
    children: &[usize],
    operation: LogicalOperation,
    results: &[MatchingState],
) -> bool {
    match operation {
        LogicalOperation::And => children
            .iter()
            .all(|&c| results[c] == MatchingState::Matched),
        LogicalOperation::Or => children
            .iter()
            .any(|&c| results[c] == MatchingState::Matched),
        LogicalOperation::Not => children
            .first()
            .is_some_and(|&c| results[c] == MatchingState::NotMatched),
        LogicalOperation::Nand => children
            .iter()
            .any(|&c| results[c] != MatchingState::Matched),
        LogicalOperation::Nor => children
            .iter()
            .all(|&c| results[c] != MatchingState::Matched),
    }
}

/// Runtime body of one matcher node.
#[derive(Debug, Clone)]
enum TrackerNode {
    Simple {
        matcher: SimpleAtomMatcher,
    },
    Combination {
        operation: LogicalOperation,
        child_ids: Vec<i64>,
        /// Resolved by `init`.
        children: Vec<usize>,
    },
}

/// One node of the matcher graph, indexed by position in the tracker array.
#[derive(Debug, Clone)]
pub struct AtomMatchingTracker {
    id: i64,
    /// Stable identity across config updates.
    proto_hash: u64,
    node: TrackerNode,
    /// Atom ids this subtree can ever match; used to dispatch events.
    atom_ids: HashSet<i32>,
    initialized: bool,
}

impl AtomMatchingTracker {
    /// Build an uninitialized tracker from config. Leaf structural
    /// validation happens here; graph resolution happens in `init`.
    pub fn new(config: &AtomMatcher) -> Result<Self, ConfigError> {
        let proto_hash = stable_hash(config);
        let node = match &config.spec {
            AtomMatcherSpec::Simple(simple) => {
                if simple.atom_id < 0 {
                    return Err(ConfigError::MissingField {
                        kind: "matcher",
                        id: config.id,
                        field: "atom_id",
                    });
                }
                validate_field_matchers(config.id, &simple.field_value_matchers, 0)?;
                TrackerNode::Simple {
                    matcher: simple.clone(),
                }
            }
            AtomMatcherSpec::Combination {
                operation,
                matchers,
            } => {
                if matchers.is_empty() {
                    return Err(ConfigError::MissingField {
                        kind: "matcher",
                        id: config.id,
                        field: "matchers",
                    });
                }
                if *operation == LogicalOperation::Not && matchers.len() != 1 {
                    return Err(ConfigError::BadNotArity {
                        kind: "matcher",
                        id: config.id,
                    });
                }
                TrackerNode::Combination {
                    operation: *operation,
                    child_ids: matchers.clone(),
                    children: Vec::new(),
                }
            }
        };
        Ok(Self {
            id: config.id,
            proto_hash,
            node,
            atom_ids: HashSet::new(),
            initialized: false,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn proto_hash(&self) -> u64 {
        self.proto_hash
    }

    pub fn atom_ids(&self) -> &HashSet<i32> {
        &self.atom_ids
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Matcher structural limits: nesting depth and supported positions.
fn validate_field_matchers(
    matcher_id: i64,
    matchers: &[crate::config::FieldValueMatcher],
    depth: usize,
) -> Result<(), ConfigError> {
    if depth >= MAX_FIELD_DEPTH {
        return Err(ConfigError::DepthExceeded { id: matcher_id });
    }
    for fvm in matchers {
        if fvm.position == Some(Position::All) {
            return Err(ConfigError::UnsupportedPosition { id: matcher_id });
        }
        // A positional selector consumes one depth level.
        let child_depth = depth + fvm.position.map_or(0, |_| 1);
        if let ValueMatcher::MatchesTuple(sub) = &fvm.value {
            validate_field_matchers(matcher_id, sub, child_depth + 1)?;
        }
    }
    Ok(())
}

/// Recursively initialize the tracker at `index`: resolve child ids,
/// detect cycles with an on-stack bit, and propagate atom-id sets upward.
pub fn init_matcher(
    trackers: &mut [AtomMatchingTracker],
    index: usize,
    id_to_index: &std::collections::HashMap<i64, usize>,
    stack: &mut [bool],
) -> Result<(), ConfigError> {
    if trackers[index].initialized {
        return Ok(());
    }
    let matcher_id = trackers[index].id;

    // Copy out the node shape first; recursion below needs the slice back.
    let child_ids: Option<Vec<i64>> = match &trackers[index].node {
        TrackerNode::Simple { matcher } => {
            let atom_id = matcher.atom_id;
            trackers[index].atom_ids.insert(atom_id);
            None
        }
        TrackerNode::Combination { child_ids, .. } => Some(child_ids.clone()),
    };

    if let Some(child_ids) = child_ids {
        stack[index] = true;
        let mut children = Vec::with_capacity(child_ids.len());
        let mut atom_ids: HashSet<i32> = HashSet::new();
        for child_id in child_ids {
            let &child_index =
                id_to_index
                    .get(&child_id)
                    .ok_or(ConfigError::UnknownReference {
                        kind: "matcher",
                        from_id: matcher_id,
                        to_kind: "matcher",
                        to_id: child_id,
                    })?;
            if stack[child_index] {
                return Err(ConfigError::Cycle {
                    kind: "matcher",
                    id: matcher_id,
                });
            }
            init_matcher(trackers, child_index, id_to_index, stack)?;
            atom_ids.extend(trackers[child_index].atom_ids.iter().copied());
            children.push(child_index);
        }
        stack[index] = false;
        trackers[index].atom_ids = atom_ids;
        if let TrackerNode::Combination { children: slot, .. } = &mut trackers[index].node {
            *slot = children;
        }
    }

    trackers[index].initialized = true;
    Ok(())
}

/// Evaluate the matcher at `index` against `event`, memoized through
/// `cache`. Every tracker referencing this event's atom id gets evaluated
/// at most once per event.
pub fn evaluate_matcher(
    trackers: &[AtomMatchingTracker],
    index: usize,
    event: &Event,
    resolver: &dyn PackageResolver,
    cache: &mut [MatchingState],
) {
    if cache[index] != MatchingState::NotComputed {
        return;
    }

    let matched = match &trackers[index].node {
        TrackerNode::Simple { matcher } => {
            if matcher.atom_id != event.atom_id {
                false
            } else {
                matcher.field_value_matchers.iter().all(|fvm| {
                    matches_simple(resolver, fvm, &event.fields, 0, event.fields.len(), 0)
                })
            }
        }
        TrackerNode::Combination {
            operation,
            children,
            ..
        } => {
            for &child in children {
                evaluate_matcher(trackers, child, event, resolver, cache);
            }
            combination_match(children, *operation, cache)
        }
    };

    cache[index] = if matched {
        MatchingState::Matched
    } else {
        MatchingState::NotMatched
    };
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldValueMatcher;
    use crate::external::EmptyPackageResolver;
    use crate::types::FieldValue;
    use std::collections::HashMap;

    fn simple(id: i64, atom_id: i32) -> AtomMatcher {
        AtomMatcher {
            id,
            spec: AtomMatcherSpec::Simple(SimpleAtomMatcher {
                atom_id,
                field_value_matchers: Vec::new(),
            }),
        }
    }

    fn combination(id: i64, operation: LogicalOperation, matchers: Vec<i64>) -> AtomMatcher {
        AtomMatcher {
            id,
            spec: AtomMatcherSpec::Combination {
                operation,
                matchers,
            },
        }
    }

    fn build(configs: &[AtomMatcher]) -> Result<Vec<AtomMatchingTracker>, ConfigError> {
        let mut trackers: Vec<AtomMatchingTracker> = configs
            .iter()
            .map(AtomMatchingTracker::new)
            .collect::<Result<_, _>>()?;
        let id_to_index: HashMap<i64, usize> = configs
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i))
            .collect();
        let mut stack = vec![false; trackers.len()];
        for i in 0..trackers.len() {
            init_matcher(&mut trackers, i, &id_to_index, &mut stack)?;
        }
        Ok(trackers)
    }

    fn run(trackers: &[AtomMatchingTracker], event: &Event) -> Vec<MatchingState> {
        let mut cache = vec![MatchingState::NotComputed; trackers.len()];
        for i in 0..trackers.len() {
            evaluate_matcher(trackers, i, event, &EmptyPackageResolver, &mut cache);
        }
        cache
    }

    #[test]
    fn test_leaf_matches_by_atom_id() {
        let trackers = build(&[simple(1, 29)]).unwrap();
        assert_eq!(trackers[0].atom_ids().len(), 1);

        let hit = Event::new(29, 0).normalized();
        let miss = Event::new(30, 0).normalized();
        assert_eq!(run(&trackers, &hit)[0], MatchingState::Matched);
        assert_eq!(run(&trackers, &miss)[0], MatchingState::NotMatched);
    }

    #[test]
    fn test_combination_operations() {
        let configs = vec![
            simple(1, 29),
            simple(2, 30),
            combination(3, LogicalOperation::Or, vec![1, 2]),
            combination(4, LogicalOperation::And, vec![1, 2]),
            combination(5, LogicalOperation::Not, vec![1]),
            combination(6, LogicalOperation::Nand, vec![1, 2]),
            combination(7, LogicalOperation::Nor, vec![1, 2]),
        ];
        let trackers = build(&configs).unwrap();
        // The OR/AND trees care about both atoms.
        assert_eq!(trackers[2].atom_ids().len(), 2);

        let event = Event::new(29, 0).normalized();
        let cache = run(&trackers, &event);
        assert_eq!(cache[2], MatchingState::Matched); // OR
        assert_eq!(cache[3], MatchingState::NotMatched); // AND
        assert_eq!(cache[4], MatchingState::NotMatched); // NOT(29)
        assert_eq!(cache[5], MatchingState::Matched); // NAND
        assert_eq!(cache[6], MatchingState::NotMatched); // NOR
    }

    #[test]
    fn test_leaf_field_constraints_all_must_hold() {
        let matcher = AtomMatcher {
            id: 1,
            spec: AtomMatcherSpec::Simple(SimpleAtomMatcher {
                atom_id: 29,
                field_value_matchers: vec![
                    FieldValueMatcher {
                        field: 1,
                        position: None,
                        value: ValueMatcher::EqInt(2),
                    },
                    FieldValueMatcher {
                        field: 2,
                        position: None,
                        value: ValueMatcher::GtInt(10),
                    },
                ],
            }),
        };
        let trackers = build(&[matcher]).unwrap();

        let both = Event::new(29, 0)
            .with_value(1, FieldValue::Int(2))
            .with_value(2, FieldValue::Int(11))
            .normalized();
        let one = Event::new(29, 0)
            .with_value(1, FieldValue::Int(2))
            .with_value(2, FieldValue::Int(10))
            .normalized();
        assert_eq!(run(&trackers, &both)[0], MatchingState::Matched);
        assert_eq!(run(&trackers, &one)[0], MatchingState::NotMatched);
    }

    #[test]
    fn test_cycle_rejected() {
        let configs = vec![
            combination(1, LogicalOperation::And, vec![2]),
            combination(2, LogicalOperation::And, vec![1]),
        ];
        assert!(matches!(
            build(&configs),
            Err(ConfigError::Cycle { kind: "matcher", .. })
        ));
    }

    #[test]
    fn test_unknown_child_rejected() {
        let configs = vec![combination(1, LogicalOperation::And, vec![99])];
        assert!(matches!(
            build(&configs),
            Err(ConfigError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_not_arity_enforced() {
        let configs = vec![
            simple(1, 29),
            simple(2, 30),
            combination(3, LogicalOperation::Not, vec![1, 2]),
        ];
        assert!(matches!(build(&configs), Err(ConfigError::BadNotArity { .. })));
    }

    #[test]
    fn test_position_all_rejected_at_build() {
        let matcher = AtomMatcher {
            id: 1,
            spec: AtomMatcherSpec::Simple(SimpleAtomMatcher {
                atom_id: 29,
                field_value_matchers: vec![FieldValueMatcher {
                    field: 1,
                    position: Some(Position::All),
                    value: ValueMatcher::EqInt(1),
                }],
            }),
        };
        assert!(matches!(
            build(&[matcher]),
            Err(ConfigError::UnsupportedPosition { .. })
        ));
    }

    #[test]
    fn test_tuple_depth_limit() {
        // position (1 level) + tuple (1 level) + inner position + tuple is
        // too deep for a 3-level schema.
        let too_deep = AtomMatcher {
            id: 1,
            spec: AtomMatcherSpec::Simple(SimpleAtomMatcher {
                atom_id: 29,
                field_value_matchers: vec![FieldValueMatcher {
                    field: 1,
                    position: Some(Position::Any),
                    value: ValueMatcher::MatchesTuple(vec![FieldValueMatcher {
                        field: 1,
                        position: Some(Position::Any),
                        value: ValueMatcher::MatchesTuple(vec![FieldValueMatcher {
                            field: 1,
                            position: None,
                            value: ValueMatcher::EqInt(1),
                        }]),
                    }]),
                }],
            }),
        };
        assert!(matches!(
            build(&[too_deep]),
            Err(ConfigError::DepthExceeded { .. })
        ));

        // Depth-3 nesting without positions is accepted.
        let ok = AtomMatcher {
            id: 2,
            spec: AtomMatcherSpec::Simple(SimpleAtomMatcher {
                atom_id: 29,
                field_value_matchers: vec![FieldValueMatcher {
                    field: 1,
                    position: None,
                    value: ValueMatcher::MatchesTuple(vec![FieldValueMatcher {
                        field: 1,
                        position: None,
                        value: ValueMatcher::MatchesTuple(vec![FieldValueMatcher {
                            field: 1,
                            position: None,
                            value: ValueMatcher::EqInt(1),
                        }]),
                    }]),
                }],
            }),
        };
        assert!(build(&[ok]).is_ok());
    }

    #[test]
    fn test_memoization_via_cache() {
        let configs = vec![
            simple(1, 29),
            combination(2, LogicalOperation::Or, vec![1, 1]),
        ];
        let trackers = build(&configs).unwrap();
        let event = Event::new(29, 0).normalized();
        let mut cache = vec![MatchingState::NotComputed; trackers.len()];
        evaluate_matcher(&trackers, 1, &event, &EmptyPackageResolver, &mut cache);
        // Child got filled in by the recursive evaluation.
        assert_eq!(cache[0], MatchingState::Matched);
        assert_eq!(cache[1], MatchingState::Matched);
    }
}
