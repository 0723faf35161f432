//! Field value matching
//!
//! Evaluates one [`FieldValueMatcher`] against an event's DFS-sorted field
//! sequence. Selection proceeds depth by depth: at each depth the matcher's
//! field narrows the working range to the contiguous run of fields with
//! that position, an optional positional selector refines it, and a
//! `matches_tuple` recurses one level deeper. Integer comparators apply to
//! both int32 and int64 storage; string equality on uid-annotated fields
//! resolves through the package database and the symbolic AID table.

use crate::config::{FieldValueMatcher, Position, ValueMatcher};
use crate::external::{aid_to_uid, PackageResolver};
use crate::types::event::{EventField, FieldValue, MAX_FIELD_DEPTH};

/// Match a string literal against one field.
///
/// Uid-annotated fields compare by identity: an `AID_*` name resolves to a
/// numeric uid, anything else is looked up in the package database for
/// that uid. Plain string fields compare by value.
fn try_match_string(resolver: &dyn PackageResolver, field: &EventField, literal: &str) -> bool {
    if field.is_uid {
        let Some(uid) = field.value.as_long() else {
            return false;
        };
        if let Some(aid_uid) = aid_to_uid(literal) {
            return aid_uid as i64 == uid;
        }
        return resolver
            .app_names_from_uid(uid as i32, true)
            .contains(literal);
    }
    match &field.value {
        FieldValue::Str(s) => s == literal,
        _ => false,
    }
}

/// Evaluate `matcher` against `fields[start..end)` at `depth`.
///
/// `fields` must be sorted in DFS path order; the contiguous-range scans
/// rely on it.
pub fn matches_simple(
    resolver: &dyn PackageResolver,
    matcher: &FieldValueMatcher,
    fields: &[EventField],
    start: usize,
    end: usize,
    depth: usize,
) -> bool {
    if depth >= MAX_FIELD_DEPTH {
        return false;
    }
    if start >= end {
        return false;
    }

    // Narrow to the contiguous run with the matcher's position at this
    // depth. Fields are DFS-sorted, so past the target position we can stop.
    let mut new_start: Option<usize> = None;
    let mut new_end = end;
    for (i, field) in fields.iter().enumerate().take(end).skip(start) {
        let pos = field.path.pos_at_depth(depth);
        if pos == matcher.field {
            if new_start.is_none() {
                new_start = Some(i);
            }
            new_end = i + 1;
        } else if pos > matcher.field {
            break;
        }
    }
    let Some(mut start) = new_start else {
        return false;
    };
    let mut end = new_end;
    let mut depth = depth;

    // Positional selectors consume one path level: the repeated field's
    // sibling index is stored as the next node in the path.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    if let Some(position) = matcher.position {
        depth += 1;
        if depth >= MAX_FIELD_DEPTH {
            return false;
        }
        match position {
            Position::First => {
                for i in start..end {
                    if fields[i].path.pos_at_depth(depth) != 1 {
                        end = i;
                        break;
                    }
                }
                ranges.push((start, end));
            }
            Position::Last => {
                for (i, field) in fields.iter().enumerate().take(end).skip(start) {
                    if field.last[depth] {
                        start = i;
                        break;
                    }
                }
                ranges.push((start, end));
            }
            Position::Any => {
                // One range per sibling subtree; success if any matches.
                let mut sub_start = start;
                let mut current_pos = fields[start].path.pos_at_depth(depth);
                for i in start..end {
                    let pos = fields[i].path.pos_at_depth(depth);
                    if pos != current_pos {
                        ranges.push((sub_start, i));
                        sub_start = i;
                        current_pos = pos;
                    }
                }
                ranges.push((sub_start, end));
            }
            // Rejected at build time; unreachable through a built config.
            Position::All => return false,
        }
    } else {
        ranges.push((start, end));
    }

    match &matcher.value {
        ValueMatcher::MatchesTuple(sub_matchers) => {
            let depth = depth + 1;
            // A range matches when every sub-matcher matches inside it.
            ranges.iter().any(|&(s, e)| {
                sub_matchers
                    .iter()
                    .all(|sub| matches_simple(resolver, sub, fields, s, e, depth))
            })
        }
        // Leaf comparators: with a trailing ANY the range spans several
        // siblings and any matching value succeeds.
        ValueMatcher::EqBool(want) => fields[start..end]
            .iter()
            .any(|f| f.value.as_bool() == Some(*want)),
        ValueMatcher::EqInt(want) => fields[start..end]
            .iter()
            .any(|f| f.value.as_long() == Some(*want)),
        ValueMatcher::LtInt(bound) => fields[start..end]
            .iter()
            .any(|f| f.value.as_long().is_some_and(|v| v < *bound)),
        ValueMatcher::GtInt(bound) => fields[start..end]
            .iter()
            .any(|f| f.value.as_long().is_some_and(|v| v > *bound)),
        ValueMatcher::LteInt(bound) => fields[start..end]
            .iter()
            .any(|f| f.value.as_long().is_some_and(|v| v <= *bound)),
        ValueMatcher::GteInt(bound) => fields[start..end]
            .iter()
            .any(|f| f.value.as_long().is_some_and(|v| v >= *bound)),
        ValueMatcher::LtFloat(bound) => fields[start..end]
            .iter()
            .any(|f| f.value.as_float().is_some_and(|v| v < *bound)),
        ValueMatcher::GtFloat(bound) => fields[start..end]
            .iter()
            .any(|f| f.value.as_float().is_some_and(|v| v > *bound)),
        ValueMatcher::EqString(literal) => fields[start..end]
            .iter()
            .any(|f| try_match_string(resolver, f, literal)),
        ValueMatcher::EqAnyString(literals) => fields[start..end].iter().any(|f| {
            literals
                .iter()
                .any(|literal| try_match_string(resolver, f, literal))
        }),
        ValueMatcher::NeqAnyString(literals) => fields[start..end].iter().any(|f| {
            literals
                .iter()
                .all(|literal| !try_match_string(resolver, f, literal))
        }),
    }
}
