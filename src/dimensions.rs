//! Dimension extraction
//!
//! Translates a metric's or predicate's field selectors against a concrete
//! event into [`HashableDimensionKey`]s. Selectors address fields by path;
//! a positional selector addresses a repeated field's siblings, where ANY
//! expands into one key per sibling present in the event.

use tracing::warn;

use crate::config::{Dimensions, FieldSelector, MetricConditionLink, Position};
use crate::types::dimension::HashableDimensionKey;
use crate::types::event::{Event, EventField, FieldPath, FieldValue};

/// The event path a selector resolves to, given a sibling index for its
/// positional level: `path[0], sibling, path[1..]`.
fn positioned_path(selector: &FieldSelector, sibling: u8) -> Option<FieldPath> {
    let base = selector.field;
    let mut positions: Vec<u8> = vec![base.pos_at_depth(0), sibling];
    for d in 1..base.depth() {
        positions.push(base.pos_at_depth(d));
    }
    FieldPath::new(&positions)
}

/// Sibling indices present under the selector's repeated field.
fn siblings_present(selector: &FieldSelector, event: &Event) -> Vec<u8> {
    let parent = selector.field.pos_at_depth(0);
    let mut out: Vec<u8> = Vec::new();
    for field in &event.fields {
        if field.path.pos_at_depth(0) == parent && field.path.depth() >= 2 {
            let sibling = field.path.pos_at_depth(1);
            if out.last() != Some(&sibling) {
                out.push(sibling);
            }
        }
    }
    out
}

/// Last sibling index under the selector's repeated field, if any.
fn last_sibling(selector: &FieldSelector, event: &Event) -> Option<u8> {
    siblings_present(selector, event).into_iter().max()
}

fn lookup(event: &Event, path: &FieldPath) -> Option<FieldValue> {
    event
        .fields
        .iter()
        .find(|f: &&EventField| &f.path == path)
        .map(|f| f.value.clone())
}

/// Resolve one selector for a fixed ANY-sibling choice. Returns the
/// (canonical path, value) pair to append to the key, or `None` when the
/// event carries no such field.
fn resolve_selector(
    selector: &FieldSelector,
    event: &Event,
    any_sibling: Option<u8>,
) -> Option<(FieldPath, FieldValue)> {
    match selector.position {
        None => lookup(event, &selector.field).map(|v| (selector.field, v)),
        Some(Position::First) => {
            let path = positioned_path(selector, 1)?;
            lookup(event, &path).map(|v| (path, v))
        }
        Some(Position::Last) => {
            let sibling = last_sibling(selector, event)?;
            let path = positioned_path(selector, sibling)?;
            lookup(event, &path).map(|v| (path, v))
        }
        Some(Position::Any) | Some(Position::All) => {
            let sibling = any_sibling?;
            let path = positioned_path(selector, sibling)?;
            // ANY/ALL-expanded keys keep a canonical sibling index so the
            // same entity maps to the same key regardless of its position.
            lookup(event, &path).map(|v| (positioned_path(selector, 1).unwrap_or(path), v))
        }
    }
}

/// Extract the dimension keys selected by `dims` from `event`.
///
/// Without an ANY selector this yields exactly one key (possibly the
/// default key when `dims` is empty or nothing matched). With ANY
/// selectors it yields one key per sibling subtree present; all ANY
/// selectors walk the siblings together.
pub fn extract_dimension_keys(dims: &Dimensions, event: &Event) -> Vec<HashableDimensionKey> {
    if dims.is_empty() {
        return vec![HashableDimensionKey::default_key()];
    }

    let any_selector = dims
        .fields
        .iter()
        .find(|s| matches!(s.position, Some(Position::Any) | Some(Position::All)));

    let sibling_choices: Vec<Option<u8>> = match any_selector {
        Some(selector) => {
            let siblings = siblings_present(selector, event);
            if siblings.is_empty() {
                vec![None]
            } else {
                siblings.into_iter().map(Some).collect()
            }
        }
        None => vec![None],
    };

    let mut keys = Vec::with_capacity(sibling_choices.len());
    for choice in sibling_choices {
        let mut key = HashableDimensionKey::default_key();
        for selector in &dims.fields {
            if let Some((path, value)) = resolve_selector(selector, event, choice) {
                key.push(path, value);
            }
        }
        keys.push(key);
    }
    keys
}

/// Single-key variant used where ANY expansion is not meaningful
/// (condition slicing); the first extracted key wins.
pub fn extract_dimension_key(dims: &Dimensions, event: &Event) -> HashableDimensionKey {
    extract_dimension_keys(dims, event)
        .into_iter()
        .next()
        .unwrap_or_default()
}

/// Build the condition-side key for a metric condition link: values come
/// from the `fields_in_what` selectors of the event, paths from the
/// link's `fields_in_condition`.
pub fn extract_link_key(link: &MetricConditionLink, event: &Event) -> HashableDimensionKey {
    if link.fields_in_what.fields.len() != link.fields_in_condition.fields.len() {
        warn!(
            condition = link.condition,
            "Condition link has mismatched what/condition field counts"
        );
        return HashableDimensionKey::default_key();
    }

    let what_key = extract_dimension_key(&link.fields_in_what, event);
    if what_key.values().len() != link.fields_in_condition.fields.len() {
        // Event did not carry every linked field; condition can only be
        // queried unsliced.
        return HashableDimensionKey::default_key();
    }

    let mut key = HashableDimensionKey::default_key();
    for (slot, (_, value)) in link
        .fields_in_condition
        .fields
        .iter()
        .zip(what_key.values().iter())
    {
        key.push(slot.field, value.clone());
    }
    key
}

// ============================================================================
// Tests
// ============================================================================
