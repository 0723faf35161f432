//! Atom event types
//!
//! An atom is a typed structured event: an integer atom id, a monotonic
//! nanosecond timestamp, the originating uid/pid, and an ordered sequence of
//! typed fields. Fields carry a positional path into the atom's nested
//! schema (depth <= 3) and arrive sorted in DFS order, which the matcher
//! machinery relies on for contiguous-range field selection.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Maximum nesting depth of an atom field schema.
pub const MAX_FIELD_DEPTH: usize = 3;

/// Atom id. Non-negative; negative ids never match anything.
pub type AtomId = i32;

// ============================================================================
// Field Path
// ============================================================================

/// Positional path of a field inside an atom's nested schema.
///
/// Each entry is a 1-based position at that depth. Depth is at most
/// [`MAX_FIELD_DEPTH`]. Paths order in DFS order, which matches the order
/// fields appear in an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<u8>", try_from = "Vec<u8>")]
pub struct FieldPath {
    depth: u8,
    pos: [u8; MAX_FIELD_DEPTH],
}

impl FieldPath {
    /// Build a path from 1-based positions, one per depth.
    ///
    /// Returns `None` for an empty path, a path deeper than
    /// [`MAX_FIELD_DEPTH`], or a zero position.
    pub fn new(positions: &[u8]) -> Option<Self> {
        if positions.is_empty() || positions.len() > MAX_FIELD_DEPTH {
            return None;
        }
        if positions.iter().any(|&p| p == 0) {
            return None;
        }
        let mut pos = [0u8; MAX_FIELD_DEPTH];
        pos[..positions.len()].copy_from_slice(positions);
        Some(Self {
            depth: positions.len() as u8,
            pos,
        })
    }

    /// Single-level path (a top-level field of the atom).
    pub fn leaf(position: u8) -> Self {
        Self::new(&[position]).unwrap_or(Self {
            depth: 1,
            pos: [1, 0, 0],
        })
    }

    /// Number of valid levels (1..=3).
    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    /// Position at `depth` (0-based depth index), or 0 when the path does
    /// not extend that deep.
    pub fn pos_at_depth(&self, depth: usize) -> u8 {
        if depth < self.depth as usize {
            self.pos[depth]
        } else {
            0
        }
    }

    /// Extend this path one level down. Returns `None` past max depth.
    pub fn with_child(&self, position: u8) -> Option<Self> {
        if self.depth as usize >= MAX_FIELD_DEPTH || position == 0 {
            return None;
        }
        let mut pos = self.pos;
        pos[self.depth as usize] = position;
        Some(Self {
            depth: self.depth + 1,
            pos,
        })
    }

    /// Replace the position at one depth, keeping the rest of the path.
    pub fn with_pos_at_depth(&self, depth: usize, position: u8) -> Self {
        let mut out = *self;
        if depth < out.depth as usize {
            out.pos[depth] = position;
        }
        out
    }

    /// Whether `other` is this path or lies under it in the schema tree.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        if other.depth < self.depth {
            return false;
        }
        (0..self.depth as usize).all(|d| self.pos[d] == other.pos[d])
    }
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    // DFS order: compare position sequences element-wise; a parent sorts
    // before its children (missing levels compare as 0).
    fn cmp(&self, other: &Self) -> Ordering {
        self.pos.cmp(&other.pos).then(self.depth.cmp(&other.depth))
    }
}

impl From<FieldPath> for Vec<u8> {
    fn from(path: FieldPath) -> Self {
        path.pos[..path.depth as usize].to_vec()
    }
}

impl TryFrom<Vec<u8>> for FieldPath {
    type Error = String;

    fn try_from(positions: Vec<u8>) -> Result<Self, Self::Error> {
        FieldPath::new(&positions)
            .ok_or_else(|| format!("invalid field path {positions:?} (depth 1..=3, positions >= 1)"))
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for d in 0..self.depth as usize {
            if d > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", self.pos[d])?;
        }
        Ok(())
    }
}

// ============================================================================
// Field Value
// ============================================================================

/// Tagged value of one event field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Str(String),
    /// Opaque storage-typed payload, carried but never matched on.
    Storage(Vec<u8>),
}

impl FieldValue {
    /// Widened integer view. Covers both int32 and int64 storage, since
    /// integer comparators apply to either width.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v as i64),
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness of an integer field, used by boolean matchers.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_long().map(|v| v != 0)
    }
}

// Structural equality; floats compare by bit pattern so dimension keys can
// hash them.
impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Int(b)) => a == b,
            (FieldValue::Long(a), FieldValue::Long(b)) => a == b,
            (FieldValue::Float(a), FieldValue::Float(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::Str(a), FieldValue::Str(b)) => a == b,
            (FieldValue::Storage(a), FieldValue::Storage(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            FieldValue::Int(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            FieldValue::Long(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            FieldValue::Float(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
            FieldValue::Str(v) => {
                3u8.hash(state);
                v.hash(state);
            }
            FieldValue::Storage(v) => {
                4u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Long(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Str(v) => write!(f, "{v}"),
            FieldValue::Storage(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

// ============================================================================
// Event Field
// ============================================================================

/// One field of an event: path, sibling markers, annotations, value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventField {
    pub path: FieldPath,
    /// `last[d]` marks this element as the last sibling at depth `d`, which
    /// the LAST positional selector keys off.
    #[serde(default)]
    pub last: [bool; MAX_FIELD_DEPTH],
    /// The field carries a uid and string matchers against it resolve
    /// through the package database.
    #[serde(default)]
    pub is_uid: bool,
    pub value: FieldValue,
}

impl EventField {
    pub fn new(path: FieldPath, value: FieldValue) -> Self {
        Self {
            path,
            last: [false; MAX_FIELD_DEPTH],
            is_uid: false,
            value,
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable atom event as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub atom_id: AtomId,
    /// Monotonic elapsed-realtime timestamp.
    pub elapsed_timestamp_ns: i64,
    #[serde(default)]
    pub uid: i32,
    #[serde(default)]
    pub pid: i32,
    /// Fields in DFS order of their paths.
    #[serde(default)]
    pub fields: Vec<EventField>,
}

impl Event {
    pub fn new(atom_id: AtomId, elapsed_timestamp_ns: i64) -> Self {
        Self {
            atom_id,
            elapsed_timestamp_ns,
            uid: 0,
            pid: 0,
            fields: Vec::new(),
        }
    }

    /// Append a field at a top-level position.
    pub fn with_value(mut self, position: u8, value: FieldValue) -> Self {
        self.fields
            .push(EventField::new(FieldPath::leaf(position), value));
        self
    }

    /// Append a field at an arbitrary path.
    pub fn with_value_at(mut self, positions: &[u8], value: FieldValue) -> Self {
        if let Some(path) = FieldPath::new(positions) {
            self.fields.push(EventField::new(path, value));
        }
        self
    }

    /// Append a uid-annotated field (string matchers will resolve it
    /// through the package database).
    pub fn with_uid_value_at(mut self, positions: &[u8], value: FieldValue) -> Self {
        if let Some(path) = FieldPath::new(positions) {
            let mut field = EventField::new(path, value);
            field.is_uid = true;
            self.fields.push(field);
        }
        self
    }

    /// Sort fields into DFS order and mark last-sibling flags. Call once
    /// after all fields are appended; transport-built events arrive
    /// normalized already.
    pub fn normalized(mut self) -> Self {
        self.fields.sort_by(|a, b| a.path.cmp(&b.path));
        let snapshot: Vec<FieldPath> = self.fields.iter().map(|f| f.path).collect();
        for field in self.fields.iter_mut() {
            for d in 0..field.path.depth() {
                let pos = field.path.pos_at_depth(d);
                // Last sibling at depth d: no other field shares the prefix
                // above d with a greater position at d.
                let is_last = !snapshot.iter().any(|other| {
                    (0..d).all(|k| other.pos_at_depth(k) == field.path.pos_at_depth(k))
                        && other.pos_at_depth(d) > pos
                });
                field.last[d] = is_last;
            }
        }
        self
    }

    /// Value of the field at `path`, if present.
    pub fn value_at(&self, path: &FieldPath) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| &f.path == path)
            .map(|f| &f.value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_path_construction() {
        let p = FieldPath::new(&[2, 1, 3]).unwrap();
        assert_eq!(p.depth(), 3);
        assert_eq!(p.pos_at_depth(0), 2);
        assert_eq!(p.pos_at_depth(1), 1);
        assert_eq!(p.pos_at_depth(2), 3);
        assert_eq!(p.pos_at_depth(3), 0);

        assert!(FieldPath::new(&[]).is_none());
        assert!(FieldPath::new(&[1, 2, 3, 4]).is_none());
        assert!(FieldPath::new(&[1, 0]).is_none());
    }

    #[test]
    fn test_field_path_dfs_order() {
        let parent = FieldPath::new(&[2]).unwrap();
        let child = FieldPath::new(&[2, 1]).unwrap();
        let sibling = FieldPath::new(&[3]).unwrap();
        assert!(parent < child);
        assert!(child < sibling);
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
    }

    #[test]
    fn test_field_value_widening() {
        assert_eq!(FieldValue::Int(7).as_long(), Some(7));
        assert_eq!(FieldValue::Long(7).as_long(), Some(7));
        assert_eq!(FieldValue::Float(1.5).as_long(), None);
        assert_eq!(FieldValue::Int(0).as_bool(), Some(false));
        assert_eq!(FieldValue::Long(2).as_bool(), Some(true));
    }

    #[test]
    fn test_float_values_hashable() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(FieldValue::Float(1.25));
        assert!(set.contains(&FieldValue::Float(1.25)));
        assert!(!set.contains(&FieldValue::Float(1.5)));
    }

    #[test]
    fn test_normalized_marks_last_siblings() {
        // Attribution-chain shape: field 1 repeats with two children each.
        let event = Event::new(10, 100)
            .with_value_at(&[1, 1, 1], FieldValue::Int(111))
            .with_value_at(&[1, 1, 2], FieldValue::Str("a".into()))
            .with_value_at(&[1, 2, 1], FieldValue::Int(222))
            .with_value_at(&[1, 2, 2], FieldValue::Str("b".into()))
            .with_value(2, FieldValue::Int(5))
            .normalized();

        // Fields sorted DFS; the second attribution node is last at depth 1.
        let f = &event.fields;
        assert_eq!(f.len(), 5);
        assert_eq!(f[0].path, FieldPath::new(&[1, 1, 1]).unwrap());
        assert!(!f[0].last[1]);
        assert_eq!(f[2].path, FieldPath::new(&[1, 2, 1]).unwrap());
        assert!(f[2].last[1]);
        // Top-level field 2 is last at depth 0.
        assert!(f[4].last[0]);
    }

    #[test]
    fn test_event_value_lookup() {
        let event = Event::new(29, 1)
            .with_value(1, FieldValue::Int(2))
            .normalized();
        assert_eq!(
            event.value_at(&FieldPath::leaf(1)),
            Some(&FieldValue::Int(2))
        );
        assert_eq!(event.value_at(&FieldPath::leaf(2)), None);
    }
}
