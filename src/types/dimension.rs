//! Dimension keys
//!
//! Aggregation state is grouped by dimension keys extracted from events.
//! A [`HashableDimensionKey`] is an ordered list of (field path, value)
//! pairs with structural equality and hash. A [`MetricDimensionKey`] pairs
//! the `what`-dimension with the condition-dimension; all per-dimension
//! metric state is indexed by it.

use serde::{Deserialize, Serialize};

use super::event::{FieldPath, FieldValue};

/// Ordered (field path, value) pairs identifying one dimension.
///
/// The empty key is the "no dimensioning" default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashableDimensionKey {
    values: Vec<(FieldPath, FieldValue)>,
}

impl HashableDimensionKey {
    pub fn new(values: Vec<(FieldPath, FieldValue)>) -> Self {
        Self { values }
    }

    /// The "no dimensioning" key.
    pub fn default_key() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[(FieldPath, FieldValue)] {
        &self.values
    }

    pub fn push(&mut self, path: FieldPath, value: FieldValue) {
        self.values.push((path, value));
    }
}

impl std::fmt::Display for HashableDimensionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.values.is_empty() {
            return write!(f, "(default)");
        }
        for (i, (path, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{path}={value}")?;
        }
        Ok(())
    }
}

/// (what-key, condition-key) pair indexing per-dimension metric state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDimensionKey {
    what: HashableDimensionKey,
    condition: HashableDimensionKey,
}

impl MetricDimensionKey {
    pub fn new(what: HashableDimensionKey, condition: HashableDimensionKey) -> Self {
        Self { what, condition }
    }

    pub fn what(&self) -> &HashableDimensionKey {
        &self.what
    }

    pub fn condition(&self) -> &HashableDimensionKey {
        &self.condition
    }
}

impl std::fmt::Display for MetricDimensionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "what:{} cond:{}", self.what, self.condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_key_is_empty() {
        let key = HashableDimensionKey::default_key();
        assert!(key.is_empty());
        assert_eq!(key, HashableDimensionKey::new(Vec::new()));
    }

    #[test]
    fn test_structural_equality() {
        let a = HashableDimensionKey::new(vec![(FieldPath::leaf(1), FieldValue::Int(3))]);
        let b = HashableDimensionKey::new(vec![(FieldPath::leaf(1), FieldValue::Int(3))]);
        let c = HashableDimensionKey::new(vec![(FieldPath::leaf(1), FieldValue::Int(4))]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Order matters: the key is an ordered sequence.
        let two = HashableDimensionKey::new(vec![
            (FieldPath::leaf(1), FieldValue::Int(3)),
            (FieldPath::leaf(2), FieldValue::Str("x".into())),
        ]);
        let swapped = HashableDimensionKey::new(vec![
            (FieldPath::leaf(2), FieldValue::Str("x".into())),
            (FieldPath::leaf(1), FieldValue::Int(3)),
        ]);
        assert_ne!(two, swapped);
    }

    #[test]
    fn test_metric_dimension_key_as_map_index() {
        let mut map: HashMap<MetricDimensionKey, i64> = HashMap::new();
        let what = HashableDimensionKey::new(vec![(FieldPath::leaf(1), FieldValue::Int(10))]);
        let key = MetricDimensionKey::new(what, HashableDimensionKey::default_key());
        map.insert(key.clone(), 5);
        assert_eq!(map.get(&key), Some(&5));
    }
}
