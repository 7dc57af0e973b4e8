//! Index definitions and the per-collection secondary structures they feed.
//! A definition names an XPath-like element path and a value type; the
//! pipeline in [`pipeline`] extracts typed values from XML documents at
//! write time, and queries intersect the resulting id sets.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use crate::error::{Error, Result};

pub(crate) mod pipeline;

/// Type of the values an index extracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    String,
    Integer,
    Long,
    Float,
    Double,
    /// Accepted in definitions for catalog compatibility; date values are
    /// never parsed out of documents.
    Date,
}

impl IndexType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            IndexType::String => 0,
            IndexType::Integer => 1,
            IndexType::Long => 2,
            IndexType::Float => 3,
            IndexType::Double => 4,
            IndexType::Date => 5,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<IndexType> {
        match tag {
            0 => Ok(IndexType::String),
            1 => Ok(IndexType::Integer),
            2 => Ok(IndexType::Long),
            3 => Ok(IndexType::Float),
            4 => Ok(IndexType::Double),
            5 => Ok(IndexType::Date),
            other => Err(Error::catalog(format!("unknown index type tag {}", other))),
        }
    }
}

/// An index rule attached to a collection and inherited by its descendants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDef {
    pub id: u32,
    pub name: String,
    pub path: String,
    pub value_type: IndexType,
}

/// A typed index value. Ordering is total (floats order by `total_cmp`) so
/// value maps iterate deterministically.
#[derive(Clone, Debug)]
pub enum Value {
    String(String),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::String(_) => 0,
            Value::Integer(_) => 1,
            Value::Long(_) => 2,
            Value::Float(_) => 3,
            Value::Double(_) => 4,
        }
    }

    /// Coerces element text into a typed value. Numeric parse failures and
    /// date values yield `None`; the caller drops them.
    pub fn coerce(text: &str, value_type: IndexType) -> Option<Value> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        match value_type {
            IndexType::String => Some(Value::String(text.to_owned())),
            IndexType::Integer => text.parse().ok().map(Value::Integer),
            IndexType::Long => text.parse().ok().map(Value::Long),
            IndexType::Float => text.parse().ok().map(Value::Float),
            IndexType::Double => text.parse().ok().map(Value::Double),
            IndexType::Date => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
        }
    }
}

/// One lookup key of a structured query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    pub name: String,
    pub value: Value,
}

impl Key {
    pub fn new(name: impl Into<String>, value: Value) -> Key {
        Key { name: name.into(), value }
    }
}

/// The secondary structure on a collection: key name to value to the ordered
/// set of document ids carrying that value.
#[derive(Debug, Default, Clone)]
pub(crate) struct IndexValues {
    map: BTreeMap<String, BTreeMap<Value, BTreeSet<u32>>>,
}

impl IndexValues {
    pub fn add(&mut self, key: &str, value: Value, document: u32) {
        self.map
            .entry(key.to_owned())
            .or_default()
            .entry(value)
            .or_default()
            .insert(document);
    }

    /// Document ids recorded for `key` = `value`; empty when either level is
    /// absent.
    pub fn lookup(&self, key: &str, value: &Value) -> BTreeSet<u32> {
        self.map
            .get(key)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the document's entry under `key`: any value previously
    /// recorded for this document and key is dropped first.
    pub fn replace(&mut self, key: &str, value: Value, document: u32) {
        if let Some(values) = self.map.get_mut(key) {
            values.retain(|_, ids| {
                ids.remove(&document);
                !ids.is_empty()
            });
        }
        self.add(key, value, document);
    }

    /// Forgets every entry citing `document`. Used when a document is
    /// rewritten so queries only see its latest content.
    pub fn remove_document(&mut self, document: u32) {
        for values in self.map.values_mut() {
            values.retain(|_, ids| {
                ids.remove(&document);
                !ids.is_empty()
            });
        }
        self.map.retain(|_, values| !values.is_empty());
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&String, &BTreeMap<Value, BTreeSet<u32>>)> {
        self.map.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_follows_the_index_type() {
        assert_eq!(Value::coerce(" 42 ", IndexType::Integer), Some(Value::Integer(42)));
        assert_eq!(Value::coerce("42", IndexType::Long), Some(Value::Long(42)));
        assert_eq!(Value::coerce("2.5", IndexType::Double), Some(Value::Double(2.5)));
        assert_eq!(
            Value::coerce("  foo  ", IndexType::String),
            Some(Value::String("foo".to_owned()))
        );
        assert_eq!(Value::coerce("not a number", IndexType::Integer), None);
        assert_eq!(Value::coerce("   ", IndexType::String), None);
        assert_eq!(Value::coerce("2024-01-01", IndexType::Date), None);
    }

    #[test]
    fn values_order_deterministically() {
        let mut values = vec![
            Value::Double(2.0),
            Value::Integer(5),
            Value::String("b".into()),
            Value::Integer(1),
            Value::String("a".into()),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::Integer(1),
                Value::Integer(5),
                Value::Double(2.0),
            ]
        );
    }

    #[test]
    fn value_map_tracks_documents_per_value() {
        let mut values = IndexValues::default();
        values.add("DocumentId", Value::Integer(1), 10);
        values.add("DocumentId", Value::Integer(2), 11);
        values.add("DocumentId", Value::Integer(2), 12);

        let hits = values.lookup("DocumentId", &Value::Integer(2));
        assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![11, 12]);
        assert!(values.lookup("DocumentId", &Value::Integer(9)).is_empty());
        assert!(values.lookup("Missing", &Value::Integer(2)).is_empty());

        values.remove_document(11);
        let hits = values.lookup("DocumentId", &Value::Integer(2));
        assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![12]);
    }
}
