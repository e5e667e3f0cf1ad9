//! # Value Type System
//!
//! Core value types for the aggregation engine: `Null`, `Bool`, `Int64`, `Float64`,
//! `String`, `Date` (milliseconds since epoch), `Array`, and `Object` (an
//! order-preserving document). This is the universal representation documents
//! are normalized into on ingest and the representation every stage operator
//! and expression evaluates over.
//!
//! ## Usage
//!
//! ```rust
//! use aggpipe::value::{Value, Doc};
//!
//! let mut doc = Doc::new();
//! doc.insert("name".to_string(), Value::String("ada".into()));
//! doc.insert("age".to_string(), Value::Int64(36));
//! let v = Value::Object(doc);
//! ```

use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// Dense, monotonically increasing row identity. Never reused within a
/// collection's lifetime.
pub type RowId = u32;

/// An order-preserving document. Backed by a `Vec` rather than a hash map so
/// that materialized output reproduces the field insertion order required by
/// `$project`/`$addFields` output ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Doc {
    fields: Vec<(String, Value)>,
}

impl Doc {
    pub fn new() -> Self {
        Doc { fields: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Doc {
            fields: Vec::with_capacity(cap),
        }
    }

    /// Inserts or overwrites a field. Overwriting an existing key keeps its
    /// original position (matches how Mongo's `$addFields` overlays in place).
    pub fn insert(&mut self, key: String, value: Value) {
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().map(|(k, v)| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value)> {
        self.fields.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        let mut doc = Doc::new();
        for (k, v) in pairs {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Doc {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl FromIterator<(String, Value)> for Doc {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Doc::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

/// The universal tagged value union.
///
/// Null and Missing are distinct concepts at the `Value` level: `Null` is an
/// explicit value observed in a document; "missing" is the absence of a key
/// and is represented by [`FieldLookup::Missing`] rather than by a `Value`
/// variant, matching the predicate semantics in the specification.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Array(Vec<Value>),
    Object(Doc),
}

/// Result of resolving a dotted field path against a document.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldLookup<'a> {
    Present(&'a Value),
    /// An intermediate or terminal key did not exist.
    Missing,
}

impl<'a> FieldLookup<'a> {
    pub fn is_present(&self) -> bool {
        matches!(self, FieldLookup::Present(_))
    }

    pub fn value_or_null(&self) -> Value {
        match self {
            FieldLookup::Present(v) => (*v).clone(),
            FieldLookup::Missing => Value::Null,
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int64(_) | Value::Float64(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        match self {
            Value::Int64(_) => true,
            Value::Float64(f) => !f.is_nan(),
            _ => false,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Doc> {
        match self {
            Value::Object(d) => Some(d),
            _ => None,
        }
    }

    /// Truthiness used by `$cond`/`$switch`/`$filter`/boolean coercion.
    /// Mongo's rule: everything except `false`, `null`, and missing is truthy
    /// (notably `0` and `""` are truthy).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Null)
    }

    /// Resolves a dotted path (`a.b.c`) by walking nested objects. Arrays are
    /// not traversed by numeric index in this engine (Mongo supports it, but
    /// it is not part of the specified field-path contract); encountering an
    /// array mid-path yields `Missing`.
    pub fn get_path<'a>(&'a self, path: &str) -> FieldLookup<'a> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Object(doc) => match doc.get(segment) {
                    Some(v) => current = v,
                    None => return FieldLookup::Missing,
                },
                _ => return FieldLookup::Missing,
            }
        }
        FieldLookup::Present(current)
    }

    /// Sets a value at a dotted path, creating intermediate objects as
    /// needed. Used by `$project`/`$addFields` to materialize nested output
    /// fields (e.g. `{"a.b": 1}`).
    pub fn set_path(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.').peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                if let Value::Object(doc) = current {
                    doc.insert(segment.to_string(), value);
                }
                return;
            }
            if !matches!(current, Value::Object(_)) {
                *current = Value::Object(Doc::new());
            }
            if let Value::Object(doc) = current {
                if !doc.contains_key(segment) {
                    doc.insert(segment.to_string(), Value::Object(Doc::new()));
                }
                current = doc
                    .fields
                    .iter_mut()
                    .find(|(k, _)| k == segment)
                    .map(|(_, v)| v)
                    .expect("just inserted");
            }
        }
    }

    /// Numeric comparison promoting Int64<->Float64; `None` for non-numeric
    /// comparisons (equality across unrelated tags is always false, never
    /// "equal via coercion").
    pub fn numeric_partial_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// BSON-like canonical ordering used by `$sort` and `$group` key
    /// comparison. Cross-type comparisons follow a stable total order by
    /// type rank so that mixed-type sort keys never panic.
    pub fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int64(_) | Value::Float64(_) => 2,
            Value::String(_) => 3,
            Value::Date(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }

    pub fn total_cmp(&self, other: &Value) -> Ordering {
        if self.type_rank() != other.type_rank() {
            return self.type_rank().cmp(&other.type_rank());
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int64(_) | Value::Float64(_), Value::Int64(_) | Value::Float64(_)) => self
                .numeric_partial_cmp(other)
                .unwrap_or(Ordering::Equal),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.total_cmp(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                let ca = canonicalize_doc(a);
                let cb = canonicalize_doc(b);
                ca.cmp(&cb)
            }
            _ => Ordering::Equal,
        }
    }

    /// Equality used by predicates (`$eq`, `$in`): unrelated tags are never
    /// equal, numeric tags compare across Int64/Float64.
    pub fn predicate_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(_) | Value::Float64(_), Value::Int64(_) | Value::Float64(_)) => {
                self.numeric_partial_cmp(other) == Some(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.predicate_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|bv| v.predicate_eq(bv)).unwrap_or(false))
            }
            _ => false,
        }
    }

    /// Converts a parsed JSON value into the engine's `Value`. Integral
    /// JSON numbers become `Int64`; all others become `Float64`. Dates have
    /// no native JSON representation, so they are recognised via the Mongo
    /// extended-JSON convention `{"$date": <millis>}`.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else {
                    Value::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::Number(n)) = map.get("$date") {
                        if let Some(ms) = n.as_i64() {
                            return Value::Date(ms);
                        }
                    }
                }
                let mut doc = Doc::new();
                for (k, v) in map {
                    doc.insert(k, Value::from_json(v));
                }
                Value::Object(doc)
            }
        }
    }

    /// Converts back into `serde_json::Value` for output serialization.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int64(i) => serde_json::Value::Number((*i).into()),
            Value::Float64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(ms) => {
                let mut map = serde_json::Map::new();
                map.insert("$date".to_string(), serde_json::Value::Number((*ms).into()));
                serde_json::Value::Object(map)
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(doc) => {
                let mut map = serde_json::Map::new();
                for (k, v) in doc.iter() {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Stable canonicalization used for `$group` key hashing: object keys
/// sorted, numbers normalized to their `f64` bit pattern text, dates
/// serialized as ISO-8601-ish strings. Produces a `String` suitable as a
/// `HashMap` key.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "n:".to_string(),
        Value::Bool(b) => format!("b:{b}"),
        Value::Int64(i) => format!("i:{i}"),
        Value::Float64(f) => format!("f:{f}"),
        Value::String(s) => format!("s:{s}"),
        Value::Date(ms) => format!("d:{ms}"),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("a:[{}]", parts.join(","))
        }
        Value::Object(doc) => format!("o:{{{}}}", canonicalize_doc(doc)),
    }
}

fn canonicalize_doc(doc: &Doc) -> String {
    let mut entries: Vec<(&String, &Value)> = doc.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(k, v)| format!("{k}:{}", canonicalize(v)))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_path_resolves_nested() {
        let mut inner = Doc::new();
        inner.insert("b".to_string(), Value::Int64(7));
        let mut outer = Doc::new();
        outer.insert("a".to_string(), Value::Object(inner));
        let doc = Value::Object(outer);

        assert_eq!(doc.get_path("a.b"), FieldLookup::Present(&Value::Int64(7)));
        assert_eq!(doc.get_path("a.c"), FieldLookup::Missing);
        assert_eq!(doc.get_path("x.y"), FieldLookup::Missing);
    }

    #[test]
    fn numeric_equality_promotes_across_tags() {
        assert!(Value::Int64(2).predicate_eq(&Value::Float64(2.0)));
        assert!(!Value::Int64(2).predicate_eq(&Value::String("2".into())));
    }

    #[test]
    fn canonicalize_sorts_object_keys() {
        let mut a = Doc::new();
        a.insert("b".to_string(), Value::Int64(1));
        a.insert("a".to_string(), Value::Int64(2));
        let mut b = Doc::new();
        b.insert("a".to_string(), Value::Int64(2));
        b.insert("b".to_string(), Value::Int64(1));
        assert_eq!(
            canonicalize(&Value::Object(a)),
            canonicalize(&Value::Object(b))
        );
    }

    #[test]
    fn json_round_trip_preserves_field_order() {
        let json = serde_json::json!({"b": 1, "a": 2});
        let value = Value::from_json(json);
        let back = value.to_json();
        let keys: Vec<&String> = back.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn missing_vs_null_distinguished() {
        let mut doc = Doc::new();
        doc.insert("x".to_string(), Value::Null);
        let v = Value::Object(doc);
        assert!(v.get_path("x").is_present());
        assert!(!v.get_path("y").is_present());
    }
}
