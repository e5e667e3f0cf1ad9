//! `$unwind` (C6): a forwarding stage that fans a single input row out into
//! zero or more output rows, one per array element. Fan-out rows are given
//! fresh virtual [`FlowId`]s (never colliding with real row ids) and the
//! stage remembers which virtual ids belong to which parent so a parent
//! removal retracts exactly the rows it produced.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AggError, AggResult};
use crate::flow::{Delta, FlowId, VirtualIdMinter};
use crate::value::{Doc, Value};

#[derive(Clone)]
pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty_arrays: bool,
}

/// Default per-stage cap on the number of virtual rows a single input row
/// may fan out into, guarding against runaway memory growth from a
/// pathologically large array field.
pub const MAX_FANOUT_PER_ROW: usize = 100_000;

pub struct UnwindOp {
    spec: UnwindSpec,
    minter: VirtualIdMinter,
    // parent FlowId -> virtual ids it currently owns, in index order.
    fanout: HashMap<FlowId, Vec<FlowId>>,
}

impl UnwindOp {
    pub fn new(spec: UnwindSpec, salt: u64) -> Self {
        UnwindOp {
            spec,
            minter: VirtualIdMinter::new(salt),
            fanout: HashMap::new(),
        }
    }

    /// Produces the output deltas for an incoming `on_add`/`on_remove`
    /// parent delta. For adds, mints fresh virtual ids and records them
    /// under the parent; for removes, retracts the ids previously minted
    /// for that parent (looked up by `delta.id`, the parent's own FlowId).
    pub fn apply(&mut self, delta: &Delta) -> AggResult<Vec<Delta>> {
        if delta.is_add() {
            self.expand(delta)
        } else {
            Ok(self.retract(delta))
        }
    }

    fn expand(&mut self, delta: &Delta) -> AggResult<Vec<Delta>> {
        let elements = match delta.value.get_path(&self.spec.path) {
            crate::value::FieldLookup::Present(Value::Array(items)) => {
                if items.is_empty() {
                    None
                } else {
                    Some(items.clone())
                }
            }
            crate::value::FieldLookup::Present(Value::Null) | crate::value::FieldLookup::Missing => None,
            crate::value::FieldLookup::Present(other) => Some(vec![other.clone()]),
        };

        let elements = match elements {
            Some(items) => items,
            None => {
                if self.spec.preserve_null_and_empty_arrays {
                    let id = self.minter.mint();
                    let out_doc = self.build_output(&delta.value, None, None);
                    self.fanout.insert(delta.id, vec![id]);
                    return Ok(vec![Delta::add(id, out_doc)]);
                } else {
                    self.fanout.insert(delta.id, Vec::new());
                    return Ok(Vec::new());
                }
            }
        };

        if elements.len() > MAX_FANOUT_PER_ROW {
            return Err(AggError::ResourceError {
                stage: "$unwind".to_string(),
                message: format!(
                    "row fans out into {} elements, exceeding the cap of {}",
                    elements.len(),
                    MAX_FANOUT_PER_ROW
                ),
            });
        }

        let mut out = Vec::with_capacity(elements.len());
        let mut ids = Vec::with_capacity(elements.len());
        for (index, element) in elements.into_iter().enumerate() {
            let id = self.minter.mint();
            let out_doc = self.build_output(&delta.value, Some(element), Some(index as i64));
            ids.push(id);
            out.push(Delta::add(id, out_doc));
        }
        self.fanout.insert(delta.id, ids);
        Ok(out)
    }

    fn retract(&mut self, delta: &Delta) -> Vec<Delta> {
        match self.fanout.remove(&delta.id) {
            Some(ids) => ids
                .into_iter()
                .map(|id| Delta::remove(id, Arc::new(Value::Null)))
                .collect(),
            None => Vec::new(),
        }
    }

    fn build_output(&self, parent: &Value, element: Option<Value>, index: Option<i64>) -> Value {
        let mut result = parent.clone();
        let replacement = element.unwrap_or(Value::Null);
        result.set_path(&self.spec.path, replacement);
        if let Some(field) = &self.spec.include_array_index {
            let idx_value = index.map(Value::Int64).unwrap_or(Value::Null);
            result.set_path(field, idx_value);
        }
        result
    }
}

/// Parses a `$unwind` spec, accepting both the bare-string shorthand
/// (`"$unwind": "$field"`) and the full object form.
pub fn parse_unwind_spec(json: &serde_json::Value) -> AggResult<UnwindSpec> {
    match json {
        serde_json::Value::String(path) => Ok(UnwindSpec {
            path: strip_dollar(path),
            include_array_index: None,
            preserve_null_and_empty_arrays: false,
        }),
        serde_json::Value::Object(map) => {
            let path = map
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AggError::ParseError {
                    message: "$unwind object form requires a 'path' string".to_string(),
                })?;
            let include_array_index = map
                .get("includeArrayIndex")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let preserve = map
                .get("preserveNullAndEmptyArrays")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(UnwindSpec {
                path: strip_dollar(path),
                include_array_index,
                preserve_null_and_empty_arrays: preserve,
            })
        }
        _ => Err(AggError::ParseError {
            message: "$unwind requires a string or object".to_string(),
        }),
    }
}

fn strip_dollar(path: &str) -> String {
    path.strip_prefix('$').unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_array(items: Vec<i64>) -> Value {
        let mut d = Doc::new();
        d.insert(
            "tags".to_string(),
            Value::Array(items.into_iter().map(Value::Int64).collect()),
        );
        Value::Object(d)
    }

    #[test]
    fn unwind_fans_out_one_row_per_element() {
        let spec = parse_unwind_spec(&json!("$tags")).unwrap();
        let mut op = UnwindOp::new(spec, 1);
        let parent = Delta::add(10, doc_with_array(vec![1, 2, 3]));
        let out = op.apply(&parent).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|d| d.is_add()));
    }

    #[test]
    fn unwind_removal_retracts_exactly_its_own_rows() {
        let spec = parse_unwind_spec(&json!("$tags")).unwrap();
        let mut op = UnwindOp::new(spec, 1);
        let parent = Delta::add(10, doc_with_array(vec![1, 2]));
        op.apply(&parent).unwrap();

        let removed = Delta::remove(10, std::sync::Arc::new(Value::Null));
        let retractions = op.apply(&removed).unwrap();
        assert_eq!(retractions.len(), 2);
        assert!(retractions.iter().all(|d| !d.is_add()));
    }

    #[test]
    fn empty_array_drops_row_without_preserve_flag() {
        let spec = parse_unwind_spec(&json!("$tags")).unwrap();
        let mut op = UnwindOp::new(spec, 1);
        let parent = Delta::add(10, doc_with_array(vec![]));
        let out = op.apply(&parent).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn preserve_null_and_empty_arrays_keeps_one_row() {
        let spec = parse_unwind_spec(&json!({
            "path": "$tags",
            "preserveNullAndEmptyArrays": true
        }))
        .unwrap();
        let mut op = UnwindOp::new(spec, 2);
        let parent = Delta::add(10, doc_with_array(vec![]));
        let out = op.apply(&parent).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn include_array_index_is_set_per_element() {
        let spec = parse_unwind_spec(&json!({
            "path": "$tags",
            "includeArrayIndex": "idx"
        }))
        .unwrap();
        let mut op = UnwindOp::new(spec, 3);
        let parent = Delta::add(10, doc_with_array(vec![9, 8]));
        let out = op.apply(&parent).unwrap();
        let idx0 = out[0].value.get_path("idx");
        assert_eq!(idx0.value_or_null(), Value::Int64(0));
    }

    #[test]
    fn fanout_beyond_cap_is_a_resource_error() {
        let spec = parse_unwind_spec(&json!("$tags")).unwrap();
        let mut op = UnwindOp::new(spec, 4);
        let huge = (0..(MAX_FANOUT_PER_ROW + 1) as i64).collect();
        let parent = Delta::add(10, doc_with_array(huge));
        let result = op.apply(&parent);
        assert!(result.is_err());
    }
}
