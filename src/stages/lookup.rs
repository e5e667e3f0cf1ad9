//! `$lookup` (C6), simple-equality-join variant only (`localField` /
//! `foreignField` / `as`). The `let`/`pipeline` sub-pipeline form is routed
//! to the compatibility shim by the planner rather than handled here.
//!
//! The foreign collection is indexed once at construction time by
//! `foreignField`; joins are passthrough on identity (the output row keeps
//! the local row's [`FlowId`]), since a simple lookup never fans a row out
//! more than once per incoming delta — it always attaches exactly one
//! array field.

use std::collections::HashMap;

use crate::error::{AggError, AggResult};
use crate::flow::Delta;
use crate::value::{canonicalize, Doc, Value};

#[derive(Clone)]
pub struct LookupSpec {
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

pub struct LookupOp {
    spec: LookupSpec,
    // canonicalized foreign-field value -> matching foreign documents.
    index: HashMap<String, Vec<Value>>,
}

impl LookupOp {
    pub fn new(spec: LookupSpec, foreign_docs: &[Value]) -> Self {
        let mut index: HashMap<String, Vec<Value>> = HashMap::new();
        for doc in foreign_docs {
            let key = match doc.get_path(&spec.foreign_field) {
                crate::value::FieldLookup::Present(v) => canonicalize(v),
                crate::value::FieldLookup::Missing => canonicalize(&Value::Null),
            };
            index.entry(key).or_default().push(doc.clone());
        }
        LookupOp { spec, index }
    }

    /// Joins a single incoming delta, attaching the matching foreign
    /// documents under `as_field`. Preserves the delta's identity and sign;
    /// the join result is recomputed against the foreign index's current
    /// state each time, matching this stage's forwarding contract.
    pub fn apply(&self, delta: &Delta) -> Delta {
        let key = match delta.value.get_path(&self.spec.local_field) {
            crate::value::FieldLookup::Present(v) => canonicalize(v),
            crate::value::FieldLookup::Missing => canonicalize(&Value::Null),
        };
        let matches = self.index.get(&key).cloned().unwrap_or_default();
        let mut out = delta.value.as_ref().clone();
        if !matches!(out, Value::Object(_)) {
            out = Value::Object(Doc::new());
        }
        out.set_path(&self.spec.as_field, Value::Array(matches));
        Delta {
            id: delta.id,
            sign: delta.sign,
            value: std::sync::Arc::new(out),
        }
    }
}

pub fn parse_lookup_spec(json: &serde_json::Value) -> AggResult<LookupSpec> {
    let map = json.as_object().ok_or_else(|| AggError::ParseError {
        message: "$lookup requires an object".to_string(),
    })?;
    if map.contains_key("pipeline") || map.contains_key("let") {
        return Err(AggError::UnsupportedOperator {
            operator: "$lookup (pipeline form)".to_string(),
        });
    }
    let get_str = |key: &str| {
        map.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AggError::ParseError {
                message: format!("$lookup requires '{key}'"),
            })
    };
    Ok(LookupSpec {
        local_field: get_str("localField")?,
        foreign_field: get_str("foreignField")?,
        as_field: get_str("as")?,
    })
}
