//! Fused row stage: a maximal run of `$match`/`$project`/`$addFields`/
//! `$unset` stages compiled into a single row-at-a-time transform, per the
//! planner's fusion rules (C7). Applying the chain either yields the
//! transformed document or drops the row, matching "executed as a single
//! row-at-a-time function that either emits the transformed row or drops it".

use crate::expr::compiler::{CompiledExpr, ExprCache};
use crate::expr::ast::parse_expr;
use crate::error::AggResult;
use crate::stages::predicate::{self, parse_predicate, Predicate};
use crate::value::{Doc, Value};

#[derive(Clone)]
pub enum ProjectField {
    Include,
    Computed(CompiledExpr),
}

#[derive(Clone)]
pub struct ProjectSpec {
    pub fields: Vec<(String, ProjectField)>,
    pub include_id: bool,
}

#[derive(Clone)]
pub enum RowTransform {
    Match(Predicate),
    Project(ProjectSpec),
    AddFields(Vec<(String, CompiledExpr)>),
    Unset(Vec<String>),
}

#[derive(Clone, Default)]
pub struct FusedRowStage {
    pub transforms: Vec<RowTransform>,
}

impl FusedRowStage {
    pub fn new() -> Self {
        FusedRowStage { transforms: Vec::new() }
    }

    pub fn push(&mut self, transform: RowTransform) {
        self.transforms.push(transform);
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Applies every transform in order. `$$ROOT` for each stage resolves
    /// against the document as it stands entering that stage, matching
    /// Mongo's per-stage rebinding rather than the pipeline's original input.
    pub fn apply(&self, doc: &Value, now: i64) -> Option<Value> {
        let mut current = doc.clone();
        for t in &self.transforms {
            match t {
                RowTransform::Match(pred) => {
                    if !predicate::eval_predicate(pred, &current, &current, now) {
                        return None;
                    }
                }
                RowTransform::Project(spec) => current = apply_project(spec, &current, now),
                RowTransform::AddFields(fields) => current = apply_add_fields(fields, &current, now),
                RowTransform::Unset(paths) => current = apply_unset(paths, &current),
            }
        }
        Some(current)
    }
}

fn apply_project(spec: &ProjectSpec, doc: &Value, now: i64) -> Value {
    let mut out = Doc::new();
    if spec.include_id {
        if let Some(id) = doc.as_object().and_then(|d| d.get("_id")) {
            out.insert("_id".to_string(), id.clone());
        }
    }
    let env = crate::expr::interpreter::Env::new(doc, now);
    for (path, field) in &spec.fields {
        match field {
            ProjectField::Include => {
                if let crate::value::FieldLookup::Present(v) = doc.get_path(path) {
                    out.insert(path.clone(), v.clone());
                }
            }
            ProjectField::Computed(compiled) => {
                let value = compiled.evaluate(doc, &env);
                let mut wrapper = Value::Object(out);
                wrapper.set_path(path, value);
                out = match wrapper {
                    Value::Object(d) => d,
                    _ => unreachable!("set_path preserves Object shape"),
                };
            }
        }
    }
    Value::Object(out)
}

fn apply_add_fields(fields: &[(String, CompiledExpr)], doc: &Value, now: i64) -> Value {
    let env = crate::expr::interpreter::Env::new(doc, now);
    let mut result = doc.clone();
    if !matches!(result, Value::Object(_)) {
        result = Value::Object(Doc::new());
    }
    for (path, compiled) in fields {
        let value = compiled.evaluate(doc, &env);
        result.set_path(path, value);
    }
    result
}

fn apply_unset(paths: &[String], doc: &Value) -> Value {
    let mut result = doc.clone();
    for path in paths {
        remove_path(&mut result, path);
    }
    result
}

fn remove_path(value: &mut Value, path: &str) {
    let mut segments = path.splitn(2, '.');
    let head = segments.next().unwrap_or(path);
    let rest = segments.next();
    if let Value::Object(doc) = value {
        match rest {
            None => {
                doc.remove(head);
            }
            Some(rest) => {
                if let Some(child) = doc_get_mut(doc, head) {
                    remove_path(child, rest);
                }
            }
        }
    }
}

fn doc_get_mut<'a>(doc: &'a mut Doc, key: &str) -> Option<&'a mut Value> {
    doc.iter_mut().find(|(k, _)| k.as_str() == key).map(|(_, v)| v)
}

/// Parses a `$project` spec. Inclusive form: values `1`/`true` copy the
/// field verbatim, anything else is a computed expression. `_id` is carried
/// unless the spec explicitly sets `_id: 0`/`false`.
pub fn parse_project_spec(
    json: &serde_json::Value,
    cache: &ExprCache,
    sample: &[Value],
) -> AggResult<ProjectSpec> {
    let map = json.as_object().ok_or_else(|| crate::error::AggError::ParseError {
        message: "$project requires an object".to_string(),
    })?;
    let mut include_id = true;
    let mut fields = Vec::with_capacity(map.len());
    for (key, val) in map {
        if key == "_id" && is_exclusion(val) {
            include_id = false;
            continue;
        }
        if is_inclusion(val) {
            fields.push((key.clone(), ProjectField::Include));
        } else {
            let ast = parse_expr(val)?;
            let compiled = cache.compile(ast, sample);
            fields.push((key.clone(), ProjectField::Computed(compiled)));
        }
    }
    Ok(ProjectSpec { fields, include_id })
}

fn is_inclusion(val: &serde_json::Value) -> bool {
    matches!(val, serde_json::Value::Bool(true)) || val.as_i64() == Some(1)
}

fn is_exclusion(val: &serde_json::Value) -> bool {
    matches!(val, serde_json::Value::Bool(false)) || val.as_i64() == Some(0)
}

/// Parses `$addFields`/`$set`: every key maps to a computed expression
/// overlaid onto the input document.
pub fn parse_add_fields(
    json: &serde_json::Value,
    cache: &ExprCache,
    sample: &[Value],
) -> AggResult<Vec<(String, CompiledExpr)>> {
    let map = json.as_object().ok_or_else(|| crate::error::AggError::ParseError {
        message: "$addFields requires an object".to_string(),
    })?;
    let mut fields = Vec::with_capacity(map.len());
    for (key, val) in map {
        let ast = parse_expr(val)?;
        fields.push((key.clone(), cache.compile(ast, sample)));
    }
    Ok(fields)
}

/// Parses `$unset`: either a single field path string or an array of paths.
pub fn parse_unset(json: &serde_json::Value) -> AggResult<Vec<String>> {
    match json {
        serde_json::Value::String(s) => Ok(vec![s.clone()]),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| crate::error::AggError::ParseError {
                        message: "$unset array entries must be strings".to_string(),
                    })
            })
            .collect(),
        _ => Err(crate::error::AggError::ParseError {
            message: "$unset requires a string or array of strings".to_string(),
        }),
    }
}

pub fn parse_match(json: &serde_json::Value) -> AggResult<Predicate> {
    parse_predicate(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with(field: &str, value: Value) -> Value {
        let mut d = Doc::new();
        d.insert(field.to_string(), value);
        Value::Object(d)
    }

    #[test]
    fn project_inclusive_keeps_id_by_default() {
        let cache = ExprCache::new();
        let spec = parse_project_spec(&json!({"a": 1}), &cache, &[]).unwrap();
        let mut d = Doc::new();
        d.insert("_id".to_string(), Value::Int64(1));
        d.insert("a".to_string(), Value::Int64(7));
        d.insert("b".to_string(), Value::Int64(9));
        let out = apply_project(&spec, &Value::Object(d), 0);
        let out_doc = out.as_object().unwrap();
        assert_eq!(out_doc.get("_id"), Some(&Value::Int64(1)));
        assert_eq!(out_doc.get("a"), Some(&Value::Int64(7)));
        assert_eq!(out_doc.get("b"), None);
    }

    #[test]
    fn project_computed_field_and_suppressed_id() {
        let cache = ExprCache::new();
        let spec = parse_project_spec(
            &json!({"_id": 0, "passed": {"$gte": ["$s", 90]}}),
            &cache,
            &[],
        )
        .unwrap();
        let doc = doc_with("s", Value::Int64(95));
        let out = apply_project(&spec, &doc, 0);
        let out_doc = out.as_object().unwrap();
        assert_eq!(out_doc.get("_id"), None);
        assert_eq!(out_doc.get("passed"), Some(&Value::Bool(true)));
    }

    #[test]
    fn add_fields_overlays_without_dropping() {
        let cache = ExprCache::new();
        let fields = parse_add_fields(&json!({"doubled": {"$multiply": ["$x", 2]}}), &cache, &[]).unwrap();
        let doc = doc_with("x", Value::Int64(3));
        let out = apply_add_fields(&fields, &doc, 0);
        let out_doc = out.as_object().unwrap();
        assert_eq!(out_doc.get("x"), Some(&Value::Int64(3)));
        assert_eq!(out_doc.get("doubled"), Some(&Value::Int64(6)));
    }

    #[test]
    fn unset_removes_nested_field() {
        let mut inner = Doc::new();
        inner.insert("secret".to_string(), Value::Int64(1));
        inner.insert("keep".to_string(), Value::Int64(2));
        let mut outer = Doc::new();
        outer.insert("nested".to_string(), Value::Object(inner));
        let out = apply_unset(&["nested.secret".to_string()], &Value::Object(outer));
        let nested = out.as_object().unwrap().get("nested").unwrap().as_object().unwrap();
        assert_eq!(nested.get("secret"), None);
        assert_eq!(nested.get("keep"), Some(&Value::Int64(2)));
    }

    #[test]
    fn fused_chain_drops_rows_failing_match() {
        let cache = ExprCache::new();
        let mut stage = FusedRowStage::new();
        stage.push(RowTransform::Match(parse_match(&json!({"x": {"$gte": 2}})).unwrap()));
        stage.push(RowTransform::Project(
            parse_project_spec(&json!({"x": 1, "_id": 0}), &cache, &[]).unwrap(),
        ));
        assert!(stage.apply(&doc_with("x", Value::Int64(1)), 0).is_none());
        assert!(stage.apply(&doc_with("x", Value::Int64(5)), 0).is_some());
    }
}
