//! Compatibility shim (C10): a non-incremental evaluator for the pipelines
//! the planner routes away from the hot path — `$function`, `$where`,
//! `$merge`, `$out`, and advanced `$lookup` (`let`/`pipeline`), plus `$match`
//! predicates the compiler has given up specializing (megamorphic `$expr`).
//!
//! Unlike the executor, this evaluator never threads deltas: it takes the
//! full live document list for the pipeline's collection and recomputes the
//! whole output on every call, one stage at a time, each stage's closure
//! operating on the entire array. There is exactly one fallback path (this
//! one); anything the hot path can't run ends up here, and the registry
//! counts every stage that forced the detour.

use serde_json::Value as Json;

use crate::config::Config;
use crate::error::{AggError, AggResult};
use crate::expr::ast::parse_expr;
use crate::expr::interpreter::Env;
use crate::expr::ExprCache;
use crate::registry;
use crate::stages::fused::{parse_add_fields, parse_match, parse_project_spec, parse_unset, FusedRowStage, RowTransform};
use crate::stages::group::{parse_group_spec, GroupOp};
use crate::stages::lookup::LookupOp;
use crate::stages::sort::{parse_limit, parse_skip, parse_sort_spec, SortOp};
use crate::stages::unwind::{parse_unwind_spec, UnwindOp};
use crate::value::Value;

const SHIM_ONLY: &[&str] = &["$function", "$where", "$merge", "$out"];

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Runs `pipeline` against the full materialized `docs`, recomputing from
/// scratch. `$function`/`$where`/`$merge`/`$out` and advanced `$lookup`
/// stages record a fallback reason and pass their input through unchanged
/// (there is no sensible non-identity default for operators this crate does
/// not implement semantics for); every other stage kind runs its ordinary
/// batch semantics so a pipeline mixing one shim-only stage with otherwise
/// ordinary stages still produces a materialized result end to end.
pub fn run(pipeline: &[Json], docs: &[Value], cache: &ExprCache, config: &Config) -> AggResult<Vec<Value>> {
    let mut current: Vec<Value> = docs.to_vec();
    for stage in pipeline {
        current = run_stage(stage, current, cache, config)?;
    }
    Ok(current)
}

fn run_stage(stage: &Json, docs: Vec<Value>, cache: &ExprCache, config: &Config) -> AggResult<Vec<Value>> {
    let map = stage.as_object().ok_or_else(|| AggError::ParseError {
        message: "pipeline stage must be an object".to_string(),
    })?;
    if map.len() != 1 {
        return Err(AggError::ParseError {
            message: "pipeline stage object must have exactly one key".to_string(),
        });
    }
    let (name, body) = map.iter().next().expect("len == 1");
    let name = name.as_str();

    if SHIM_ONLY.contains(&name) {
        registry::record(&registry::unsupported_operator_reason(name));
        return Ok(docs);
    }

    if name == "$lookup" {
        if let Some(lookup_map) = body.as_object() {
            if lookup_map.contains_key("pipeline") || lookup_map.contains_key("let") {
                registry::record(registry::ADVANCED_LOOKUP_REASON);
                return Ok(docs);
            }
        }
    }

    if name == "$match" {
        if let Some(expr_json) = body.as_object().and_then(|m| m.get("$expr")) {
            let ast = parse_expr(expr_json)?;
            if cache.compile(ast, &docs).megamorphic {
                registry::record(registry::MEGAMORPHIC_EXPR_REASON);
            }
        }
    }

    let now = now_millis();
    match name {
        "$match" => {
            let pred = parse_match(body)?;
            let mut fused = FusedRowStage::new();
            fused.push(RowTransform::Match(pred));
            Ok(docs.into_iter().filter_map(|d| fused.apply(&d, now)).collect())
        }
        "$project" => {
            let spec = parse_project_spec(body, cache, &docs)?;
            let mut fused = FusedRowStage::new();
            fused.push(RowTransform::Project(spec));
            Ok(docs.into_iter().filter_map(|d| fused.apply(&d, now)).collect())
        }
        "$addFields" | "$set" => {
            let fields = parse_add_fields(body, cache, &docs)?;
            let mut fused = FusedRowStage::new();
            fused.push(RowTransform::AddFields(fields));
            Ok(docs.into_iter().filter_map(|d| fused.apply(&d, now)).collect())
        }
        "$unset" => {
            let paths = parse_unset(body)?;
            let mut fused = FusedRowStage::new();
            fused.push(RowTransform::Unset(paths));
            Ok(docs.into_iter().filter_map(|d| fused.apply(&d, now)).collect())
        }
        "$sort" => {
            let specs = parse_sort_spec(body)?;
            let mut op = SortOp::new(specs);
            for (i, doc) in docs.iter().enumerate() {
                op.on_add(&crate::flow::Delta::add(i as u64, doc.clone()));
            }
            Ok(op.snapshot(|id| docs.get(id as usize).cloned()))
        }
        "$limit" => {
            let n = parse_limit(body)?;
            Ok(docs.into_iter().take(n).collect())
        }
        "$skip" => {
            let n = parse_skip(body)?;
            Ok(docs.into_iter().skip(n).collect())
        }
        "$group" => {
            let (id_expr, specs) = parse_group_spec(body, cache, &docs)?;
            let mut op = GroupOp::new(id_expr, specs);
            for (i, doc) in docs.into_iter().enumerate() {
                op.apply_delta(&crate::flow::Delta::add(i as u64, doc), now)?;
            }
            Ok(op.snapshot())
        }
        "$unwind" => {
            let spec = parse_unwind_spec(body)?;
            let mut op = UnwindOp::new(spec, 0);
            let mut out = Vec::new();
            for (i, doc) in docs.into_iter().enumerate() {
                let delta = crate::flow::Delta::add(i as u64, doc);
                for d in op.apply(&delta)? {
                    out.push(d.value.as_ref().clone());
                }
            }
            Ok(out)
        }
        "$lookup" => {
            let spec = crate::stages::lookup::parse_lookup_spec(body)?;
            let op = LookupOp::new(spec, &[]);
            Ok(docs
                .into_iter()
                .enumerate()
                .map(|(i, d)| op.apply(&crate::flow::Delta::add(i as u64, d)).value.as_ref().clone())
                .collect())
        }
        other => {
            let _ = config;
            Err(AggError::UnsupportedOperator {
                operator: other.to_string(),
            })
        }
    }
}

/// Evaluates a raw expression against every document, independent of any
/// pipeline stage. Used by the shim's `$where`-adjacent bookkeeping (and
/// available for callers who want the same non-incremental evaluation the
/// rest of this module performs).
#[allow(dead_code)]
fn eval_for_each(docs: &[Value], expr_json: &Json) -> AggResult<Vec<Value>> {
    let ast = parse_expr(expr_json)?;
    Ok(docs
        .iter()
        .map(|d| {
            let env = Env::new(d, now_millis());
            crate::expr::eval(&ast, d, &env)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Doc;
    use serde_json::json;

    fn doc(a: i64) -> Value {
        let mut d = Doc::new();
        d.insert("a".to_string(), Value::Int64(a));
        Value::Object(d)
    }

    #[test]
    fn where_stage_records_fallback_and_passes_through() {
        registry::reset();
        let cache = ExprCache::new();
        let config = Config::default_config();
        let docs = vec![doc(1), doc(2)];
        let pipeline = vec![json!({"$where": "this.a > 1"})];
        let out = run(&pipeline, &docs, &cache, &config).unwrap();
        assert_eq!(out.len(), 2);
        assert!(registry::count() >= 1);
    }

    #[test]
    fn advanced_lookup_records_fallback_and_passes_through() {
        registry::reset();
        let cache = ExprCache::new();
        let config = Config::default_config();
        let docs = vec![doc(1)];
        let pipeline = vec![json!({
            "$lookup": {
                "from": "other",
                "let": {"x": "$a"},
                "pipeline": [],
                "as": "joined"
            }
        })];
        let out = run(&pipeline, &docs, &cache, &config).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(registry::analysis().by_reason[registry::ADVANCED_LOOKUP_REASON], 1);
    }

    #[test]
    fn ordinary_stages_still_run_inside_the_shim() {
        registry::reset();
        let cache = ExprCache::new();
        let config = Config::default_config();
        let docs = vec![doc(1), doc(2), doc(3)];
        let pipeline = vec![json!({"$where": "true"}), json!({"$match": {"a": {"$gte": 2}}})];
        let out = run(&pipeline, &docs, &cache, &config).unwrap();
        assert_eq!(out.len(), 2);
    }
}
