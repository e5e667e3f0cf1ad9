//! Pipeline planner / fuser (C7): compiles a raw pipeline array into a
//! [`Plan`] — a routing decision plus a sequence of stage descriptors with
//! consecutive row-at-a-time stages folded into [`FusedRowStage`] groups.

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::config::{Config, FusionConfig};
use crate::error::{AggError, AggResult};
use crate::expr::ast::parse_expr;
use crate::expr::ExprCache;
use crate::registry;
use crate::stages::fused::{parse_add_fields, parse_match, parse_project_spec, parse_unset, FusedRowStage, RowTransform};
use crate::stages::group::{parse_group_spec, AccKind};
use crate::stages::lookup::{parse_lookup_spec, LookupOp, LookupSpec};
use crate::stages::sort::{parse_limit, parse_skip, parse_sort_spec, SortSpec};
use crate::stages::unwind::{parse_unwind_spec, UnwindSpec};
use crate::value::Value;

const SHIM_ONLY: &[&str] = &["$function", "$where", "$merge", "$out"];

#[derive(Clone)]
pub enum StageSpec {
    Fused(FusedRowStage),
    Unwind(UnwindSpec),
    Lookup(LookupSpec, std::sync::Arc<LookupOp>),
    Group(crate::expr::CompiledExpr, Vec<(String, AccKind)>),
    Sort(Vec<SortSpec>),
    TopK(Vec<SortSpec>, usize),
    Limit(usize),
    Skip(usize),
}

impl StageSpec {
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            StageSpec::Group(..) | StageSpec::Sort(_) | StageSpec::TopK(..) | StageSpec::Limit(_) | StageSpec::Skip(_)
        )
    }
}

#[derive(Clone)]
pub enum Route {
    HotPath,
    Shim(String),
}

#[derive(Clone)]
pub struct Plan {
    pub stages: Vec<StageSpec>,
    pub first_barrier: Option<usize>,
    pub route: Route,
}

fn stage_name_and_body(stage: &Json) -> AggResult<(&str, &Json)> {
    let map = stage.as_object().ok_or_else(|| AggError::ParseError {
        message: "pipeline stage must be an object".to_string(),
    })?;
    if map.len() != 1 {
        return Err(AggError::ParseError {
            message: "pipeline stage object must have exactly one key".to_string(),
        });
    }
    let (name, body) = map.iter().next().expect("len == 1");
    Ok((name.as_str(), body))
}

fn field_count(body: &Json) -> u32 {
    body.as_object().map(|m| m.len() as u32).unwrap_or(1)
}

fn stage_cost(name: &str, body: &Json) -> u32 {
    let base = match name {
        "$match" => 5,
        "$project" => 3,
        "$addFields" | "$set" => 4,
        "$unset" => 1,
        "$sort" => 15,
        "$limit" | "$skip" => 1,
        _ => 0,
    };
    base + 2 * field_count(body)
}

/// Decides hot-path vs compatibility-shim routing by scanning the raw
/// pipeline for shim-only operators, advanced `$lookup`, and megamorphic
/// `$match`/`$expr` predicates. This only decides the route: the fallback
/// registry is incremented exactly once, by the shim itself as it executes
/// the triggering stage (§4.8/§4.9), not here at plan time.
fn determine_route(
    pipeline: &[Json],
    cache: &ExprCache,
    sample: &[Value],
) -> AggResult<Route> {
    for stage in pipeline {
        let (name, body) = stage_name_and_body(stage)?;
        if SHIM_ONLY.contains(&name) {
            return Ok(Route::Shim(registry::unsupported_operator_reason(name)));
        }
        if name == "$lookup" {
            if let Some(map) = body.as_object() {
                if map.contains_key("pipeline") || map.contains_key("let") {
                    return Ok(Route::Shim(registry::ADVANCED_LOOKUP_REASON.to_string()));
                }
            }
        }
        if name == "$match" {
            if let Some(expr_json) = body.as_object().and_then(|m| m.get("$expr")) {
                let ast = parse_expr(expr_json)?;
                let compiled = cache.compile(ast, sample);
                if compiled.megamorphic {
                    return Ok(Route::Shim(registry::MEGAMORPHIC_EXPR_REASON.to_string()));
                }
            }
        }
    }
    Ok(Route::HotPath)
}

/// Compiles a raw pipeline into an executable [`Plan`].
pub fn compile_plan(
    pipeline: &[Json],
    cache: &ExprCache,
    sample: &[Value],
    config: &Config,
    lookup_sources: &HashMap<String, Vec<Value>>,
) -> AggResult<Plan> {
    let route = determine_route(pipeline, cache, sample)?;
    if let Route::Shim(reason) = route {
        return Ok(Plan {
            stages: Vec::new(),
            first_barrier: None,
            route: Route::Shim(reason),
        });
    }

    let fusion = &config.fusion;
    let mut stages: Vec<StageSpec> = Vec::new();
    let mut current = FusedRowStage::new();
    let mut current_cost: u32 = 0;

    let mut i = 0;
    while i < pipeline.len() {
        let (name, body) = stage_name_and_body(&pipeline[i])?;
        match name {
            "$match" if fusion.enable_match_project_fusion || current.is_empty() => {
                push_row_transform(
                    &mut stages,
                    &mut current,
                    &mut current_cost,
                    fusion,
                    name,
                    body,
                    RowTransform::Match(parse_match(body)?),
                )?;
                i += 1;
            }
            "$project" | "$addFields" | "$set" | "$unset" if fusion.enable_project_chain_fusion || current.is_empty() => {
                let transform = build_row_transform(name, body, cache, sample)?;
                push_row_transform(&mut stages, &mut current, &mut current_cost, fusion, name, body, transform)?;
                i += 1;
            }
            "$match" | "$project" | "$addFields" | "$set" | "$unset" => {
                // Fusion disabled for this kind: still executed, just its
                // own singleton group.
                flush(&mut stages, &mut current);
                current_cost = 0;
                let transform = build_row_transform(name, body, cache, sample)?;
                current.push(transform);
                flush(&mut stages, &mut current);
                i += 1;
            }
            "$sort" => {
                flush(&mut stages, &mut current);
                current_cost = 0;
                let specs = parse_sort_spec(body)?;
                if fusion.enable_sort_limit_fusion && i + 1 < pipeline.len() {
                    let (next_name, next_body) = stage_name_and_body(&pipeline[i + 1])?;
                    if next_name == "$limit" {
                        let k = parse_limit(next_body)?;
                        stages.push(StageSpec::TopK(specs, k));
                        i += 2;
                        continue;
                    }
                }
                stages.push(StageSpec::Sort(specs));
                i += 1;
            }
            "$limit" => {
                flush(&mut stages, &mut current);
                current_cost = 0;
                stages.push(StageSpec::Limit(parse_limit(body)?));
                i += 1;
            }
            "$skip" => {
                flush(&mut stages, &mut current);
                current_cost = 0;
                stages.push(StageSpec::Skip(parse_skip(body)?));
                i += 1;
            }
            "$group" => {
                flush(&mut stages, &mut current);
                current_cost = 0;
                let (id_expr, specs) = parse_group_spec(body, cache, sample)?;
                stages.push(StageSpec::Group(id_expr, specs));
                i += 1;
            }
            "$unwind" => {
                flush(&mut stages, &mut current);
                current_cost = 0;
                stages.push(StageSpec::Unwind(parse_unwind_spec(body)?));
                i += 1;
            }
            "$lookup" => {
                flush(&mut stages, &mut current);
                current_cost = 0;
                let spec = parse_lookup_spec(body)?;
                let from = body.get("from").and_then(|v| v.as_str()).unwrap_or("");
                let foreign = lookup_sources.get(from).cloned().unwrap_or_default();
                let op = std::sync::Arc::new(LookupOp::new(
                    LookupSpec {
                        local_field: spec.local_field.clone(),
                        foreign_field: spec.foreign_field.clone(),
                        as_field: spec.as_field.clone(),
                    },
                    &foreign,
                ));
                stages.push(StageSpec::Lookup(spec, op));
                i += 1;
            }
            other => {
                return Err(AggError::UnsupportedOperator {
                    operator: other.to_string(),
                })
            }
        }
    }
    flush(&mut stages, &mut current);

    let first_barrier = stages.iter().position(StageSpec::is_barrier);
    Ok(Plan {
        stages,
        first_barrier,
        route: Route::HotPath,
    })
}

fn build_row_transform(
    name: &str,
    body: &Json,
    cache: &ExprCache,
    sample: &[Value],
) -> AggResult<RowTransform> {
    Ok(match name {
        "$match" => RowTransform::Match(parse_match(body)?),
        "$project" => RowTransform::Project(parse_project_spec(body, cache, sample)?),
        "$addFields" | "$set" => RowTransform::AddFields(parse_add_fields(body, cache, sample)?),
        "$unset" => RowTransform::Unset(parse_unset(body)?),
        _ => unreachable!("caller dispatches only these kinds"),
    })
}

#[allow(clippy::too_many_arguments)]
fn push_row_transform(
    stages: &mut Vec<StageSpec>,
    current: &mut FusedRowStage,
    current_cost: &mut u32,
    fusion: &FusionConfig,
    name: &str,
    body: &Json,
    transform: RowTransform,
) -> AggResult<()> {
    let cost = stage_cost(name, body);
    let exceeds_budget = *current_cost + cost > fusion.max_complexity
        || current.transforms.len() >= fusion.max_stages_per_group;
    if exceeds_budget && !current.is_empty() {
        flush(stages, current);
        *current_cost = 0;
    }
    current.push(transform);
    *current_cost += cost;
    Ok(())
}

fn flush(stages: &mut Vec<StageSpec>, current: &mut FusedRowStage) {
    if !current.is_empty() {
        stages.push(StageSpec::Fused(std::mem::take(current)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    #[test]
    fn fuses_match_and_project_into_single_group() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        let pipeline = vec![
            json!({"$match": {"a": {"$gte": 2}}}),
            json!({"$project": {"a": 1, "_id": 0}}),
        ];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert!(matches!(plan.stages[0], StageSpec::Fused(_)));
    }

    #[test]
    fn sort_then_limit_fuse_into_topk() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        let pipeline = vec![json!({"$sort": {"v": 1}}), json!({"$limit": 2})];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert!(matches!(plan.stages[0], StageSpec::TopK(_, 2)));
    }

    #[test]
    fn group_closes_fusion_group_as_a_barrier() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        let pipeline = vec![
            json!({"$match": {"a": {"$gte": 0}}}),
            json!({"$group": {"_id": "$cat", "total": {"$sum": "$v"}}}),
        ];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.first_barrier, Some(1));
    }

    #[test]
    fn shim_only_operator_routes_to_shim() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        registry::reset();
        let pipeline = vec![json!({"$where": "this.a > 1"})];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        assert!(matches!(plan.route, Route::Shim(_)));
    }
}
