//! Executor & context (C8): drives deltas through a compiled [`Plan`].
//!
//! The forward prefix up to and including the plan's first barrier stage is
//! maintained incrementally: only the rows added or removed since the last
//! run are threaded through `on_add`/`on_remove`, and the barrier's own
//! accumulator state (`$group`'s running sums, `$sort`'s ordered multiset,
//! `$limit`/`$skip`'s upstream arrival order) persists across calls on
//! [`PersistentState`]. Everything downstream of that first barrier is
//! recomputed from the barrier's materialized snapshot on every call — once
//! a pipeline has blocked on a barrier the remaining suffix is cheap to
//! re-derive, and re-deriving it avoids threading row/virtual-row identity
//! through a second, third, or later barrier for no observable benefit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::AggResult;
use crate::flow::{Delta, FlowId, LiveSet};
use crate::planner::{Plan, StageSpec};
use crate::row_store::RowStore;
use crate::stages::group::GroupOp;
use crate::stages::sort::{LimitOp, SkipOp, SortOp, TopKOp};
use crate::stages::unwind::UnwindOp;
use crate::value::{RowId, Value};

enum FirstBarrierState {
    Group(GroupOp),
    Sort(SortOp, LiveSet),
    TopK(TopKOp, LiveSet),
    LimitSkip(LiveSet),
}

/// Per-pipeline state that survives across `stream()` calls. Created once
/// when a pipeline is first compiled and torn down only when the owning
/// collection evicts or destroys it; never shared between distinct
/// pipelines or distinct collections.
pub struct PersistentState {
    unwind_ops: HashMap<usize, UnwindOp>,
    first_barrier: Option<FirstBarrierState>,
    final_live: LiveSet,
    applied: BTreeSet<RowId>,
}

impl PersistentState {
    pub fn new() -> Self {
        PersistentState {
            unwind_ops: HashMap::new(),
            first_barrier: None,
            final_live: LiveSet::new(),
            applied: BTreeSet::new(),
        }
    }
}

impl Default for PersistentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one full incremental step: diffs `store`'s current live set against
/// what this pipeline has already applied, threads the resulting deltas
/// through the plan, and returns the materialized output.
pub fn run(plan: &Plan, state: &mut PersistentState, store: &RowStore, now: i64) -> AggResult<Vec<Value>> {
    let live_now: BTreeSet<RowId> = store.live_ids().collect();

    let mut initial: Vec<Delta> = Vec::new();
    for &id in live_now.difference(&state.applied) {
        initial.push(Delta::add(id as FlowId, store.get(id)?.clone()));
    }
    for &id in state.applied.difference(&live_now) {
        initial.push(Delta::remove(id as FlowId, Arc::new(store.get(id)?.clone())));
    }

    let output = match plan.first_barrier {
        Some(barrier_idx) => {
            let mut deltas = initial;
            for (idx, stage) in plan.stages.iter().enumerate().take(barrier_idx) {
                deltas = apply_forward_stage(stage, idx, deltas, state, now)?;
            }
            let barrier_output = apply_barrier_stage(&plan.stages[barrier_idx], deltas, state, now)?;

            let mut batch = barrier_output;
            for stage in &plan.stages[barrier_idx + 1..] {
                batch = run_stage_batch(stage, batch, now)?;
            }
            batch
        }
        None => {
            let mut deltas = initial;
            for (idx, stage) in plan.stages.iter().enumerate() {
                deltas = apply_forward_stage(stage, idx, deltas, state, now)?;
            }
            state.final_live.apply_all(&deltas);
            state.final_live.values_in_order().cloned().collect()
        }
    };

    state.applied = live_now;
    Ok(output)
}

fn apply_forward_stage(
    stage: &StageSpec,
    idx: usize,
    deltas: Vec<Delta>,
    state: &mut PersistentState,
    now: i64,
) -> AggResult<Vec<Delta>> {
    match stage {
        StageSpec::Fused(f) => Ok(deltas
            .into_iter()
            .filter_map(|d| {
                f.apply(&d.value, now).map(|v| Delta {
                    id: d.id,
                    sign: d.sign,
                    value: Arc::new(v),
                })
            })
            .collect()),
        StageSpec::Unwind(spec) => {
            let op = state
                .unwind_ops
                .entry(idx)
                .or_insert_with(|| UnwindOp::new(spec.clone(), idx as u64));
            let mut out = Vec::new();
            for d in &deltas {
                out.extend(op.apply(d)?);
            }
            Ok(out)
        }
        StageSpec::Lookup(_, op) => Ok(deltas.iter().map(|d| op.apply(d)).collect()),
        StageSpec::Group(..) | StageSpec::Sort(_) | StageSpec::TopK(..) | StageSpec::Limit(_) | StageSpec::Skip(_) => {
            unreachable!("barrier stages never appear before the plan's first barrier index")
        }
    }
}

fn apply_barrier_stage(
    stage: &StageSpec,
    deltas: Vec<Delta>,
    state: &mut PersistentState,
    now: i64,
) -> AggResult<Vec<Value>> {
    match stage {
        StageSpec::Group(id_expr, specs) => {
            let op = match state.first_barrier.get_or_insert_with(|| {
                FirstBarrierState::Group(GroupOp::new(id_expr.clone(), specs.clone()))
            }) {
                FirstBarrierState::Group(op) => op,
                _ => unreachable!("plan's first-barrier kind is fixed at compile time"),
            };
            for d in &deltas {
                op.apply_delta(d, now)?;
            }
            Ok(op.snapshot())
        }
        StageSpec::Sort(specs) => {
            let (op, companion) = match state.first_barrier.get_or_insert_with(|| {
                FirstBarrierState::Sort(SortOp::new(specs.clone()), LiveSet::new())
            }) {
                FirstBarrierState::Sort(op, live) => (op, live),
                _ => unreachable!("plan's first-barrier kind is fixed at compile time"),
            };
            for d in &deltas {
                if d.is_add() {
                    op.on_add(d);
                } else {
                    op.on_remove(d);
                }
                companion.apply(d);
            }
            let snapshot_companion = companion.clone();
            Ok(op.snapshot(move |id| snapshot_companion.iter().find(|(i, _)| *i == id).map(|(_, v)| v.clone())))
        }
        StageSpec::TopK(specs, k) => {
            let (op, companion) = match state.first_barrier.get_or_insert_with(|| {
                FirstBarrierState::TopK(TopKOp::new(specs.clone(), *k), LiveSet::new())
            }) {
                FirstBarrierState::TopK(op, live) => (op, live),
                _ => unreachable!("plan's first-barrier kind is fixed at compile time"),
            };
            for d in &deltas {
                if d.is_add() {
                    op.on_add(d);
                } else {
                    op.on_remove(d);
                }
                companion.apply(d);
            }
            let snapshot_companion = companion.clone();
            Ok(op.snapshot(move |id| snapshot_companion.iter().find(|(i, _)| *i == id).map(|(_, v)| v.clone())))
        }
        StageSpec::Limit(n) => {
            let live = match state
                .first_barrier
                .get_or_insert_with(|| FirstBarrierState::LimitSkip(LiveSet::new()))
            {
                FirstBarrierState::LimitSkip(live) => live,
                _ => unreachable!("plan's first-barrier kind is fixed at compile time"),
            };
            live.apply_all(&deltas);
            Ok(LimitOp::new(*n).apply(live))
        }
        StageSpec::Skip(n) => {
            let live = match state
                .first_barrier
                .get_or_insert_with(|| FirstBarrierState::LimitSkip(LiveSet::new()))
            {
                FirstBarrierState::LimitSkip(live) => live,
                _ => unreachable!("plan's first-barrier kind is fixed at compile time"),
            };
            live.apply_all(&deltas);
            Ok(SkipOp::new(*n).apply(live))
        }
        StageSpec::Fused(_) | StageSpec::Unwind(_) | StageSpec::Lookup(..) => {
            unreachable!("is_barrier() only selects Group/Sort/TopK/Limit/Skip")
        }
    }
}

/// Recomputes one downstream-of-barrier stage from scratch against an
/// ordinary document batch; no persistent identity is needed here since the
/// whole suffix re-derives on every run from the barrier's current output.
fn run_stage_batch(stage: &StageSpec, docs: Vec<Value>, now: i64) -> AggResult<Vec<Value>> {
    match stage {
        StageSpec::Fused(f) => Ok(docs.iter().filter_map(|d| f.apply(d, now)).collect()),
        StageSpec::Unwind(spec) => {
            let mut op = UnwindOp::new(spec.clone(), 0);
            let mut out = Vec::new();
            for doc in docs {
                let delta = Delta::add(0, doc);
                for d in op.apply(&delta)? {
                    out.push(d.value.as_ref().clone());
                }
            }
            Ok(out)
        }
        StageSpec::Lookup(_, op) => Ok(docs
            .iter()
            .map(|d| op.apply(&Delta::add(0, d.clone())).value.as_ref().clone())
            .collect()),
        StageSpec::Group(id_expr, specs) => {
            let mut op = GroupOp::new(id_expr.clone(), specs.clone());
            for (i, doc) in docs.into_iter().enumerate() {
                op.apply_delta(&Delta::add(i as FlowId, doc), now)?;
            }
            Ok(op.snapshot())
        }
        StageSpec::Sort(specs) => {
            let mut op = SortOp::new(specs.clone());
            for (i, doc) in docs.iter().enumerate() {
                op.on_add(&Delta::add(i as FlowId, doc.clone()));
            }
            Ok(op.snapshot(|id| docs.get(id as usize).cloned()))
        }
        StageSpec::TopK(specs, k) => {
            let mut op = TopKOp::new(specs.clone(), *k);
            for (i, doc) in docs.iter().enumerate() {
                op.on_add(&Delta::add(i as FlowId, doc.clone()));
            }
            Ok(op.snapshot(|id| docs.get(id as usize).cloned()))
        }
        StageSpec::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
        StageSpec::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::expr::ExprCache;
    use crate::planner::compile_plan;
    use crate::value::Doc;
    use serde_json::json;

    fn doc(cat: &str, v: i64) -> Value {
        let mut d = Doc::new();
        d.insert("cat".to_string(), Value::String(cat.to_string()));
        d.insert("v".to_string(), Value::Int64(v));
        Value::Object(d)
    }

    #[test]
    fn incremental_group_reflects_add_and_remove_across_runs() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        let mut store = RowStore::new();
        let id0 = store.add_document(doc("A", 1));

        let pipeline = vec![json!({"$group": {"_id": null, "sum": {"$sum": "$v"}}})];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        let mut state = PersistentState::new();

        let out = run(&plan, &mut state, &store, 0).unwrap();
        assert_eq!(out[0].as_object().unwrap().get("sum"), Some(&Value::Int64(1)));

        store.add_document(doc("A", 2));
        store.add_document(doc("A", 3));
        let out = run(&plan, &mut state, &store, 0).unwrap();
        assert_eq!(out[0].as_object().unwrap().get("sum"), Some(&Value::Int64(6)));

        store.remove_row(id0).unwrap();
        let out = run(&plan, &mut state, &store, 0).unwrap();
        assert_eq!(out[0].as_object().unwrap().get("sum"), Some(&Value::Int64(5)));
    }

    #[test]
    fn match_project_pipeline_matches_scenario_one() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        let mut store = RowStore::new();
        let mut d1 = Doc::new();
        d1.insert("_id".to_string(), Value::Int64(1));
        d1.insert("a".to_string(), Value::Int64(1));
        store.add_document(Value::Object(d1));
        let mut d2 = Doc::new();
        d2.insert("_id".to_string(), Value::Int64(2));
        d2.insert("a".to_string(), Value::Int64(2));
        store.add_document(Value::Object(d2));
        let mut d3 = Doc::new();
        d3.insert("_id".to_string(), Value::Int64(3));
        d3.insert("a".to_string(), Value::Int64(3));
        store.add_document(Value::Object(d3));

        let pipeline = vec![
            json!({"$match": {"a": {"$gte": 2}}}),
            json!({"$project": {"a": 1, "_id": 0}}),
        ];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        let mut state = PersistentState::new();
        let mut out = run(&plan, &mut state, &store, 0).unwrap();
        out.sort_by_key(|v| v.as_object().unwrap().get("a").unwrap().to_string());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_object().unwrap().get("a"), Some(&Value::Int64(2)));
        assert_eq!(out[1].as_object().unwrap().get("a"), Some(&Value::Int64(3)));
    }

    #[test]
    fn group_then_sort_recomputes_downstream_suffix() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        let mut store = RowStore::new();
        store.add_document(doc("A", 10));
        store.add_document(doc("A", 20));
        store.add_document(doc("B", 5));

        let pipeline = vec![
            json!({"$group": {"_id": "$cat", "total": {"$sum": "$v"}}}),
            json!({"$sort": {"_id": 1}}),
        ];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        let mut state = PersistentState::new();
        let out = run(&plan, &mut state, &store, 0).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_object().unwrap().get("_id"), Some(&Value::String("A".to_string())));
        assert_eq!(out[0].as_object().unwrap().get("total"), Some(&Value::Int64(30)));
        assert_eq!(out[1].as_object().unwrap().get("_id"), Some(&Value::String("B".to_string())));
    }

    #[test]
    fn rerunning_same_pipeline_twice_is_stable() {
        let cache = ExprCache::new();
        let config = Config::default_config();
        let mut store = RowStore::new();
        store.add_document(doc("A", 1));
        let pipeline = vec![json!({"$match": {"v": {"$gte": 0}}})];
        let plan = compile_plan(&pipeline, &cache, &[], &config, &HashMap::new()).unwrap();
        let mut state = PersistentState::new();
        let first = run(&plan, &mut state, &store, 0).unwrap();
        let second = run(&plan, &mut state, &store, 0).unwrap();
        assert_eq!(first.len(), second.len());
    }
}
