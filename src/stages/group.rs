//! `$group` (C6): dimension-indexed accumulator state maintained
//! incrementally across runs. Each group's accumulators are updated with
//! `sign = +1`/`-1` per the specification's delta contract rather than
//! recomputed from the base data, so the "hard" incremental part —
//! `$min`/`$max` order-statistic tracking, `$push` occurrence removal,
//! `$addToSet` refcounting — all happen here.
//!
//! State machine per group key: `empty -> nonEmpty -> pruned -> nonEmpty`.
//! A group transitioning out of `pruned` back to `nonEmpty` reinitializes
//! its accumulators from scratch rather than resuming stale partials.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::error::{AggError, AggResult};
use crate::expr::compiler::CompiledExpr;
use crate::expr::interpreter::Env;
use crate::flow::{Delta, FlowId};
use crate::value::{canonicalize, Doc, Value};

#[derive(Clone)]
pub enum AccKind {
    Sum(CompiledExpr),
    Avg(CompiledExpr),
    Min(CompiledExpr),
    Max(CompiledExpr),
    First(CompiledExpr),
    Last(CompiledExpr),
    Push(CompiledExpr),
    AddToSet(CompiledExpr),
    Count,
}

/// Wraps a `Value` with the engine's cross-type total order so it can key a
/// `BTreeMap`-backed multiset for `$min`/`$max`.
#[derive(Clone, Debug)]
struct OrdKey(Value);

impl PartialEq for OrdKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}
impl Eq for OrdKey {}
impl PartialOrd for OrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

enum AccState {
    Sum {
        int_sum: i64,
        float_sum: f64,
        is_float: bool,
    },
    Avg {
        int_sum: i64,
        float_sum: f64,
        is_float: bool,
        count: i64,
    },
    MinMax {
        multiset: BTreeMap<OrdKey, i64>,
        want_max: bool,
    },
    FirstLast {
        by_flow: BTreeMap<FlowId, Value>,
        want_last: bool,
    },
    Push {
        items: BTreeMap<FlowId, Value>,
    },
    AddToSet {
        // canonical key -> (value, refcount); Vec preserves first-seen order.
        entries: Vec<(String, Value, i64)>,
    },
    Count {
        count: i64,
    },
}

impl AccState {
    fn fresh(kind: &AccKind) -> Self {
        match kind {
            AccKind::Sum(_) => AccState::Sum {
                int_sum: 0,
                float_sum: 0.0,
                is_float: false,
            },
            AccKind::Avg(_) => AccState::Avg {
                int_sum: 0,
                float_sum: 0.0,
                is_float: false,
                count: 0,
            },
            AccKind::Min(_) => AccState::MinMax {
                multiset: BTreeMap::new(),
                want_max: false,
            },
            AccKind::Max(_) => AccState::MinMax {
                multiset: BTreeMap::new(),
                want_max: true,
            },
            AccKind::First(_) => AccState::FirstLast {
                by_flow: BTreeMap::new(),
                want_last: false,
            },
            AccKind::Last(_) => AccState::FirstLast {
                by_flow: BTreeMap::new(),
                want_last: true,
            },
            AccKind::Push(_) => AccState::Push {
                items: BTreeMap::new(),
            },
            AccKind::AddToSet(_) => AccState::AddToSet { entries: Vec::new() },
            AccKind::Count => AccState::Count { count: 0 },
        }
    }

    fn apply(&mut self, value: Value, flow_id: FlowId, sign: i8) {
        match self {
            AccState::Sum {
                int_sum,
                float_sum,
                is_float,
            } => apply_sum(value, sign, int_sum, float_sum, is_float),
            AccState::Avg {
                int_sum,
                float_sum,
                is_float,
                count,
            } => {
                apply_sum(value, sign, int_sum, float_sum, is_float);
                *count += sign as i64;
            }
            AccState::MinMax { multiset, .. } => {
                if sign > 0 {
                    *multiset.entry(OrdKey(value)).or_insert(0) += 1;
                } else {
                    let key = OrdKey(value);
                    if let Some(count) = multiset.get_mut(&key) {
                        *count -= 1;
                        if *count <= 0 {
                            multiset.remove(&key);
                        }
                    }
                }
            }
            AccState::FirstLast { by_flow, .. } => {
                if sign > 0 {
                    by_flow.insert(flow_id, value);
                } else {
                    by_flow.remove(&flow_id);
                }
            }
            AccState::Push { items } => {
                if sign > 0 {
                    items.insert(flow_id, value);
                } else {
                    items.remove(&flow_id);
                }
            }
            AccState::AddToSet { entries } => {
                let key = canonicalize(&value);
                if sign > 0 {
                    if let Some(e) = entries.iter_mut().find(|(k, _, _)| *k == key) {
                        e.2 += 1;
                    } else {
                        entries.push((key, value, 1));
                    }
                } else if let Some(pos) = entries.iter().position(|(k, _, _)| *k == key) {
                    entries[pos].2 -= 1;
                    if entries[pos].2 <= 0 {
                        entries.remove(pos);
                    }
                }
            }
            AccState::Count { count } => *count += sign as i64,
        }
    }

    fn result(&self) -> Value {
        match self {
            AccState::Sum {
                int_sum,
                float_sum,
                is_float,
            } => {
                if *is_float {
                    Value::Float64(*float_sum)
                } else {
                    Value::Int64(*int_sum)
                }
            }
            AccState::Avg {
                int_sum,
                float_sum,
                count,
                ..
            } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float64((*int_sum as f64 + *float_sum) / *count as f64)
                }
            }
            AccState::MinMax { multiset, want_max } => {
                let key = if *want_max {
                    multiset.keys().next_back()
                } else {
                    multiset.keys().next()
                };
                key.map(|k| k.0.clone()).unwrap_or(Value::Null)
            }
            AccState::FirstLast { by_flow, want_last } => {
                let v = if *want_last {
                    by_flow.values().next_back()
                } else {
                    by_flow.values().next()
                };
                v.cloned().unwrap_or(Value::Null)
            }
            AccState::Push { items } => Value::Array(items.values().cloned().collect()),
            AccState::AddToSet { entries } => {
                Value::Array(entries.iter().map(|(_, v, _)| v.clone()).collect())
            }
            AccState::Count { count } => Value::Int64(*count),
        }
    }
}

fn apply_sum(value: Value, sign: i8, int_sum: &mut i64, float_sum: &mut f64, is_float: &mut bool) {
    match value {
        Value::Int64(i) => *int_sum += sign as i64 * i,
        Value::Float64(f) => {
            *is_float = true;
            *float_sum += sign as f64 * f;
        }
        _ => {}
    }
}

struct GroupEntry {
    id_value: Value,
    count: i64,
    states: Vec<AccState>,
    pruned: bool,
}

impl GroupEntry {
    fn fresh(id_value: Value, specs: &[(String, AccKind)]) -> Self {
        GroupEntry {
            id_value,
            count: 0,
            states: specs.iter().map(|(_, k)| AccState::fresh(k)).collect(),
            pruned: false,
        }
    }
}

pub struct GroupOp {
    id_expr: CompiledExpr,
    acc_specs: Vec<(String, AccKind)>,
    groups: HashMap<String, GroupEntry>,
}

impl GroupOp {
    pub fn new(id_expr: CompiledExpr, acc_specs: Vec<(String, AccKind)>) -> Self {
        GroupOp {
            id_expr,
            acc_specs,
            groups: HashMap::new(),
        }
    }

    fn kind_of(&self, index: usize) -> &AccKind {
        &self.acc_specs[index].1
    }

    fn acc_expr(kind: &AccKind) -> Option<&CompiledExpr> {
        match kind {
            AccKind::Sum(e)
            | AccKind::Avg(e)
            | AccKind::Min(e)
            | AccKind::Max(e)
            | AccKind::First(e)
            | AccKind::Last(e)
            | AccKind::Push(e)
            | AccKind::AddToSet(e) => Some(e),
            AccKind::Count => None,
        }
    }

    pub fn apply_delta(&mut self, delta: &Delta, now: i64) -> AggResult<()> {
        let env = Env::new(&delta.value, now);
        let id_value = self.id_expr.evaluate(&delta.value, &env);
        let key = canonicalize(&id_value);

        let specs = &self.acc_specs;
        let entry = self
            .groups
            .entry(key)
            .or_insert_with(|| GroupEntry::fresh(id_value.clone(), specs));
        if entry.pruned && delta.sign > 0 {
            *entry = GroupEntry::fresh(id_value, specs);
        }

        entry.count += delta.sign as i64;
        for (index, state) in entry.states.iter_mut().enumerate() {
            let kind = &specs[index].1;
            let value = match Self::acc_expr(kind) {
                Some(expr) => expr.evaluate(&delta.value, &env),
                None => Value::Null,
            };
            state.apply(value, delta.id, delta.sign);
        }

        if entry.count <= 0 {
            entry.pruned = true;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for entry in self.groups.values() {
            if entry.pruned {
                continue;
            }
            let mut doc = Doc::new();
            doc.insert("_id".to_string(), entry.id_value.clone());
            for (index, (name, _)) in self.acc_specs.iter().enumerate() {
                doc.insert(name.clone(), entry.states[index].result());
            }
            out.push(Value::Object(doc));
        }
        out
    }
}

/// Parses a `$group` stage spec: `{_id: <expr>, field: {$sum: <expr>}, ...}`.
pub fn parse_group_spec(
    json: &serde_json::Value,
    cache: &crate::expr::ExprCache,
    sample: &[Value],
) -> AggResult<(CompiledExpr, Vec<(String, AccKind)>)> {
    let map = json.as_object().ok_or_else(|| AggError::ParseError {
        message: "$group requires an object".to_string(),
    })?;
    let id_json = map.get("_id").ok_or_else(|| AggError::ParseError {
        message: "$group requires '_id'".to_string(),
    })?;
    let id_expr = cache.compile(crate::expr::ast::parse_expr(id_json)?, sample);

    let mut specs = Vec::with_capacity(map.len().saturating_sub(1));
    for (key, val) in map {
        if key == "_id" {
            continue;
        }
        let obj = val.as_object().ok_or_else(|| AggError::ParseError {
            message: format!("$group field '{key}' must be an accumulator object"),
        })?;
        if obj.len() != 1 {
            return Err(AggError::ParseError {
                message: format!("$group field '{key}' must have exactly one accumulator"),
            });
        }
        let (acc_name, acc_val) = obj.iter().next().expect("len == 1");
        let kind = match acc_name.as_str() {
            "$sum" if acc_val.as_i64() == Some(1) => AccKind::Count,
            "$sum" => AccKind::Sum(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample)),
            "$avg" => AccKind::Avg(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample)),
            "$min" => AccKind::Min(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample)),
            "$max" => AccKind::Max(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample)),
            "$first" => AccKind::First(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample)),
            "$last" => AccKind::Last(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample)),
            "$push" => AccKind::Push(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample)),
            "$addToSet" => {
                AccKind::AddToSet(cache.compile(crate::expr::ast::parse_expr(acc_val)?, sample))
            }
            "$count" => AccKind::Count,
            other => {
                return Err(AggError::UnsupportedOperator {
                    operator: other.to_string(),
                })
            }
        };
        specs.push((key.clone(), kind));
    }
    Ok((id_expr, specs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprCache;
    use crate::value::Doc as VDoc;
    use serde_json::json;

    fn doc(cat: &str, v: i64) -> Value {
        let mut d = VDoc::new();
        d.insert("cat".into(), Value::String(cat.into()));
        d.insert("v".into(), Value::Int64(v));
        Value::Object(d)
    }

    #[test]
    fn sum_groups_by_category() {
        let cache = ExprCache::new();
        let (id_expr, specs) =
            parse_group_spec(&json!({"_id": "$cat", "total": {"$sum": "$v"}}), &cache, &[]).unwrap();
        let mut op = GroupOp::new(id_expr, specs);
        op.apply_delta(&Delta::add(0, doc("A", 10)), 0).unwrap();
        op.apply_delta(&Delta::add(1, doc("A", 20)), 0).unwrap();
        op.apply_delta(&Delta::add(2, doc("B", 5)), 0).unwrap();

        let mut snap = op.snapshot();
        snap.sort_by_key(|v| v.as_object().unwrap().get("_id").unwrap().to_string());
        assert_eq!(snap.len(), 2);
        let a = snap[0].as_object().unwrap();
        assert_eq!(a.get("total"), Some(&Value::Int64(30)));
    }

    #[test]
    fn removal_prunes_group_and_resurrection_reinitializes() {
        let cache = ExprCache::new();
        let (id_expr, specs) =
            parse_group_spec(&json!({"_id": "$cat", "total": {"$sum": "$v"}}), &cache, &[]).unwrap();
        let mut op = GroupOp::new(id_expr, specs);
        op.apply_delta(&Delta::add(0, doc("A", 10)), 0).unwrap();
        assert_eq!(op.snapshot().len(), 1);

        let val = std::sync::Arc::new(doc("A", 10));
        op.apply_delta(&Delta::remove(0, val), 0).unwrap();
        assert_eq!(op.snapshot().len(), 0);

        op.apply_delta(&Delta::add(1, doc("A", 99)), 0).unwrap();
        let snap = op.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(
            snap[0].as_object().unwrap().get("total"),
            Some(&Value::Int64(99))
        );
    }

    #[test]
    fn min_max_promote_next_extremum_on_removal() {
        let cache = ExprCache::new();
        let (id_expr, specs) = parse_group_spec(
            &json!({"_id": null, "lo": {"$min": "$v"}, "hi": {"$max": "$v"}}),
            &cache,
            &[],
        )
        .unwrap();
        let mut op = GroupOp::new(id_expr, specs);
        op.apply_delta(&Delta::add(0, doc("A", 5)), 0).unwrap();
        op.apply_delta(&Delta::add(1, doc("A", 1)), 0).unwrap();
        op.apply_delta(&Delta::add(2, doc("A", 9)), 0).unwrap();

        let snap = op.snapshot();
        let d = snap[0].as_object().unwrap();
        assert_eq!(d.get("lo"), Some(&Value::Int64(1)));
        assert_eq!(d.get("hi"), Some(&Value::Int64(9)));

        let removed = std::sync::Arc::new(doc("A", 1));
        op.apply_delta(&Delta::remove(1, removed), 0).unwrap();
        let snap = op.snapshot();
        let d = snap[0].as_object().unwrap();
        assert_eq!(d.get("lo"), Some(&Value::Int64(5)));
    }

    #[test]
    fn add_to_set_refcounts_duplicates() {
        let cache = ExprCache::new();
        let (id_expr, specs) =
            parse_group_spec(&json!({"_id": null, "s": {"$addToSet": "$cat"}}), &cache, &[]).unwrap();
        let mut op = GroupOp::new(id_expr, specs);
        op.apply_delta(&Delta::add(0, doc("A", 1)), 0).unwrap();
        op.apply_delta(&Delta::add(1, doc("A", 2)), 0).unwrap();
        op.apply_delta(&Delta::add(2, doc("B", 3)), 0).unwrap();

        let snap = op.snapshot();
        let arr = snap[0].as_object().unwrap().get("s").unwrap().as_array().unwrap();
        assert_eq!(arr.len(), 2);

        let removed = std::sync::Arc::new(doc("A", 1));
        op.apply_delta(&Delta::remove(0, removed), 0).unwrap();
        let snap = op.snapshot();
        let arr = snap[0].as_object().unwrap().get("s").unwrap().as_array().unwrap();
        // "A" refcount drops from 2 to 1, still present.
        assert_eq!(arr.len(), 2);
    }
}
