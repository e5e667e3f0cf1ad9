//! `$sort`, `$limit`, `$skip` (C6) and the fused `$sort` + `$limit` Top-K
//! barrier (C7). `$sort` maintains a persistent ordered multiset of
//! `(sortKey, FlowId)` pairs rather than re-sorting on every call; `$limit`
//! and `$skip` are backed directly by upstream arrival order via
//! [`crate::flow::LiveSet`] when they are the first barrier in a plan.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::error::{AggError, AggResult};
use crate::flow::{Delta, FlowId};
use crate::value::Value;

/// One `(field, direction)` pair; `direction` is `1` for ascending, `-1`
/// for descending.
#[derive(Clone)]
pub struct SortSpec {
    pub field: String,
    pub direction: i8,
}

/// A compound sort key: one [`Value`] per sort field, compared field by
/// field using the engine's cross-type total order, direction-adjusted.
#[derive(Clone, Debug)]
pub struct SortKey(pub Vec<Value>);

struct Entry {
    key: Vec<Value>,
    id: FlowId,
}

/// Compares two compound keys field by field under the given per-field
/// directions, tie-breaking on ascending `FlowId` to give a stable total
/// order over otherwise-equal rows.
fn compare_entries(a: &Entry, b: &Entry, directions: &[i8]) -> Ordering {
    for (i, dir) in directions.iter().enumerate() {
        let ord = a.key[i].total_cmp(&b.key[i]);
        let ord = if *dir < 0 { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}

impl PartialEq for Entry {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, _other: &Self) -> Option<Ordering> {
        None
    }
}
impl Ord for Entry {
    fn cmp(&self, _other: &Self) -> Ordering {
        Ordering::Equal
    }
}

/// Persistent ordered view over the live rows reaching this stage.
pub struct SortOp {
    specs: Vec<SortSpec>,
    directions: Vec<i8>,
    // BTreeSet can't carry external comparator state, so entries are kept
    // in a Vec kept sorted by binary search; row counts in a single
    // pipeline run are small enough that this is the right trade for
    // simplicity over a custom balanced-tree comparator.
    entries: Vec<Entry>,
}

impl SortOp {
    pub fn new(specs: Vec<SortSpec>) -> Self {
        let directions = specs.iter().map(|s| s.direction).collect();
        SortOp {
            specs,
            directions,
            entries: Vec::new(),
        }
    }

    fn key_for(&self, doc: &Value) -> Vec<Value> {
        self.specs
            .iter()
            .map(|s| match doc.get_path(&s.field) {
                crate::value::FieldLookup::Present(v) => v.clone(),
                crate::value::FieldLookup::Missing => Value::Null,
            })
            .collect()
    }

    pub fn on_add(&mut self, delta: &Delta) {
        let key = self.key_for(&delta.value);
        let entry = Entry { key, id: delta.id };
        let pos = self
            .entries
            .binary_search_by(|e| compare_entries(e, &entry, &self.directions))
            .unwrap_or_else(|p| p);
        self.entries.insert(pos, entry);
    }

    pub fn on_remove(&mut self, delta: &Delta) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == delta.id) {
            self.entries.remove(pos);
        }
    }

    pub fn snapshot(&self, docs_by_id: impl Fn(FlowId) -> Option<Value>) -> Vec<Value> {
        self.entries
            .iter()
            .filter_map(|e| docs_by_id(e.id))
            .collect()
    }

    pub fn ordered_ids(&self) -> Vec<FlowId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `$sort` immediately followed by `$limit`, fused by the planner into a
/// single barrier that only needs to retain the top `k` entries instead of
/// the full order.
pub struct TopKOp {
    sort: SortOp,
    k: usize,
}

impl TopKOp {
    pub fn new(specs: Vec<SortSpec>, k: usize) -> Self {
        TopKOp {
            sort: SortOp::new(specs),
            k,
        }
    }

    pub fn on_add(&mut self, delta: &Delta) {
        self.sort.on_add(delta);
    }

    pub fn on_remove(&mut self, delta: &Delta) {
        self.sort.on_remove(delta);
    }

    pub fn ordered_ids(&self) -> Vec<FlowId> {
        self.sort.ordered_ids().into_iter().take(self.k).collect()
    }

    pub fn snapshot(&self, docs_by_id: impl Fn(FlowId) -> Option<Value>) -> Vec<Value> {
        self.sort
            .entries
            .iter()
            .take(self.k)
            .filter_map(|e| docs_by_id(e.id))
            .collect()
    }
}

/// `$limit`: takes the first `n` rows in upstream arrival order.
pub struct LimitOp {
    pub n: usize,
}

impl LimitOp {
    pub fn new(n: usize) -> Self {
        LimitOp { n }
    }

    pub fn apply(&self, live: &crate::flow::LiveSet) -> Vec<Value> {
        live.values_in_order().take(self.n).cloned().collect()
    }
}

/// `$skip`: drops the first `n` rows in upstream arrival order.
pub struct SkipOp {
    pub n: usize,
}

impl SkipOp {
    pub fn new(n: usize) -> Self {
        SkipOp { n }
    }

    pub fn apply(&self, live: &crate::flow::LiveSet) -> Vec<Value> {
        live.values_in_order().skip(self.n).cloned().collect()
    }
}

pub fn parse_sort_spec(json: &serde_json::Value) -> AggResult<Vec<SortSpec>> {
    let map = json.as_object().ok_or_else(|| AggError::ParseError {
        message: "$sort requires an object".to_string(),
    })?;
    let mut specs = Vec::with_capacity(map.len());
    for (key, val) in map {
        let direction = match val.as_i64() {
            Some(1) => 1,
            Some(-1) => -1,
            _ => {
                return Err(AggError::ParseError {
                    message: format!("$sort direction for '{key}' must be 1 or -1"),
                })
            }
        };
        specs.push(SortSpec {
            field: key.clone(),
            direction,
        });
    }
    Ok(specs)
}

pub fn parse_limit(json: &serde_json::Value) -> AggResult<usize> {
    json.as_u64().map(|n| n as usize).ok_or_else(|| AggError::ParseError {
        message: "$limit requires a non-negative integer".to_string(),
    })
}

pub fn parse_skip(json: &serde_json::Value) -> AggResult<usize> {
    json.as_u64().map(|n| n as usize).ok_or_else(|| AggError::ParseError {
        message: "$skip requires a non-negative integer".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::LiveSet;
    use std::collections::HashMap;

    fn int_delta(id: FlowId, v: i64) -> Delta {
        let mut d = crate::value::Doc::new();
        d.insert("v".to_string(), Value::Int64(v));
        Delta::add(id, Value::Object(d))
    }

    #[test]
    fn sort_maintains_ascending_order_under_inserts() {
        let mut op = SortOp::new(vec![SortSpec {
            field: "v".to_string(),
            direction: 1,
        }]);
        op.on_add(&int_delta(1, 30));
        op.on_add(&int_delta(2, 10));
        op.on_add(&int_delta(3, 20));
        let ids = op.ordered_ids();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn sort_removal_preserves_relative_order() {
        let mut op = SortOp::new(vec![SortSpec {
            field: "v".to_string(),
            direction: -1,
        }]);
        op.on_add(&int_delta(1, 30));
        op.on_add(&int_delta(2, 10));
        op.on_add(&int_delta(3, 20));
        let removed = int_delta(3, 20);
        op.on_remove(&removed);
        assert_eq!(op.ordered_ids(), vec![1, 2]);
    }

    #[test]
    fn top_k_retains_only_k_entries() {
        let mut op = TopKOp::new(
            vec![SortSpec {
                field: "v".to_string(),
                direction: 1,
            }],
            2,
        );
        for i in 0..5 {
            op.on_add(&int_delta(i, (5 - i) as i64));
        }
        assert_eq!(op.ordered_ids().len(), 2);
    }

    #[test]
    fn limit_and_skip_apply_to_arrival_order() {
        let mut live = LiveSet::new();
        live.apply(&int_delta(1, 1));
        live.apply(&int_delta(2, 2));
        live.apply(&int_delta(3, 3));
        let limit = LimitOp::new(2);
        assert_eq!(limit.apply(&live).len(), 2);
        let skip = SkipOp::new(1);
        assert_eq!(skip.apply(&live).len(), 2);
    }

    #[test]
    fn snapshot_resolves_through_lookup_closure() {
        let mut op = SortOp::new(vec![SortSpec {
            field: "v".to_string(),
            direction: 1,
        }]);
        op.on_add(&int_delta(1, 2));
        op.on_add(&int_delta(2, 1));
        let mut docs: HashMap<FlowId, Value> = HashMap::new();
        docs.insert(1, Value::Int64(100));
        docs.insert(2, Value::Int64(200));
        let snap = op.snapshot(|id| docs.get(&id).cloned());
        assert_eq!(snap, vec![Value::Int64(200), Value::Int64(100)]);
    }
}
