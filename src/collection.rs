//! Streaming collection (C9) and the public library surface (§6).
//!
//! Two ways to drive a pipeline sit side by side here: the one-shot
//! [`aggregate`] free function (compile a fresh plan, run it once, throw the
//! state away) and [`StreamingCollection`] (the same planner/executor pair,
//! kept alive across `add`/`remove`/`stream` calls so each pipeline's
//! incremental state survives between runs). `aggregate(docs, pipeline)` is
//! defined to be observationally equal to building a collection from `docs`,
//! calling `stream(pipeline)` once, then destroying it.
//!
//! The free per-stage functions below (`match_stage`, `project_stage`, ...)
//! exist for unit testing a single stage's semantics without compiling a
//! full plan; they always run in batch mode over a document slice.

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::config::{Config, ExecutionMode, FusionConfig};
use crate::error::AggResult;
use crate::executor::{self, PersistentState};
use crate::expr::ExprCache;
use crate::planner::{self, Plan, Route};
use crate::row_store::RowStore;
use crate::shim;
use crate::stages;
use crate::value::{RowId, Value};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Options accepted by [`aggregate`] and [`StreamingCollection::stream`].
///
/// `lookup_sources` is not part of the specification's options block: it is
/// a pragmatic addition so `$lookup`'s foreign collection has somewhere to
/// come from through this boundary (see DESIGN.md). Every other field
/// mirrors §6 exactly.
#[derive(Clone, Default)]
pub struct AggregateOptions {
    pub mode: ExecutionMode,
    pub enable_bloom_filter: Option<bool>,
    pub min_collection_size: Option<usize>,
    pub fusion: Option<FusionConfig>,
    pub lookup_sources: HashMap<String, Vec<Value>>,
}

fn resolve_config(options: Option<&AggregateOptions>) -> (Config, HashMap<String, Vec<Value>>) {
    let mut config = Config::default_config();
    let mut lookup_sources = HashMap::new();
    if let Some(opts) = options {
        config.execution.default_mode = opts.mode;
        if let Some(enable) = opts.enable_bloom_filter {
            config.prefilter.enable_bloom_filter = enable;
        }
        if let Some(size) = opts.min_collection_size {
            config.prefilter.min_collection_size = size;
        }
        if let Some(fusion) = &opts.fusion {
            config.fusion = fusion.clone();
        }
        lookup_sources = opts.lookup_sources.clone();
    }
    (config, lookup_sources)
}

/// Compiles `pipeline` fresh against `docs` and runs it to completion once.
/// Equivalent to `createStreamingCollection(docs).stream(pipeline)` followed
/// immediately by `destroy()` — no state survives the call.
pub fn aggregate(
    docs: &[Value],
    pipeline: &[Json],
    options: Option<AggregateOptions>,
) -> AggResult<Vec<Value>> {
    let (config, lookup_sources) = resolve_config(options.as_ref());
    let cache = ExprCache::new();
    let mut store = RowStore::new();
    for doc in docs {
        store.add_document(doc.clone());
    }

    let sample: Vec<Value> = docs.iter().take(10).cloned().collect();
    let plan = planner::compile_plan(pipeline, &cache, &sample, &config, &lookup_sources)?;
    match &plan.route {
        Route::HotPath => {
            let mut state = PersistentState::new();
            executor::run(&plan, &mut state, &store, now_millis())
        }
        Route::Shim(_) => shim::run(pipeline, docs, &cache, &config),
    }
}

/// `count(docs, query) == aggregate(docs, [{$match: query}]).len()`, without
/// materializing the matched documents.
pub fn count(docs: &[Value], query: &Json) -> AggResult<usize> {
    let pred = stages::parse_predicate(query)?;
    let now = now_millis();
    Ok(docs
        .iter()
        .filter(|d| stages::predicate::eval_predicate(&pred, d, d, now))
        .count())
}

/// Evaluates a single expression-object against `doc`. `$$NOW` resolves to
/// the evaluation wall-clock time, matching a one-row, one-run pipeline.
pub fn expression(doc: &Value, expr: &Json) -> AggResult<Value> {
    let ast = crate::expr::ast::parse_expr(expr)?;
    let env = crate::expr::interpreter::Env::new(doc, now_millis());
    Ok(crate::expr::eval(&ast, doc, &env))
}

pub fn match_stage(docs: &[Value], query: &Json) -> AggResult<Vec<Value>> {
    let pred = stages::parse_predicate(query)?;
    let now = now_millis();
    Ok(docs
        .iter()
        .filter(|d| stages::predicate::eval_predicate(&pred, d, d, now))
        .cloned()
        .collect())
}

pub fn project_stage(docs: &[Value], spec: &Json) -> AggResult<Vec<Value>> {
    let cache = ExprCache::new();
    let parsed = stages::fused::parse_project_spec(spec, &cache, docs)?;
    let now = now_millis();
    let mut stage = crate::stages::FusedRowStage::new();
    stage.push(crate::stages::RowTransform::Project(parsed));
    Ok(docs.iter().filter_map(|d| stage.apply(d, now)).collect())
}

pub fn add_fields_stage(docs: &[Value], spec: &Json) -> AggResult<Vec<Value>> {
    let cache = ExprCache::new();
    let parsed = stages::fused::parse_add_fields(spec, &cache, docs)?;
    let now = now_millis();
    let mut stage = crate::stages::FusedRowStage::new();
    stage.push(crate::stages::RowTransform::AddFields(parsed));
    Ok(docs.iter().filter_map(|d| stage.apply(d, now)).collect())
}

pub fn unset_stage(docs: &[Value], spec: &Json) -> AggResult<Vec<Value>> {
    let paths = stages::fused::parse_unset(spec)?;
    let now = now_millis();
    let mut stage = crate::stages::FusedRowStage::new();
    stage.push(crate::stages::RowTransform::Unset(paths));
    Ok(docs.iter().filter_map(|d| stage.apply(d, now)).collect())
}

pub fn group_stage(docs: &[Value], spec: &Json) -> AggResult<Vec<Value>> {
    let cache = ExprCache::new();
    let (id_expr, acc_specs) = stages::parse_group_spec(spec, &cache, docs)?;
    let now = now_millis();
    let mut op = crate::stages::GroupOp::new(id_expr, acc_specs);
    for (i, doc) in docs.iter().enumerate() {
        op.apply_delta(&crate::flow::Delta::add(i as u64, doc.clone()), now)?;
    }
    Ok(op.snapshot())
}

pub fn sort_stage(docs: &[Value], spec: &Json) -> AggResult<Vec<Value>> {
    let specs = stages::sort::parse_sort_spec(spec)?;
    let mut op = crate::stages::SortOp::new(specs);
    for (i, doc) in docs.iter().enumerate() {
        op.on_add(&crate::flow::Delta::add(i as u64, doc.clone()));
    }
    Ok(op.snapshot(|id| docs.get(id as usize).cloned()))
}

pub fn limit_stage(docs: &[Value], n: usize) -> Vec<Value> {
    docs.iter().take(n).cloned().collect()
}

pub fn skip_stage(docs: &[Value], n: usize) -> Vec<Value> {
    docs.iter().skip(n).cloned().collect()
}

pub fn unwind_stage(docs: &[Value], spec: &Json) -> AggResult<Vec<Value>> {
    let unwind_spec = stages::unwind::parse_unwind_spec(spec)?;
    let mut op = crate::stages::UnwindOp::new(unwind_spec, 0);
    let mut out = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        let delta = crate::flow::Delta::add(i as u64, doc.clone());
        for d in op.apply(&delta)? {
            out.push(d.value.as_ref().clone());
        }
    }
    Ok(out)
}

pub fn lookup_stage(docs: &[Value], spec: &Json, foreign: &[Value]) -> AggResult<Vec<Value>> {
    let lookup_spec = stages::lookup::parse_lookup_spec(spec)?;
    let op = crate::stages::LookupOp::new(lookup_spec, foreign);
    Ok(docs
        .iter()
        .enumerate()
        .map(|(i, d)| {
            op.apply(&crate::flow::Delta::add(i as u64, d.clone()))
                .value
                .as_ref()
                .clone()
        })
        .collect())
}

/// Convenience constructor matching §6's `createStreamingCollection(docs)`.
pub fn create_streaming_collection(initial_docs: Vec<Value>) -> StreamingCollection {
    StreamingCollection::new(initial_docs, None)
}

struct PipelineHandle {
    plan: Plan,
    state: PersistentState,
}

/// Public handle (C9) for push-updates and repeated materialization over one
/// logical document set. Each distinct pipeline compiled against this
/// collection gets its own [`Plan`]/[`PersistentState`] pair, cached by a
/// hash of the pipeline's JSON shape, so interleaved `stream` calls for
/// different pipelines never share incremental state.
pub struct StreamingCollection {
    store: RowStore,
    config: Config,
    cache: ExprCache,
    lookup_sources: HashMap<String, Vec<Value>>,
    pipelines: HashMap<u64, PipelineHandle>,
}

impl StreamingCollection {
    pub fn new(initial_docs: Vec<Value>, options: Option<AggregateOptions>) -> Self {
        let (config, lookup_sources) = resolve_config(options.as_ref());
        let mut store = RowStore::new();
        for doc in initial_docs {
            store.add_document(doc);
        }
        StreamingCollection {
            store,
            config,
            cache: ExprCache::new(),
            lookup_sources,
            pipelines: HashMap::new(),
        }
    }

    pub fn add(&mut self, doc: Value) -> RowId {
        self.store.add_document(doc)
    }

    pub fn add_bulk(&mut self, docs: Vec<Value>) -> Vec<RowId> {
        docs.into_iter().map(|d| self.store.add_document(d)).collect()
    }

    pub fn remove(&mut self, row_id: RowId) -> AggResult<()> {
        self.store.remove_row(row_id)
    }

    /// Threads everything added/removed since the last call to this same
    /// pipeline through its compiled plan, returning the freshly
    /// materialized output.
    pub fn stream(&mut self, pipeline: &[Json]) -> AggResult<Vec<Value>> {
        let now = now_millis();
        let key = pipeline_key(pipeline);
        if !self.pipelines.contains_key(&key) {
            let sample: Vec<Value> = self
                .store
                .live_ids()
                .take(10)
                .filter_map(|id| self.store.get(id).ok().cloned())
                .collect();
            let plan = planner::compile_plan(pipeline, &self.cache, &sample, &self.config, &self.lookup_sources)?;
            self.pipelines.insert(
                key,
                PipelineHandle {
                    plan,
                    state: PersistentState::new(),
                },
            );
        }
        let route = self.pipelines.get(&key).expect("just inserted").plan.route.clone();
        match route {
            Route::HotPath => {
                let handle = self.pipelines.get_mut(&key).expect("just inserted");
                executor::run(&handle.plan, &mut handle.state, &self.store, now)
            }
            Route::Shim(_) => {
                let docs: Vec<Value> = self
                    .store
                    .live_ids()
                    .filter_map(|id| self.store.get(id).ok().cloned())
                    .collect();
                shim::run(pipeline, &docs, &self.cache, &self.config)
            }
        }
    }

    /// Alias for [`StreamingCollection::stream`]; the specification does
    /// not distinguish the two beyond naming.
    pub fn get_streaming_result(&mut self, pipeline: &[Json]) -> AggResult<Vec<Value>> {
        self.stream(pipeline)
    }

    /// Drops all held state. Provided for API symmetry with §6; a
    /// `StreamingCollection` going out of scope has the same effect.
    pub fn destroy(self) {}
}

fn pipeline_key(pipeline: &[Json]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let canonical = serde_json::to_string(pipeline).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
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
    fn aggregate_records_fallback_exactly_once_per_triggering_stage() {
        crate::registry::reset();
        let docs = vec![doc(1), doc(2)];
        let pipeline = vec![json!({"$where": "this.a > 1"})];
        let out = aggregate(&docs, &pipeline, None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(
            crate::registry::analysis().by_reason[&crate::registry::unsupported_operator_reason("$where")],
            1
        );
    }

    #[test]
    fn aggregate_matches_scenario_one() {
        let docs = vec![doc(1), doc(2), doc(3)];
        let pipeline = vec![
            json!({"$match": {"a": {"$gte": 2}}}),
            json!({"$project": {"a": 1, "_id": 0}}),
        ];
        let out = aggregate(&docs, &pipeline, None).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn count_matches_match_stage_length() {
        let docs = vec![doc(1), doc(2), doc(3)];
        let query = json!({"a": {"$gte": 2}});
        let n = count(&docs, &query).unwrap();
        let matched = match_stage(&docs, &query).unwrap();
        assert_eq!(n, matched.len());
    }

    #[test]
    fn streaming_collection_reflects_add_and_remove() {
        let mut coll = StreamingCollection::new(vec![doc(1)], None);
        let pipeline = vec![json!({"$group": {"_id": null, "sum": {"$sum": "$a"}}})];
        let out = coll.stream(&pipeline).unwrap();
        assert_eq!(out[0].as_object().unwrap().get("sum"), Some(&Value::Int64(1)));

        let ids = coll.add_bulk(vec![doc(2), doc(3)]);
        let out = coll.stream(&pipeline).unwrap();
        assert_eq!(out[0].as_object().unwrap().get("sum"), Some(&Value::Int64(6)));

        coll.remove(ids[0]).unwrap();
        let out = coll.stream(&pipeline).unwrap();
        assert_eq!(out[0].as_object().unwrap().get("sum"), Some(&Value::Int64(4)));
    }

    #[test]
    fn distinct_pipelines_keep_independent_state() {
        let mut coll = StreamingCollection::new(vec![doc(1), doc(2)], None);
        let group_pipeline = vec![json!({"$group": {"_id": null, "sum": {"$sum": "$a"}}})];
        let match_pipeline = vec![json!({"$match": {"a": {"$gte": 2}}})];

        let grouped = coll.stream(&group_pipeline).unwrap();
        assert_eq!(grouped[0].as_object().unwrap().get("sum"), Some(&Value::Int64(3)));

        let matched = coll.stream(&match_pipeline).unwrap();
        assert_eq!(matched.len(), 1);

        let grouped_again = coll.stream(&group_pipeline).unwrap();
        assert_eq!(grouped_again.len(), 1);
    }
}
