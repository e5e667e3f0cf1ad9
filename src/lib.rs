//! # aggpipe
//!
//! An in-process, MongoDB-pipeline-shaped aggregation engine built around
//! incremental view maintenance: documents flow through a compiled plan of
//! stage operators (`$match`, `$project`, `$group`, `$sort`, ...) that know
//! how to apply and retract deltas rather than recompute from scratch on
//! every call.
//!
//! ## Module organization
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`value`] | Universal `Value`/`Doc` representation, field-path resolution |
//! | [`row_store`] | Append-only document arena keyed by stable row ids |
//! | [`bitset`] | Packed boolean vectors with word-level set operations |
//! | [`flow`] | `FlowId`, `Delta`, `LiveSet` — the identity/delta plumbing between stages |
//! | [`expr`] | Expression AST, compiler (monomorphic cache), interpreter |
//! | [`stages`] | Per-stage IVM operators: `$match`, `$project`, `$group`, `$sort`, `$unwind`, `$lookup`, ... |
//! | [`planner`] | Compiles a raw pipeline into a fused, routed [`planner::Plan`] |
//! | [`executor`] | Drives deltas through a compiled plan, owns persistent per-pipeline state |
//! | [`collection`] | Public streaming handle and the free-function library surface |
//! | [`shim`] | Non-incremental fallback evaluator for operators the hot path can't run |
//! | [`prefilter`] | Optional Bloom/trigram prefilters for `$text`/`$regex` |
//! | [`registry`] | Process-wide fallback counters |
//! | [`config`] | Engine tunables loaded via `figment` |
//! | [`error`] | `AggError`/`AggResult` |
//! | [`logging`] | `tracing-subscriber` init gated by `DEBUG_IVM` |
//!
//! ## Usage
//!
//! ```rust
//! use aggpipe::collection::aggregate;
//! use aggpipe::value::Value;
//! use serde_json::json;
//!
//! let docs = vec![
//!     Value::from_json(json!({"_id": 1, "a": 1})),
//!     Value::from_json(json!({"_id": 2, "a": 2})),
//! ];
//! let pipeline = vec![json!({"$match": {"a": {"$gte": 2}}})];
//! let out = aggregate(&docs, &pipeline, None).unwrap();
//! assert_eq!(out.len(), 1);
//! ```

pub mod bitset;
pub mod collection;
pub mod config;
pub mod error;
pub mod executor;
pub mod expr;
pub mod flow;
pub mod logging;
pub mod planner;
pub mod prefilter;
pub mod registry;
pub mod row_store;
pub mod shim;
pub mod stages;
pub mod value;

pub use collection::{
    aggregate, count, create_streaming_collection, AggregateOptions, StreamingCollection,
};
pub use error::{AggError, AggResult};
