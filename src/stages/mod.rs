//! Stage operators (C6): one module per pipeline stage kind, each exposing
//! the `on_add`/`on_remove`/`snapshot` contract described in the design.
//! Forwardable stages (`$match`, `$project`, `$addFields`, `$unset`,
//! `$unwind`, simple `$lookup`) are represented as row-at-a-time transforms
//! and folded by the planner into a single [`fused::FusedRowStage`] wherever
//! fusion applies; barrier stages (`$group`, `$sort`/`$limit`/`$skip`) hold
//! their own per-run accumulation state instead.

pub mod fused;
pub mod group;
pub mod lookup;
pub mod predicate;
pub mod sort;
pub mod unwind;

pub use fused::{FusedRowStage, ProjectField, ProjectSpec, RowTransform};
pub use group::{parse_group_spec, AccKind, GroupOp};
pub use lookup::LookupOp;
pub use predicate::{parse_predicate, Predicate};
pub use sort::{LimitOp, SkipOp, SortKey, SortOp, TopKOp};
pub use unwind::UnwindOp;
