//! Expression compiler (C4) and interpreter (C5).

pub mod ast;
pub mod compiler;
pub mod interpreter;

pub use ast::{parse_expr, Expr};
pub use compiler::{CompiledExpr, ExprCache};
pub use interpreter::{eval, eval_batch, Env};
