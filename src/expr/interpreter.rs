//! Expression interpreter (C5): evaluates an [`Expr`] tree against a
//! document and an [`Env`]. Used both as the scalar evaluator behind
//! [`crate::expr::compiler::CompiledExpr`] and directly as the vector
//! (batch) interpreter that is the fallback path for megamorphic
//! expressions.
//!
//! Every runtime failure (division by zero, type mismatch, out-of-range
//! index) evaluates to `Value::Null` rather than propagating — per the
//! specification's failure semantics, `ExpressionFailure` never aborts a
//! pipeline run.

use std::collections::HashMap;

use crate::bitset::Tribool;
use crate::expr::ast::{Expr, Op, SysVar};
use crate::value::{Doc, Value};

/// Evaluation environment threaded through every call. `now` is captured
/// once at the start of a pipeline run and is identical for every
/// expression evaluation within that run.
pub struct Env<'a> {
    pub root: &'a Value,
    pub now: i64,
    pub bindings: HashMap<String, Value>,
}

impl<'a> Env<'a> {
    pub fn new(root: &'a Value, now: i64) -> Self {
        Env {
            root,
            now,
            bindings: HashMap::new(),
        }
    }

    fn with_binding(&self, name: &str, value: Value) -> Env<'_> {
        let mut bindings = self.bindings.clone();
        bindings.insert(name.to_string(), value);
        Env {
            root: self.root,
            now: self.now,
            bindings,
        }
    }
}

/// Evaluates `expr` against `doc` (the "current" document — for top-level
/// stage expressions this equals `env.root`, but nested `$map`/`$filter`
/// lambdas evaluate against the bound `$$this` instead).
pub fn eval(expr: &Expr, doc: &Value, env: &Env) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::ArrayLit(items) => Value::Array(items.iter().map(|e| eval(e, doc, env)).collect()),
        Expr::ObjectLit(pairs) => {
            let mut out = Doc::new();
            for (k, v) in pairs {
                out.insert(k.clone(), eval(v, doc, env));
            }
            Value::Object(out)
        }
        Expr::Field(path) => doc.get_path(path).value_or_null(),
        Expr::Var(var, path) => {
            let base = match var {
                SysVar::Root | SysVar::Current => env.root.clone(),
                SysVar::Now => Value::Date(env.now),
                SysVar::This => env.bindings.get("this").cloned().unwrap_or(Value::Null),
                SysVar::Value => env.bindings.get("value").cloned().unwrap_or(Value::Null),
            };
            match path {
                Some(p) => base.get_path(p).value_or_null(),
                None => base,
            }
        }
        Expr::BoundVar(name, path) => {
            let base = env.bindings.get(name).cloned().unwrap_or(Value::Null);
            match path {
                Some(p) => base.get_path(p).value_or_null(),
                None => base,
            }
        }
        Expr::Op(op, args) => eval_op(*op, args, doc, env),
        Expr::Cond { if_, then, else_ } => {
            if eval(if_, doc, env).is_truthy() {
                eval(then, doc, env)
            } else {
                eval(else_, doc, env)
            }
        }
        Expr::Switch { branches, default } => {
            for (case, then) in branches {
                if eval(case, doc, env).is_truthy() {
                    return eval(then, doc, env);
                }
            }
            match default {
                Some(d) => eval(d, doc, env),
                None => Value::Null,
            }
        }
        Expr::Map { input, as_, inner } => {
            let items = match eval(input, doc, env) {
                Value::Array(items) => items,
                Value::Null => return Value::Null,
                _ => return Value::Null,
            };
            let out: Vec<Value> = items
                .into_iter()
                .map(|item| {
                    let sub_env = env.with_binding(as_, item.clone());
                    let sub_env = sub_env.with_binding("this", item);
                    eval(inner, doc, &sub_env)
                })
                .collect();
            Value::Array(out)
        }
        Expr::Filter { input, as_, cond } => {
            let items = match eval(input, doc, env) {
                Value::Array(items) => items,
                Value::Null => return Value::Null,
                _ => return Value::Null,
            };
            let out: Vec<Value> = items
                .into_iter()
                .filter(|item| {
                    let sub_env = env.with_binding(as_, item.clone());
                    let sub_env = sub_env.with_binding("this", item.clone());
                    eval(cond, doc, &sub_env).is_truthy()
                })
                .collect();
            Value::Array(out)
        }
        Expr::Reduce {
            input,
            initial,
            inner,
        } => {
            let items = match eval(input, doc, env) {
                Value::Array(items) => items,
                Value::Null => return Value::Null,
                _ => return Value::Null,
            };
            let mut acc = eval(initial, doc, env);
            for item in items {
                let sub_env = env.with_binding("value", acc.clone());
                let sub_env = sub_env.with_binding("this", item);
                acc = eval(inner, doc, &sub_env);
            }
            acc
        }
    }
}

/// Evaluates a batch of documents against the same expression tree — the
/// vector interpreter entry point (C5), used as the fallback path once a
/// compiled-expression cache entry is marked megamorphic.
pub fn eval_batch(expr: &Expr, docs: &[Value], now: i64) -> Vec<Value> {
    docs.iter()
        .map(|doc| {
            let env = Env::new(doc, now);
            eval(expr, doc, &env)
        })
        .collect()
}

fn numeric_binop(a: &Value, b: &Value, f_i: impl Fn(i64, i64) -> Option<i64>, f_f: impl Fn(f64, f64) -> f64) -> Value {
    match (a, b) {
        (Value::Int64(x), Value::Int64(y)) => match f_i(*x, *y) {
            Some(v) => Value::Int64(v),
            None => Value::Null,
        },
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Value::Float64(f_f(x, y)),
            _ => Value::Null,
        },
    }
}

fn truthy_to_tribool(v: &Value) -> Tribool {
    match v {
        Value::Null => Tribool::Unknown,
        Value::Bool(b) => Tribool::from_bool(*b),
        _ => Tribool::from_bool(v.is_truthy()),
    }
}

fn tribool_to_value(t: Tribool) -> Value {
    match t {
        Tribool::True => Value::Bool(true),
        Tribool::False => Value::Bool(false),
        Tribool::Unknown => Value::Null,
    }
}

fn eval_op(op: Op, args: &[Expr], doc: &Value, env: &Env) -> Value {
    let vals: Vec<Value> = args.iter().map(|a| eval(a, doc, env)).collect();
    let arg = |i: usize| vals.get(i).cloned().unwrap_or(Value::Null);

    match op {
        Op::Add => vals.iter().fold(Value::Int64(0), |acc, v| {
            numeric_binop(&acc, v, |a, b| a.checked_add(b), |a, b| a + b)
        }),
        Op::Subtract => numeric_binop(&arg(0), &arg(1), |a, b| a.checked_sub(b), |a, b| a - b),
        Op::Multiply => vals.iter().fold(Value::Int64(1), |acc, v| {
            numeric_binop(&acc, v, |a, b| a.checked_mul(b), |a, b| a * b)
        }),
        Op::Divide => {
            let (a, b) = (arg(0), arg(1));
            match (a.as_f64(), b.as_f64()) {
                (Some(_), Some(b)) if b == 0.0 => Value::Null,
                (Some(a), Some(b)) => Value::Float64(a / b),
                _ => Value::Null,
            }
        }
        Op::Mod => {
            let (a, b) = (arg(0), arg(1));
            match (&a, &b) {
                (Value::Int64(x), Value::Int64(y)) if *y != 0 => Value::Int64(x % y),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) if y != 0.0 => Value::Float64(x % y),
                    _ => Value::Null,
                },
            }
        }
        Op::Abs => match arg(0) {
            Value::Int64(i) => Value::Int64(i.abs()),
            Value::Float64(f) => Value::Float64(f.abs()),
            _ => Value::Null,
        },
        Op::Trunc => match arg(0).as_f64() {
            Some(f) => Value::Float64(f.trunc()),
            None => Value::Null,
        },
        Op::Round => match arg(0).as_f64() {
            Some(f) => Value::Float64(f.round()),
            None => Value::Null,
        },
        Op::Sqrt => match arg(0).as_f64() {
            Some(f) if f >= 0.0 => Value::Float64(f.sqrt()),
            _ => Value::Null,
        },
        Op::Log10 => match arg(0).as_f64() {
            Some(f) if f > 0.0 => Value::Float64(f.log10()),
            _ => Value::Null,
        },
        Op::Eq => tribool_to_value(Tribool::from_bool(arg(0).predicate_eq(&arg(1)))),
        Op::Ne => tribool_to_value(Tribool::from_bool(!arg(0).predicate_eq(&arg(1)))),
        Op::Gt => compare_op(&arg(0), &arg(1), |o| o == std::cmp::Ordering::Greater),
        Op::Gte => compare_op(&arg(0), &arg(1), |o| o != std::cmp::Ordering::Less),
        Op::Lt => compare_op(&arg(0), &arg(1), |o| o == std::cmp::Ordering::Less),
        Op::Lte => compare_op(&arg(0), &arg(1), |o| o != std::cmp::Ordering::Greater),
        Op::And => {
            let t = vals
                .iter()
                .map(truthy_to_tribool)
                .fold(Tribool::True, Tribool::and);
            tribool_to_value(t)
        }
        Op::Or => {
            let t = vals
                .iter()
                .map(truthy_to_tribool)
                .fold(Tribool::False, Tribool::or);
            tribool_to_value(t)
        }
        Op::Not => tribool_to_value(truthy_to_tribool(&arg(0)).not()),
        Op::Concat => {
            let mut s = String::new();
            for v in &vals {
                match v {
                    Value::String(x) => s.push_str(x),
                    Value::Null => return Value::Null,
                    other => s.push_str(&value_to_display_string(other)),
                }
            }
            Value::String(s)
        }
        Op::ToLower => match arg(0) {
            Value::String(s) => Value::String(s.to_lowercase()),
            Value::Null => Value::Null,
            other => Value::String(value_to_display_string(&other).to_lowercase()),
        },
        Op::ToUpper => match arg(0) {
            Value::String(s) => Value::String(s.to_uppercase()),
            Value::Null => Value::Null,
            other => Value::String(value_to_display_string(&other).to_uppercase()),
        },
        Op::Substr => {
            let s = match arg(0) {
                Value::String(s) => s,
                _ => return Value::Null,
            };
            let start = arg(1).as_f64().unwrap_or(0.0) as i64;
            let len = arg(2).as_f64().unwrap_or(-1.0) as i64;
            let chars: Vec<char> = s.chars().collect();
            let start = start.max(0) as usize;
            if start >= chars.len() {
                return Value::String(String::new());
            }
            let end = if len < 0 {
                chars.len()
            } else {
                (start + len as usize).min(chars.len())
            };
            Value::String(chars[start..end].iter().collect())
        }
        Op::Split => {
            let s = match arg(0) {
                Value::String(s) => s,
                _ => return Value::Null,
            };
            let sep = match arg(1) {
                Value::String(s) => s,
                _ => return Value::Null,
            };
            Value::Array(s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect())
        }
        Op::StrLen => match arg(0) {
            Value::String(s) => Value::Int64(s.chars().count() as i64),
            _ => Value::Null,
        },
        Op::ToString => match arg(0) {
            Value::Null => Value::Null,
            other => Value::String(value_to_display_string(&other)),
        },
        Op::Size => match arg(0) {
            Value::Array(a) => Value::Int64(a.len() as i64),
            _ => Value::Null,
        },
        Op::ArrayElemAt => {
            let arr = match arg(0) {
                Value::Array(a) => a,
                _ => return Value::Null,
            };
            let idx = match arg(1) {
                Value::Int64(i) => i,
                _ => return Value::Null,
            };
            let resolved = if idx < 0 {
                arr.len() as i64 + idx
            } else {
                idx
            };
            if resolved < 0 || resolved as usize >= arr.len() {
                Value::Null
            } else {
                arr[resolved as usize].clone()
            }
        }
        Op::Push => {
            let mut arr = match arg(0) {
                Value::Array(a) => a,
                Value::Null => Vec::new(),
                _ => return Value::Null,
            };
            arr.push(arg(1));
            Value::Array(arr)
        }
        Op::AddToSet => {
            let mut arr = match arg(0) {
                Value::Array(a) => a,
                Value::Null => Vec::new(),
                _ => return Value::Null,
            };
            let v = arg(1);
            if !arr.iter().any(|x| x.predicate_eq(&v)) {
                arr.push(v);
            }
            Value::Array(arr)
        }
        Op::Slice => {
            let arr = match arg(0) {
                Value::Array(a) => a,
                _ => return Value::Null,
            };
            let n = match arg(1) {
                Value::Int64(i) => i,
                _ => return Value::Null,
            };
            let sliced = if n >= 0 {
                arr.into_iter().take(n as usize).collect()
            } else {
                let skip = (arr.len() as i64 + n).max(0) as usize;
                arr.into_iter().skip(skip).collect()
            };
            Value::Array(sliced)
        }
        Op::IndexOfArray => {
            let arr = match arg(0) {
                Value::Array(a) => a,
                _ => return Value::Null,
            };
            let target = arg(1);
            match arr.iter().position(|x| x.predicate_eq(&target)) {
                Some(i) => Value::Int64(i as i64),
                None => Value::Int64(-1),
            }
        }
        Op::ConcatArrays => {
            let mut out = Vec::new();
            for v in &vals {
                match v {
                    Value::Array(a) => out.extend(a.iter().cloned()),
                    Value::Null => return Value::Null,
                    _ => return Value::Null,
                }
            }
            Value::Array(out)
        }
        Op::MergeObjects => {
            let mut out = Doc::new();
            for v in &vals {
                if let Value::Object(d) = v {
                    for (k, val) in d.iter() {
                        out.insert(k.clone(), val.clone());
                    }
                }
            }
            Value::Object(out)
        }
        Op::Type => Value::String(
            match arg(0) {
                Value::Float64(f) if f.is_nan() => "number",
                other => match other {
                    Value::Int64(_) | Value::Float64(_) => "number",
                    Value::Bool(_) => "bool",
                    Value::String(_) => "string",
                    Value::Null => "null",
                    Value::Array(_) => "array",
                    Value::Object(_) => "object",
                    Value::Date(_) => "date",
                },
            }
            .to_string(),
        ),
        Op::IsNumber => Value::Bool(match arg(0) {
            Value::Float64(f) => !f.is_nan(),
            Value::Int64(_) => true,
            _ => false,
        }),
        Op::IsArray => Value::Bool(matches!(arg(0), Value::Array(_))),
        Op::IfNull => vals
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
        Op::Coalesce => vals
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
        Op::Month => date_field(&arg(0), |dt| dt.month() as i64),
        Op::Year => date_field(&arg(0), |dt| dt.year() as i64),
        Op::Hour => date_field(&arg(0), |dt| dt.hour() as i64),
        Op::DayOfWeek => date_field(&arg(0), |dt| {
            // Mongo: 1 (Sunday) .. 7 (Saturday); chrono Weekday starts at Monday=0.
            (dt.weekday().num_days_from_sunday() as i64) + 1
        }),
    }
}

fn compare_op(a: &Value, b: &Value, pass: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    if a.is_null() || b.is_null() {
        return Value::Bool(false);
    }
    if a.type_rank() != b.type_rank() {
        return Value::Null;
    }
    Value::Bool(pass(a.total_cmp(b)))
}

fn value_to_display_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Int64(i) => i.to_string(),
        Value::Float64(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Date(ms) => ms.to_string(),
        _ => String::new(),
    }
}

fn date_field(v: &Value, f: impl Fn(chrono::DateTime<chrono::Utc>) -> i64) -> Value {
    use chrono::TimeZone;
    let ms = match v {
        Value::Date(ms) => *ms,
        _ => return Value::Null,
    };
    match chrono::Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => Value::Int64(f(dt)),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ast::parse_expr;
    use serde_json::json;

    fn eval_json(expr_json: serde_json::Value, doc: &Value) -> Value {
        let expr = parse_expr(&expr_json).unwrap();
        let env = Env::new(doc, 0);
        eval(&expr, doc, &env)
    }

    #[test]
    fn divide_by_zero_is_null() {
        let doc = Value::Null;
        let v = eval_json(json!({"$divide": [1, 0]}), &doc);
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn and_or_three_valued() {
        let doc = {
            let mut d = Doc::new();
            d.insert("missing_placeholder".into(), Value::Null);
            Value::Object(d)
        };
        let v = eval_json(json!({"$and": ["$nope", false]}), &doc);
        assert_eq!(v, Value::Bool(false));
        let v = eval_json(json!({"$or": ["$nope", true]}), &doc);
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn reduce_sums_array() {
        let doc = {
            let mut d = Doc::new();
            d.insert(
                "items".into(),
                Value::Array(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]),
            );
            Value::Object(d)
        };
        let v = eval_json(
            json!({"$reduce": {"input": "$items", "initialValue": 0, "in": {"$add": ["$$value", "$$this"]}}}),
            &doc,
        );
        assert_eq!(v, Value::Int64(6));
    }

    #[test]
    fn map_and_filter() {
        let doc = {
            let mut d = Doc::new();
            d.insert(
                "items".into(),
                Value::Array(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]),
            );
            Value::Object(d)
        };
        let mapped = eval_json(
            json!({"$map": {"input": "$items", "as": "x", "in": {"$multiply": ["$$x", 2]}}}),
            &doc,
        );
        assert_eq!(
            mapped,
            Value::Array(vec![Value::Int64(2), Value::Int64(4), Value::Int64(6)])
        );

        let filtered = eval_json(
            json!({"$filter": {"input": "$items", "as": "x", "cond": {"$gt": ["$$x", 1]}}}),
            &doc,
        );
        assert_eq!(
            filtered,
            Value::Array(vec![Value::Int64(2), Value::Int64(3)])
        );
    }

    #[test]
    fn cond_and_switch() {
        let doc = Value::Null;
        let v = eval_json(json!({"$cond": [true, "yes", "no"]}), &doc);
        assert_eq!(v, Value::String("yes".into()));

        let v = eval_json(
            json!({"$switch": {"branches": [{"case": false, "then": 1}], "default": 2}}),
            &doc,
        );
        assert_eq!(v, Value::Int64(2));
    }

    #[test]
    fn comparison_cross_type_is_null() {
        let doc = Value::Null;
        let v = eval_json(json!({"$gt": ["a", 1]}), &doc);
        assert_eq!(v, Value::Null);
    }
}
