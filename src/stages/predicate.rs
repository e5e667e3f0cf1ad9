//! Mongo-style query predicates consumed by `$match` (and, for the boundary
//! contract, by the free `count`/`$match` entry points). Distinct from
//! [`crate::expr::Expr`] (used for computed values), though `$expr` predicates
//! embed an `Expr` and `$regex` reuses the `regex` crate shared with the
//! trigram prefilter (C12).

use regex::Regex;

use crate::error::{AggError, AggResult};
use crate::expr::ast::parse_expr;
use crate::expr::interpreter::{eval, Env};
use crate::expr::Expr;
use crate::value::{FieldLookup, Value};

#[derive(Debug, Clone)]
pub enum FieldCond {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(RegexCond),
}

#[derive(Debug, Clone)]
pub struct RegexCond {
    pub pattern: String,
    pub regex: Regex,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Nor(Vec<Predicate>),
    Field(String, Vec<FieldCond>),
    ExprPredicate(Expr),
    Text(Vec<String>),
    True,
}

/// Every `$regex` pattern appearing anywhere under this predicate, used by
/// the planner to decide whether a trigram prefilter is worth attaching.
pub fn collect_regex_patterns(pred: &Predicate, out: &mut Vec<(String, String)>) {
    match pred {
        Predicate::And(ps) | Predicate::Or(ps) | Predicate::Nor(ps) => {
            ps.iter().for_each(|p| collect_regex_patterns(p, out))
        }
        Predicate::Field(path, conds) => {
            for c in conds {
                if let FieldCond::Regex(r) = c {
                    out.push((path.clone(), r.pattern.clone()));
                }
            }
        }
        Predicate::ExprPredicate(_) | Predicate::Text(_) | Predicate::True => {}
    }
}

pub fn has_text_search(pred: &Predicate) -> bool {
    match pred {
        Predicate::And(ps) | Predicate::Or(ps) | Predicate::Nor(ps) => {
            ps.iter().any(has_text_search)
        }
        Predicate::Text(_) => true,
        _ => false,
    }
}

pub fn parse_predicate(json: &serde_json::Value) -> AggResult<Predicate> {
    let map = match json {
        serde_json::Value::Object(m) if m.is_empty() => return Ok(Predicate::True),
        serde_json::Value::Object(m) => m,
        _ => {
            return Err(AggError::ParseError {
                message: "$match predicate must be an object".to_string(),
            })
        }
    };

    let mut clauses = Vec::new();
    for (key, val) in map {
        match key.as_str() {
            "$and" => clauses.push(Predicate::And(parse_predicate_array(val)?)),
            "$or" => clauses.push(Predicate::Or(parse_predicate_array(val)?)),
            "$nor" => clauses.push(Predicate::Nor(parse_predicate_array(val)?)),
            "$expr" => clauses.push(Predicate::ExprPredicate(parse_expr(val)?)),
            "$text" => {
                let search = val
                    .get("$search")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| AggError::ParseError {
                        message: "$text requires $search".to_string(),
                    })?;
                let tokens = search
                    .split_whitespace()
                    .map(|t| t.to_lowercase())
                    .collect();
                clauses.push(Predicate::Text(tokens));
            }
            field => clauses.push(Predicate::Field(field.to_string(), parse_field_conds(val)?)),
        }
    }

    Ok(match clauses.len() {
        0 => Predicate::True,
        1 => clauses.into_iter().next().expect("len == 1"),
        _ => Predicate::And(clauses),
    })
}

fn parse_predicate_array(val: &serde_json::Value) -> AggResult<Vec<Predicate>> {
    let arr = val.as_array().ok_or_else(|| AggError::ParseError {
        message: "expected an array of predicates".to_string(),
    })?;
    arr.iter().map(parse_predicate).collect()
}

fn parse_field_conds(val: &serde_json::Value) -> AggResult<Vec<FieldCond>> {
    match val {
        serde_json::Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
            let mut conds = Vec::with_capacity(ops.len());
            for (op, operand) in ops {
                conds.push(parse_single_cond(op, operand)?);
            }
            Ok(conds)
        }
        other => Ok(vec![FieldCond::Eq(Value::from_json(other.clone()))]),
    }
}

fn parse_single_cond(op: &str, operand: &serde_json::Value) -> AggResult<FieldCond> {
    let v = || Value::from_json(operand.clone());
    Ok(match op {
        "$eq" => FieldCond::Eq(v()),
        "$ne" => FieldCond::Ne(v()),
        "$gt" => FieldCond::Gt(v()),
        "$gte" => FieldCond::Gte(v()),
        "$lt" => FieldCond::Lt(v()),
        "$lte" => FieldCond::Lte(v()),
        "$exists" => FieldCond::Exists(operand.as_bool().unwrap_or(true)),
        "$in" => FieldCond::In(
            operand
                .as_array()
                .ok_or_else(|| AggError::ParseError {
                    message: "$in requires an array".to_string(),
                })?
                .iter()
                .map(|j| Value::from_json(j.clone()))
                .collect(),
        ),
        "$nin" => FieldCond::Nin(
            operand
                .as_array()
                .ok_or_else(|| AggError::ParseError {
                    message: "$nin requires an array".to_string(),
                })?
                .iter()
                .map(|j| Value::from_json(j.clone()))
                .collect(),
        ),
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| AggError::ParseError {
                    message: "$regex requires a string pattern".to_string(),
                })?
                .to_string();
            let regex = Regex::new(&pattern).map_err(|e| AggError::ParseError {
                message: format!("invalid regex '{pattern}': {e}"),
            })?;
            FieldCond::Regex(RegexCond { pattern, regex })
        }
        other => {
            return Err(AggError::UnsupportedOperator {
                operator: other.to_string(),
            })
        }
    })
}

/// Evaluates `pred` against a document. `$exists` distinguishes missing
/// from explicit null; every other comparison on a missing field behaves as
/// though it compared against `Null` (so `{field: null}` matches both
/// present-null and missing, per the field-path resolution contract).
pub fn eval_predicate(pred: &Predicate, doc: &Value, root: &Value, now: i64) -> bool {
    match pred {
        Predicate::True => true,
        Predicate::And(ps) => ps.iter().all(|p| eval_predicate(p, doc, root, now)),
        Predicate::Or(ps) => ps.iter().any(|p| eval_predicate(p, doc, root, now)),
        Predicate::Nor(ps) => !ps.iter().any(|p| eval_predicate(p, doc, root, now)),
        Predicate::ExprPredicate(expr) => {
            let env = Env::new(root, now);
            eval(expr, doc, &env).is_truthy()
        }
        Predicate::Text(tokens) => {
            // Degrades to a full-document substring scan when no Bloom
            // prefilter narrows the candidate set (see C12); correctness
            // never depends on the prefilter.
            let haystack = document_text(doc).to_lowercase();
            tokens.iter().all(|t| haystack.contains(t.as_str()))
        }
        Predicate::Field(path, conds) => {
            let lookup = doc.get_path(path);
            conds.iter().all(|c| eval_field_cond(c, &lookup))
        }
    }
}

fn eval_field_cond(cond: &FieldCond, lookup: &FieldLookup) -> bool {
    match cond {
        FieldCond::Exists(want_present) => lookup.is_present() == *want_present,
        FieldCond::Eq(target) => match lookup {
            FieldLookup::Present(v) => v.predicate_eq(target),
            FieldLookup::Missing => target.is_null(),
        },
        FieldCond::Ne(target) => !eval_field_cond(&FieldCond::Eq(target.clone()), lookup),
        FieldCond::Gt(target) => compare_present(lookup, target, |o| o == std::cmp::Ordering::Greater),
        FieldCond::Gte(target) => compare_present(lookup, target, |o| o != std::cmp::Ordering::Less),
        FieldCond::Lt(target) => compare_present(lookup, target, |o| o == std::cmp::Ordering::Less),
        FieldCond::Lte(target) => compare_present(lookup, target, |o| o != std::cmp::Ordering::Greater),
        FieldCond::In(targets) => match lookup {
            FieldLookup::Present(v) => targets.iter().any(|t| v.predicate_eq(t)),
            FieldLookup::Missing => targets.iter().any(Value::is_null),
        },
        FieldCond::Nin(targets) => !eval_field_cond(&FieldCond::In(targets.clone()), lookup),
        FieldCond::Regex(r) => match lookup {
            FieldLookup::Present(Value::String(s)) => r.regex.is_match(s),
            _ => false,
        },
    }
}

fn compare_present(lookup: &FieldLookup, target: &Value, pass: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let value = match lookup {
        FieldLookup::Present(v) => v,
        FieldLookup::Missing => return false,
    };
    if value.is_null() || target.is_null() {
        return false;
    }
    if value.type_rank() != target.type_rank() {
        return false;
    }
    pass(value.total_cmp(target))
}

fn document_text(doc: &Value) -> String {
    match doc {
        Value::String(s) => s.clone(),
        Value::Object(d) => d
            .iter()
            .map(|(_, v)| document_text(v))
            .collect::<Vec<_>>()
            .join(" "),
        Value::Array(items) => items
            .iter()
            .map(document_text)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}
