//! Expression AST (C4).
//!
//! Parses the Mongo-style expression-object grammar (`{"$add": [...]}`,
//! field refs (`"$a.b"`), system variables (`"$$ROOT"`), literals, object
//! literals, and the three variable-binding forms `$map`/`$filter`/`$reduce`)
//! into an [`Expr`] tree.

use std::hash::{Hash, Hasher};

use crate::error::{AggError, AggResult};
use crate::value::Value;

/// Built-in operator identifiers. Distinguished from arbitrary strings so
/// that the compiler can key its cache on a stable discriminant rather than
/// on operator names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Trunc,
    Round,
    Sqrt,
    Log10,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    Concat,
    ToLower,
    ToUpper,
    Substr,
    Split,
    StrLen,
    ToString,
    Size,
    ArrayElemAt,
    Push,
    AddToSet,
    Slice,
    IndexOfArray,
    ConcatArrays,
    MergeObjects,
    Type,
    IsNumber,
    IsArray,
    IfNull,
    Coalesce,
    Month,
    Year,
    Hour,
    DayOfWeek,
}

impl Op {
    fn from_name(name: &str) -> Option<Op> {
        use Op::*;
        Some(match name {
            "$add" => Add,
            "$subtract" => Subtract,
            "$multiply" => Multiply,
            "$divide" => Divide,
            "$mod" => Mod,
            "$abs" => Abs,
            "$trunc" => Trunc,
            "$round" => Round,
            "$sqrt" => Sqrt,
            "$log10" => Log10,
            "$eq" => Eq,
            "$ne" => Ne,
            "$gt" => Gt,
            "$gte" => Gte,
            "$lt" => Lt,
            "$lte" => Lte,
            "$and" => And,
            "$or" => Or,
            "$not" => Not,
            "$concat" => Concat,
            "$toLower" => ToLower,
            "$toUpper" => ToUpper,
            "$substr" | "$substrBytes" | "$substrCP" => Substr,
            "$split" => Split,
            "$strLen" | "$strLenCP" | "$strLenBytes" => StrLen,
            "$toString" => ToString,
            "$size" => Size,
            "$arrayElemAt" => ArrayElemAt,
            "$push" => Push,
            "$addToSet" => AddToSet,
            "$slice" => Slice,
            "$indexOfArray" => IndexOfArray,
            "$concatArrays" => ConcatArrays,
            "$mergeObjects" => MergeObjects,
            "$type" => Type,
            "$isNumber" => IsNumber,
            "$isArray" => IsArray,
            "$ifNull" => IfNull,
            "$coalesce" => Coalesce,
            "$month" => Month,
            "$year" => Year,
            "$hour" => Hour,
            "$dayOfWeek" => DayOfWeek,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use Op::*;
        match self {
            Add => "$add",
            Subtract => "$subtract",
            Multiply => "$multiply",
            Divide => "$divide",
            Mod => "$mod",
            Abs => "$abs",
            Trunc => "$trunc",
            Round => "$round",
            Sqrt => "$sqrt",
            Log10 => "$log10",
            Eq => "$eq",
            Ne => "$ne",
            Gt => "$gt",
            Gte => "$gte",
            Lt => "$lt",
            Lte => "$lte",
            And => "$and",
            Or => "$or",
            Not => "$not",
            Concat => "$concat",
            ToLower => "$toLower",
            ToUpper => "$toUpper",
            Substr => "$substr",
            Split => "$split",
            StrLen => "$strLen",
            ToString => "$toString",
            Size => "$size",
            ArrayElemAt => "$arrayElemAt",
            Push => "$push",
            AddToSet => "$addToSet",
            Slice => "$slice",
            IndexOfArray => "$indexOfArray",
            ConcatArrays => "$concatArrays",
            MergeObjects => "$mergeObjects",
            Type => "$type",
            IsNumber => "$isNumber",
            IsArray => "$isArray",
            IfNull => "$ifNull",
            Coalesce => "$coalesce",
            Month => "$month",
            Year => "$year",
            Hour => "$hour",
            DayOfWeek => "$dayOfWeek",
        }
    }
}

/// System variable references (`$$ROOT`, `$$NOW`, `$$CURRENT`, `$$this`,
/// `$$value`), with an optional dotted suffix path (`$$ROOT.a.b`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SysVar {
    Root,
    Current,
    Now,
    This,
    Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    ArrayLit(Vec<Expr>),
    ObjectLit(Vec<(String, Expr)>),
    Field(String),
    Var(SysVar, Option<String>),
    /// A `$$<name>` reference to a user-bound variable — the `as` of an
    /// enclosing `$map`/`$filter`, not one of the reserved system
    /// variables. Resolved against `Env::bindings` at evaluation time.
    BoundVar(String, Option<String>),
    Op(Op, Vec<Expr>),
    Cond {
        if_: Box<Expr>,
        then: Box<Expr>,
        else_: Box<Expr>,
    },
    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    Map {
        input: Box<Expr>,
        as_: String,
        inner: Box<Expr>,
    },
    Filter {
        input: Box<Expr>,
        as_: String,
        cond: Box<Expr>,
    },
    Reduce {
        input: Box<Expr>,
        initial: Box<Expr>,
        inner: Box<Expr>,
    },
}

/// Every dotted field path referenced anywhere in the tree, used to build a
/// type vector for the compiler cache key.
pub fn referenced_fields(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Field(path) => out.push(path.clone()),
        Expr::Literal(_) => {}
        Expr::ArrayLit(items) => items.iter().for_each(|e| referenced_fields(e, out)),
        Expr::ObjectLit(pairs) => pairs.iter().for_each(|(_, e)| referenced_fields(e, out)),
        Expr::Var(_, Some(path)) => out.push(path.clone()),
        Expr::Var(_, None) => {}
        Expr::BoundVar(_, Some(path)) => out.push(path.clone()),
        Expr::BoundVar(_, None) => {}
        Expr::Op(_, args) => args.iter().for_each(|e| referenced_fields(e, out)),
        Expr::Cond { if_, then, else_ } => {
            referenced_fields(if_, out);
            referenced_fields(then, out);
            referenced_fields(else_, out);
        }
        Expr::Switch { branches, default } => {
            for (c, v) in branches {
                referenced_fields(c, out);
                referenced_fields(v, out);
            }
            if let Some(d) = default {
                referenced_fields(d, out);
            }
        }
        Expr::Map { input, inner, .. } => {
            referenced_fields(input, out);
            referenced_fields(inner, out);
        }
        Expr::Filter { input, cond, .. } => {
            referenced_fields(input, out);
            referenced_fields(cond, out);
        }
        Expr::Reduce {
            input,
            initial,
            inner,
        } => {
            referenced_fields(input, out);
            referenced_fields(initial, out);
            referenced_fields(inner, out);
        }
    }
}

/// A structural hash of the AST shape (not of observed runtime values),
/// used as the `astHash` half of the compiler cache key.
pub fn hash_expr(expr: &Expr) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    hash_expr_into(expr, &mut hasher);
    hasher.finish()
}

fn hash_expr_into<H: Hasher>(expr: &Expr, hasher: &mut H) {
    match expr {
        Expr::Literal(v) => {
            0u8.hash(hasher);
            hash_value_shape(v, hasher);
        }
        Expr::ArrayLit(items) => {
            1u8.hash(hasher);
            items.len().hash(hasher);
            for i in items {
                hash_expr_into(i, hasher);
            }
        }
        Expr::ObjectLit(pairs) => {
            2u8.hash(hasher);
            for (k, v) in pairs {
                k.hash(hasher);
                hash_expr_into(v, hasher);
            }
        }
        Expr::Field(path) => {
            3u8.hash(hasher);
            path.hash(hasher);
        }
        Expr::Var(v, path) => {
            4u8.hash(hasher);
            v.hash(hasher);
            path.hash(hasher);
        }
        Expr::BoundVar(name, path) => {
            11u8.hash(hasher);
            name.hash(hasher);
            path.hash(hasher);
        }
        Expr::Op(op, args) => {
            5u8.hash(hasher);
            op.hash(hasher);
            for a in args {
                hash_expr_into(a, hasher);
            }
        }
        Expr::Cond { if_, then, else_ } => {
            6u8.hash(hasher);
            hash_expr_into(if_, hasher);
            hash_expr_into(then, hasher);
            hash_expr_into(else_, hasher);
        }
        Expr::Switch { branches, default } => {
            7u8.hash(hasher);
            for (c, v) in branches {
                hash_expr_into(c, hasher);
                hash_expr_into(v, hasher);
            }
            if let Some(d) = default {
                hash_expr_into(d, hasher);
            }
        }
        Expr::Map { input, as_, inner } => {
            8u8.hash(hasher);
            hash_expr_into(input, hasher);
            as_.hash(hasher);
            hash_expr_into(inner, hasher);
        }
        Expr::Filter { input, as_, cond } => {
            9u8.hash(hasher);
            hash_expr_into(input, hasher);
            as_.hash(hasher);
            hash_expr_into(cond, hasher);
        }
        Expr::Reduce {
            input,
            initial,
            inner,
        } => {
            10u8.hash(hasher);
            hash_expr_into(input, hasher);
            hash_expr_into(initial, hasher);
            hash_expr_into(inner, hasher);
        }
    }
}

fn hash_value_shape<H: Hasher>(v: &Value, hasher: &mut H) {
    // Literals are part of the AST shape, but floats aren't `Hash`; hash
    // their bit pattern so structurally-identical literals collide and
    // NaN doesn't panic.
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int64(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Float64(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::String(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Date(d) => {
            5u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Array(items) => {
            6u8.hash(hasher);
            for i in items {
                hash_value_shape(i, hasher);
            }
        }
        Value::Object(doc) => {
            7u8.hash(hasher);
            for (k, v) in doc.iter() {
                k.hash(hasher);
                hash_value_shape(v, hasher);
            }
        }
    }
}

/// Parses an expression spec (already-decoded JSON) into an [`Expr`] tree.
pub fn parse_expr(json: &serde_json::Value) -> AggResult<Expr> {
    match json {
        serde_json::Value::String(s) => parse_string_expr(s),
        serde_json::Value::Array(items) => {
            let parsed = items
                .iter()
                .map(parse_expr)
                .collect::<AggResult<Vec<_>>>()?;
            Ok(Expr::ArrayLit(parsed))
        }
        serde_json::Value::Object(map) => parse_object_expr(map),
        other => Ok(Expr::Literal(Value::from_json(other.clone()))),
    }
}

fn parse_string_expr(s: &str) -> AggResult<Expr> {
    if let Some(rest) = s.strip_prefix("$$") {
        let (name, path) = match rest.split_once('.') {
            Some((n, p)) => (n, Some(p.to_string())),
            None => (rest, None),
        };
        let var = match name {
            "ROOT" => SysVar::Root,
            "CURRENT" => SysVar::Current,
            "NOW" => SysVar::Now,
            "this" => SysVar::This,
            "value" => SysVar::Value,
            other => return Ok(Expr::BoundVar(other.to_string(), path)),
        };
        return Ok(Expr::Var(var, path));
    }
    if let Some(path) = s.strip_prefix('$') {
        if path.is_empty() {
            return Err(AggError::ParseError {
                message: "empty field reference '$'".to_string(),
            });
        }
        return Ok(Expr::Field(path.to_string()));
    }
    Ok(Expr::Literal(Value::String(s.to_string())))
}

fn parse_object_expr(map: &serde_json::Map<String, serde_json::Value>) -> AggResult<Expr> {
    if map.len() == 1 {
        let (key, val) = map.iter().next().expect("len == 1");
        if key.starts_with('$') {
            return parse_operator_form(key, val);
        }
    }
    let mut pairs = Vec::with_capacity(map.len());
    for (k, v) in map {
        pairs.push((k.clone(), parse_expr(v)?));
    }
    Ok(Expr::ObjectLit(pairs))
}

fn args_vec(val: &serde_json::Value) -> AggResult<Vec<Expr>> {
    match val {
        serde_json::Value::Array(items) => items.iter().map(parse_expr).collect(),
        other => Ok(vec![parse_expr(other)?]),
    }
}

fn parse_operator_form(key: &str, val: &serde_json::Value) -> AggResult<Expr> {
    match key {
        "$cond" => parse_cond(val),
        "$switch" => parse_switch(val),
        "$ifNull" => Ok(Expr::Op(Op::IfNull, args_vec(val)?)),
        "$coalesce" => Ok(Expr::Op(Op::Coalesce, args_vec(val)?)),
        "$map" => parse_map(val),
        "$filter" => parse_filter(val),
        "$reduce" => parse_reduce(val),
        "$literal" => Ok(Expr::Literal(Value::from_json(val.clone()))),
        _ => {
            if let Some(op) = Op::from_name(key) {
                Ok(Expr::Op(op, args_vec(val)?))
            } else {
                Err(AggError::UnsupportedOperator {
                    operator: key.to_string(),
                })
            }
        }
    }
}

fn field(obj: &serde_json::Value, name: &str) -> Option<serde_json::Value> {
    obj.get(name).cloned()
}

fn parse_cond(val: &serde_json::Value) -> AggResult<Expr> {
    if let serde_json::Value::Array(items) = val {
        if items.len() == 3 {
            return Ok(Expr::Cond {
                if_: Box::new(parse_expr(&items[0])?),
                then: Box::new(parse_expr(&items[1])?),
                else_: Box::new(parse_expr(&items[2])?),
            });
        }
    }
    let if_ = field(val, "if").ok_or_else(|| AggError::ParseError {
        message: "$cond requires 'if'".to_string(),
    })?;
    let then = field(val, "then").ok_or_else(|| AggError::ParseError {
        message: "$cond requires 'then'".to_string(),
    })?;
    let else_ = field(val, "else").ok_or_else(|| AggError::ParseError {
        message: "$cond requires 'else'".to_string(),
    })?;
    Ok(Expr::Cond {
        if_: Box::new(parse_expr(&if_)?),
        then: Box::new(parse_expr(&then)?),
        else_: Box::new(parse_expr(&else_)?),
    })
}

fn parse_switch(val: &serde_json::Value) -> AggResult<Expr> {
    let branches_json = field(val, "branches").ok_or_else(|| AggError::ParseError {
        message: "$switch requires 'branches'".to_string(),
    })?;
    let branches_arr = branches_json.as_array().ok_or_else(|| AggError::ParseError {
        message: "$switch 'branches' must be an array".to_string(),
    })?;
    let mut branches = Vec::with_capacity(branches_arr.len());
    for b in branches_arr {
        let case = field(b, "case").ok_or_else(|| AggError::ParseError {
            message: "$switch branch requires 'case'".to_string(),
        })?;
        let then = field(b, "then").ok_or_else(|| AggError::ParseError {
            message: "$switch branch requires 'then'".to_string(),
        })?;
        branches.push((parse_expr(&case)?, parse_expr(&then)?));
    }
    let default = match field(val, "default") {
        Some(d) => Some(Box::new(parse_expr(&d)?)),
        None => None,
    };
    Ok(Expr::Switch { branches, default })
}

fn parse_map(val: &serde_json::Value) -> AggResult<Expr> {
    let input = field(val, "input").ok_or_else(|| AggError::ParseError {
        message: "$map requires 'input'".to_string(),
    })?;
    let as_ = field(val, "as")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "this".to_string());
    let inner = field(val, "in").ok_or_else(|| AggError::ParseError {
        message: "$map requires 'in'".to_string(),
    })?;
    Ok(Expr::Map {
        input: Box::new(parse_expr(&input)?),
        as_,
        inner: Box::new(parse_expr(&inner)?),
    })
}

fn parse_filter(val: &serde_json::Value) -> AggResult<Expr> {
    let input = field(val, "input").ok_or_else(|| AggError::ParseError {
        message: "$filter requires 'input'".to_string(),
    })?;
    let as_ = field(val, "as")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "this".to_string());
    let cond = field(val, "cond").ok_or_else(|| AggError::ParseError {
        message: "$filter requires 'cond'".to_string(),
    })?;
    Ok(Expr::Filter {
        input: Box::new(parse_expr(&input)?),
        as_,
        cond: Box::new(parse_expr(&cond)?),
    })
}

fn parse_reduce(val: &serde_json::Value) -> AggResult<Expr> {
    let input = field(val, "input").ok_or_else(|| AggError::ParseError {
        message: "$reduce requires 'input'".to_string(),
    })?;
    let initial = field(val, "initialValue").ok_or_else(|| AggError::ParseError {
        message: "$reduce requires 'initialValue'".to_string(),
    })?;
    let inner = field(val, "in").ok_or_else(|| AggError::ParseError {
        message: "$reduce requires 'in'".to_string(),
    })?;
    Ok(Expr::Reduce {
        input: Box::new(parse_expr(&input)?),
        initial: Box::new(parse_expr(&initial)?),
        inner: Box::new(parse_expr(&inner)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_field_ref_and_literal() {
        assert_eq!(parse_expr(&json!("$a.b")).unwrap(), Expr::Field("a.b".into()));
        assert_eq!(
            parse_expr(&json!("literal")).unwrap(),
            Expr::Literal(Value::String("literal".into()))
        );
    }

    #[test]
    fn parses_system_var_with_suffix() {
        assert_eq!(
            parse_expr(&json!("$$ROOT.a")).unwrap(),
            Expr::Var(SysVar::Root, Some("a".into()))
        );
        assert_eq!(parse_expr(&json!("$$NOW")).unwrap(), Expr::Var(SysVar::Now, None));
    }

    #[test]
    fn parses_bound_var_for_custom_as_name() {
        assert_eq!(
            parse_expr(&json!("$$x")).unwrap(),
            Expr::BoundVar("x".into(), None)
        );
        assert_eq!(
            parse_expr(&json!("$$x.y")).unwrap(),
            Expr::BoundVar("x".into(), Some("y".into()))
        );
    }

    #[test]
    fn parses_operator_with_array_args() {
        let e = parse_expr(&json!({"$add": ["$a", 1]})).unwrap();
        assert_eq!(
            e,
            Expr::Op(Op::Add, vec![Expr::Field("a".into()), Expr::Literal(Value::Int64(1))])
        );
    }

    #[test]
    fn parses_cond_object_form() {
        let e = parse_expr(&json!({"$cond": {"if": "$a", "then": 1, "else": 2}})).unwrap();
        match e {
            Expr::Cond { .. } => {}
            _ => panic!("expected Cond"),
        }
    }

    #[test]
    fn unknown_operator_is_unsupported() {
        let err = parse_expr(&json!({"$function": {"body": "x", "args": [], "lang": "js"}}));
        assert!(matches!(err, Err(AggError::UnsupportedOperator { .. })));
    }

    #[test]
    fn hash_is_stable_for_equal_trees() {
        let a = parse_expr(&json!({"$add": ["$a", 1]})).unwrap();
        let b = parse_expr(&json!({"$add": ["$a", 1]})).unwrap();
        assert_eq!(hash_expr(&a), hash_expr(&b));
    }
}
