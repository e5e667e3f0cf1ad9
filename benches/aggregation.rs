//! Aggregation performance benchmarks: match+project, group+sort, and
//! unwind over varying collection sizes.

use std::time::Duration;

use aggpipe::collection::aggregate;
use aggpipe::value::{Doc, Value};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn make_docs(size: u32) -> Vec<Value> {
    (0..size)
        .map(|i| {
            let mut d = Doc::new();
            d.insert("_id".to_string(), Value::Int64(i as i64));
            d.insert("cat".to_string(), Value::String(format!("cat-{}", i % 10)));
            d.insert("v".to_string(), Value::Int64(i as i64));
            d.insert(
                "tags".to_string(),
                Value::Array(vec![Value::String("x".to_string()), Value::String("y".to_string())]),
            );
            Value::Object(d)
        })
        .collect()
}

fn bench_match_project(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_project");
    for size in [1_000u32, 10_000] {
        let docs = make_docs(size);
        let pipeline = vec![
            json!({"$match": {"v": {"$gte": 0}}}),
            json!({"$project": {"cat": 1, "v": 1}}),
        ];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| aggregate(&docs, &pipeline, None).unwrap());
        });
    }
    group.finish();
}

fn bench_group_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_sort");
    for size in [1_000u32, 10_000] {
        let docs = make_docs(size);
        let pipeline = vec![
            json!({"$group": {"_id": "$cat", "total": {"$sum": "$v"}}}),
            json!({"$sort": {"_id": 1}}),
        ];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| aggregate(&docs, &pipeline, None).unwrap());
        });
    }
    group.finish();
}

fn bench_unwind(c: &mut Criterion) {
    let mut group = c.benchmark_group("unwind");
    for size in [1_000u32, 10_000] {
        let docs = make_docs(size);
        let pipeline = vec![json!({"$unwind": "$tags"})];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| aggregate(&docs, &pipeline, None).unwrap());
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(3));
    targets = bench_match_project, bench_group_sort, bench_unwind
}
criterion_main!(benches);
