//! End-to-end scenarios against the public library surface (§6/§8). Each
//! test mirrors one concrete, literal-input scenario from the testable
//! properties list, plus a couple of the universal invariants that are
//! cheap to check directly (no proptest machinery needed for these).

use aggpipe::collection::{aggregate, create_streaming_collection, count, match_stage};
use aggpipe::value::{Doc, Value};
use serde_json::json;

fn doc(pairs: &[(&str, Value)]) -> Value {
    let mut d = Doc::new();
    for (k, v) in pairs {
        d.insert((*k).to_string(), v.clone());
    }
    Value::Object(d)
}

fn get<'a>(doc: &'a Value, field: &str) -> &'a Value {
    doc.as_object().and_then(|d| d.get(field)).expect("field present")
}

#[test]
fn scenario_1_match_then_project() {
    let docs = vec![
        doc(&[("_id", Value::Int64(1)), ("a", Value::Int64(1))]),
        doc(&[("_id", Value::Int64(2)), ("a", Value::Int64(2))]),
        doc(&[("_id", Value::Int64(3)), ("a", Value::Int64(3))]),
    ];
    let pipeline = vec![
        json!({"$match": {"a": {"$gte": 2}}}),
        json!({"$project": {"a": 1, "_id": 0}}),
    ];
    let out = aggregate(&docs, &pipeline, None).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(get(&out[0], "a"), &Value::Int64(2));
    assert_eq!(get(&out[1], "a"), &Value::Int64(3));
    assert!(out[0].as_object().unwrap().get("_id").is_none());
}

#[test]
fn scenario_2_unwind_preserves_parent_id() {
    let docs = vec![
        doc(&[
            ("_id", Value::Int64(1)),
            ("tags", Value::Array(vec![Value::String("red".to_string()), Value::String("blue".to_string())])),
        ]),
        doc(&[("_id", Value::Int64(2)), ("tags", Value::Array(vec![Value::String("green".to_string())]))]),
    ];
    let pipeline = vec![json!({"$unwind": "$tags"})];
    let out = aggregate(&docs, &pipeline, None).unwrap();
    assert_eq!(out.len(), 3);
    let tags: Vec<&str> = out.iter().map(|d| get(d, "tags").as_str().unwrap()).collect();
    assert_eq!(tags, vec!["red", "blue", "green"]);
    assert_eq!(get(&out[0], "_id"), &Value::Int64(1));
    assert_eq!(get(&out[1], "_id"), &Value::Int64(1));
    assert_eq!(get(&out[2], "_id"), &Value::Int64(2));
}

#[test]
fn scenario_3_group_by_category_then_sort() {
    let docs = vec![
        doc(&[("cat", Value::String("A".to_string())), ("v", Value::Int64(10))]),
        doc(&[("cat", Value::String("A".to_string())), ("v", Value::Int64(20))]),
        doc(&[("cat", Value::String("B".to_string())), ("v", Value::Int64(5))]),
    ];
    let pipeline = vec![
        json!({"$group": {"_id": "$cat", "total": {"$sum": "$v"}}}),
        json!({"$sort": {"_id": 1}}),
    ];
    let out = aggregate(&docs, &pipeline, None).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(get(&out[0], "_id"), &Value::String("A".to_string()));
    assert_eq!(get(&out[0], "total"), &Value::Int64(30));
    assert_eq!(get(&out[1], "_id"), &Value::String("B".to_string()));
    assert_eq!(get(&out[1], "total"), &Value::Int64(5));
}

#[test]
fn scenario_4_project_computed_bool_then_limit() {
    let docs = vec![
        doc(&[("s", Value::Int64(95))]),
        doc(&[("s", Value::Int64(85))]),
        doc(&[("s", Value::Int64(90))]),
    ];
    let pipeline = vec![
        json!({"$project": {"passed": {"$gte": ["$s", 90]}}}),
        json!({"$limit": 2}),
    ];
    let out = aggregate(&docs, &pipeline, None).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(get(&out[0], "passed"), &Value::Bool(true));
    assert_eq!(get(&out[1], "passed"), &Value::Bool(false));
}

#[test]
fn scenario_5_incremental_add_and_remove() {
    let mut coll = create_streaming_collection(vec![doc(&[("x", Value::Int64(1))])]);
    let pipeline = vec![json!({"$group": {"_id": null, "sum": {"$sum": "$x"}}})];

    let out = coll.stream(&pipeline).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(get(&out[0], "sum"), &Value::Int64(1));

    coll.add_bulk(vec![doc(&[("x", Value::Int64(2))]), doc(&[("x", Value::Int64(3))])]);
    let out = coll.stream(&pipeline).unwrap();
    assert_eq!(get(&out[0], "sum"), &Value::Int64(6));

    coll.remove(0).unwrap();
    let out = coll.stream(&pipeline).unwrap();
    assert_eq!(get(&out[0], "sum"), &Value::Int64(5));
}

#[test]
fn scenario_6_cross_run_isolation_group_then_unwind() {
    let docs = vec![
        doc(&[
            ("_id", Value::Int64(1)),
            ("category", Value::String("A".to_string())),
            ("items", Value::Array(vec![Value::String("x".to_string()), Value::String("y".to_string())])),
        ]),
        doc(&[
            ("_id", Value::Int64(2)),
            ("category", Value::String("A".to_string())),
            ("items", Value::Array(vec![Value::String("z".to_string())])),
        ]),
        doc(&[
            ("_id", Value::Int64(3)),
            ("category", Value::String("B".to_string())),
            ("items", Value::Array(vec![Value::String("w".to_string())])),
        ]),
    ];

    let grouped = aggregate(
        &docs,
        &[json!({"$group": {"_id": "$category", "total": {"$sum": 1}}})],
        None,
    )
    .unwrap();
    assert_eq!(grouped.len(), 2);

    let unwound = aggregate(&docs, &[json!({"$unwind": "$items"})], None).unwrap();
    assert_eq!(unwound.len(), 4);
    for d in &unwound {
        let obj = d.as_object().unwrap();
        assert!(obj.get("category").is_some());
        assert!(obj.get("items").unwrap().as_str().is_some());
        assert!(obj.get("total").is_none(), "accumulator field leaked across runs");
    }
}

#[test]
fn invariant_empty_collection_never_errors() {
    let docs: Vec<Value> = Vec::new();
    let pipeline = vec![
        json!({"$match": {"a": 1}}),
        json!({"$group": {"_id": "$a", "n": {"$sum": 1}}}),
        json!({"$sort": {"_id": 1}}),
    ];
    let out = aggregate(&docs, &pipeline, None).unwrap();
    assert!(out.is_empty());
}

#[test]
fn invariant_count_matches_match_stage_length() {
    let docs = vec![
        doc(&[("a", Value::Int64(1))]),
        doc(&[("a", Value::Int64(2))]),
        doc(&[("a", Value::Int64(3))]),
    ];
    let query = json!({"a": {"$gte": 2}});
    let n = count(&docs, &query).unwrap();
    let matched = match_stage(&docs, &query).unwrap();
    assert_eq!(n, matched.len());
}

#[test]
fn invariant_repeated_run_is_idempotent() {
    let docs = vec![doc(&[("a", Value::Int64(1))]), doc(&[("a", Value::Int64(2))])];
    let pipeline = vec![json!({"$match": {"a": {"$gte": 1}}})];
    let first = aggregate(&docs, &pipeline, None).unwrap();
    let second = aggregate(&docs, &pipeline, None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn invariant_division_by_zero_yields_null_not_error() {
    let docs = vec![doc(&[("a", Value::Int64(10)), ("b", Value::Int64(0))])];
    let pipeline = vec![json!({"$project": {"q": {"$divide": ["$a", "$b"]}}})];
    let out = aggregate(&docs, &pipeline, None).unwrap();
    assert_eq!(get(&out[0], "q"), &Value::Null);
}
