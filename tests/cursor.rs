#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::json;

use doclite::engine::{MemoryEngine, Store};
use doclite::query::{DataSource, Expression, Ordering, QueryBuilder, SelectResult, Value};
use doclite::DbError;

fn store_with_names(names: &[&str]) -> Store {
    let engine = MemoryEngine::new();
    for name in names {
        engine.insert("users", json!({"name": name}));
    }
    Store::new(Arc::new(engine))
}

fn names_query(store: &Store) -> doclite::query::Query {
    QueryBuilder::select(vec![SelectResult::property("name")])
        .unwrap()
        .from(DataSource::collection("users"))
        .order_by(vec![Ordering::property("name")])
        .unwrap()
        .create_query(store)
}

#[test]
fn enumerator_is_single_use() {
    let store = store_with_names(&["Al", "Bob"]);
    let results = names_query(&store).execute().expect("execute");

    let rows: Vec<_> = results.iter().expect("first iter").collect();
    assert_eq!(rows.len(), 2);

    assert!(matches!(results.iter(), Err(DbError::AlreadyEnumerated)));
}

#[test]
fn next_after_exhaustion_keeps_returning_none() {
    let store = store_with_names(&["Al"]);
    let results = names_query(&store).execute().expect("execute");

    let mut iter = results.iter().expect("iter");
    assert!(iter.next().is_some());
    assert!(iter.next().is_none());
    assert!(iter.next().is_none());
    assert!(results.error().is_none());
}

#[test]
fn all_results_materializes_in_order() {
    let store = store_with_names(&["Cy", "Al", "Bob"]);
    let results = names_query(&store).execute().expect("execute");

    let names: Vec<Option<Value>> = results
        .all_results()
        .iter()
        .map(|row| row.get("name"))
        .collect();
    assert_eq!(
        names,
        vec![Some("Al".into()), Some("Bob".into()), Some("Cy".into())]
    );
}

#[test]
fn seek_supports_random_access_with_range_check() {
    let store = store_with_names(&["Al", "Bob"]);
    let results = names_query(&store).execute().expect("execute");

    let row = results.row_at(1).expect("seek");
    assert_eq!(row.get("name"), Some("Bob".into()));

    match results.row_at(5) {
        Err(DbError::InvalidIndex { index, len }) => {
            assert_eq!(index, 5);
            assert_eq!(len, 2);
        }
        other => panic!("expected InvalidIndex, got {other:?}"),
    }
}

#[test]
fn empty_cursor_has_no_error_and_no_rows() {
    let store = store_with_names(&[]);
    let results = names_query(&store).execute().expect("execute");
    assert!(results.all_results().is_empty());
    assert!(results.error().is_none());
}

#[test]
fn row_lookup_by_index_and_dict() {
    let store = store_with_names(&["Al"]);
    let results = names_query(&store).execute().expect("execute");
    let rows = results.all_results();
    assert_eq!(rows[0].get_at(0), Some("Al".into()));
    assert_eq!(rows[0].column_names(), ["name"]);
    let dict = rows[0].to_dict();
    assert_eq!(dict.get("name"), Some(&"Al".into()));
}

#[test]
fn disposal_invalidates_open_cursors() {
    let store = store_with_names(&["Al", "Bob"]);
    let query = names_query(&store);
    let results = query.execute().expect("execute");

    query.dispose();
    assert!(results.all_results().is_empty());
}

#[test]
fn projected_expression_gets_provisional_name() {
    let store = store_with_names(&["Al"]);
    let query = QueryBuilder::select(vec![SelectResult::expression(
        Expression::int(1).add(Expression::int(2)),
    )])
    .unwrap()
    .from(DataSource::collection("users"))
    .create_query(&store);

    let results = query.execute().expect("execute");
    assert_eq!(results.column_names(), ["$1"]);
    let rows = results.all_results();
    assert_eq!(rows[0].get_at(0), Some(Value::Int(3)));
}
