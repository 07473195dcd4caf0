#![allow(missing_docs)]

use proptest::prelude::*;
use serde_json::json;

use doclite::query::{DataSource, Expression, Ordering, QueryBuilder, SelectResult};

fn identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}"
}

proptest! {
    #[test]
    fn where_clause_ir_shape_is_stable(prop in identifier(), value in any::<i64>()) {
        let ir = QueryBuilder::select(vec![SelectResult::property(&prop)])
            .unwrap()
            .from(DataSource::collection("docs"))
            .where_(Expression::property(&prop).greater_than(Expression::int(value)))
            .ir();

        prop_assert_eq!(&ir["WHAT"], &json!([[".", prop.clone()]]));
        prop_assert_eq!(&ir["WHERE"], &json!([">", [".", prop], value]));
        prop_assert_eq!(&ir["FROM"], &json!([{"COLLECTION": "docs"}]));
    }

    #[test]
    fn compiling_twice_is_byte_identical(prop in identifier(), value in any::<i64>()) {
        let expr = Expression::property(&prop).less_than_or_equal_to(Expression::int(value));
        let first = serde_json::to_vec(&expr.compile()).unwrap();
        let second = serde_json::to_vec(&expr.compile()).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn retained_stages_never_observe_later_clauses(a in any::<i64>(), b in any::<i64>()) {
        let from = QueryBuilder::select(vec![SelectResult::property("n")])
            .unwrap()
            .from(DataSource::collection("docs"));

        let left = from.where_(Expression::property("n").equal_to(Expression::int(a)));
        let right = from.where_(Expression::property("n").equal_to(Expression::int(b)));

        prop_assert_eq!(&left.ir()["WHERE"], &json!(["=", [".", "n"], a]));
        prop_assert_eq!(&right.ir()["WHERE"], &json!(["=", [".", "n"], b]));
        prop_assert!(from.ir().get("WHERE").is_none());
    }

    #[test]
    fn optional_clauses_appear_only_when_set(limit in 0i64..1000, descending in any::<bool>()) {
        let from = QueryBuilder::select(vec![SelectResult::property("n")])
            .unwrap()
            .from(DataSource::collection("docs"));
        let bare = from.ir();
        prop_assert!(bare.get("ORDER_BY").is_none());
        prop_assert!(bare.get("LIMIT").is_none());
        prop_assert!(bare.get("DISTINCT").is_none());

        let ordering = if descending {
            Ordering::property("n").descending()
        } else {
            Ordering::property("n")
        };
        let full = from
            .order_by(vec![ordering])
            .unwrap()
            .limit(Expression::int(limit))
            .ir();
        prop_assert!(full.get("ORDER_BY").is_some());
        prop_assert_eq!(&full["LIMIT"], &json!(limit));
    }
}
