//! The query builder chain.
//!
//! One immutable accumulator ([`QuerySpec`]) is threaded through typed
//! stage structs; every transition copies the accumulated state, so a
//! retained intermediate stage can be branched from freely without later
//! stages bleeding into earlier ones. Each stage exposes only the clauses
//! legally reachable from it.

use serde_json::json;

use crate::engine::Store;

use super::errors::BuildError;
use super::expr::Expression;
use super::nodes::{DataSource, Join, JoinKind, Ordering, SelectResult};
use super::query::Query;

/// Accumulated query state carried between stages.
#[derive(Clone, Debug, Default)]
pub(crate) struct QuerySpec {
    pub(crate) select: Vec<SelectResult>,
    pub(crate) distinct: bool,
    pub(crate) from: Option<DataSource>,
    pub(crate) joins: Vec<Join>,
    pub(crate) where_: Option<Expression>,
    pub(crate) group_by: Vec<Expression>,
    pub(crate) having: Option<Expression>,
    pub(crate) order_by: Vec<Ordering>,
    pub(crate) limit: Option<Expression>,
    pub(crate) offset: Option<Expression>,
}

impl QuerySpec {
    /// Serializes the accumulated state into the engine IR document.
    ///
    /// Clause order follows the fixed grammar: WHAT, DISTINCT, FROM (source
    /// then joins), WHERE, GROUP_BY, HAVING, ORDER_BY, LIMIT, OFFSET. All
    /// argument validation has already happened at the stage calls.
    pub(crate) fn encode(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        doc.insert(
            "WHAT".into(),
            serde_json::Value::Array(self.select.iter().map(SelectResult::to_json).collect()),
        );
        if self.distinct {
            doc.insert("DISTINCT".into(), json!(true));
        }
        if let Some(from) = &self.from {
            let mut sources = vec![from.to_json()];
            sources.extend(self.joins.iter().map(Join::to_json));
            doc.insert("FROM".into(), serde_json::Value::Array(sources));
        }
        if let Some(predicate) = &self.where_ {
            doc.insert("WHERE".into(), predicate.compile());
        }
        if !self.group_by.is_empty() {
            doc.insert(
                "GROUP_BY".into(),
                serde_json::Value::Array(self.group_by.iter().map(Expression::compile).collect()),
            );
        }
        if let Some(predicate) = &self.having {
            doc.insert("HAVING".into(), predicate.compile());
        }
        if !self.order_by.is_empty() {
            doc.insert(
                "ORDER_BY".into(),
                serde_json::Value::Array(self.order_by.iter().map(Ordering::to_json).collect()),
            );
        }
        if let Some(limit) = &self.limit {
            doc.insert("LIMIT".into(), limit.compile());
        }
        if let Some(offset) = &self.offset {
            doc.insert("OFFSET".into(), offset.compile());
        }
        serde_json::Value::Object(doc)
    }

    fn with_joins(&self, joins: Vec<Join>) -> Result<QuerySpec, BuildError> {
        if joins.is_empty() {
            return Err(BuildError::EmptyArgumentList { operation: "join" });
        }
        let aliased = self.from.as_ref().is_some_and(|f| f.alias().is_some());
        if !aliased {
            return Err(BuildError::AliasRequired);
        }
        for join in &joins {
            if join.kind() != JoinKind::Cross && !join.has_predicate() {
                return Err(BuildError::MissingJoinPredicate);
            }
        }
        let mut spec = self.clone();
        spec.joins.extend(joins);
        Ok(spec)
    }
}

/// Entry point of the builder chain.
pub struct QueryBuilder;

impl QueryBuilder {
    /// Starts a query projecting the given select results.
    pub fn select(results: Vec<SelectResult>) -> Result<Select, BuildError> {
        Self::start(results, false)
    }

    /// Starts a query projecting distinct rows only.
    pub fn select_distinct(results: Vec<SelectResult>) -> Result<Select, BuildError> {
        Self::start(results, true)
    }

    fn start(results: Vec<SelectResult>, distinct: bool) -> Result<Select, BuildError> {
        if results.is_empty() {
            return Err(BuildError::EmptyArgumentList {
                operation: "select",
            });
        }
        Ok(Select {
            spec: QuerySpec {
                select: results,
                distinct,
                ..QuerySpec::default()
            },
        })
    }
}

/// The SELECT stage; needs a data source before it can run.
#[derive(Debug)]
pub struct Select {
    spec: QuerySpec,
}

impl Select {
    /// Sets the data source to read from.
    pub fn from(&self, source: DataSource) -> From {
        let mut spec = self.spec.clone();
        spec.from = Some(source);
        From { spec }
    }
}

/// The FROM stage.
#[derive(Debug)]
pub struct From {
    spec: QuerySpec,
}

/// The JOIN stage.
#[derive(Debug)]
pub struct Joins {
    spec: QuerySpec,
}

/// The WHERE stage.
#[derive(Debug)]
pub struct Where {
    spec: QuerySpec,
}

/// The GROUP BY stage.
#[derive(Debug)]
pub struct GroupBy {
    spec: QuerySpec,
}

/// The HAVING stage.
#[derive(Debug)]
pub struct Having {
    spec: QuerySpec,
}

/// The ORDER BY stage.
#[derive(Debug)]
pub struct OrderBy {
    spec: QuerySpec,
}

/// The LIMIT stage; terminal.
#[derive(Debug)]
pub struct Limit {
    spec: QuerySpec,
}

macro_rules! executable_stage {
    ($($stage:ty),+ $(,)?) => {
        $(impl $stage {
            /// Serializes the query accumulated so far into its IR document.
            pub fn ir(&self) -> serde_json::Value {
                self.spec.encode()
            }

            /// Materializes a query handle against the given store.
            pub fn create_query(&self, store: &Store) -> Query {
                Query::new(store.clone(), self.spec.clone())
            }
        })+
    };
}

executable_stage!(From, Joins, Where, GroupBy, Having, OrderBy, Limit);

macro_rules! where_transition {
    ($($stage:ty),+ $(,)?) => {
        $(impl $stage {
            /// Filters rows with the given predicate.
            pub fn where_(&self, predicate: Expression) -> Where {
                let mut spec = self.spec.clone();
                spec.where_ = Some(predicate);
                Where { spec }
            }
        })+
    };
}

where_transition!(From, Joins);

macro_rules! group_by_transition {
    ($($stage:ty),+ $(,)?) => {
        $(impl $stage {
            /// Groups rows by the given key expressions.
            pub fn group_by(&self, keys: Vec<Expression>) -> Result<GroupBy, BuildError> {
                if keys.is_empty() {
                    return Err(BuildError::EmptyArgumentList { operation: "group_by" });
                }
                let mut spec = self.spec.clone();
                spec.group_by = keys;
                Ok(GroupBy { spec })
            }
        })+
    };
}

group_by_transition!(From, Joins, Where);

macro_rules! order_by_transition {
    ($($stage:ty),+ $(,)?) => {
        $(impl $stage {
            /// Orders the result rows.
            pub fn order_by(&self, orderings: Vec<Ordering>) -> Result<OrderBy, BuildError> {
                if orderings.is_empty() {
                    return Err(BuildError::EmptyArgumentList { operation: "order_by" });
                }
                let mut spec = self.spec.clone();
                spec.order_by = orderings;
                Ok(OrderBy { spec })
            }
        })+
    };
}

order_by_transition!(From, Joins, Where, GroupBy, Having);

macro_rules! limit_transition {
    ($($stage:ty),+ $(,)?) => {
        $(impl $stage {
            /// Caps the number of result rows.
            pub fn limit(&self, limit: Expression) -> Limit {
                let mut spec = self.spec.clone();
                spec.limit = Some(limit);
                spec.offset = None;
                Limit { spec }
            }

            /// Caps the number of result rows after skipping `offset`.
            pub fn limit_offset(&self, limit: Expression, offset: Expression) -> Limit {
                let mut spec = self.spec.clone();
                spec.limit = Some(limit);
                spec.offset = Some(offset);
                Limit { spec }
            }
        })+
    };
}

limit_transition!(From, Joins, Where, GroupBy, Having, OrderBy);

impl From {
    /// Joins one or more secondary data sources. The primary source must
    /// carry an alias; non-CROSS joins must carry an ON predicate.
    pub fn join(&self, joins: Vec<Join>) -> Result<Joins, BuildError> {
        Ok(Joins {
            spec: self.spec.with_joins(joins)?,
        })
    }
}

impl Joins {
    /// Appends further joins.
    pub fn join(&self, joins: Vec<Join>) -> Result<Joins, BuildError> {
        Ok(Joins {
            spec: self.spec.with_joins(joins)?,
        })
    }
}

impl GroupBy {
    /// Filters groups with the given predicate.
    pub fn having(&self, predicate: Expression) -> Having {
        let mut spec = self.spec.clone();
        spec.having = Some(predicate);
        Having { spec }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ir_follows_clause_grammar() {
        let stage = QueryBuilder::select(vec![SelectResult::property("name")])
            .unwrap()
            .from(DataSource::collection("users"))
            .where_(Expression::property("age").greater_than(Expression::int(30)))
            .order_by(vec![Ordering::property("name")])
            .unwrap();

        let ir = stage.ir();
        assert_eq!(ir["WHAT"], json!([[".", "name"]]));
        assert_eq!(ir["FROM"], json!([{"COLLECTION": "users"}]));
        assert_eq!(ir["WHERE"], json!([">", [".", "age"], 30]));
        assert_eq!(ir["ORDER_BY"], json!([[".", "name"]]));
    }

    #[test]
    fn branching_from_a_retained_stage_does_not_bleed() {
        let from = QueryBuilder::select(vec![SelectResult::property("name")])
            .unwrap()
            .from(DataSource::collection("users"));

        let first = from.where_(Expression::property("age").greater_than(Expression::int(30)));
        let second = from.where_(Expression::property("age").less_than(Expression::int(10)));

        assert_eq!(first.ir()["WHERE"], json!([">", [".", "age"], 30]));
        assert_eq!(second.ir()["WHERE"], json!(["<", [".", "age"], 10]));
        assert!(from.ir().get("WHERE").is_none());
    }

    #[test]
    fn empty_argument_lists_fail_at_the_call() {
        assert_eq!(
            QueryBuilder::select(vec![]).unwrap_err().code(),
            "EmptyArgumentList"
        );

        let from = QueryBuilder::select(vec![SelectResult::all()])
            .unwrap()
            .from(DataSource::collection("users").as_alias("u"));
        assert_eq!(from.join(vec![]).unwrap_err().code(), "EmptyArgumentList");
        assert_eq!(
            from.order_by(vec![]).unwrap_err().code(),
            "EmptyArgumentList"
        );
        assert_eq!(
            from.group_by(vec![]).unwrap_err().code(),
            "EmptyArgumentList"
        );
    }

    #[test]
    fn join_validation() {
        let from = QueryBuilder::select(vec![SelectResult::all()])
            .unwrap()
            .from(DataSource::collection("users"));
        let join = Join::cross(DataSource::collection("orders").as_alias("o"));
        assert_eq!(from.join(vec![join]).unwrap_err().code(), "AliasRequired");

        let from = QueryBuilder::select(vec![SelectResult::all()])
            .unwrap()
            .from(DataSource::collection("users").as_alias("u"));
        let bare = Join::inner(DataSource::collection("orders").as_alias("o"));
        assert_eq!(
            from.join(vec![bare]).unwrap_err().code(),
            "MissingJoinPredicate"
        );

        let cross = Join::cross(DataSource::collection("orders").as_alias("o"));
        let joined = from.join(vec![cross]).unwrap();
        assert_eq!(
            joined.ir()["FROM"],
            json!([
                {"COLLECTION": "users", "AS": "u"},
                {"COLLECTION": "orders", "AS": "o", "JOIN": "CROSS"},
            ])
        );
    }

    #[test]
    fn distinct_and_limit_offset() {
        let ir = QueryBuilder::select_distinct(vec![SelectResult::property("city")])
            .unwrap()
            .from(DataSource::collection("users"))
            .limit_offset(Expression::int(10), Expression::parameter("skip"))
            .ir();
        assert_eq!(ir["DISTINCT"], json!(true));
        assert_eq!(ir["LIMIT"], json!(10));
        assert_eq!(ir["OFFSET"], json!(["$", "skip"]));
    }
}
