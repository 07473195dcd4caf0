//! Clause nodes referenced by the builder chain: data sources, joins,
//! orderings, and select results.

use serde_json::json;

use super::expr::Expression;

/// The collection a query reads from.
#[derive(Clone, Debug)]
pub struct DataSource {
    collection: String,
    alias: Option<String>,
}

impl DataSource {
    /// A named collection in the store.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            alias: None,
        }
    }

    /// Assigns an alias, required when the source participates in joins.
    pub fn as_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub(crate) fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The name result columns fall back to for wildcard selects.
    pub(crate) fn column_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.collection)
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("COLLECTION".into(), json!(self.collection));
        if let Some(alias) = &self.alias {
            obj.insert("AS".into(), json!(alias));
        }
        serde_json::Value::Object(obj)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JoinKind {
    Inner,
    LeftOuter,
    Cross,
}

impl JoinKind {
    fn token(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::LeftOuter => "LEFT OUTER",
            JoinKind::Cross => "CROSS",
        }
    }
}

/// A join against a secondary data source.
#[derive(Clone, Debug)]
pub struct Join {
    kind: JoinKind,
    source: DataSource,
    on: Option<Expression>,
}

impl Join {
    /// Inner join; requires an `ON` predicate.
    pub fn inner(source: DataSource) -> Self {
        Self {
            kind: JoinKind::Inner,
            source,
            on: None,
        }
    }

    /// Left outer join; requires an `ON` predicate.
    pub fn left_outer(source: DataSource) -> Self {
        Self {
            kind: JoinKind::LeftOuter,
            source,
            on: None,
        }
    }

    /// Cross join; takes no predicate.
    pub fn cross(source: DataSource) -> Self {
        Self {
            kind: JoinKind::Cross,
            source,
            on: None,
        }
    }

    /// Attaches the join predicate.
    pub fn on(mut self, predicate: Expression) -> Self {
        self.on = Some(predicate);
        self
    }

    pub(crate) fn kind(&self) -> JoinKind {
        self.kind
    }

    pub(crate) fn has_predicate(&self) -> bool {
        self.on.is_some()
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        let mut obj = match self.source.to_json() {
            serde_json::Value::Object(obj) => obj,
            _ => unreachable!(),
        };
        obj.insert("JOIN".into(), json!(self.kind.token()));
        if let Some(on) = &self.on {
            obj.insert("ON".into(), on.compile());
        }
        serde_json::Value::Object(obj)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SortOrder {
    Ascending,
    Descending,
}

/// A single ORDER BY term.
#[derive(Clone, Debug)]
pub struct Ordering {
    expr: Expression,
    order: SortOrder,
}

impl Ordering {
    /// Orders by a property path, ascending by default.
    pub fn property(path: &str) -> Self {
        Self::expression(Expression::property(path))
    }

    /// Orders by an arbitrary expression, ascending by default.
    pub fn expression(expr: Expression) -> Self {
        Self {
            expr,
            order: SortOrder::Ascending,
        }
    }

    /// Ascending order (the default).
    pub fn ascending(mut self) -> Self {
        self.order = SortOrder::Ascending;
        self
    }

    /// Descending order.
    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self.order {
            SortOrder::Ascending => self.expr.compile(),
            SortOrder::Descending => json!(["DESC", self.expr.compile()]),
        }
    }
}

#[derive(Clone, Debug)]
enum SelectResultKind {
    Expr {
        expr: Expression,
        alias: Option<String>,
    },
    All,
}

/// A single projected column of the result set.
#[derive(Clone, Debug)]
pub struct SelectResult {
    kind: SelectResultKind,
}

impl SelectResult {
    /// Projects an arbitrary expression.
    pub fn expression(expr: Expression) -> Self {
        Self {
            kind: SelectResultKind::Expr { expr, alias: None },
        }
    }

    /// Projects a property path.
    pub fn property(path: &str) -> Self {
        Self::expression(Expression::property(path))
    }

    /// Projects the whole document.
    pub fn all() -> Self {
        Self {
            kind: SelectResultKind::All,
        }
    }

    /// Names the result column.
    pub fn as_alias(mut self, alias: impl Into<String>) -> Self {
        if let SelectResultKind::Expr { alias: slot, .. } = &mut self.kind {
            *slot = Some(alias.into());
        }
        self
    }

    /// The column name this projection contributes, if it determines one.
    ///
    /// Wildcards yield `None`; the enclosing query substitutes the data
    /// source's column name. Unaliased non-property expressions also yield
    /// `None` and receive a provisional `$n` name.
    pub(crate) fn column_name(&self) -> Option<String> {
        match &self.kind {
            SelectResultKind::All => None,
            SelectResultKind::Expr {
                alias: Some(alias), ..
            } => Some(alias.clone()),
            SelectResultKind::Expr { expr, alias: None } => expr
                .compile()
                .as_array()
                .filter(|parts| parts.first().map(|p| p == ".").unwrap_or(false))
                .and_then(|parts| parts.last())
                .and_then(|seg| seg.as_str())
                .map(str::to_owned),
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match &self.kind {
            SelectResultKind::All => json!(["."]),
            SelectResultKind::Expr { expr, alias: None } => expr.compile(),
            SelectResultKind::Expr {
                expr,
                alias: Some(alias),
            } => json!(["AS", expr.compile(), alias]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_serializes_source_and_predicate() {
        let join = Join::inner(DataSource::collection("orders").as_alias("o")).on(
            Expression::property("id")
                .from_source("u")
                .equal_to(Expression::property("user_id").from_source("o")),
        );
        assert_eq!(
            join.to_json(),
            json!({
                "COLLECTION": "orders",
                "AS": "o",
                "JOIN": "INNER",
                "ON": ["=", [".", "u", "id"], [".", "o", "user_id"]],
            })
        );
    }

    #[test]
    fn ordering_descending_wraps() {
        assert_eq!(
            Ordering::property("name").descending().to_json(),
            json!(["DESC", [".", "name"]])
        );
        assert_eq!(Ordering::property("name").to_json(), json!([".", "name"]));
    }

    #[test]
    fn select_result_column_names() {
        assert_eq!(
            SelectResult::property("address.city").column_name(),
            Some("city".to_owned())
        );
        assert_eq!(
            SelectResult::property("age").as_alias("years").column_name(),
            Some("years".to_owned())
        );
        assert_eq!(SelectResult::all().column_name(), None);
    }
}
