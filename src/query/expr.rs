//! Expression nodes and the IR compiler.
//!
//! Expressions form an owned, acyclic tree of closed variants. Each node
//! caches its encoded IR on first compile; a binding change (rebinding a
//! property path's source alias, filling a full-text match slot) stales
//! every cache entry from before the change, so any node whose compiled
//! form embeds the changed one recompiles on its next use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use super::collation::Collation;
use super::errors::BuildError;
use super::value::Value;

/// Bumped whenever any binding slot changes. Cache entries record the epoch
/// they were computed under, so a rebind invalidates every cached form that
/// could embed the rebound node.
static BINDING_EPOCH: AtomicU64 = AtomicU64::new(0);

/// A node in the query expression tree.
///
/// Handles are cheap to clone; the underlying node is shared and immutable
/// apart from its explicit binding slots.
#[derive(Clone, Debug)]
pub struct Expression {
    node: Arc<ExprNode>,
}

#[derive(Debug)]
struct ExprNode {
    kind: ExprKind,
    cache: Mutex<Option<(u64, serde_json::Value)>>,
}

#[derive(Debug)]
enum ExprKind {
    Constant(Value),
    Collection(Vec<Expression>),
    Property {
        path: Vec<String>,
        source: Mutex<Option<String>>,
    },
    Parameter {
        name: String,
    },
    Variable {
        name: String,
    },
    Binary {
        op: BinaryOp,
        lhs: Expression,
        rhs: Expression,
    },
    Unary {
        op: UnaryOp,
        operand: Expression,
    },
    Quantified {
        quantifier: Quantifier,
        variable: String,
        source: Expression,
        predicate: Expression,
    },
    Compound {
        op: CompoundOp,
        operands: Vec<Expression>,
    },
    FullText {
        index: String,
        text: Mutex<Option<String>>,
    },
    Function {
        name: &'static str,
        args: Vec<Expression>,
    },
    Collate {
        collation: Collation,
        operand: Expression,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    EqualTo,
    NotEqualTo,
    LessThan,
    LessThanOrEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
    Is,
    IsNot,
    Like,
    RegexLike,
    Between,
    In,
}

impl BinaryOp {
    fn token(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::EqualTo => "=",
            BinaryOp::NotEqualTo => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqualTo => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqualTo => ">=",
            BinaryOp::Is => "IS",
            BinaryOp::IsNot => "IS NOT",
            BinaryOp::Like => "LIKE",
            BinaryOp::RegexLike => "REGEXP_LIKE()",
            BinaryOp::Between => "BETWEEN",
            BinaryOp::In => "IN",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnaryOp {
    Not,
    IsNull,
    IsMissing,
    IsValued,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Quantifier {
    Any,
    Every,
    AnyAndEvery,
}

impl Quantifier {
    fn token(self) -> &'static str {
        match self {
            Quantifier::Any => "ANY",
            Quantifier::Every => "EVERY",
            Quantifier::AnyAndEvery => "ANY AND EVERY",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompoundOp {
    And,
    Or,
}

impl Expression {
    fn new(kind: ExprKind) -> Self {
        Self {
            node: Arc::new(ExprNode {
                kind,
                cache: Mutex::new(None),
            }),
        }
    }

    /// A property path into the current document, segments separated by `.`.
    pub fn property(path: &str) -> Self {
        Self::new(ExprKind::Property {
            path: path.split('.').map(str::to_owned).collect(),
            source: Mutex::new(None),
        })
    }

    /// A named query parameter, bound at execution time.
    pub fn parameter(name: impl Into<String>) -> Self {
        Self::new(ExprKind::Parameter { name: name.into() })
    }

    /// A constant literal.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::new(ExprKind::Constant(value.into()))
    }

    /// A string literal.
    pub fn string(value: impl Into<String>) -> Self {
        Self::value(Value::String(value.into()))
    }

    /// An integer literal.
    pub fn int(value: i64) -> Self {
        Self::value(value)
    }

    /// A float literal.
    pub fn float(value: f64) -> Self {
        Self::value(value)
    }

    /// A boolean literal.
    pub fn boolean(value: bool) -> Self {
        Self::value(value)
    }

    /// Logical negation of the supplied expression.
    pub fn negated(expr: Expression) -> Self {
        Self::new(ExprKind::Unary {
            op: UnaryOp::Not,
            operand: expr,
        })
    }

    pub(crate) fn collection(elements: Vec<Expression>) -> Self {
        Self::new(ExprKind::Collection(elements))
    }

    pub(crate) fn variable_ref(name: impl Into<String>) -> Self {
        Self::new(ExprKind::Variable { name: name.into() })
    }

    pub(crate) fn function(name: &'static str, args: Vec<Expression>) -> Self {
        Self::new(ExprKind::Function { name, args })
    }

    fn binary(self, op: BinaryOp, rhs: Expression) -> Self {
        Self::new(ExprKind::Binary { op, lhs: self, rhs })
    }

    fn unary(self, op: UnaryOp) -> Self {
        Self::new(ExprKind::Unary {
            op,
            operand: self,
        })
    }

    /// Arithmetic addition.
    pub fn add(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::Add, rhs)
    }

    /// Arithmetic subtraction.
    pub fn subtract(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::Subtract, rhs)
    }

    /// Arithmetic multiplication.
    pub fn multiply(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::Multiply, rhs)
    }

    /// Arithmetic division.
    pub fn divide(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::Divide, rhs)
    }

    /// Arithmetic modulo.
    pub fn modulo(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::Modulo, rhs)
    }

    /// Equality comparison.
    pub fn equal_to(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::EqualTo, rhs)
    }

    /// Inequality comparison.
    pub fn not_equal_to(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::NotEqualTo, rhs)
    }

    /// Strict less-than comparison.
    pub fn less_than(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::LessThan, rhs)
    }

    /// Less-than-or-equal comparison.
    pub fn less_than_or_equal_to(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::LessThanOrEqualTo, rhs)
    }

    /// Strict greater-than comparison.
    pub fn greater_than(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::GreaterThan, rhs)
    }

    /// Greater-than-or-equal comparison.
    pub fn greater_than_or_equal_to(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::GreaterThanOrEqualTo, rhs)
    }

    /// `IS` comparison (null-aware equality).
    pub fn is(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::Is, rhs)
    }

    /// `IS NOT` comparison.
    pub fn is_not(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::IsNot, rhs)
    }

    /// SQL `LIKE` pattern match (`%` and `_` wildcards).
    pub fn like(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::Like, rhs)
    }

    /// Regular-expression match.
    pub fn regex(self, rhs: Expression) -> Self {
        self.binary(BinaryOp::RegexLike, rhs)
    }

    /// Range test with inclusive bounds.
    ///
    /// Both bounds must be property/parameter references or constants.
    pub fn between(self, lower: Expression, upper: Expression) -> Result<Self, BuildError> {
        if !lower.is_range_operand() || !upper.is_range_operand() {
            return Err(BuildError::InvalidOperandKind { operator: "BETWEEN" });
        }
        Ok(self.binary(BinaryOp::Between, Expression::collection(vec![lower, upper])))
    }

    /// Negated range test.
    pub fn not_between(self, lower: Expression, upper: Expression) -> Result<Self, BuildError> {
        Ok(Self::negated(self.between(lower, upper)?))
    }

    /// Membership test against a finite expression list.
    pub fn in_(self, values: Vec<Expression>) -> Result<Self, BuildError> {
        if values.is_empty() {
            return Err(BuildError::EmptyArgumentList { operation: "in" });
        }
        Ok(self.binary(BinaryOp::In, Expression::collection(values)))
    }

    /// Negated membership test.
    pub fn not_in(self, values: Vec<Expression>) -> Result<Self, BuildError> {
        Ok(Self::negated(self.in_(values)?))
    }

    /// Logical conjunction.
    pub fn and(self, rhs: Expression) -> Self {
        Self::new(ExprKind::Compound {
            op: CompoundOp::And,
            operands: vec![self, rhs],
        })
    }

    /// Logical disjunction.
    pub fn or(self, rhs: Expression) -> Self {
        Self::new(ExprKind::Compound {
            op: CompoundOp::Or,
            operands: vec![self, rhs],
        })
    }

    /// Tests whether the expression is null or missing from the document.
    pub fn is_null_or_missing(self) -> Self {
        self.clone()
            .unary(UnaryOp::IsNull)
            .or(self.unary(UnaryOp::IsMissing))
    }

    /// Tests whether the expression exists and is neither null nor missing.
    pub fn is_valued(self) -> Self {
        self.unary(UnaryOp::IsValued)
    }

    /// Attaches collation rules to this expression.
    pub fn collate(self, collation: Collation) -> Self {
        Self::new(ExprKind::Collate {
            collation,
            operand: self,
        })
    }

    /// Binds a data-source alias to every property path in this subtree.
    ///
    /// Rebinding invalidates the cached compilation of the subtree and of
    /// any node whose compiled form embeds it.
    pub fn from_source(self, alias: &str) -> Self {
        self.bind_source(alias);
        BINDING_EPOCH.fetch_add(1, Ordering::SeqCst);
        self
    }

    fn bind_source(&self, alias: &str) {
        if let ExprKind::Property { source, .. } = &self.node.kind {
            *source.lock() = Some(alias.to_owned());
        }
        for child in self.children() {
            child.bind_source(alias);
        }
    }

    /// Compiles this node to its IR form, memoized per node instance until
    /// the next binding change.
    pub fn compile(&self) -> serde_json::Value {
        let epoch = BINDING_EPOCH.load(Ordering::SeqCst);
        if let Some((cached_epoch, cached)) = &*self.node.cache.lock() {
            if *cached_epoch == epoch {
                return cached.clone();
            }
        }
        let encoded = self.encode();
        *self.node.cache.lock() = Some((epoch, encoded.clone()));
        encoded
    }

    fn children(&self) -> Vec<Expression> {
        match &self.node.kind {
            ExprKind::Constant(_)
            | ExprKind::Property { .. }
            | ExprKind::Parameter { .. }
            | ExprKind::Variable { .. }
            | ExprKind::FullText { .. } => Vec::new(),
            ExprKind::Collection(items) => items.clone(),
            ExprKind::Binary { lhs, rhs, .. } => vec![lhs.clone(), rhs.clone()],
            ExprKind::Unary { operand, .. } => vec![operand.clone()],
            ExprKind::Quantified {
                source, predicate, ..
            } => vec![source.clone(), predicate.clone()],
            ExprKind::Compound { operands, .. } => operands.clone(),
            ExprKind::Function { args, .. } => args.clone(),
            ExprKind::Collate { operand, .. } => vec![operand.clone()],
        }
    }

    fn is_range_operand(&self) -> bool {
        matches!(
            self.node.kind,
            ExprKind::Constant(_)
                | ExprKind::Property { .. }
                | ExprKind::Parameter { .. }
                | ExprKind::Variable { .. }
        )
    }

    /// Returns the index name of the first full-text node in this subtree
    /// whose match text has not been filled in yet.
    pub(crate) fn find_unfilled_match(&self) -> Option<String> {
        if let ExprKind::FullText { index, text } = &self.node.kind {
            if text.lock().is_none() {
                return Some(index.clone());
            }
        }
        self.children()
            .iter()
            .find_map(Expression::find_unfilled_match)
    }

    fn encode(&self) -> serde_json::Value {
        match &self.node.kind {
            ExprKind::Constant(value) => value.to_json(),
            ExprKind::Collection(items) => {
                let mut out = vec![json!("[]")];
                out.extend(items.iter().map(Expression::compile));
                serde_json::Value::Array(out)
            }
            ExprKind::Property { path, source } => {
                let mut out = vec![json!(".")];
                if let Some(alias) = &*source.lock() {
                    out.push(json!(alias));
                }
                out.extend(path.iter().map(|seg| json!(seg)));
                serde_json::Value::Array(out)
            }
            ExprKind::Parameter { name } => json!(["$", name]),
            ExprKind::Variable { name } => json!(["?", name]),
            ExprKind::Binary { op, lhs, rhs } => {
                let mut out = vec![json!(op.token()), lhs.compile()];
                match (op, &rhs.node.kind) {
                    // BETWEEN takes its bounds as elements of the operator
                    // array; IN keeps the collection as a single operand.
                    (BinaryOp::Between, ExprKind::Collection(bounds)) => {
                        out.extend(bounds.iter().map(Expression::compile));
                    }
                    _ => out.push(rhs.compile()),
                }
                serde_json::Value::Array(out)
            }
            ExprKind::Unary { op, operand } => {
                let x = operand.compile();
                match op {
                    UnaryOp::Not => json!(["NOT", x]),
                    UnaryOp::IsNull => json!(["IS", x, null]),
                    UnaryOp::IsMissing => json!(["IS", x, ["MISSING"]]),
                    UnaryOp::IsValued => json!(["IS VALUED", x]),
                }
            }
            ExprKind::Quantified {
                quantifier,
                variable,
                source,
                predicate,
            } => {
                json!([
                    quantifier.token(),
                    variable,
                    source.compile(),
                    predicate.compile()
                ])
            }
            ExprKind::Compound { op, operands } => {
                let token = match op {
                    CompoundOp::And => "AND",
                    CompoundOp::Or => "OR",
                };
                let mut out = vec![json!(token)];
                out.extend(operands.iter().map(Expression::compile));
                serde_json::Value::Array(out)
            }
            ExprKind::FullText { index, text } => match &*text.lock() {
                Some(query) => json!(["MATCH", index, query]),
                None => json!(["MATCH", index]),
            },
            ExprKind::Function { name, args } => {
                let mut out = vec![json!(name)];
                out.extend(args.iter().map(Expression::compile));
                serde_json::Value::Array(out)
            }
            ExprKind::Collate { collation, operand } => {
                json!(["COLLATE", collation.to_json(), operand.compile()])
            }
        }
    }
}

/// Entry points for quantified array predicates and variable references.
pub struct ArrayExpression;

impl ArrayExpression {
    /// A reference to a quantifier variable, usable inside `satisfies`.
    pub fn variable(name: impl Into<String>) -> Expression {
        Expression::variable_ref(name)
    }

    /// `ANY` quantifier: at least one element satisfies the predicate.
    pub fn any(variable: impl Into<String>) -> ArrayExpressionIn {
        ArrayExpressionIn {
            quantifier: Quantifier::Any,
            variable: variable.into(),
        }
    }

    /// `EVERY` quantifier: all elements satisfy the predicate (true for an
    /// empty array).
    pub fn every(variable: impl Into<String>) -> ArrayExpressionIn {
        ArrayExpressionIn {
            quantifier: Quantifier::Every,
            variable: variable.into(),
        }
    }

    /// `ANY AND EVERY`: all elements satisfy the predicate and the array is
    /// non-empty.
    pub fn any_and_every(variable: impl Into<String>) -> ArrayExpressionIn {
        ArrayExpressionIn {
            quantifier: Quantifier::AnyAndEvery,
            variable: variable.into(),
        }
    }
}

/// A quantifier waiting for its source array expression.
pub struct ArrayExpressionIn {
    quantifier: Quantifier,
    variable: String,
}

impl ArrayExpressionIn {
    /// Supplies the array to quantify over.
    pub fn in_(self, source: Expression) -> ArrayExpressionSatisfies {
        ArrayExpressionSatisfies {
            quantifier: self.quantifier,
            variable: self.variable,
            source,
        }
    }
}

/// A quantifier waiting for its per-element predicate.
pub struct ArrayExpressionSatisfies {
    quantifier: Quantifier,
    variable: String,
    source: Expression,
}

impl ArrayExpressionSatisfies {
    /// Supplies the per-element predicate and closes the quantifier.
    pub fn satisfies(self, predicate: Expression) -> Expression {
        Expression::new(ExprKind::Quantified {
            quantifier: self.quantifier,
            variable: self.variable,
            source: self.source,
            predicate,
        })
    }
}

/// A full-text match expression whose query text is supplied later.
pub struct FullTextExpression {
    node: Expression,
}

impl FullTextExpression {
    /// References a full-text index by name. The match text is filled in
    /// with [`FullTextExpression::match_text`].
    pub fn index(name: impl Into<String>) -> Self {
        Self {
            node: Expression::new(ExprKind::FullText {
                index: name.into(),
                text: Mutex::new(None),
            }),
        }
    }

    /// Fills the deferred query-text slot and returns the match expression.
    pub fn match_text(&self, text: impl Into<String>) -> Expression {
        if let ExprKind::FullText { text: slot, .. } = &self.node.node.kind {
            *slot.lock() = Some(text.into());
        }
        BINDING_EPOCH.fetch_add(1, Ordering::SeqCst);
        self.node.clone()
    }

    /// The underlying expression, valid for token-shape inspection even
    /// before the match text is filled.
    pub fn expression(&self) -> Expression {
        self.node.clone()
    }
}

/// Built-in scalar and aggregate functions.
pub struct Function;

impl Function {
    /// Row count aggregate.
    pub fn count(expr: Expression) -> Expression {
        Expression::function("COUNT()", vec![expr])
    }

    /// Sum aggregate.
    pub fn sum(expr: Expression) -> Expression {
        Expression::function("SUM()", vec![expr])
    }

    /// Arithmetic-mean aggregate.
    pub fn avg(expr: Expression) -> Expression {
        Expression::function("AVG()", vec![expr])
    }

    /// Minimum aggregate.
    pub fn min(expr: Expression) -> Expression {
        Expression::function("MIN()", vec![expr])
    }

    /// Maximum aggregate.
    pub fn max(expr: Expression) -> Expression {
        Expression::function("MAX()", vec![expr])
    }

    /// Lower-cases a string.
    pub fn lower(expr: Expression) -> Expression {
        Expression::function("LOWER()", vec![expr])
    }

    /// Upper-cases a string.
    pub fn upper(expr: Expression) -> Expression {
        Expression::function("UPPER()", vec![expr])
    }

    /// String length.
    pub fn length(expr: Expression) -> Expression {
        Expression::function("LENGTH()", vec![expr])
    }

    /// Absolute value.
    pub fn abs(expr: Expression) -> Expression {
        Expression::function("ABS()", vec![expr])
    }

    /// Substring containment test.
    pub fn contains(operand: Expression, substring: Expression) -> Expression {
        Expression::function("CONTAINS()", vec![operand, substring])
    }

    /// Full-text relevance rank of a match.
    pub fn rank(expr: Expression) -> Expression {
        Expression::function("RANK()", vec![expr])
    }
}

/// Document metadata references.
pub struct Meta;

impl Meta {
    /// The document identifier.
    pub fn id() -> Expression {
        Expression::property("_id")
    }

    /// The document's store sequence number.
    pub fn sequence() -> Expression {
        Expression::property("_sequence")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_tokens_match_contract() {
        let ir = Expression::property("age")
            .greater_than(Expression::int(30))
            .compile();
        assert_eq!(ir, json!([">", [".", "age"], 30]));

        let ir = Expression::property("name")
            .like(Expression::string("B%"))
            .compile();
        assert_eq!(ir, json!(["LIKE", [".", "name"], "B%"]));
    }

    #[test]
    fn in_keeps_collection_operand() {
        let ir = Expression::property("state")
            .in_(vec![Expression::string("CA"), Expression::string("WA")])
            .unwrap()
            .compile();
        assert_eq!(ir, json!(["IN", [".", "state"], ["[]", "CA", "WA"]]));
    }

    #[test]
    fn between_flattens_bounds() {
        let ir = Expression::property("age")
            .between(Expression::int(20), Expression::int(40))
            .unwrap()
            .compile();
        assert_eq!(ir, json!(["BETWEEN", [".", "age"], 20, 40]));
    }

    #[test]
    fn between_rejects_compound_bounds() {
        let bound = Expression::int(1).add(Expression::int(2));
        let err = Expression::property("age")
            .between(bound, Expression::int(40))
            .unwrap_err();
        assert_eq!(err.code(), "InvalidOperandKind");
    }

    #[test]
    fn empty_in_list_is_rejected() {
        let err = Expression::property("state").in_(vec![]).unwrap_err();
        assert_eq!(err.code(), "EmptyArgumentList");
    }

    #[test]
    fn compile_is_memoized_until_rebind() {
        let expr = Expression::property("name");
        let first = expr.compile();
        assert_eq!(first, expr.compile());

        let expr = expr.from_source("db");
        let rebound = expr.compile();
        assert_eq!(rebound, json!([".", "db", "name"]));
        assert_ne!(first, rebound);
    }

    #[test]
    fn rebind_invalidates_embedding_nodes() {
        let prop = Expression::property("age");
        let parent = prop.clone().greater_than(Expression::int(30));
        let before = parent.compile();

        let _ = prop.from_source("a");
        let after = parent.compile();
        assert_eq!(before, json!([">", [".", "age"], 30]));
        assert_eq!(after, json!([">", [".", "a", "age"], 30]));
    }

    #[test]
    fn quantifier_shapes() {
        let ir = ArrayExpression::any("x")
            .in_(Expression::property("tags"))
            .satisfies(ArrayExpression::variable("x").equal_to(Expression::string("db")))
            .compile();
        assert_eq!(
            ir,
            json!(["ANY", "x", [".", "tags"], ["=", ["?", "x"], "db"]])
        );
    }

    #[test]
    fn full_text_slot_is_deferred() {
        let fts = FullTextExpression::index("fts");
        assert_eq!(fts.expression().compile(), json!(["MATCH", "fts"]));
        assert_eq!(
            fts.expression().find_unfilled_match(),
            Some("fts".to_owned())
        );

        let filled = fts.match_text("rust database");
        assert_eq!(filled.compile(), json!(["MATCH", "fts", "rust database"]));
        assert_eq!(filled.find_unfilled_match(), None);
    }

    #[test]
    fn function_and_meta_tokens() {
        assert_eq!(
            Function::count(Expression::property("n")).compile(),
            json!(["COUNT()", [".", "n"]])
        );
        assert_eq!(Meta::id().compile(), json!([".", "_id"]));
        assert_eq!(Meta::sequence().compile(), json!([".", "_sequence"]));
    }

    #[test]
    fn collation_shape() {
        let ir = Expression::property("name")
            .collate(Collation::unicode().ignore_case(true).locale("en"))
            .compile();
        assert_eq!(
            ir,
            json!([
                "COLLATE",
                {"UNICODE": true, "LOCALE": "en", "CASE": false, "DIAC": true},
                [".", "name"]
            ])
        );
    }
}
