use thiserror::Error;

/// Structured errors raised while constructing expressions and builder
/// stages.
///
/// These fire synchronously at the offending call; nothing is deferred to
/// IR encoding or engine compilation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// An argument list declared non-empty was empty.
    #[error("{operation} requires at least one argument")]
    EmptyArgumentList {
        /// The builder operation that was called.
        operation: &'static str,
    },
    /// An operator received an operand kind it cannot serialize.
    #[error("{operator} operands must be property, parameter, or constant expressions")]
    InvalidOperandKind {
        /// The operator token that rejected its operand.
        operator: &'static str,
    },
    /// A non-CROSS join was supplied without an ON predicate.
    #[error("join requires an ON predicate unless it is CROSS")]
    MissingJoinPredicate,
    /// Joining requires the primary data source to carry an alias.
    #[error("the primary data source must have an alias to join against")]
    AliasRequired,
    /// A full-text expression reached execution without its match text.
    #[error("full-text index '{index}' has no match text")]
    MissingMatchText {
        /// The full-text index name.
        index: String,
    },
}

impl BuildError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::EmptyArgumentList { .. } => "EmptyArgumentList",
            BuildError::InvalidOperandKind { .. } => "InvalidOperandKind",
            BuildError::MissingJoinPredicate => "MissingJoinPredicate",
            BuildError::AliasRequired => "AliasRequired",
            BuildError::MissingMatchText { .. } => "MissingMatchText",
        }
    }
}
