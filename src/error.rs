use thiserror::Error;

use crate::engine::EngineError;
use crate::query::errors::BuildError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DbError>;

/// Top-level error type surfaced to application code.
#[derive(Debug, Error)]
pub enum DbError {
    /// Malformed expression graph or illegal builder-stage argument.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// The engine rejected the compiled IR.
    #[error("query compilation failed: {0}")]
    Compile(EngineError),
    /// The engine failed while running a compiled query.
    #[error("query execution failed: {0}")]
    Execution(EngineError),
    /// Two select results produced the same column name.
    #[error("duplicate select result named '{0}'")]
    DuplicateColumn(String),
    /// The result cursor's enumerator was requested a second time.
    #[error("result rows already enumerated")]
    AlreadyEnumerated,
    /// Random access past the end of the result set.
    #[error("row index {index} out of range ({len} rows)")]
    InvalidIndex {
        /// Requested row index.
        index: usize,
        /// Number of rows available.
        len: usize,
    },
    /// Operation not supported by the underlying engine.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    /// The query handle was used after disposal.
    #[error("{0} used after disposal")]
    Disposed(&'static str),
}
