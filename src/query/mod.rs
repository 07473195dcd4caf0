//! Query construction, execution, and live observation.
//!
//! Application code chains typed builder stages into an immutable query
//! spec, which compiles to the JSON IR the engine consumes. Query handles
//! own the compiled state and result cursors; live queriers keep a query's
//! results fresh and notify listeners only when they actually change.

/// String comparison collation specs.
pub mod collation;

/// Live query timing configuration.
pub mod config;

/// Construction-time error types.
pub mod errors;

/// Expression nodes and the IR compiler.
pub mod expr;

/// Live query observation.
pub mod live;

/// Clause nodes: data sources, joins, orderings, select results.
pub mod nodes;

/// Named parameter bindings.
pub mod params;

/// Result cursors and rows.
pub mod result;

/// The typed builder stage chain.
pub mod stages;

/// Scalar and collection values.
pub mod value;

mod query;

pub use collation::Collation;
pub use config::LiveQueryConfig;
pub use errors::BuildError;
pub use expr::{ArrayExpression, Expression, FullTextExpression, Function, Meta};
pub use live::{ListenerToken, QueryChange};
pub use nodes::{DataSource, Join, Ordering, SelectResult};
pub use params::Parameters;
pub use query::Query;
pub use result::{ResultIter, ResultSet, Row};
pub use stages::QueryBuilder;
pub use value::Value;
