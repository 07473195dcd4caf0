//! Boundary to the external query/storage engine.
//!
//! The engine is an opaque collaborator: it compiles IR documents, runs
//! compiled queries, exposes column introspection, and raises change
//! notifications. Everything it reports goes through the structured
//! [`EngineError`]. All native access is serialized by a mutual-exclusion
//! lock scoped to the [`Store`] handle shared by every query against the
//! same underlying store.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryEngine;

/// Subsystem that produced an engine error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorDomain {
    /// Query compilation or evaluation.
    Query,
    /// Underlying storage.
    Storage,
    /// Full-text indexing.
    FullText,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Query => write!(f, "query"),
            ErrorDomain::Storage => write!(f, "storage"),
            ErrorDomain::FullText => write!(f, "fulltext"),
        }
    }
}

/// Structured error reported by the engine: domain, code, message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[{domain}/{code}] {message}")]
pub struct EngineError {
    /// Originating subsystem.
    pub domain: ErrorDomain,
    /// Engine-defined error code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl EngineError {
    /// Builds an engine error.
    pub fn new(domain: ErrorDomain, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
        }
    }
}

/// Result alias for engine-boundary calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Callback invoked by the engine when underlying data may have changed.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// Compiles IR documents into executable queries.
pub trait QueryEngine: Send + Sync {
    /// Compiles the IR document, failing with a structured error if the
    /// engine rejects it.
    fn compile(&self, ir: &serde_json::Value) -> EngineResult<Arc<dyn CompiledQuery>>;
}

/// An engine-side compiled query handle.
pub trait CompiledQuery: Send + Sync + fmt::Debug {
    /// Runs the query with the given parameter bindings. `None` means the
    /// engine produced no enumerator (e.g. an empty predicate set); the
    /// caller substitutes an explicit empty cursor.
    fn run(&self, params: &serde_json::Value) -> EngineResult<Option<Box<dyn RowEnumerator>>>;

    /// Pushes new parameter bindings without recompiling.
    fn set_parameters(&self, params: &serde_json::Value);

    /// Returns the engine's human-readable execution plan.
    fn explain(&self) -> EngineResult<String>;

    /// Column titles, in projection order.
    fn column_names(&self) -> Vec<String>;

    /// Registers a change observer on this query. The hook fires whenever
    /// the underlying data may have changed; dropping the returned guard
    /// unregisters.
    fn observe(&self, hook: ChangeHook) -> EngineResult<Box<dyn ObserverGuard>>;
}

/// RAII registration of an engine-level change observer.
pub trait ObserverGuard: Send {
    /// Starts delivering change notifications.
    fn enable(&self);

    /// Stops delivering change notifications without unregistering.
    fn disable(&self);
}

/// Forward iterator over engine-produced rows.
pub trait RowEnumerator: Send {
    /// Advances to the next row; `None` at normal end of data.
    fn next_row(&mut self) -> EngineResult<Option<Vec<serde_json::Value>>>;

    /// Whether this enumerator supports random access.
    fn supports_seek(&self) -> bool {
        false
    }

    /// Random access to a row by index; `None` when out of range.
    fn seek(&mut self, _index: usize) -> EngineResult<Option<Vec<serde_json::Value>>> {
        Err(EngineError::new(
            ErrorDomain::Query,
            1,
            "enumerator does not support seek",
        ))
    }

    /// Total row count, when the engine knows it up front.
    fn row_count(&self) -> Option<usize> {
        None
    }
}

/// Client-side handle to one underlying data store.
///
/// Cloning shares the engine and the store-scoped lock; all queries created
/// against the same `Store` serialize their native-engine access on it.
#[derive(Clone)]
pub struct Store {
    engine: Arc<dyn QueryEngine>,
    lock: Arc<Mutex<()>>,
}

impl Store {
    /// Wraps an engine in a store handle with its own access lock.
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            engine,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Runs `f` against the engine while holding the store lock.
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&dyn QueryEngine) -> R) -> R {
        let _guard = self.lock.lock();
        f(self.engine.as_ref())
    }

    /// Runs `f` while holding the store lock, without touching the engine.
    pub(crate) fn locked_detached<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
