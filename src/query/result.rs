//! Single-pass result cursors and rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::engine::{EngineError, RowEnumerator};
use crate::error::{DbError, Result};

use super::value::Value;

/// Column titles and their projection indexes, shared by a cursor and all
/// rows it produces.
#[derive(Debug)]
pub(crate) struct ColumnMap {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ColumnMap {
    pub(crate) fn new(names: Vec<String>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, index }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

enum CursorState {
    Engine(Box<dyn RowEnumerator>),
    Materialized {
        rows: Arc<Vec<Vec<Json>>>,
        pos: usize,
    },
    Done,
}

pub(crate) struct ResultSetShared {
    columns: Arc<ColumnMap>,
    state: Mutex<CursorState>,
    enumerated: AtomicBool,
    error: Mutex<Option<EngineError>>,
}

impl ResultSetShared {
    /// Drops the underlying enumerator; subsequent reads see end-of-data.
    pub(crate) fn invalidate(&self) {
        *self.state.lock() = CursorState::Done;
    }
}

/// Forward-only view over the rows of one query execution.
///
/// The row iterator may be taken exactly once; the cursor owns the engine
/// enumerator, and rows borrow only the shared column table from it.
pub struct ResultSet {
    shared: Arc<ResultSetShared>,
}

impl ResultSet {
    pub(crate) fn from_enumerator(
        columns: Arc<ColumnMap>,
        enumerator: Box<dyn RowEnumerator>,
    ) -> Self {
        Self::with_state(columns, CursorState::Engine(enumerator))
    }

    pub(crate) fn materialized(columns: Arc<ColumnMap>, rows: Arc<Vec<Vec<Json>>>) -> Self {
        Self::with_state(columns, CursorState::Materialized { rows, pos: 0 })
    }

    /// An explicit empty cursor, used when the engine produces no
    /// enumerator so callers never see a null result set.
    pub(crate) fn empty(columns: Arc<ColumnMap>) -> Self {
        Self::with_state(columns, CursorState::Done)
    }

    fn with_state(columns: Arc<ColumnMap>, state: CursorState) -> Self {
        Self {
            shared: Arc::new(ResultSetShared {
                columns,
                state: Mutex::new(state),
                enumerated: AtomicBool::new(false),
                error: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ResultSetShared> {
        &self.shared
    }

    /// Takes the row iterator. Allowed exactly once per cursor.
    pub fn iter(&self) -> Result<ResultIter<'_>> {
        if self.shared.enumerated.swap(true, Ordering::SeqCst) {
            return Err(DbError::AlreadyEnumerated);
        }
        Ok(ResultIter { set: self })
    }

    /// Materializes all remaining rows in order.
    pub fn all_results(&self) -> Vec<Row> {
        self.shared.enumerated.store(true, Ordering::SeqCst);
        let mut rows = Vec::new();
        while let Some(row) = self.advance() {
            rows.push(row);
        }
        rows
    }

    /// Random access to a row by index, where the engine supports it.
    pub fn row_at(&self, index: usize) -> Result<Row> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            CursorState::Engine(enumerator) => {
                if !enumerator.supports_seek() {
                    return Err(DbError::UnsupportedOperation("seek"));
                }
                match enumerator.seek(index) {
                    Ok(Some(values)) => Ok(self.row(values)),
                    Ok(None) => Err(DbError::InvalidIndex {
                        index,
                        len: enumerator.row_count().unwrap_or(0),
                    }),
                    Err(err) => Err(DbError::Execution(err)),
                }
            }
            CursorState::Materialized { rows, .. } => match rows.get(index) {
                Some(values) => Ok(self.row(values.clone())),
                None => Err(DbError::InvalidIndex {
                    index,
                    len: rows.len(),
                }),
            },
            CursorState::Done => Err(DbError::InvalidIndex { index, len: 0 }),
        }
    }

    /// Column titles in projection order.
    pub fn column_names(&self) -> &[String] {
        &self.shared.columns.names
    }

    /// The engine error recorded during iteration, if any. Distinguishes
    /// "error occurred" from "no error, no data".
    pub fn error(&self) -> Option<EngineError> {
        self.shared.error.lock().clone()
    }

    fn advance(&self) -> Option<Row> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            CursorState::Engine(enumerator) => match enumerator.next_row() {
                Ok(Some(values)) => Some(self.row(values)),
                Ok(None) => {
                    *state = CursorState::Done;
                    None
                }
                Err(err) => {
                    *self.shared.error.lock() = Some(err);
                    *state = CursorState::Done;
                    None
                }
            },
            CursorState::Materialized { rows, pos } => {
                let row = rows.get(*pos).cloned();
                match row {
                    Some(values) => {
                        *pos += 1;
                        Some(self.row(values))
                    }
                    None => {
                        *state = CursorState::Done;
                        None
                    }
                }
            }
            CursorState::Done => None,
        }
    }

    fn row(&self, values: Vec<Json>) -> Row {
        Row {
            columns: self.shared.columns.clone(),
            values,
        }
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("columns", &self.shared.columns.names)
            .finish_non_exhaustive()
    }
}

/// The single-use row iterator of a [`ResultSet`].
pub struct ResultIter<'a> {
    set: &'a ResultSet,
}

impl Iterator for ResultIter<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.set.advance()
    }
}

/// One result row; column values decode on demand.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<ColumnMap>,
    values: Vec<Json>,
}

impl Row {
    /// Decodes the value of the named column.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.columns
            .position(name)
            .and_then(|index| self.get_at(index))
    }

    /// Decodes the value at a projection index.
    pub fn get_at(&self, index: usize) -> Option<Value> {
        self.values.get(index).map(Value::from_json)
    }

    /// Column titles in projection order.
    pub fn column_names(&self) -> &[String] {
        &self.columns.names
    }

    /// Decodes the whole row into a name-keyed dictionary.
    pub fn to_dict(&self) -> BTreeMap<String, Value> {
        self.columns
            .names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| self.get_at(i).map(|v| (name.clone(), v)))
            .collect()
    }
}
