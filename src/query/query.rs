//! The query handle: owns the compiled engine state, executes, and hosts
//! the live observer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::engine::{CompiledQuery, Store};
use crate::error::{DbError, Result};

use super::config::LiveQueryConfig;
use super::errors::BuildError;
use super::live::{LiveQuerier, ListenerToken, QueryChange};
use super::params::Parameters;
use super::result::{ColumnMap, ResultSet, ResultSetShared};
use super::stages::QuerySpec;

const EXPLAIN_SENTINEL: &str = "(unable to explain)";

/// A compiled-on-demand query against one store.
///
/// The IR is encoded once at construction; the engine-side compiled form is
/// created lazily on first execute/explain/listener and reused afterwards.
/// Parameter rebinding pushes values to the compiled form without
/// recompiling. Disposal is explicit and idempotent.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

struct QueryInner {
    store: Store,
    spec: QuerySpec,
    ir: serde_json::Value,
    compiled: Mutex<Option<Arc<dyn CompiledQuery>>>,
    columns: Mutex<Option<Arc<ColumnMap>>>,
    params: Arc<Mutex<Arc<Parameters>>>,
    cursors: Mutex<Vec<Weak<ResultSetShared>>>,
    live: Mutex<Option<Arc<LiveQuerier>>>,
    live_config: Mutex<LiveQueryConfig>,
    disposed: AtomicBool,
}

impl Query {
    pub(crate) fn new(store: Store, spec: QuerySpec) -> Self {
        let ir = spec.encode();
        Self {
            inner: Arc::new(QueryInner {
                store,
                spec,
                ir,
                compiled: Mutex::new(None),
                columns: Mutex::new(None),
                params: Arc::new(Mutex::new(Arc::new(Parameters::new()))),
                cursors: Mutex::new(Vec::new()),
                live: Mutex::new(None),
                live_config: Mutex::new(LiveQueryConfig::default()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The IR document this query compiles to.
    pub fn ir(&self) -> &serde_json::Value {
        &self.inner.ir
    }

    /// Overrides the live query timing configuration. Takes effect for
    /// observers created after the call.
    pub fn set_live_query_config(&self, config: LiveQueryConfig) {
        *self.inner.live_config.lock() = config;
    }

    /// Current parameter bindings.
    pub fn parameters(&self) -> Parameters {
        (**self.inner.params.lock()).clone()
    }

    /// Replaces the parameter bindings with an immutable snapshot.
    ///
    /// If the query is already compiled the values are pushed to the
    /// compiled form without recompilation, and any live observer re-runs
    /// through the ordinary change path.
    pub fn set_parameters(&self, params: Parameters) {
        let snapshot = Arc::new(params);
        *self.inner.params.lock() = snapshot.clone();

        let compiled = self.inner.compiled.lock().clone();
        if let Some(compiled) = compiled {
            self.inner
                .store
                .locked_detached(|| compiled.set_parameters(&snapshot.to_json()));
        }
        let live = self.inner.live.lock().clone();
        if let Some(live) = live {
            live.trigger();
        }
    }

    /// Compiles (if needed) and runs the query, returning a result cursor.
    ///
    /// When the engine produces no enumerator an explicit empty cursor is
    /// returned, never a null result.
    pub fn execute(&self) -> Result<ResultSet> {
        self.check_disposed()?;
        self.check_match_slots()?;
        let (compiled, columns) = self.ensure_compiled()?;
        let params = self.inner.params.lock().to_json();

        let outcome = self
            .inner
            .store
            .locked_detached(|| compiled.run(&params))
            .map_err(DbError::Execution)?;

        let results = match outcome {
            Some(enumerator) => ResultSet::from_enumerator(columns, enumerator),
            None => ResultSet::empty(columns),
        };

        let mut cursors = self.inner.cursors.lock();
        cursors.retain(|weak| weak.strong_count() > 0);
        cursors.push(Arc::downgrade(results.shared()));
        Ok(results)
    }

    /// The engine's human-readable execution plan. Never fails: internal
    /// errors yield a sentinel string.
    pub fn explain(&self) -> String {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return EXPLAIN_SENTINEL.to_owned();
        }
        let compiled = match self.ensure_compiled() {
            Ok((compiled, _)) => compiled,
            Err(_) => return EXPLAIN_SENTINEL.to_owned(),
        };
        self.inner
            .store
            .locked_detached(|| compiled.explain())
            .unwrap_or_else(|_| EXPLAIN_SENTINEL.to_owned())
    }

    /// Registers a change listener, starting live observation on the first
    /// registration. Subsequent listeners share the single engine-level
    /// observer.
    pub fn add_change_listener(
        &self,
        listener: impl Fn(QueryChange) + Send + Sync + 'static,
    ) -> Result<ListenerToken> {
        self.check_disposed()?;
        let mut live = self.inner.live.lock();
        let querier = if let Some(querier) = live.as_ref() {
            querier.clone()
        } else {
            let (compiled, columns) = self.ensure_compiled()?;
            let querier = Arc::new(LiveQuerier::start(
                self.inner.store.clone(),
                compiled,
                columns,
                self.inner.params.clone(),
                *self.inner.live_config.lock(),
            )?);
            info!("live query observer created");
            *live = Some(querier.clone());
            querier
        };
        drop(live);
        Ok(querier.add_listener(Arc::new(listener)))
    }

    /// Unregisters a listener by token. When the count reaches zero the
    /// engine-level observer is torn down synchronously.
    pub fn remove_change_listener(&self, token: ListenerToken) {
        let mut live = self.inner.live.lock();
        if let Some(querier) = live.as_ref() {
            querier.remove_listener(token);
            if querier.listener_count() == 0 {
                querier.stop();
                *live = None;
                info!("live query observer torn down");
            }
        }
    }

    /// Releases engine resources: stops live observation, invalidates every
    /// open cursor, then drops the compiled handle. Safe to call twice.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    fn check_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(DbError::Disposed("query"));
        }
        Ok(())
    }

    fn check_match_slots(&self) -> Result<()> {
        for predicate in [&self.inner.spec.where_, &self.inner.spec.having]
            .into_iter()
            .flatten()
        {
            if let Some(index) = predicate.find_unfilled_match() {
                return Err(BuildError::MissingMatchText { index }.into());
            }
        }
        Ok(())
    }

    fn ensure_compiled(&self) -> Result<(Arc<dyn CompiledQuery>, Arc<ColumnMap>)> {
        let mut compiled_slot = self.inner.compiled.lock();
        if let Some(compiled) = &*compiled_slot {
            let columns = self
                .inner
                .columns
                .lock()
                .clone()
                .unwrap_or_else(|| Arc::new(ColumnMap::new(Vec::new())));
            return Ok((compiled.clone(), columns));
        }

        debug!("compiling query IR");
        let compiled = self
            .inner
            .store
            .locked(|engine| engine.compile(&self.inner.ir))
            .map_err(DbError::Compile)?;

        let columns = Arc::new(self.resolve_columns(compiled.column_names())?);
        self.inner
            .store
            .locked_detached(|| compiled.set_parameters(&self.inner.params.lock().to_json()));

        *compiled_slot = Some(compiled.clone());
        *self.inner.columns.lock() = Some(columns.clone());
        Ok((compiled, columns))
    }

    /// Engine introspection reports `*` for wildcard projections; those
    /// take the data source's column name. Duplicates are a compile-level
    /// failure.
    fn resolve_columns(&self, mut names: Vec<String>) -> Result<ColumnMap> {
        let fallback = self
            .inner
            .spec
            .from
            .as_ref()
            .map(|from| from.column_name().to_owned())
            .unwrap_or_else(|| "*".to_owned());
        for name in &mut names {
            if name == "*" {
                *name = fallback.clone();
            }
        }
        let mut seen = std::collections::HashSet::new();
        for name in &names {
            if !seen.insert(name.clone()) {
                return Err(DbError::DuplicateColumn(name.clone()));
            }
        }
        Ok(ColumnMap::new(names))
    }
}

impl QueryInner {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing query");
        let live = self.live.lock().take();
        if let Some(querier) = live {
            querier.stop();
        }
        for cursor in self.cursors.lock().drain(..) {
            if let Some(cursor) = cursor.upgrade() {
                cursor.invalidate();
            }
        }
        self.compiled.lock().take();
        self.columns.lock().take();
    }
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("ir", &self.inner.ir).finish()
    }
}
