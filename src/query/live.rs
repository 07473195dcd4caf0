//! Live query observation.
//!
//! One querier per query handle, created when the first change listener
//! registers and torn down synchronously when the last one unregisters.
//! Evaluation runs on a dedicated worker thread; listener callbacks are
//! fanned out from a separate delivery thread so a slow listener delays
//! only itself, never the next evaluation. The scheduler is the explicit
//! three-state machine Idle / Running / RunningWithPendingRerun: however
//! many notifications arrive while an evaluation is in flight, at most one
//! follow-up run is queued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value as Json;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh64::xxh64;

use crate::engine::{CompiledQuery, EngineError, ObserverGuard, Store};
use crate::error::{DbError, Result};

use super::config::LiveQueryConfig;
use super::params::Parameters;
use super::result::{ColumnMap, ResultSet};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying one registered change listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// A change event delivered to live query listeners.
pub struct QueryChange {
    results: Option<ResultSet>,
    error: Option<EngineError>,
}

impl QueryChange {
    /// The fresh result cursor, absent when evaluation failed.
    pub fn results(&self) -> Option<&ResultSet> {
        self.results.as_ref()
    }

    /// Consumes the event, yielding the result cursor.
    pub fn into_results(self) -> Option<ResultSet> {
        self.results
    }

    /// The evaluation error, if this change reports a failure.
    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }
}

type Listener = Arc<dyn Fn(QueryChange) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EvalState {
    Idle,
    Running,
    RunningWithPendingRerun,
}

enum WorkerMsg {
    Run(Duration),
    Stop,
}

struct Delivery {
    rows: Option<Arc<Vec<Vec<Json>>>>,
    error: Option<EngineError>,
}

pub(crate) struct LiveQuerier {
    inner: Arc<LiveInner>,
}

struct LiveInner {
    store: Store,
    compiled: Arc<dyn CompiledQuery>,
    columns: Arc<ColumnMap>,
    params: Arc<Mutex<Arc<Parameters>>>,
    config: LiveQueryConfig,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    state: Mutex<EvalState>,
    last_signature: Mutex<Option<u64>>,
    last_eval_started: Mutex<Option<Instant>>,
    generation: AtomicU64,
    worker_tx: Mutex<Option<Sender<WorkerMsg>>>,
    delivery_tx: Mutex<Option<Sender<Delivery>>>,
    observer: Mutex<Option<Box<dyn ObserverGuard>>>,
    closed: AtomicBool,
}

impl LiveQuerier {
    /// Registers the engine-level observer, spawns the evaluation worker
    /// and delivery threads, and schedules the initial evaluation.
    pub(crate) fn start(
        store: Store,
        compiled: Arc<dyn CompiledQuery>,
        columns: Arc<ColumnMap>,
        params: Arc<Mutex<Arc<Parameters>>>,
        config: LiveQueryConfig,
    ) -> Result<Self> {
        let (worker_tx, worker_rx) = mpsc::channel();
        let (delivery_tx, delivery_rx) = mpsc::channel();
        let inner = Arc::new(LiveInner {
            store,
            compiled,
            columns,
            params,
            config,
            listeners: Mutex::new(BTreeMap::new()),
            state: Mutex::new(EvalState::Idle),
            last_signature: Mutex::new(None),
            last_eval_started: Mutex::new(None),
            generation: AtomicU64::new(0),
            worker_tx: Mutex::new(Some(worker_tx)),
            delivery_tx: Mutex::new(Some(delivery_tx)),
            observer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let hook_target: Weak<LiveInner> = Arc::downgrade(&inner);
        let guard = inner
            .store
            .locked_detached(|| {
                inner.compiled.observe(Arc::new(move || {
                    if let Some(target) = hook_target.upgrade() {
                        target.trigger();
                    }
                }))
            })
            .map_err(DbError::Execution)?;
        guard.enable();
        *inner.observer.lock() = Some(guard);

        let worker_inner = inner.clone();
        thread::spawn(move || worker_loop(worker_inner, worker_rx));
        let delivery_inner = inner.clone();
        thread::spawn(move || delivery_loop(delivery_inner, delivery_rx));

        debug!("live querier started");
        inner.trigger();
        Ok(Self { inner })
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> ListenerToken {
        let token = ListenerToken(NEXT_TOKEN.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.lock().insert(token.0, listener);
        token
    }

    pub(crate) fn remove_listener(&self, token: ListenerToken) -> bool {
        self.inner.listeners.lock().remove(&token.0).is_some()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Routes parameter rebinding through the ordinary change path.
    pub(crate) fn trigger(&self) {
        self.inner.trigger();
    }

    /// Tears the querier down: no further callbacks fire once this begins.
    pub(crate) fn stop(&self) {
        self.inner.stop();
    }
}

impl LiveInner {
    fn trigger(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        match *state {
            EvalState::Idle => {
                *state = EvalState::Running;
                drop(state);
                let delay = self.debounce_delay();
                self.schedule(delay);
            }
            EvalState::Running => {
                *state = EvalState::RunningWithPendingRerun;
                trace!("evaluation in flight, queued one re-run");
            }
            EvalState::RunningWithPendingRerun => {}
        }
    }

    fn debounce_delay(&self) -> Duration {
        let burst = self
            .last_eval_started
            .lock()
            .map_or(false, |started| started.elapsed() < self.config.coalesce_window);
        if burst {
            self.config.burst_delay
        } else {
            Duration::ZERO
        }
    }

    fn schedule(&self, delay: Duration) {
        if let Some(tx) = &*self.worker_tx.lock() {
            let _ = tx.send(WorkerMsg::Run(delay));
        }
    }

    fn evaluate(&self) {
        *self.last_eval_started.lock() = Some(Instant::now());
        let generation = self.generation.load(Ordering::SeqCst);
        trace!(generation, "live query evaluating");

        let params = self.params.lock().to_json();
        let result = self.store.locked_detached(|| collect_rows(&*self.compiled, &params));

        match result {
            Ok(rows) => {
                let signature = signature_of(&rows);
                let changed = {
                    let mut last = self.last_signature.lock();
                    if *last == Some(signature) {
                        false
                    } else {
                        *last = Some(signature);
                        true
                    }
                };
                if changed {
                    debug!(generation, rows = rows.len(), "live query changed");
                    self.deliver(Some(Arc::new(rows)), None);
                } else {
                    trace!(generation, "live query unchanged");
                }
            }
            Err(err) => {
                warn!(generation, %err, "live query evaluation failed");
                self.deliver(None, Some(err));
            }
        }

        let mut state = self.state.lock();
        match *state {
            EvalState::RunningWithPendingRerun => {
                *state = EvalState::Running;
                drop(state);
                // The queued change arrived during this evaluation, which
                // by definition puts it inside the coalesce window.
                self.schedule(self.config.burst_delay);
            }
            _ => *state = EvalState::Idle,
        }
    }

    fn deliver(&self, rows: Option<Arc<Vec<Vec<Json>>>>, error: Option<EngineError>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &*self.delivery_tx.lock() {
            let _ = tx.send(Delivery { rows, error });
        }
    }

    fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("live querier stopping");
        if let Some(observer) = self.observer.lock().take() {
            observer.disable();
        }
        self.listeners.lock().clear();
        if let Some(tx) = self.worker_tx.lock().take() {
            let _ = tx.send(WorkerMsg::Stop);
        }
        self.delivery_tx.lock().take();
    }
}

impl Drop for LiveQuerier {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

fn collect_rows(
    compiled: &dyn CompiledQuery,
    params: &Json,
) -> std::result::Result<Vec<Vec<Json>>, EngineError> {
    let mut enumerator = match compiled.run(params)? {
        Some(enumerator) => enumerator,
        None => return Ok(Vec::new()),
    };
    let mut rows = Vec::new();
    while let Some(row) = enumerator.next_row()? {
        rows.push(row);
    }
    Ok(rows)
}

fn signature_of(rows: &[Vec<Json>]) -> u64 {
    let bytes = serde_json::to_vec(rows).unwrap_or_default();
    xxh64(&bytes, 0)
}

fn worker_loop(inner: Arc<LiveInner>, rx: Receiver<WorkerMsg>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let msg = match deadline {
            Some(due) => {
                let now = Instant::now();
                if due <= now {
                    None
                } else {
                    match rx.recv_timeout(due - now) {
                        Ok(msg) => Some(msg),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            },
        };
        match msg {
            Some(WorkerMsg::Run(delay)) => {
                let due = Instant::now() + delay;
                deadline = Some(deadline.map_or(due, |d| d.min(due)));
            }
            Some(WorkerMsg::Stop) => break,
            None => {
                deadline = None;
                inner.evaluate();
            }
        }
    }
    debug!("live query worker exited");
}

fn delivery_loop(inner: Arc<LiveInner>, rx: Receiver<Delivery>) {
    while let Ok(delivery) = rx.recv() {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let listeners: Vec<Listener> = inner.listeners.lock().values().cloned().collect();
        for listener in listeners {
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            let change = QueryChange {
                results: delivery
                    .rows
                    .clone()
                    .map(|rows| ResultSet::materialized(inner.columns.clone(), rows)),
                error: delivery.error.clone(),
            };
            listener(change);
        }
    }
    debug!("live query delivery exited");
}
