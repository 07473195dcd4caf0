#![allow(missing_docs)]

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;

use doclite::engine::{MemoryEngine, Store};
use doclite::query::{
    DataSource, Expression, LiveQueryConfig, Parameters, Query, QueryBuilder, SelectResult,
};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(400);

fn test_config() -> LiveQueryConfig {
    LiveQueryConfig {
        coalesce_window: Duration::from_millis(40),
        burst_delay: Duration::from_millis(80),
    }
}

/// A delivered change, reduced to what the tests assert on.
#[derive(Debug)]
struct Event {
    rows: Option<usize>,
    error: bool,
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn channel_listener(query: &Query) -> (doclite::query::ListenerToken, Receiver<Event>) {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    let tx: Arc<Mutex<Sender<Event>>> = Arc::new(Mutex::new(tx));
    let token = query
        .add_change_listener(move |change| {
            let event = Event {
                rows: change.results().map(|r| r.all_results().len()),
                error: change.error().is_some(),
            };
            let _ = tx.lock().unwrap().send(event);
        })
        .expect("add listener");
    (token, rx)
}

fn drain(rx: &Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(QUIET) {
        events.push(event);
    }
    events
}

fn items_query(store: &Store) -> Query {
    let query = QueryBuilder::select(vec![SelectResult::property("name")])
        .unwrap()
        .from(DataSource::collection("items"))
        .create_query(store);
    query.set_live_query_config(test_config());
    query
}

#[test]
fn two_listeners_share_one_engine_registration() {
    let engine = MemoryEngine::new();
    engine.insert("items", json!({"name": "first"}));
    let store = Store::new(Arc::new(engine.clone()));
    let query = items_query(&store);

    let (token_a, rx_a) = channel_listener(&query);
    let initial = rx_a.recv_timeout(WAIT).expect("initial evaluation");
    assert_eq!(initial.rows, Some(1));

    let (token_b, rx_b) = channel_listener(&query);
    assert_eq!(engine.observer_count(), 1);

    thread::sleep(Duration::from_millis(60));
    engine.insert("items", json!({"name": "second"}));

    let a = rx_a.recv_timeout(WAIT).expect("listener A notified");
    let b = rx_b.recv_timeout(WAIT).expect("listener B notified");
    assert_eq!(a.rows, Some(2));
    assert_eq!(b.rows, Some(2));

    // One listener leaving keeps the registration alive for the other.
    drain(&rx_a);
    drain(&rx_b);
    query.remove_change_listener(token_a);
    assert_eq!(engine.observer_count(), 1);

    thread::sleep(Duration::from_millis(60));
    engine.insert("items", json!({"name": "third"}));
    let b = rx_b.recv_timeout(WAIT).expect("remaining listener notified");
    assert_eq!(b.rows, Some(3));
    assert!(drain(&rx_a).is_empty());

    query.remove_change_listener(token_b);
    assert_eq!(engine.observer_count(), 0);
}

#[test]
fn notification_burst_coalesces_into_bounded_evaluations() {
    let engine = MemoryEngine::new();
    let store = Store::new(Arc::new(engine.clone()));
    let query = items_query(&store);

    let (_token, rx) = channel_listener(&query);
    let initial = rx.recv_timeout(WAIT).expect("initial evaluation");
    assert_eq!(initial.rows, Some(0));
    thread::sleep(Duration::from_millis(60));

    for i in 0..10 {
        engine.insert("items", json!({"name": format!("item-{i}")}));
    }

    let events = drain(&rx);
    assert!(!events.is_empty(), "burst produced no notification");
    assert!(
        events.len() <= 4,
        "burst of 10 changes produced {} evaluations",
        events.len()
    );
    assert_eq!(events.last().unwrap().rows, Some(10));
}

#[test]
fn unchanged_results_fire_no_callback() {
    let engine = MemoryEngine::new();
    engine.insert("people", json!({"name": "Bob", "age": 40}));
    let store = Store::new(Arc::new(engine.clone()));
    let query = QueryBuilder::select(vec![SelectResult::property("name")])
        .unwrap()
        .from(DataSource::collection("people"))
        .where_(Expression::property("age").greater_than(Expression::int(30)))
        .create_query(&store);
    query.set_live_query_config(test_config());

    let (_token, rx) = channel_listener(&query);
    assert_eq!(rx.recv_timeout(WAIT).expect("initial").rows, Some(1));
    thread::sleep(Duration::from_millis(60));

    // The new document does not satisfy the predicate, so the result set
    // is content-identical and no callback may fire.
    engine.insert("people", json!({"name": "Kid", "age": 10}));
    assert!(drain(&rx).is_empty());

    engine.insert("people", json!({"name": "Eve", "age": 35}));
    let changed = rx.recv_timeout(WAIT).expect("matching insert notifies");
    assert_eq!(changed.rows, Some(2));
}

#[test]
fn evaluation_error_is_delivered_and_observer_survives() {
    let engine = MemoryEngine::new();
    engine.insert("items", json!({"name": "first"}));
    let store = Store::new(Arc::new(engine.clone()));
    let query = QueryBuilder::select(vec![SelectResult::property("name")])
        .unwrap()
        .from(DataSource::collection("items"))
        .limit(Expression::parameter("max"))
        .create_query(&store);
    query.set_live_query_config(test_config());

    // `max` is unbound, so the first evaluation fails.
    let (_token, rx) = channel_listener(&query);
    let failed = rx.recv_timeout(WAIT).expect("error delivered");
    assert!(failed.error);
    assert!(failed.rows.is_none());

    // Parameter rebinding goes through the ordinary change path and the
    // observer is still alive to serve it.
    query.set_parameters(Parameters::new().set_int("max", 10));
    let recovered = rx.recv_timeout(WAIT).expect("recovered evaluation");
    assert!(!recovered.error);
    assert_eq!(recovered.rows, Some(1));
}

#[test]
fn dispose_stops_further_callbacks() {
    let engine = MemoryEngine::new();
    let store = Store::new(Arc::new(engine.clone()));
    let query = items_query(&store);

    let (_token, rx) = channel_listener(&query);
    assert_eq!(rx.recv_timeout(WAIT).expect("initial").rows, Some(0));

    query.dispose();
    assert_eq!(engine.observer_count(), 0);

    engine.insert("items", json!({"name": "late"}));
    assert!(drain(&rx).is_empty());
}
