//! Observe multiplexer tests.
//!
//! Covers the delivery contract seen by subscriber handles:
//! - nothing reaches a handle before the multiplexer is ready
//! - a handle attached later first sees the current result set
//! - every handle sees the same changes in the same order
//! - teardown happens exactly once, only when no handle is attached or pending

use crossbeam_channel::{unbounded, Receiver};
use livequery::{
    DocumentId, Fields, HandleId, LiveQueryError, ObserveCallbacks, ObserveEvent, ObserveHandle,
    ObserveMultiplexer,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn id(s: &str) -> DocumentId {
    DocumentId::new(s)
}

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

fn drain(rx: &Receiver<ObserveEvent>) -> Vec<ObserveEvent> {
    rx.try_iter().collect()
}

fn ids(events: &[ObserveEvent]) -> Vec<String> {
    events.iter().map(|e| e.id().to_string()).collect()
}

fn counting_mux(ordered: bool) -> (ObserveMultiplexer, Arc<AtomicUsize>) {
    init_tracing();
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stops);
    let mux = ObserveMultiplexer::with_on_stop(ordered, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    (mux, stops)
}

// =============================================================================
// READINESS
// =============================================================================

#[test]
fn test_handles_before_and_after_ready() {
    let (mux, _stops) = counting_mux(false);
    mux.added(id("a"), fields(json!({"n": 1}))).unwrap();
    mux.added(id("b"), fields(json!({"n": 2}))).unwrap();

    let (tx1, rx1) = unbounded();
    let attaching = {
        let mux = mux.clone();
        thread::spawn(move || mux.add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx1)))
    };

    // Attached but not ready: nothing may be delivered yet.
    wait_for(|| mux.handle_count() == 1 && mux.pending_attach_count() == 0);
    mux.flush().unwrap();
    assert!(drain(&rx1).is_empty());
    assert!(!mux.is_ready());

    mux.ready().unwrap();
    let _h1 = attaching.join().unwrap().unwrap();
    let first = drain(&rx1);
    assert_eq!(ids(&first), vec!["a", "b"]);
    assert!(first.iter().all(|e| matches!(e, ObserveEvent::Added { .. })));

    // Attached after ready: initial adds arrive before the call returns.
    let (tx2, rx2) = unbounded();
    let _h2 = mux
        .add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx2))
        .unwrap();
    assert_eq!(ids(&drain(&rx2)), vec!["a", "b"]);

    mux.removed(id("a")).unwrap();
    mux.flush().unwrap();
    assert_eq!(drain(&rx1), vec![ObserveEvent::Removed { id: id("a") }]);
    assert_eq!(drain(&rx2), vec![ObserveEvent::Removed { id: id("a") }]);
}

#[test]
fn test_changes_before_ready_fold_into_initial_adds() {
    let (mux, _stops) = counting_mux(false);
    mux.added(id("a"), fields(json!({"title": "draft"}))).unwrap();
    let mut changes = livequery::ChangedFields::new();
    changes.insert("title".to_string(), Some(json!("final")));
    mux.changed(id("a"), changes).unwrap();
    mux.added(id("b"), Fields::new()).unwrap();
    mux.removed(id("b")).unwrap();
    mux.ready().unwrap();

    let (tx, rx) = unbounded();
    let _h = mux
        .add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx))
        .unwrap();
    assert_eq!(
        drain(&rx),
        vec![ObserveEvent::Added {
            id: id("a"),
            fields: fields(json!({"title": "final"})),
        }]
    );
}

#[test]
fn test_waiting_attaches_return_after_the_whole_replay() {
    let (mux, _stops) = counting_mux(false);
    mux.added(id("a"), Fields::new()).unwrap();

    // The first handle's replay blocks until the gate opens.
    let (gate_tx, gate_rx) = unbounded::<()>();
    let (seen_tx, seen_rx) = unbounded();
    let first = {
        let mux = mux.clone();
        let callbacks = ObserveCallbacks::new().added(move |id, _| {
            let _ = gate_rx.recv();
            let _ = seen_tx.send(id.clone());
        });
        thread::spawn(move || mux.add_handle_and_send_initial_adds(callbacks))
    };
    wait_for(|| mux.handle_count() == 1 && mux.pending_attach_count() == 0);

    let (tx, rx) = unbounded();
    let second = {
        let mux = mux.clone();
        thread::spawn(move || mux.add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx)))
    };
    wait_for(|| mux.handle_count() == 2 && mux.pending_attach_count() == 0);

    mux.ready().unwrap();
    wait_for(|| mux.is_ready());
    thread::sleep(Duration::from_millis(50));
    assert!(!first.is_finished());
    assert!(!second.is_finished());
    assert!(drain(&rx).is_empty());

    gate_tx.send(()).unwrap();
    let _h1 = first.join().unwrap().unwrap();
    let _h2 = second.join().unwrap().unwrap();
    assert_eq!(seen_rx.try_iter().collect::<Vec<_>>(), vec![id("a")]);
    assert_eq!(ids(&drain(&rx)), vec!["a"]);
}

#[test]
fn test_ids_of_different_types_are_different_documents() {
    let (mux, _stops) = counting_mux(false);
    let number = DocumentId::from_json(&json!(12)).unwrap();
    let string = DocumentId::from_json(&json!("12")).unwrap();
    let object_id = DocumentId::from_json(&json!({"$oid": "5f1d"})).unwrap();
    let hex = DocumentId::from_json(&json!("5f1d")).unwrap();

    mux.added(number.clone(), fields(json!({"kind": "number"}))).unwrap();
    mux.added(string.clone(), fields(json!({"kind": "string"}))).unwrap();
    mux.added(object_id, Fields::new()).unwrap();
    mux.added(hex, Fields::new()).unwrap();
    mux.ready().unwrap();
    mux.flush().unwrap();
    assert_eq!(mux.snapshot().len(), 4);

    mux.removed(number).unwrap();
    mux.flush().unwrap();
    let left = mux.snapshot();
    assert_eq!(left.len(), 3);
    assert!(left.iter().any(|(id, f)| *id == string && f["kind"] == "string"));
}

#[test]
fn test_ready_twice_is_rejected() {
    let (mux, _stops) = counting_mux(false);
    mux.ready().unwrap();
    assert!(matches!(mux.ready(), Err(LiveQueryError::AlreadyReady)));
}

// =============================================================================
// TEARDOWN
// =============================================================================

#[test]
fn test_last_handle_leaving_while_attach_queued() {
    let (mux, stops) = counting_mux(false);
    mux.ready().unwrap();
    let h1 = mux.add_handle_and_send_initial_adds(ObserveCallbacks::new()).unwrap();

    // Hold the queue so the second attach stays scheduled but not performed.
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
    mux.on_flush(move || {
        let _ = gate_rx.recv_timeout(Duration::from_secs(5));
    })
    .unwrap();

    let attaching = {
        let mux = mux.clone();
        thread::spawn(move || mux.add_handle_and_send_initial_adds(ObserveCallbacks::new()))
    };
    wait_for(|| mux.pending_attach_count() == 1);

    h1.stop();
    assert_eq!(stops.load(Ordering::SeqCst), 0);
    assert!(!mux.is_stopped());

    gate_tx.send(()).unwrap();
    let h2 = attaching.join().unwrap().unwrap();
    assert_eq!(mux.handle_count(), 1);
    assert_eq!(stops.load(Ordering::SeqCst), 0);

    h2.stop();
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(mux.is_stopped());
}

#[test]
fn test_stopped_multiplexer_rejects_everything() {
    let (mux, stops) = counting_mux(false);
    mux.ready().unwrap();
    let handle = mux.add_handle_and_send_initial_adds(ObserveCallbacks::new()).unwrap();
    handle.stop();
    handle.stop();
    drop(handle);
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    assert!(matches!(mux.added(id("x"), Fields::new()), Err(LiveQueryError::MultiplexerStopped)));
    assert!(matches!(
        mux.add_handle_and_send_initial_adds(ObserveCallbacks::new()),
        Err(LiveQueryError::MultiplexerStopped)
    ));
    assert!(matches!(mux.on_flush(|| {}), Err(LiveQueryError::MultiplexerStopped)));
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handle_removed_during_its_initial_adds() {
    let (mux, stops) = counting_mux(false);
    for name in ["a", "b", "c"] {
        mux.added(id(name), Fields::new()).unwrap();
    }
    mux.ready().unwrap();

    // First handle of a multiplexer is numbered 1.
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let remover = mux.clone();
    let handle = mux
        .add_handle_and_send_initial_adds(ObserveCallbacks::new().added(move |_id, _fields| {
            counter.fetch_add(1, Ordering::SeqCst);
            remover.remove_handle(HandleId(1));
        }))
        .unwrap();

    assert_eq!(handle.id(), HandleId(1));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(mux.is_stopped());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handle_can_stop_itself_from_a_callback() {
    let (mux, _stops) = counting_mux(false);
    mux.ready().unwrap();

    let slot: Arc<Mutex<Option<ObserveHandle>>> = Arc::new(Mutex::new(None));
    let changes = Arc::new(AtomicUsize::new(0));
    let (own_slot, counter) = (Arc::clone(&slot), Arc::clone(&changes));
    let handle = mux
        .add_handle_and_send_initial_adds(ObserveCallbacks::new().changed(move |_id, _fields| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = own_slot.lock().take() {
                handle.stop();
            }
        }))
        .unwrap();
    *slot.lock() = Some(handle);

    let (tx, rx) = unbounded();
    let _other = mux
        .add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx))
        .unwrap();

    mux.added(id("a"), Fields::new()).unwrap();
    for _ in 0..3 {
        mux.changed(id("a"), livequery::ChangedFields::new()).unwrap();
    }
    mux.flush().unwrap();

    assert_eq!(changes.load(Ordering::SeqCst), 1);
    assert_eq!(drain(&rx).len(), 4);
    assert_eq!(mux.handle_count(), 1);
    assert!(!mux.is_stopped());
}

// =============================================================================
// ORDERING
// =============================================================================

#[test]
fn test_all_handles_see_the_same_sequence() {
    let (mux, _stops) = counting_mux(false);
    mux.ready().unwrap();
    let (tx1, rx1) = unbounded();
    let (tx2, rx2) = unbounded();
    let _h1 = mux.add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx1)).unwrap();
    let _h2 = mux.add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx2)).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let mux = mux.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let doc = id(&format!("{p}-{i}"));
                    mux.added(doc.clone(), fields(json!({"i": i}))).unwrap();
                    let mut change = livequery::ChangedFields::new();
                    change.insert("i".to_string(), None);
                    mux.changed(doc, change).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    mux.flush().unwrap();

    let first = drain(&rx1);
    let second = drain(&rx2);
    assert_eq!(first.len(), 200);
    assert_eq!(first, second);
}

#[test]
fn test_late_handles_never_see_unknown_ids() {
    let (mux, _stops) = counting_mux(false);
    mux.ready().unwrap();

    let producer = {
        let mux = mux.clone();
        thread::spawn(move || {
            for i in 0..300 {
                let doc = id(&format!("d{i}"));
                mux.added(doc.clone(), Fields::new()).unwrap();
                mux.changed(doc.clone(), livequery::ChangedFields::new()).unwrap();
                if i % 2 == 0 {
                    mux.removed(doc).unwrap();
                }
            }
        })
    };

    let violations = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    let mut views = Vec::new();
    for _ in 0..5 {
        let view: Arc<Mutex<BTreeSet<DocumentId>>> = Arc::new(Mutex::new(BTreeSet::new()));
        let (on_add, on_change, on_remove) = (view.clone(), view.clone(), view.clone());
        let (bad_add, bad_change, bad_remove) =
            (violations.clone(), violations.clone(), violations.clone());
        let callbacks = ObserveCallbacks::new()
            .added(move |id, _fields| {
                if !on_add.lock().insert(id.clone()) {
                    bad_add.fetch_add(1, Ordering::SeqCst);
                }
            })
            .changed(move |id, _fields| {
                if !on_change.lock().contains(id) {
                    bad_change.fetch_add(1, Ordering::SeqCst);
                }
            })
            .removed(move |id| {
                if !on_remove.lock().remove(id) {
                    bad_remove.fetch_add(1, Ordering::SeqCst);
                }
            });
        handles.push(mux.add_handle_and_send_initial_adds(callbacks).unwrap());
        views.push(view);
        thread::sleep(Duration::from_millis(1));
    }

    producer.join().unwrap();
    mux.flush().unwrap();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    let expected: BTreeSet<DocumentId> = mux.snapshot().into_iter().map(|(id, _)| id).collect();
    assert_eq!(expected.len(), 150);
    for view in views {
        assert_eq!(*view.lock(), expected);
    }
}

#[test]
fn test_on_flush_runs_after_queued_changes() {
    let (mux, _stops) = counting_mux(false);
    mux.ready().unwrap();
    let (tx, rx) = unbounded();
    let _h = mux.add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx)).unwrap();

    for i in 0..10 {
        mux.added(id(&format!("d{i}")), Fields::new()).unwrap();
    }
    let (seen_tx, seen_rx) = crossbeam_channel::bounded(1);
    let probe = rx.clone();
    mux.on_flush(move || {
        let _ = seen_tx.send(probe.len());
    })
    .unwrap();

    assert_eq!(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 10);
}

#[test]
fn test_panicking_callback_does_not_starve_others() {
    let (mux, _stops) = counting_mux(false);
    mux.ready().unwrap();
    let _bad = mux
        .add_handle_and_send_initial_adds(
            ObserveCallbacks::new().added(|_id, _fields| panic!("subscriber bug")),
        )
        .unwrap();
    let (tx, rx) = unbounded();
    let _good = mux.add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx)).unwrap();

    mux.added(id("a"), Fields::new()).unwrap();
    mux.added(id("b"), Fields::new()).unwrap();
    mux.flush().unwrap();
    assert_eq!(ids(&drain(&rx)), vec!["a", "b"]);
}

// =============================================================================
// ORDERED QUERIES
// =============================================================================

#[test]
fn test_ordered_query_delivers_positions() {
    let (mux, _stops) = counting_mux(true);
    mux.added_before(id("b"), Fields::new(), None).unwrap();
    mux.added_before(id("a"), Fields::new(), Some(id("b"))).unwrap();
    mux.ready().unwrap();

    let (tx, rx) = unbounded();
    let _h = mux.add_handle_and_send_initial_adds(ObserveCallbacks::channel(tx)).unwrap();
    let initial = drain(&rx);
    assert_eq!(ids(&initial), vec!["a", "b"]);
    assert!(initial
        .iter()
        .all(|e| matches!(e, ObserveEvent::AddedBefore { before: None, .. })));

    mux.moved_before(id("b"), Some(id("a"))).unwrap();
    mux.flush().unwrap();
    assert_eq!(
        drain(&rx),
        vec![ObserveEvent::MovedBefore {
            id: id("b"),
            before: Some(id("a")),
        }]
    );
    let order: Vec<String> = mux.snapshot().into_iter().map(|(id, _)| id.to_string()).collect();
    assert_eq!(order, vec!["b", "a"]);
}

#[test]
fn test_ordered_query_falls_back_to_added() {
    let (mux, _stops) = counting_mux(true);
    mux.ready().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _h = mux
        .add_handle_and_send_initial_adds(ObserveCallbacks::new().added(move |id, _fields| {
            sink.lock().push(id.to_string());
        }))
        .unwrap();

    mux.added_before(id("x"), Fields::new(), None).unwrap();
    mux.added_before(id("y"), Fields::new(), Some(id("x"))).unwrap();
    mux.flush().unwrap();
    assert_eq!(*seen.lock(), vec!["x", "y"]);
}

#[test]
fn test_callback_kind_must_match_orderedness() {
    let (ordered, _a) = counting_mux(true);
    let (unordered, _b) = counting_mux(false);
    assert!(matches!(
        ordered.added(id("a"), Fields::new()),
        Err(LiveQueryError::UnsupportedCallback { .. })
    ));
    assert!(matches!(
        unordered.moved_before(id("a"), None),
        Err(LiveQueryError::UnsupportedCallback { .. })
    ));
    unordered.removed(id("a")).unwrap();
}
