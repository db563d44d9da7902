//! In-process notification router.
//!
//! Listeners register a `TriggerPattern`; `fire` delivers a `Trigger` to every
//! listener whose pattern is compatible with it and reports completion only
//! after every one of those listeners has signalled its `Completion`.
//!
//! A listener signals by dropping (or calling `done` on) the `Completion` it
//! was handed. It may pass the token to another thread, e.g. into a
//! multiplexer's queue, so a writer waiting on `fire_and_wait` blocks until
//! the change has been fanned out downstream.
//!
//! # Example
//!
//! ```ignore
//! let crossbar = Crossbar::new();
//! let _listener = crossbar.listen(TriggerPattern::collection("posts"), |trigger, done| {
//!     println!("{} changed", trigger.collection);
//!     done.done();
//! });
//! crossbar.fire_and_wait(Trigger::new("posts", Some(DocumentId::new("p1"))));
//! ```

mod trigger;

pub use trigger::{Trigger, TriggerPattern};

use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Listener callback.
pub type ListenerFn = dyn Fn(&Trigger, Completion) + Send + Sync;

/// Unique identifier for a listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

struct Listener {
    pattern: TriggerPattern,
    callback: Box<ListenerFn>,
}

/// Listeners bucketed by the collection their pattern names (`None` for
/// patterns that match any collection).
type ListenerTable = HashMap<Option<String>, BTreeMap<ListenerId, Arc<Listener>>>;

struct CrossbarInner {
    listeners: RwLock<ListenerTable>,
    next_id: AtomicU64,
}

/// Routes triggers to listeners.
#[derive(Clone)]
pub struct Crossbar {
    inner: Arc<CrossbarInner>,
}

impl Crossbar {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CrossbarInner {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener. The registration lives until the handle is
    /// stopped or dropped.
    pub fn listen<F>(&self, pattern: TriggerPattern, callback: F) -> ListenHandle
    where
        F: Fn(&Trigger, Completion) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let bucket = pattern.collection.clone();
        let listener = Arc::new(Listener {
            pattern,
            callback: Box::new(callback),
        });

        self.inner
            .listeners
            .write()
            .entry(bucket.clone())
            .or_default()
            .insert(id, listener);

        ListenHandle {
            id,
            bucket,
            crossbar: Arc::downgrade(&self.inner),
            stopped: AtomicBool::new(false),
        }
    }

    /// Deliver `trigger` to every matching listener, in registration order, on
    /// the calling thread. `on_complete` runs once all of them have signalled
    /// completion, possibly on another thread.
    ///
    /// A panicking listener is logged and counts as completed; it does not
    /// keep the remaining listeners from running.
    pub fn fire<F>(&self, trigger: Trigger, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let matching = self.matching_listeners(&trigger);
        if matching.is_empty() {
            on_complete();
            return;
        }

        debug!(
            collection = %trigger.collection,
            listeners = matching.len(),
            "firing trigger"
        );

        let state = Arc::new(FireState {
            remaining: AtomicUsize::new(matching.len()),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });

        for (id, listener) in matching {
            let completion = Completion {
                state: Arc::clone(&state),
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                (listener.callback)(&trigger, completion)
            }));
            if let Err(payload) = result {
                error!(
                    listener = id.0,
                    collection = %trigger.collection,
                    "listener panicked: {}",
                    panic_message(&payload)
                );
            }
        }
    }

    /// Fire and block until every matching listener has completed.
    pub fn fire_and_wait(&self, trigger: Trigger) {
        let (tx, rx) = bounded::<()>(1);
        self.fire(trigger, move || {
            let _ = tx.send(());
        });
        // The sender is owned by the completion state, which is only dropped
        // after it has run, so this cannot disconnect early.
        let _ = rx.recv();
    }

    /// Number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().values().map(BTreeMap::len).sum()
    }

    fn matching_listeners(&self, trigger: &Trigger) -> Vec<(ListenerId, Arc<Listener>)> {
        let table = self.inner.listeners.read();
        let mut out: Vec<(ListenerId, Arc<Listener>)> = [Some(trigger.collection.clone()), None]
            .iter()
            .filter_map(|bucket| table.get(bucket))
            .flat_map(|bucket| bucket.iter())
            .filter(|(_, listener)| listener.pattern.matches(trigger))
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

impl Default for Crossbar {
    fn default() -> Self {
        Self::new()
    }
}

struct FireState {
    remaining: AtomicUsize,
    on_complete: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Completion token handed to a listener for one fired trigger.
///
/// The fire completes once every token has been dropped.
pub struct Completion {
    state: Arc<FireState>,
}

impl Completion {
    /// Signal completion explicitly.
    pub fn done(self) {}
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let callback = self.state.on_complete.lock().take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

/// Handle to a listener registration.
pub struct ListenHandle {
    id: ListenerId,
    bucket: Option<String>,
    crossbar: Weak<CrossbarInner>,
    stopped: AtomicBool,
}

impl ListenHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the registration. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.crossbar.upgrade() else {
            return;
        };
        let mut table = inner.listeners.write();
        if let Some(bucket) = table.get_mut(&self.bucket) {
            bucket.remove(&self.id);
            if bucket.is_empty() {
                table.remove(&self.bucket);
            }
        }
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;
    use std::thread;
    use std::time::Duration;

    fn recorder(
        crossbar: &Crossbar,
        pattern: TriggerPattern,
    ) -> (ListenHandle, Arc<Mutex<Vec<Trigger>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = crossbar.listen(pattern, move |trigger, _done| {
            sink.lock().push(trigger.clone());
        });
        (handle, seen)
    }

    #[test]
    fn test_collection_listener_sees_document_triggers() {
        let crossbar = Crossbar::new();
        let (_h, seen) = recorder(&crossbar, TriggerPattern::collection("c"));

        crossbar.fire_and_wait(Trigger::new("c", Some(DocumentId::new("x"))));
        crossbar.fire_and_wait(Trigger::new("other", Some(DocumentId::new("x"))));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, Some(DocumentId::new("x")));
    }

    #[test]
    fn test_id_listener_filters_other_ids_but_not_drops() {
        let crossbar = Crossbar::new();
        let (_h, seen) = recorder(
            &crossbar,
            TriggerPattern::collection("c").with_id(DocumentId::new("x")),
        );

        crossbar.fire_and_wait(Trigger::new("c", Some(DocumentId::new("y"))));
        crossbar.fire_and_wait(Trigger::new("c", Some(DocumentId::new("x"))));
        crossbar.fire_and_wait(Trigger::drop_collection("c"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].drop_collection);
    }

    #[test]
    fn test_wildcard_listener() {
        let crossbar = Crossbar::new();
        let (_h, seen) = recorder(&crossbar, TriggerPattern::all());
        crossbar.fire_and_wait(Trigger::new("a", None));
        crossbar.fire_and_wait(Trigger::new("b", None));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_fire_waits_for_deferred_completion() {
        let crossbar = Crossbar::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let _h = crossbar.listen(TriggerPattern::all(), move |_trigger, done| {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::SeqCst);
                done.done();
            });
        });

        crossbar.fire_and_wait(Trigger::new("c", None));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_listeners_completes_immediately() {
        let crossbar = Crossbar::new();
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        crossbar.fire(Trigger::new("c", None), move || flag.store(true, Ordering::SeqCst));
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let crossbar = Crossbar::new();
        let _bad = crossbar.listen(TriggerPattern::all(), |_trigger, _done| {
            panic!("listener failure");
        });
        let (_good, seen) = recorder(&crossbar, TriggerPattern::all());

        crossbar.fire_and_wait(Trigger::new("c", None));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_drop_unregisters() {
        let crossbar = Crossbar::new();
        let handle = crossbar.listen(TriggerPattern::all(), |_t, _d| {});
        let other = crossbar.listen(TriggerPattern::collection("c"), |_t, _d| {});
        assert_eq!(crossbar.listener_count(), 2);

        handle.stop();
        handle.stop();
        assert_eq!(crossbar.listener_count(), 1);

        drop(other);
        assert_eq!(crossbar.listener_count(), 0);
    }

    #[test]
    fn test_listener_can_stop_itself() {
        let crossbar = Crossbar::new();
        let slot: Arc<Mutex<Option<ListenHandle>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let handle = crossbar.listen(TriggerPattern::all(), move |_t, _d| {
            if let Some(h) = inner_slot.lock().take() {
                h.stop();
            }
        });
        *slot.lock() = Some(handle);

        crossbar.fire_and_wait(Trigger::new("c", None));
        assert_eq!(crossbar.listener_count(), 0);
    }
}
