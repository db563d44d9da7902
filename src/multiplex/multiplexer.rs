use super::cache::ResultCache;
use super::handle::{HandleId, ObserveCallbacks, ObserveHandle};
use super::queue::TaskQueue;
use crate::crossbar::panic_message;
use crate::error::{LiveQueryError, Result};
use crate::types::{ChangedFields, DocumentId, Fields, ObserveEvent};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

static NEXT_MULTIPLEXER: AtomicU64 = AtomicU64::new(1);

type StopFn = Box<dyn FnOnce() + Send>;

struct MuxState {
    /// Set once `ready()` has been requested; guards against a second call.
    ready_requested: bool,
    ready: bool,
    /// Set once the ready replay has reached every handle attached before it.
    released: bool,
    stopped: bool,
    handles: BTreeMap<HandleId, Arc<ObserveCallbacks>>,
    cache: ResultCache,
    /// Attach tasks scheduled but not yet finished.
    pending_attach: usize,
    on_stop: Option<StopFn>,
}

struct MuxInner {
    id: u64,
    ordered: bool,
    queue: TaskQueue,
    state: Mutex<MuxState>,
    became_ready: Condvar,
    next_handle: AtomicU64,
}

/// One live query's result set, fanned out to any number of handles.
///
/// Every mutation goes through a private FIFO queue, so all handles see the
/// same changes in the same order. `remove_handle` is the one operation that
/// bypasses the queue.
#[derive(Clone)]
pub struct ObserveMultiplexer {
    inner: Arc<MuxInner>,
}

impl ObserveMultiplexer {
    pub fn new(ordered: bool) -> Result<Self> {
        Self::build(ordered, None)
    }

    /// `on_stop` runs exactly once, when the last handle leaves.
    pub fn with_on_stop<F>(ordered: bool, on_stop: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(ordered, Some(Box::new(on_stop)))
    }

    fn build(ordered: bool, on_stop: Option<StopFn>) -> Result<Self> {
        let id = NEXT_MULTIPLEXER.fetch_add(1, Ordering::Relaxed);
        let queue = TaskQueue::new(format!("observe-multiplexer-{id}"))?;
        Ok(Self {
            inner: Arc::new(MuxInner {
                id,
                ordered,
                queue,
                state: Mutex::new(MuxState {
                    ready_requested: false,
                    ready: false,
                    released: false,
                    stopped: false,
                    handles: BTreeMap::new(),
                    cache: ResultCache::new(ordered),
                    pending_attach: 0,
                    on_stop,
                }),
                became_ready: Condvar::new(),
                next_handle: AtomicU64::new(1),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_ordered(&self) -> bool {
        self.inner.ordered
    }

    /// Attach a new handle. Once the multiplexer is ready the handle receives
    /// the whole current result set as adds before any later change.
    ///
    /// Blocks until the multiplexer is ready. Fails with `Reentrant` when
    /// called from one of this multiplexer's own callbacks.
    pub fn add_handle_and_send_initial_adds(
        &self,
        callbacks: ObserveCallbacks,
    ) -> Result<ObserveHandle> {
        // Checked up front so a rejected call never counts as pending.
        if !self.inner.queue.is_safe_to_run_task() {
            return Err(LiveQueryError::Reentrant);
        }
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(LiveQueryError::MultiplexerStopped);
            }
            state.pending_attach += 1;
        }

        let id = HandleId(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let callbacks = Arc::new(callbacks.resolve(self.inner.ordered));
        let inner = Arc::clone(&self.inner);
        if let Err(e) = self.inner.queue.run_task(move || inner.attach(id, callbacks)) {
            let stop = {
                let mut state = self.inner.state.lock();
                state.pending_attach -= 1;
                state.handles.remove(&id);
                self.inner.take_stop(&mut state)
            };
            self.inner.teardown(stop);
            return Err(e);
        }

        // Dropping the handle on a failed wait detaches it again.
        let handle = ObserveHandle::new(id, self.clone());
        self.wait_until_ready()?;
        Ok(handle)
    }

    /// Count one attach as pending without scheduling it, keeping the
    /// multiplexer up until the matching `release_attach`.
    pub(crate) fn hold_attach(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(LiveQueryError::MultiplexerStopped);
        }
        state.pending_attach += 1;
        Ok(())
    }

    pub(crate) fn release_attach(&self) {
        let stop = {
            let mut state = self.inner.state.lock();
            state.pending_attach = state.pending_attach.saturating_sub(1);
            self.inner.take_stop(&mut state)
        };
        self.inner.teardown(stop);
    }

    /// Detach a handle immediately, without going through the queue. Tears
    /// the multiplexer down if no handles and no pending attaches remain.
    pub fn remove_handle(&self, id: HandleId) {
        let stop = {
            let mut state = self.inner.state.lock();
            if state.handles.remove(&id).is_none() {
                return;
            }
            debug!(multiplexer = self.inner.id, handle = id.0, "handle removed");
            self.inner.take_stop(&mut state)
        };
        self.inner.teardown(stop);
    }

    /// Mark the initial result set complete and send it to every handle
    /// attached so far.
    pub fn ready(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(LiveQueryError::MultiplexerStopped);
            }
            if state.ready_requested {
                return Err(LiveQueryError::AlreadyReady);
            }
            state.ready_requested = true;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.queue.queue_task(move || inner.make_ready())
    }

    /// Run `callback` on the queue after everything queued so far.
    pub fn on_flush<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return Err(LiveQueryError::MultiplexerStopped);
        }
        self.inner.queue.queue_task(callback)
    }

    /// Block until everything queued so far has been delivered.
    pub fn flush(&self) -> Result<()> {
        self.inner.queue.flush()
    }

    pub fn added(&self, id: DocumentId, fields: Fields) -> Result<()> {
        self.apply(ObserveEvent::Added { id, fields })
    }

    pub fn added_before(
        &self,
        id: DocumentId,
        fields: Fields,
        before: Option<DocumentId>,
    ) -> Result<()> {
        self.apply(ObserveEvent::AddedBefore { id, fields, before })
    }

    pub fn changed(&self, id: DocumentId, fields: ChangedFields) -> Result<()> {
        self.apply(ObserveEvent::Changed { id, fields })
    }

    pub fn moved_before(&self, id: DocumentId, before: Option<DocumentId>) -> Result<()> {
        self.apply(ObserveEvent::MovedBefore { id, before })
    }

    pub fn removed(&self, id: DocumentId) -> Result<()> {
        self.apply(ObserveEvent::Removed { id })
    }

    /// Queue a change: it updates the cache, then reaches every attached
    /// handle once the multiplexer is ready.
    pub fn apply(&self, event: ObserveEvent) -> Result<()> {
        let kind = event.kind();
        if !kind.valid_for(self.inner.ordered) {
            return Err(LiveQueryError::UnsupportedCallback {
                callback: kind.name(),
                ordering: if self.inner.ordered { "ordered" } else { "unordered" },
            });
        }
        if self.is_stopped() {
            return Err(LiveQueryError::MultiplexerStopped);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.queue.queue_task(move || inner.apply_change(event))
    }

    pub fn handle_count(&self) -> usize {
        self.inner.state.lock().handles.len()
    }

    pub fn pending_attach_count(&self) -> usize {
        self.inner.state.lock().pending_attach
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Current result set, in result order.
    pub fn snapshot(&self) -> Vec<(DocumentId, Fields)> {
        self.inner.state.lock().cache.snapshot()
    }

    fn wait_until_ready(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while !state.released && !state.stopped {
            self.inner.became_ready.wait(&mut state);
        }
        if state.released {
            Ok(())
        } else {
            Err(LiveQueryError::MultiplexerStopped)
        }
    }
}

impl fmt::Debug for ObserveMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ObserveMultiplexer")
            .field("id", &self.inner.id)
            .field("ordered", &self.inner.ordered)
            .field("ready", &state.ready)
            .field("stopped", &state.stopped)
            .field("handles", &state.handles.len())
            .field("docs", &state.cache.len())
            .finish()
    }
}

impl MuxInner {
    fn attach(&self, id: HandleId, callbacks: Arc<ObserveCallbacks>) {
        let ready = {
            let mut state = self.state.lock();
            state.handles.insert(id, Arc::clone(&callbacks));
            state.ready
        };
        if ready {
            self.send_adds(id, &callbacks);
        }

        let stop = {
            let mut state = self.state.lock();
            state.pending_attach -= 1;
            // The handle may have left during its own initial adds.
            self.take_stop(&mut state)
        };
        self.teardown(stop);
    }

    fn make_ready(&self) {
        let handles: Vec<(HandleId, Arc<ObserveCallbacks>)> = {
            let mut state = self.state.lock();
            if state.ready || state.stopped {
                return;
            }
            state.ready = true;
            state
                .handles
                .iter()
                .map(|(id, cb)| (*id, Arc::clone(cb)))
                .collect()
        };
        debug!(multiplexer = self.id, handles = handles.len(), "multiplexer ready");

        for (id, callbacks) in handles {
            if self.is_attached(id) {
                self.send_adds(id, &callbacks);
            }
        }
        self.state.lock().released = true;
        self.became_ready.notify_all();
    }

    fn apply_change(&self, event: ObserveEvent) {
        let handles: Vec<(HandleId, Arc<ObserveCallbacks>)> = {
            let mut state = self.state.lock();
            if let Err(e) = state.cache.apply(&event) {
                error!(
                    multiplexer = self.id,
                    error = %e,
                    "dropping change that does not fit the cache"
                );
                return;
            }
            if !state.ready {
                return;
            }
            state
                .handles
                .iter()
                .map(|(id, cb)| (*id, Arc::clone(cb)))
                .collect()
        };

        for (id, callbacks) in handles {
            // Handles can leave mid-fan-out.
            if self.is_attached(id) {
                self.invoke(id, &callbacks, &event);
            }
        }
    }

    /// Replay the cache to one handle. Runs on the queue, after ready.
    fn send_adds(&self, id: HandleId, callbacks: &ObserveCallbacks) {
        let docs = self.state.lock().cache.snapshot();
        for (doc_id, fields) in docs {
            if !self.is_attached(id) {
                debug!(multiplexer = self.id, handle = id.0, "handle left during initial adds");
                return;
            }
            let event = if self.ordered {
                ObserveEvent::AddedBefore {
                    id: doc_id,
                    fields,
                    before: None,
                }
            } else {
                ObserveEvent::Added { id: doc_id, fields }
            };
            self.invoke(id, callbacks, &event);
        }
    }

    fn invoke(&self, id: HandleId, callbacks: &ObserveCallbacks, event: &ObserveEvent) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| callbacks.dispatch(event)));
        if let Err(payload) = result {
            error!(
                multiplexer = self.id,
                handle = id.0,
                callback = event.kind().name(),
                "observe callback panicked: {}",
                panic_message(&payload)
            );
        }
    }

    fn is_attached(&self, id: HandleId) -> bool {
        self.state.lock().handles.contains_key(&id)
    }

    /// Claim teardown if the multiplexer just became unused.
    fn take_stop(&self, state: &mut MuxState) -> Option<Option<StopFn>> {
        if state.stopped || !state.handles.is_empty() || state.pending_attach > 0 {
            return None;
        }
        state.stopped = true;
        Some(state.on_stop.take())
    }

    fn teardown(&self, claimed: Option<Option<StopFn>>) {
        let Some(on_stop) = claimed else {
            return;
        };
        info!(multiplexer = self.id, "observe multiplexer stopped");
        self.queue.close();
        self.became_ready.notify_all();
        if let Some(on_stop) = on_stop {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(on_stop)) {
                error!(multiplexer = self.id, "on_stop panicked: {}", panic_message(&payload));
            }
        }
    }
}
