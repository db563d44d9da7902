use super::entry::OplogEntry;
use super::source::{OplogCursor, OplogFilter, ReplicationLog};
use crate::crossbar::{Completion, Crossbar, ListenHandle, Trigger, TriggerPattern};
use crate::error::{LiveQueryError, Result};
use crate::types::Position;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info};

/// Tailer configuration.
#[derive(Clone, Debug)]
pub struct TailerConfig {
    /// Database whose namespaces are tailed.
    pub db_name: String,
    /// How long a cursor read blocks before the stop flag is re-checked.
    pub poll_interval: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            db_name: "meteor".to_string(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailerPhase {
    Idle,
    Connecting,
    Tailing,
    Stopped,
}

impl fmt::Display for TailerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TailerPhase::Idle => "idle",
            TailerPhase::Connecting => "connecting",
            TailerPhase::Tailing => "tailing",
            TailerPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct CatchUp {
    target: Position,
    done: Sender<()>,
}

struct TailerState {
    phase: TailerPhase,
    last_processed: Option<Position>,
    /// Ascending by target.
    pending: VecDeque<CatchUp>,
    failure: Option<String>,
}

struct TailerInner {
    config: TailerConfig,
    filter: OplogFilter,
    log: Arc<dyn ReplicationLog>,
    crossbar: Crossbar,
    state: Mutex<TailerState>,
    phase_changed: Condvar,
    stop_requested: AtomicBool,
    thread_id: OnceLock<ThreadId>,
}

/// Follows the replication log and publishes one trigger per entry.
///
/// Entries are delivered strictly in log order: the next entry is not read
/// until every listener of the current one has completed. Protocol
/// violations stop the tailer for good.
pub struct OplogTailer {
    inner: Arc<TailerInner>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl OplogTailer {
    /// Create an idle tailer publishing on a fresh crossbar.
    pub fn new(log: Arc<dyn ReplicationLog>, config: TailerConfig) -> Self {
        Self::with_crossbar(log, config, Crossbar::new())
    }

    pub fn with_crossbar(
        log: Arc<dyn ReplicationLog>,
        config: TailerConfig,
        crossbar: Crossbar,
    ) -> Self {
        let filter = OplogFilter::new(config.db_name.clone());
        Self {
            inner: Arc::new(TailerInner {
                config,
                filter,
                log,
                crossbar,
                state: Mutex::new(TailerState {
                    phase: TailerPhase::Idle,
                    last_processed: None,
                    pending: VecDeque::new(),
                    failure: None,
                }),
                phase_changed: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                thread_id: OnceLock::new(),
            }),
            join: Mutex::new(None),
        }
    }

    /// Create and start a tailer.
    pub fn spawn(log: Arc<dyn ReplicationLog>, config: TailerConfig) -> Result<Self> {
        let tailer = Self::new(log, config);
        tailer.start()?;
        Ok(tailer)
    }

    /// Start the tailing thread. Only the first call has an effect.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != TailerPhase::Idle {
                return Ok(());
            }
            state.phase = TailerPhase::Connecting;
            self.inner.phase_changed.notify_all();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("oplog-tailer-{}", self.inner.config.db_name))
            .spawn(move || inner.run());
        match spawned {
            Ok(handle) => {
                *self.join.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                state.phase = TailerPhase::Stopped;
                state.failure = Some(e.to_string());
                self.inner.phase_changed.notify_all();
                Err(e.into())
            }
        }
    }

    pub fn crossbar(&self) -> &Crossbar {
        &self.inner.crossbar
    }

    pub fn phase(&self) -> TailerPhase {
        self.inner.state.lock().phase
    }

    pub fn last_processed(&self) -> Option<Position> {
        self.inner.state.lock().last_processed
    }

    /// Block until the initial connect has finished. Blocks indefinitely on a
    /// tailer that was never started.
    pub fn wait_until_ready(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while matches!(state.phase, TailerPhase::Idle | TailerPhase::Connecting) {
            self.inner.phase_changed.wait(&mut state);
        }
        match state.phase {
            TailerPhase::Tailing => Ok(()),
            _ => Err(stopped_error(&state)),
        }
    }

    /// Register a listener for triggers matching `pattern`, once the tailer
    /// is connected.
    pub fn on_oplog_entry<F>(&self, pattern: TriggerPattern, callback: F) -> Result<ListenHandle>
    where
        F: Fn(&Trigger, Completion) + Send + Sync + 'static,
    {
        if self.inner.stop_requested.load(Ordering::Acquire) {
            return Err(LiveQueryError::TailerStopped);
        }
        self.wait_until_ready()?;
        Ok(self.inner.crossbar.listen(pattern, callback))
    }

    /// Block until every entry currently visible in the log has been
    /// processed by all of its listeners.
    pub fn wait_until_caught_up(&self) -> Result<()> {
        if self.inner.stop_requested.load(Ordering::Acquire) {
            return Err(LiveQueryError::TailerStopped);
        }
        if self.inner.thread_id.get() == Some(&thread::current().id()) {
            return Err(LiveQueryError::Reentrant);
        }
        self.wait_until_ready()?;

        // Same filter as the tail itself, or the target might never show up.
        let Some(target) = self.inner.log.last_position(Some(&self.inner.filter))? else {
            return Ok(());
        };

        let done = {
            let mut state = self.inner.state.lock();
            if state.phase == TailerPhase::Stopped {
                return Err(stopped_error(&state));
            }
            if state.last_processed.map_or(false, |last| target <= last) {
                return Ok(());
            }

            let (tx, rx) = bounded::<()>(1);
            let at = state
                .pending
                .iter()
                .rposition(|p| p.target <= target)
                .map_or(0, |i| i + 1);
            if at < state.pending.len() {
                error!(
                    wanted = %target,
                    queued = %state.pending[at].target,
                    "catch-up target precedes a queued one; log position went backwards"
                );
            }
            state.pending.insert(at, CatchUp { target, done: tx });
            rx
        };

        match done.recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(stopped_error(&self.inner.state.lock())),
        }
    }

    /// Stop tailing. Terminal and idempotent; pending catch-up waiters fail
    /// with `TailerStopped`.
    pub fn stop(&self) {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.inner.state.lock();
        state.phase = TailerPhase::Stopped;
        state.pending.clear();
        self.inner.phase_changed.notify_all();
        info!(db = %self.inner.config.db_name, "oplog tailer stopped");
    }
}

impl Drop for OplogTailer {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.join.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn stopped_error(state: &TailerState) -> LiveQueryError {
    match &state.failure {
        Some(message) => LiveQueryError::TailerFailed(message.clone()),
        None => LiveQueryError::TailerStopped,
    }
}

impl TailerInner {
    fn run(self: Arc<Self>) {
        let _ = self.thread_id.set(thread::current().id());
        let result = self.connect().and_then(|cursor| self.tail(cursor));
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Start after the newest entry in the whole log so nothing written
    /// before the tailer existed is delivered.
    fn connect(&self) -> Result<Box<dyn OplogCursor>> {
        let last = self.log.last_position(None)?;
        let cursor = self.log.tail(&self.filter, last)?;

        let mut state = self.state.lock();
        state.last_processed = last;
        if state.phase == TailerPhase::Connecting {
            state.phase = TailerPhase::Tailing;
            info!(db = %self.config.db_name, start = ?last, "oplog tailer ready");
        }
        self.phase_changed.notify_all();
        Ok(cursor)
    }

    fn tail(&self, mut cursor: Box<dyn OplogCursor>) -> Result<()> {
        while !self.stop_requested.load(Ordering::Acquire) {
            if let Some(entry) = cursor.next_entry(self.config.poll_interval)? {
                self.process(entry)?;
            }
        }
        Ok(())
    }

    fn process(&self, entry: OplogEntry) -> Result<()> {
        let position = entry.position.ok_or_else(|| {
            LiveQueryError::MalformedEntry(format!("oplog entry without ts on {}", entry.namespace))
        })?;
        let last = self.state.lock().last_processed;
        if let Some(last) = last {
            if position <= last {
                return Err(LiveQueryError::NonMonotonicPosition { last, got: position });
            }
        }

        let trigger = self.trigger_for(entry)?;
        debug!(
            collection = %trigger.collection,
            id = ?trigger.id,
            position = %position,
            "delivering oplog entry"
        );
        self.crossbar.fire_and_wait(trigger);
        self.advance(position);
        Ok(())
    }

    fn trigger_for(&self, entry: OplogEntry) -> Result<Trigger> {
        let collection = entry
            .collection_in(&self.config.db_name)
            .ok_or_else(|| LiveQueryError::UnexpectedNamespace(entry.namespace.clone()))?
            .to_string();

        let trigger = if collection == "$cmd" {
            let dropped = entry.dropped_collection().ok_or_else(|| {
                LiveQueryError::MalformedEntry(format!("unknown command: {}", entry.object))
            })?;
            Trigger::drop_collection(dropped)
        } else {
            Trigger::new(collection, Some(entry.document_id()?))
        };
        Ok(trigger.with_op(Arc::new(entry)))
    }

    fn advance(&self, position: Position) {
        let mut state = self.state.lock();
        state.last_processed = Some(position);
        while state.pending.front().map_or(false, |p| p.target <= position) {
            if let Some(caught_up) = state.pending.pop_front() {
                let _ = caught_up.done.send(());
            }
        }
    }

    fn fail(&self, e: LiveQueryError) {
        let mut state = self.state.lock();
        // Errors after an explicit stop are expected teardown noise.
        if state.phase == TailerPhase::Stopped {
            debug!(error = %e, "ignoring error after stop");
            return;
        }
        error!(
            db = %self.config.db_name,
            last = ?state.last_processed,
            error = %e,
            protocol = e.is_fatal_to_tailer(),
            "oplog tailer failed"
        );
        state.failure = Some(e.to_string());
        state.phase = TailerPhase::Stopped;
        state.pending.clear();
        self.stop_requested.store(true, Ordering::Release);
        self.phase_changed.notify_all();
    }
}
