//! Write fences: let a writer wait until every live query has seen its
//! writes.
//!
//! A fence counts outstanding writes. Once armed and with nothing
//! outstanding, it runs its before-fire callbacks (which may begin further
//! writes), then fires its all-committed callbacks exactly once.

use crate::error::{LiveQueryError, Result};
use crate::multiplex::ObserveMultiplexer;
use crate::oplog::OplogTailer;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

type FenceCallback = Box<dyn FnOnce(&WriteFence) + Send>;

#[derive(Default)]
struct FenceState {
    armed: bool,
    fired: bool,
    retired: bool,
    outstanding: usize,
    before_fire: Vec<FenceCallback>,
    completion: Vec<FenceCallback>,
}

/// Shared handle to a write fence.
#[derive(Clone, Default)]
pub struct WriteFence {
    state: Arc<Mutex<FenceState>>,
}

impl WriteFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a write. The fence cannot fire until it is committed.
    pub fn begin_write(&self) -> Result<FenceWrite> {
        let mut state = self.state.lock();
        if state.retired {
            return Ok(FenceWrite { fence: None });
        }
        if state.fired {
            return Err(LiveQueryError::FenceFired);
        }
        state.outstanding += 1;
        Ok(FenceWrite {
            fence: Some(self.clone()),
        })
    }

    /// Allow the fence to fire once all writes are committed.
    pub fn arm(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.armed {
                return Err(LiveQueryError::FenceArmed);
            }
            state.armed = true;
        }
        self.maybe_fire();
        Ok(())
    }

    /// Run `callback` when the fence is about to fire. It may begin more
    /// writes, which then delay firing.
    pub fn on_before_fire<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&WriteFence) + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.fired {
            return Err(LiveQueryError::FenceFired);
        }
        state.before_fire.push(Box::new(callback));
        Ok(())
    }

    pub fn on_all_committed<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&WriteFence) + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.fired {
            return Err(LiveQueryError::FenceFired);
        }
        state.completion.push(Box::new(callback));
        Ok(())
    }

    /// Arm and block until the fence fires.
    pub fn arm_and_wait(&self) -> Result<()> {
        let (tx, rx) = bounded::<()>(1);
        self.on_all_committed(move |_| {
            let _ = tx.send(());
        })?;
        self.arm()?;
        rx.recv().map_err(|_| LiveQueryError::FenceFired)
    }

    /// Stop tracking writes on a fired fence; later `begin_write` calls get a
    /// write that does nothing.
    pub fn retire(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.fired {
            return Err(LiveQueryError::FenceNotFired);
        }
        state.retired = true;
        Ok(())
    }

    pub fn is_fired(&self) -> bool {
        self.state.lock().fired
    }

    pub fn outstanding_writes(&self) -> usize {
        self.state.lock().outstanding
    }

    fn commit_one(&self) {
        {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.maybe_fire();
    }

    fn maybe_fire(&self) {
        loop {
            let mut state = self.state.lock();
            if state.fired || !state.armed || state.outstanding > 0 {
                return;
            }

            if state.before_fire.is_empty() {
                state.fired = true;
                let completion = std::mem::take(&mut state.completion);
                drop(state);
                debug!(callbacks = completion.len(), "write fence fired");
                for callback in completion {
                    callback(self);
                }
                return;
            }

            // Hold the fence open while the callbacks run.
            state.outstanding += 1;
            let callbacks = std::mem::take(&mut state.before_fire);
            drop(state);
            for callback in callbacks {
                callback(self);
            }
            self.state.lock().outstanding -= 1;
        }
    }
}

/// One write registered on a fence.
///
/// Committing is idempotent; dropping an uncommitted write commits it.
pub struct FenceWrite {
    fence: Option<WriteFence>,
}

impl FenceWrite {
    /// A write that is not tracked by any fence.
    pub fn detached() -> Self {
        Self { fence: None }
    }

    pub fn committed(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if let Some(fence) = self.fence.take() {
            fence.commit_one();
        }
    }
}

impl Drop for FenceWrite {
    fn drop(&mut self) {
        self.commit();
    }
}

/// Commit `write` once the tailer has caught up with the log and the
/// multiplexer has delivered everything queued up to that point.
///
/// The write is committed right away when either side has stopped, since
/// nothing is left to wait for.
pub fn commit_when_observed(
    tailer: &OplogTailer,
    multiplexer: &ObserveMultiplexer,
    write: FenceWrite,
) -> Result<()> {
    if let Err(e) = tailer.wait_until_caught_up() {
        warn!(error = %e, "committing write without catching up");
        write.committed();
        return Err(e);
    }
    match multiplexer.on_flush(move || write.committed()) {
        Ok(()) => Ok(()),
        // The rejected closure drops the write, which commits it.
        Err(LiveQueryError::MultiplexerStopped) | Err(LiveQueryError::QueueClosed) => Ok(()),
        Err(e) => Err(e),
    }
}
