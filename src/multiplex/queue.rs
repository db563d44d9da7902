//! Strictly FIFO task queue with a dedicated worker thread.

use crate::crossbar::panic_message;
use crate::error::{LiveQueryError, Result};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks one at a time, in submission order, on its own thread.
///
/// Tasks may block; nothing else runs on the queue meanwhile. A panicking
/// task is logged and the queue keeps going.
pub struct TaskQueue {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    worker: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Task>();

        let thread_name = name.clone();
        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            for task in rx.iter() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    error!(queue = %thread_name, "task panicked: {}", panic_message(&payload));
                }
            }
            debug!(queue = %thread_name, "task queue drained");
        })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            worker: join.thread().id(),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False while called from inside one of this queue's tasks.
    pub fn is_safe_to_run_task(&self) -> bool {
        thread::current().id() != self.worker
    }

    /// Enqueue without waiting.
    pub fn queue_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().clone().ok_or(LiveQueryError::QueueClosed)?;
        sender
            .send(Box::new(task))
            .map_err(|_| LiveQueryError::QueueClosed)
    }

    /// Enqueue and block until the task has run, returning its result.
    /// Fails with `Reentrant` from inside a task of this queue.
    pub fn run_task<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if !self.is_safe_to_run_task() {
            return Err(LiveQueryError::Reentrant);
        }

        let (tx, rx) = bounded(1);
        self.queue_task(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            let _ = tx.send(outcome);
        })?;

        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(LiveQueryError::TaskPanicked(panic_message(&payload))),
            Err(_) => Err(LiveQueryError::QueueClosed),
        }
    }

    /// Block until every task queued before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.run_task(|| ())
    }

    /// Refuse new tasks. Already queued tasks still run.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.close();
        if let Some(join) = self.join.lock().take() {
            if self.is_safe_to_run_task() {
                let _ = join.join();
            }
        }
    }
}
