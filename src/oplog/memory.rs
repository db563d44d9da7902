//! In-process replication log.

use super::entry::OplogEntry;
use super::source::{OplogCursor, OplogFilter, ReplicationLog};
use crate::error::{LiveQueryError, Result};
use crate::types::{DocumentId, Position};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct LogState {
    entries: Vec<OplogEntry>,
    failure: Option<String>,
}

struct MemoryLogInner {
    db_name: String,
    state: Mutex<LogState>,
    appended: Condvar,
}

/// Thread-safe append-only log that assigns increasing positions.
///
/// Clones share the same log. Writes wake every open cursor.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<MemoryLogInner>,
}

impl MemoryLog {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryLogInner {
                db_name: db_name.into(),
                state: Mutex::new(LogState::default()),
                appended: Condvar::new(),
            }),
        }
    }

    pub fn db_name(&self) -> &str {
        &self.inner.db_name
    }

    fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.inner.db_name, collection)
    }

    /// Append `entry` at the next position and return that position.
    pub fn append(&self, mut entry: OplogEntry) -> Position {
        let mut state = self.inner.state.lock();
        let last = state
            .entries
            .iter()
            .rev()
            .find_map(|e| e.position)
            .unwrap_or_default();
        let position = last.successor();
        entry.position = Some(position);
        state.entries.push(entry);
        self.inner.appended.notify_all();
        position
    }

    /// Append `entry` untouched, whatever its position.
    pub fn push_raw(&self, entry: OplogEntry) {
        let mut state = self.inner.state.lock();
        state.entries.push(entry);
        self.inner.appended.notify_all();
    }

    pub fn insert(&self, collection: &str, document: Value) -> Position {
        self.append(OplogEntry::insert(self.namespace(collection), document))
    }

    pub fn update(&self, collection: &str, id: &DocumentId, modifier: Value) -> Position {
        self.append(OplogEntry::update(self.namespace(collection), id, modifier))
    }

    pub fn remove(&self, collection: &str, id: &DocumentId) -> Position {
        self.append(OplogEntry::delete(self.namespace(collection), id))
    }

    pub fn drop_collection(&self, collection: &str) -> Position {
        self.append(OplogEntry::drop_collection(&self.inner.db_name, collection))
    }

    /// Make every cursor read fail from now on.
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.inner.state.lock();
        state.failure = Some(message.into());
        self.inner.appended.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReplicationLog for MemoryLog {
    fn last_position(&self, filter: Option<&OplogFilter>) -> Result<Option<Position>> {
        let state = self.inner.state.lock();
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| filter.map_or(true, |f| f.accepts(e)))
            .find_map(|e| e.position))
    }

    fn tail(&self, filter: &OplogFilter, after: Option<Position>) -> Result<Box<dyn OplogCursor>> {
        let state = self.inner.state.lock();
        if let Some(message) = &state.failure {
            return Err(LiveQueryError::Log(message.clone()));
        }
        let start = match after {
            Some(after) => state
                .entries
                .iter()
                .rposition(|e| e.position.map_or(false, |p| p <= after))
                .map_or(0, |i| i + 1),
            None => 0,
        };
        Ok(Box::new(MemoryCursor {
            log: Arc::clone(&self.inner),
            filter: filter.clone(),
            next: start,
        }))
    }
}

struct MemoryCursor {
    log: Arc<MemoryLogInner>,
    filter: OplogFilter,
    next: usize,
}

impl OplogCursor for MemoryCursor {
    fn next_entry(&mut self, timeout: Duration) -> Result<Option<OplogEntry>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.log.state.lock();
        loop {
            if let Some(message) = &state.failure {
                return Err(LiveQueryError::Log(message.clone()));
            }
            while let Some(entry) = state.entries.get(self.next) {
                self.next += 1;
                if self.filter.accepts(entry) {
                    return Ok(Some(entry.clone()));
                }
            }
            if self.log.appended.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}
