//! The replication log as seen by the tailer.

use super::entry::{OpType, OplogEntry};
use crate::error::Result;
use crate::types::Position;
use std::time::Duration;

/// Selects the entries the tailer cares about: document writes in one
/// database, plus collection drops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OplogFilter {
    pub db_name: String,
}

impl OplogFilter {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
        }
    }

    pub fn accepts(&self, entry: &OplogEntry) -> bool {
        if entry.collection_in(&self.db_name).is_none() {
            return false;
        }
        match entry.op {
            OpType::Insert | OpType::Update | OpType::Delete => true,
            OpType::Command => entry.object.get("drop").is_some(),
            OpType::Noop => false,
        }
    }
}

/// Source of replication log entries.
pub trait ReplicationLog: Send + Sync {
    /// Position of the newest entry, restricted to `filter` when given.
    fn last_position(&self, filter: Option<&OplogFilter>) -> Result<Option<Position>>;

    /// Open a cursor over entries accepted by `filter` that come strictly
    /// after `after` (or from the start when `None`).
    fn tail(&self, filter: &OplogFilter, after: Option<Position>) -> Result<Box<dyn OplogCursor>>;
}

/// Blocking reader over a tailed log.
pub trait OplogCursor: Send {
    /// Wait up to `timeout` for the next entry. `Ok(None)` means nothing
    /// arrived in time.
    fn next_entry(&mut self, timeout: Duration) -> Result<Option<OplogEntry>>;
}
