//! # Live Query
//!
//! Keeps live query result sets up to date by tailing a replicated store's
//! operation log instead of re-polling.
//!
//! ## Core Concepts
//!
//! - **Crossbar**: In-process router from change triggers to listeners, with
//!   fire-and-wait completion
//! - **Oplog tailer**: Turns replication log entries into triggers, strictly in
//!   log order, and lets writers wait until the log is caught up
//! - **Multiplexer**: One cached result set per distinct query, fanned out to
//!   every subscriber handle through a private FIFO queue
//! - **Selector analysis**: Decides from a `$set`/`$unset` modifier alone
//!   whether a document's match status could change
//! - **Write fence**: Lets a writer block until every live query has observed
//!   its writes
//!
//! ## Example
//!
//! ```ignore
//! use livequery::{
//!     MemoryLog, MultiplexerRegistry, ObserveCallbacks, OplogTailer, QueryKey, TailerConfig,
//! };
//!
//! let log = MemoryLog::new("meteor");
//! let tailer = OplogTailer::spawn(Arc::new(log.clone()), TailerConfig::default())?;
//! let registry = MultiplexerRegistry::new();
//!
//! let key = QueryKey::new("posts", json!({"published": true}), false);
//! let handle = registry.observe_changes(
//!     &key,
//!     ObserveCallbacks::new().added(|id, fields| println!("{id}: {fields:?}")),
//!     |mux| start_my_driver(&tailer, mux),
//! )?;
//!
//! log.insert("posts", json!({"_id": "p1", "published": true}));
//! tailer.wait_until_caught_up()?;
//! handle.stop();
//! ```

pub mod crossbar;
pub mod error;
pub mod fence;
pub mod multiplex;
pub mod oplog;
pub mod selector;
pub mod types;

// Re-exports
pub use crossbar::{Completion, Crossbar, ListenHandle, ListenerId, Trigger, TriggerPattern};
pub use error::{LiveQueryError, Result};
pub use fence::{commit_when_observed, FenceWrite, WriteFence};
pub use multiplex::{
    HandleId, MultiplexerRegistry, ObserveCallbacks, ObserveDriver, ObserveHandle,
    ObserveMultiplexer, QueryKey, ResultCache, TaskQueue,
};
pub use oplog::{
    MemoryLog, OpType, OplogCursor, OplogEntry, OplogFilter, OplogTailer, ReplicationLog,
    TailerConfig, TailerPhase,
};
pub use selector::{Matcher, Modifier, Selector};
pub use types::{CallbackKind, ChangedFields, DocumentId, Fields, ObserveEvent, Position};
