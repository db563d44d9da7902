//! Replication log tailing.
//!
//! `OplogTailer` reads a `ReplicationLog` from the position it finds at
//! startup, turns every entry into a `Trigger` on its `Crossbar`, and offers
//! `wait_until_caught_up` so writers can wait for their own writes to reach
//! every listener.
//!
//! # Example
//!
//! ```ignore
//! let log = MemoryLog::new("meteor");
//! let tailer = OplogTailer::spawn(Arc::new(log.clone()), TailerConfig::default())?;
//! let _listener = tailer.on_oplog_entry(TriggerPattern::collection("posts"), |t, done| {
//!     println!("{:?}", t.id);
//!     done.done();
//! })?;
//! log.insert("posts", json!({"_id": "p1"}));
//! tailer.wait_until_caught_up()?;
//! ```

mod entry;
mod memory;
mod source;
mod tailer;

pub use entry::{OpType, OplogEntry};
pub use memory::MemoryLog;
pub use source::{OplogCursor, OplogFilter, ReplicationLog};
pub use tailer::{OplogTailer, TailerConfig, TailerPhase};
