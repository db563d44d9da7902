//! Per-query result-set multiplexing.
//!
//! An `ObserveMultiplexer` owns the cached result set of one live query and
//! replays its changes to every attached `ObserveHandle`. All of its work runs
//! on a private `TaskQueue`, one task at a time, so handles that join and
//! leave concurrently still see a single consistent order of events.
//!
//! `MultiplexerRegistry` is the entry point for observers: identical
//! `QueryKey`s share one multiplexer and one driver.

mod cache;
mod handle;
mod multiplexer;
mod queue;
mod registry;

pub use cache::ResultCache;
pub use handle::{
    AddedBeforeFn, AddedFn, ChangedFn, HandleId, MovedBeforeFn, ObserveCallbacks, ObserveHandle,
    RemovedFn,
};
pub use multiplexer::ObserveMultiplexer;
pub use queue::TaskQueue;
pub use registry::{MultiplexerRegistry, ObserveDriver, QueryKey};
