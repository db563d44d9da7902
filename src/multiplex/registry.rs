//! Shares one multiplexer between identical live queries.

use super::handle::{ObserveCallbacks, ObserveHandle};
use super::multiplexer::ObserveMultiplexer;
use crate::error::{LiveQueryError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Identity of a live query: equal keys share a multiplexer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryKey {
    pub collection: String,
    pub selector: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    pub ordered: bool,
}

impl QueryKey {
    pub fn new(collection: impl Into<String>, selector: Value, ordered: bool) -> Self {
        Self {
            collection: collection.into(),
            selector,
            sort: None,
            ordered,
        }
    }

    pub fn with_sort(mut self, sort: Value) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Stable JSON form; object keys serialize sorted.
    pub fn canonical(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Whatever feeds a multiplexer its changes (a polling or log-driven
/// observer). Stopped when the multiplexer tears down.
pub trait ObserveDriver: Send + Sync {
    fn stop(&self);
}

type DriverSlot = Arc<Mutex<Option<Box<dyn ObserveDriver>>>>;

struct Entry {
    multiplexer: ObserveMultiplexer,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Live queries by `QueryKey`.
#[derive(Clone, Default)]
pub struct MultiplexerRegistry {
    inner: Arc<RegistryInner>,
}

impl MultiplexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `callbacks` to the live query for `key`, creating its
    /// multiplexer and starting its driver if nobody observes it yet.
    ///
    /// Blocks until the multiplexer is ready, so the driver must eventually
    /// call `ready()` on it. A new multiplexer cannot tear down while its
    /// driver is starting, even if other observers come and go meanwhile.
    pub fn observe_changes<F>(
        &self,
        key: &QueryKey,
        callbacks: ObserveCallbacks,
        start_driver: F,
    ) -> Result<ObserveHandle>
    where
        F: FnOnce(&ObserveMultiplexer) -> Result<Box<dyn ObserveDriver>>,
    {
        let canonical = key.canonical()?;
        let mut start_driver = Some(start_driver);

        loop {
            let (multiplexer, driver) = self.lookup_or_create(&canonical, key.ordered)?;

            if let Some(slot) = driver {
                let attached = match start_driver.take() {
                    Some(start) => start(&multiplexer).and_then(|started| {
                        *slot.lock() = Some(started);
                        multiplexer.add_handle_and_send_initial_adds(callbacks.clone())
                    }),
                    None => Err(LiveQueryError::MultiplexerStopped),
                };
                // Tears down here if the driver failed or nobody stayed.
                multiplexer.release_attach();
                return attached;
            }

            match multiplexer.add_handle_and_send_initial_adds(callbacks.clone()) {
                // Lost a race with teardown; the next lookup builds a fresh one.
                Err(LiveQueryError::MultiplexerStopped) => continue,
                other => return other,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn multiplexer(&self, key: &QueryKey) -> Option<ObserveMultiplexer> {
        let canonical = key.canonical().ok()?;
        self.inner
            .entries
            .lock()
            .get(&canonical)
            .map(|e| e.multiplexer.clone())
    }

    /// Existing live multiplexer, or a new one plus the slot its driver goes
    /// in. A new multiplexer comes with one attach held for the caller.
    fn lookup_or_create(
        &self,
        canonical: &str,
        ordered: bool,
    ) -> Result<(ObserveMultiplexer, Option<DriverSlot>)> {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(canonical) {
            if !entry.multiplexer.is_stopped() {
                return Ok((entry.multiplexer.clone(), None));
            }
        }

        let slot: DriverSlot = Arc::new(Mutex::new(None));
        let registry = Arc::downgrade(&self.inner);
        let key = canonical.to_string();
        let stop_slot = Arc::clone(&slot);
        let multiplexer = ObserveMultiplexer::with_on_stop(ordered, move || {
            on_multiplexer_stop(&registry, &key, &stop_slot);
        })?;
        multiplexer.hold_attach()?;

        let id = multiplexer.id();
        entries.insert(
            canonical.to_string(),
            Entry {
                multiplexer: multiplexer.clone(),
            },
        );
        debug!(multiplexer = id, query = canonical, "created multiplexer");
        Ok((multiplexer, Some(slot)))
    }
}

fn on_multiplexer_stop(registry: &Weak<RegistryInner>, canonical: &str, driver: &DriverSlot) {
    if let Some(driver) = driver.lock().take() {
        driver.stop();
    }
    if let Some(registry) = registry.upgrade() {
        let mut entries = registry.entries.lock();
        if entries
            .get(canonical)
            .map_or(false, |e| e.multiplexer.is_stopped())
        {
            entries.remove(canonical);
        }
    }
}
