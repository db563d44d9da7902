use super::multiplexer::ObserveMultiplexer;
use crate::types::{CallbackKind, ChangedFields, DocumentId, Fields, ObserveEvent};
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type AddedFn = dyn Fn(&DocumentId, &Fields) + Send + Sync;
pub type AddedBeforeFn = dyn Fn(&DocumentId, &Fields, Option<&DocumentId>) + Send + Sync;
pub type ChangedFn = dyn Fn(&DocumentId, &ChangedFields) + Send + Sync;
pub type MovedBeforeFn = dyn Fn(&DocumentId, Option<&DocumentId>) + Send + Sync;
pub type RemovedFn = dyn Fn(&DocumentId) + Send + Sync;

/// The observer callbacks a subscriber wants. Any subset may be set.
#[derive(Clone, Default)]
pub struct ObserveCallbacks {
    added: Option<Arc<AddedFn>>,
    added_before: Option<Arc<AddedBeforeFn>>,
    changed: Option<Arc<ChangedFn>>,
    moved_before: Option<Arc<MovedBeforeFn>>,
    removed: Option<Arc<RemovedFn>>,
}

impl ObserveCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentId, &Fields) + Send + Sync + 'static,
    {
        self.added = Some(Arc::new(f));
        self
    }

    pub fn added_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentId, &Fields, Option<&DocumentId>) + Send + Sync + 'static,
    {
        self.added_before = Some(Arc::new(f));
        self
    }

    pub fn changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentId, &ChangedFields) + Send + Sync + 'static,
    {
        self.changed = Some(Arc::new(f));
        self
    }

    pub fn moved_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentId, Option<&DocumentId>) + Send + Sync + 'static,
    {
        self.moved_before = Some(Arc::new(f));
        self
    }

    pub fn removed<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentId) + Send + Sync + 'static,
    {
        self.removed = Some(Arc::new(f));
        self
    }

    /// Forward every callback to `sender` as an `ObserveEvent`.
    pub fn channel(sender: Sender<ObserveEvent>) -> Self {
        let added = sender.clone();
        let added_before = sender.clone();
        let changed = sender.clone();
        let moved_before = sender.clone();
        let removed = sender;
        Self::new()
            .added(move |id, fields| {
                let _ = added.send(ObserveEvent::Added {
                    id: id.clone(),
                    fields: fields.clone(),
                });
            })
            .added_before(move |id, fields, before| {
                let _ = added_before.send(ObserveEvent::AddedBefore {
                    id: id.clone(),
                    fields: fields.clone(),
                    before: before.cloned(),
                });
            })
            .changed(move |id, fields| {
                let _ = changed.send(ObserveEvent::Changed {
                    id: id.clone(),
                    fields: fields.clone(),
                });
            })
            .moved_before(move |id, before| {
                let _ = moved_before.send(ObserveEvent::MovedBefore {
                    id: id.clone(),
                    before: before.cloned(),
                });
            })
            .removed(move |id| {
                let _ = removed.send(ObserveEvent::Removed { id: id.clone() });
            })
    }

    pub fn has(&self, kind: CallbackKind) -> bool {
        match kind {
            CallbackKind::Added => self.added.is_some(),
            CallbackKind::AddedBefore => self.added_before.is_some(),
            CallbackKind::Changed => self.changed.is_some(),
            CallbackKind::MovedBefore => self.moved_before.is_some(),
            CallbackKind::Removed => self.removed.is_some(),
        }
    }

    /// Keep only the callbacks that exist for this orderedness. An ordered
    /// query without `added_before` but with `added` gets an `added_before`
    /// that ignores the position.
    pub(crate) fn resolve(self, ordered: bool) -> Self {
        let added_before = match (self.added_before, &self.added) {
            (Some(f), _) => Some(f),
            (None, Some(added)) => {
                let added = Arc::clone(added);
                let adapted = move |id: &DocumentId, fields: &Fields, _: Option<&DocumentId>| {
                    added(id, fields)
                };
                Some(Arc::new(adapted) as Arc<AddedBeforeFn>)
            }
            (None, None) => None,
        };

        if ordered {
            Self {
                added: None,
                added_before,
                changed: self.changed,
                moved_before: self.moved_before,
                removed: self.removed,
            }
        } else {
            Self {
                added: self.added,
                added_before: None,
                changed: self.changed,
                moved_before: None,
                removed: self.removed,
            }
        }
    }

    /// Invoke the callback matching `event`, if registered.
    pub(crate) fn dispatch(&self, event: &ObserveEvent) {
        match event {
            ObserveEvent::Added { id, fields } => {
                if let Some(f) = &self.added {
                    f(id, fields);
                }
            }
            ObserveEvent::AddedBefore { id, fields, before } => {
                if let Some(f) = &self.added_before {
                    f(id, fields, before.as_ref());
                }
            }
            ObserveEvent::Changed { id, fields } => {
                if let Some(f) = &self.changed {
                    f(id, fields);
                }
            }
            ObserveEvent::MovedBefore { id, before } => {
                if let Some(f) = &self.moved_before {
                    f(id, before.as_ref());
                }
            }
            ObserveEvent::Removed { id } => {
                if let Some(f) = &self.removed {
                    f(id);
                }
            }
        }
    }
}

impl fmt::Debug for ObserveCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveCallbacks")
            .field("added", &self.added.is_some())
            .field("added_before", &self.added_before.is_some())
            .field("changed", &self.changed.is_some())
            .field("moved_before", &self.moved_before.is_some())
            .field("removed", &self.removed.is_some())
            .finish()
    }
}

/// Identifies a handle within its multiplexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

/// A subscriber's attachment to a multiplexer.
///
/// Stopping (or dropping) the last handle tears the multiplexer down.
pub struct ObserveHandle {
    id: HandleId,
    multiplexer: ObserveMultiplexer,
    stopped: AtomicBool,
}

impl ObserveHandle {
    pub(crate) fn new(id: HandleId, multiplexer: ObserveMultiplexer) -> Self {
        Self {
            id,
            multiplexer,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn multiplexer(&self) -> &ObserveMultiplexer {
        &self.multiplexer
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Detach from the multiplexer. Safe to call from inside this handle's
    /// own callbacks; later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.multiplexer.remove_handle(self.id);
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ObserveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveHandle")
            .field("id", &self.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
