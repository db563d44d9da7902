//! Authoritative copy of a live query's current result set.

use crate::error::{LiveQueryError, Result};
use crate::types::{ChangedFields, DocumentId, Fields, ObserveEvent};
use std::collections::BTreeMap;

/// Documents currently in a query's result set.
///
/// Ordered caches keep the result order as reported by `added_before` and
/// `moved_before`; unordered ones iterate by id.
#[derive(Debug, Clone)]
pub struct ResultCache {
    ordered: bool,
    docs: BTreeMap<DocumentId, Fields>,
    order: Vec<DocumentId>,
}

impl ResultCache {
    pub fn new(ordered: bool) -> Self {
        Self {
            ordered,
            docs: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.docs.contains_key(id)
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Fields> {
        self.docs.get(id)
    }

    /// Documents in result order.
    pub fn snapshot(&self) -> Vec<(DocumentId, Fields)> {
        if self.ordered {
            self.order
                .iter()
                .filter_map(|id| self.docs.get(id).map(|f| (id.clone(), f.clone())))
                .collect()
        } else {
            self.docs
                .iter()
                .map(|(id, f)| (id.clone(), f.clone()))
                .collect()
        }
    }

    /// Apply one change. Fails, leaving the cache untouched, when the change
    /// does not fit the current contents.
    pub fn apply(&mut self, event: &ObserveEvent) -> Result<()> {
        let kind = event.kind();
        if !kind.valid_for(self.ordered) {
            return Err(LiveQueryError::Cache(format!(
                "{} on an {} cache",
                kind.name(),
                if self.ordered { "ordered" } else { "unordered" }
            )));
        }

        match event {
            ObserveEvent::Added { id, fields } => {
                self.require_absent(id)?;
                self.docs.insert(id.clone(), fields.clone());
            }
            ObserveEvent::AddedBefore { id, fields, before } => {
                self.require_absent(id)?;
                let at = self.index_before(before.as_ref())?;
                self.order.insert(at, id.clone());
                self.docs.insert(id.clone(), fields.clone());
            }
            ObserveEvent::Changed { id, fields } => {
                let doc = self
                    .docs
                    .get_mut(id)
                    .ok_or_else(|| missing("changed", id))?;
                apply_changed(doc, fields);
            }
            ObserveEvent::MovedBefore { id, before } => {
                self.require_present("movedBefore", id)?;
                if before.as_ref() == Some(id) {
                    return Err(LiveQueryError::Cache(format!("cannot move {id} before itself")));
                }
                // Validate the target before touching the order.
                self.index_before(before.as_ref())?;
                self.order.retain(|o| o != id);
                let at = self.index_before(before.as_ref())?;
                self.order.insert(at, id.clone());
            }
            ObserveEvent::Removed { id } => {
                self.docs.remove(id).ok_or_else(|| missing("removed", id))?;
                if self.ordered {
                    self.order.retain(|o| o != id);
                }
            }
        }
        Ok(())
    }

    fn require_absent(&self, id: &DocumentId) -> Result<()> {
        if self.docs.contains_key(id) {
            return Err(LiveQueryError::Cache(format!("added {id} twice")));
        }
        Ok(())
    }

    fn require_present(&self, callback: &str, id: &DocumentId) -> Result<()> {
        if !self.docs.contains_key(id) {
            return Err(missing(callback, id));
        }
        Ok(())
    }

    fn index_before(&self, before: Option<&DocumentId>) -> Result<usize> {
        match before {
            None => Ok(self.order.len()),
            Some(before) => self
                .order
                .iter()
                .position(|o| o == before)
                .ok_or_else(|| {
                    LiveQueryError::Cache(format!("unknown 'before' document {before}"))
                }),
        }
    }
}

fn apply_changed(doc: &mut Fields, fields: &ChangedFields) {
    for (key, value) in fields {
        match value {
            Some(value) => {
                doc.insert(key.clone(), value.clone());
            }
            None => {
                doc.remove(key);
            }
        }
    }
}

fn missing(callback: &str, id: &DocumentId) -> LiveQueryError {
    LiveQueryError::Cache(format!("{callback} for unknown document {id}"))
}
