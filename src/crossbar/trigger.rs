use crate::oplog::OplogEntry;
use crate::types::DocumentId;
use std::sync::Arc;

/// A change notification.
#[derive(Clone, Debug)]
pub struct Trigger {
    pub collection: String,
    /// `None` when the change is not tied to a single document.
    pub id: Option<DocumentId>,
    pub drop_collection: bool,
    /// The log entry that produced this trigger, when there is one.
    pub op: Option<Arc<OplogEntry>>,
}

impl Trigger {
    pub fn new(collection: impl Into<String>, id: Option<DocumentId>) -> Self {
        Self {
            collection: collection.into(),
            id,
            drop_collection: false,
            op: None,
        }
    }

    pub fn drop_collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: None,
            drop_collection: true,
            op: None,
        }
    }

    pub fn with_op(mut self, op: Arc<OplogEntry>) -> Self {
        self.op = Some(op);
        self
    }
}

/// What a listener wants to hear about. Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerPattern {
    pub collection: Option<String>,
    pub id: Option<DocumentId>,
    pub drop_collection: Option<bool>,
}

impl TriggerPattern {
    /// Matches every trigger.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_drop_collection(mut self, drop_collection: bool) -> Self {
        self.drop_collection = Some(drop_collection);
        self
    }

    /// A field only filters when both sides carry it: a trigger without an id
    /// reaches every id-specific listener on its collection.
    pub fn matches(&self, trigger: &Trigger) -> bool {
        if let Some(collection) = &self.collection {
            if *collection != trigger.collection {
                return false;
            }
        }
        if let (Some(wanted), Some(got)) = (&self.id, &trigger.id) {
            if wanted != got {
                return false;
            }
        }
        if let Some(drop) = self.drop_collection {
            if drop != trigger.drop_collection {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching_is_bidirectional() {
        let by_id = TriggerPattern::collection("c").with_id(DocumentId::new("a"));
        assert!(by_id.matches(&Trigger::new("c", Some(DocumentId::new("a")))));
        assert!(!by_id.matches(&Trigger::new("c", Some(DocumentId::new("b")))));
        assert!(by_id.matches(&Trigger::new("c", None)));
        assert!(!by_id.matches(&Trigger::new("d", None)));

        let drops = TriggerPattern::collection("c").with_drop_collection(true);
        assert!(drops.matches(&Trigger::drop_collection("c")));
        assert!(!drops.matches(&Trigger::new("c", None)));
    }
}
