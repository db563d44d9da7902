//! Core types shared by the tailer, router and multiplexer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of an entry in the replication log.
///
/// Server clock seconds plus an increment that orders entries written within
/// the same second. Ordering is lexicographic on `(time, increment)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position {
    #[serde(rename = "t")]
    pub time: u32,
    #[serde(rename = "i")]
    pub increment: u32,
}

impl Position {
    pub const fn new(time: u32, increment: u32) -> Self {
        Self { time, increment }
    }

    /// Next position after `self`, using the wall clock when it has moved on.
    /// The largest position is its own successor.
    pub fn successor(self) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0);
        if now > self.time {
            Position::new(now, 1)
        } else if self.increment == u32::MAX {
            match self.time.checked_add(1) {
                Some(time) => Position::new(time, 1),
                None => self,
            }
        } else {
            Position::new(self.time, self.increment + 1)
        }
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.time, self.increment)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.time, self.increment)
    }
}

/// Identifier of a document (`_id`), in a string form that keeps the id's
/// JSON type.
///
/// Plain strings are kept as is. Numbers, booleans and `null` become `~`
/// followed by their JSON text, and ObjectIds become their lowercase hex.
/// Strings that could be mistaken for either form (a leading `-`, `~` or `{`,
/// or 24 hex digits) get a `-` prefix. Equal ids therefore always come from
/// equal `_id` values.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Id of a document whose `_id` is the string `id`.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if needs_escape(&id) {
            DocumentId(format!("-{id}"))
        } else {
            DocumentId(id)
        }
    }

    /// Build an id from a JSON `_id` value. Arrays and objects other than
    /// `{"$oid": ..}` are not valid ids.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(DocumentId::new(s.as_str())),
            Value::Number(n) => Some(DocumentId(format!("~{}", canonical_number(n)))),
            Value::Bool(_) | Value::Null => Some(DocumentId(format!("~{value}"))),
            Value::Object(map) if map.len() == 1 => {
                let oid = map.get("$oid")?.as_str()?;
                if looks_like_object_id(oid) {
                    Some(DocumentId(oid.to_ascii_lowercase()))
                } else {
                    Some(DocumentId(format!("~{value}")))
                }
            }
            _ => None,
        }
    }

    /// The `_id` value this id was built from.
    pub fn to_json(&self) -> Value {
        let id = self.0.as_str();
        if let Some(raw) = id.strip_prefix('-') {
            Value::String(raw.to_string())
        } else if let Some(text) = id.strip_prefix('~') {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(id.to_string()))
        } else if looks_like_object_id(id) {
            json!({ "$oid": id })
        } else {
            Value::String(id.to_string())
        }
    }

    /// The tagged string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn needs_escape(id: &str) -> bool {
    id.starts_with(['-', '~', '{']) || looks_like_object_id(id)
}

fn looks_like_object_id(id: &str) -> bool {
    id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `1` and `1.0` are the same id.
fn canonical_number(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId::new(s)
    }
}

/// Top-level fields of a document, without `_id`.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Field changes for a `changed` callback. `None` clears the field.
pub type ChangedFields = BTreeMap<String, Option<serde_json::Value>>;

/// Names of the observer callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Added,
    AddedBefore,
    Changed,
    MovedBefore,
    Removed,
}

impl CallbackKind {
    pub fn name(self) -> &'static str {
        match self {
            CallbackKind::Added => "added",
            CallbackKind::AddedBefore => "addedBefore",
            CallbackKind::Changed => "changed",
            CallbackKind::MovedBefore => "movedBefore",
            CallbackKind::Removed => "removed",
        }
    }

    /// Whether this callback belongs to the ordered or unordered contract.
    pub fn valid_for(self, ordered: bool) -> bool {
        match self {
            CallbackKind::Added => !ordered,
            CallbackKind::AddedBefore | CallbackKind::MovedBefore => ordered,
            CallbackKind::Changed | CallbackKind::Removed => true,
        }
    }
}

/// One change to a live query's result set.
#[derive(Clone, Debug, PartialEq)]
pub enum ObserveEvent {
    Added {
        id: DocumentId,
        fields: Fields,
    },
    AddedBefore {
        id: DocumentId,
        fields: Fields,
        before: Option<DocumentId>,
    },
    Changed {
        id: DocumentId,
        fields: ChangedFields,
    },
    MovedBefore {
        id: DocumentId,
        before: Option<DocumentId>,
    },
    Removed {
        id: DocumentId,
    },
}

impl ObserveEvent {
    pub fn kind(&self) -> CallbackKind {
        match self {
            ObserveEvent::Added { .. } => CallbackKind::Added,
            ObserveEvent::AddedBefore { .. } => CallbackKind::AddedBefore,
            ObserveEvent::Changed { .. } => CallbackKind::Changed,
            ObserveEvent::MovedBefore { .. } => CallbackKind::MovedBefore,
            ObserveEvent::Removed { .. } => CallbackKind::Removed,
        }
    }

    pub fn id(&self) -> &DocumentId {
        match self {
            ObserveEvent::Added { id, .. }
            | ObserveEvent::AddedBefore { id, .. }
            | ObserveEvent::Changed { id, .. }
            | ObserveEvent::MovedBefore { id, .. }
            | ObserveEvent::Removed { id } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_ordering() {
        assert!(Position::new(1, 5) < Position::new(2, 0));
        assert!(Position::new(2, 1) < Position::new(2, 2));
        assert_eq!(Position::new(3, 3), Position::new(3, 3));
    }

    #[test]
    fn test_position_successor_is_greater() {
        let p = Position::new(u32::MAX - 1, 7);
        assert!(p.successor() > p);

        let p = Position::new(0, 0);
        assert!(p.successor() > p);
    }

    #[test]
    fn test_position_serde_shape() {
        let p: Position = serde_json::from_value(json!({"t": 10, "i": 2})).unwrap();
        assert_eq!(p, Position::new(10, 2));
    }

    #[test]
    fn test_position_successor_saturates() {
        let last = Position::new(u32::MAX, u32::MAX);
        assert_eq!(last.successor(), last);

        let p = Position::new(u32::MAX, 3);
        assert_eq!(p.successor(), Position::new(u32::MAX, 4));
    }

    #[test]
    fn test_document_id_from_json() {
        assert_eq!(DocumentId::from_json(&json!("abc")), Some(DocumentId::new("abc")));
        assert_eq!(DocumentId::from_json(&json!("abc")).unwrap().as_str(), "abc");
        assert_eq!(DocumentId::from_json(&json!(12)).unwrap().as_str(), "~12");
        assert_eq!(DocumentId::from_json(&json!(12.0)), DocumentId::from_json(&json!(12)));
        assert_eq!(DocumentId::from_json(&json!(true)).unwrap().as_str(), "~true");
        assert_eq!(DocumentId::from_json(&json!([1])), None);
        assert_eq!(DocumentId::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_document_ids_keep_their_type() {
        let pairs = [
            (json!(12), json!("12")),
            (json!({"$oid": "5f1d"}), json!("5f1d")),
            (json!({"$oid": "5f1d0c9e8b3a2d1e0f9c8b7a"}), json!("5f1d0c9e8b3a2d1e0f9c8b7a")),
            (json!(true), json!("~true")),
            (json!("-x"), json!("x")),
            (json!(null), json!("~null")),
        ];
        for (a, b) in pairs {
            let ida = DocumentId::from_json(&a).unwrap();
            let idb = DocumentId::from_json(&b).unwrap();
            assert_ne!(ida, idb, "{a} and {b}");
        }
    }

    #[test]
    fn test_document_id_back_to_json() {
        for value in [
            json!("abc"),
            json!("-dash"),
            json!("~tilde"),
            json!("{brace"),
            json!(""),
            json!(42),
            json!(-7),
            json!(false),
            json!({"$oid": "5f1d0c9e8b3a2d1e0f9c8b7a"}),
            json!({"$oid": "5f1d"}),
            json!("5f1d0c9e8b3a2d1e0f9c8b7a"),
        ] {
            let id = DocumentId::from_json(&value).unwrap();
            assert_eq!(id.to_json(), value);
            assert_eq!(DocumentId::from_json(&id.to_json()), Some(id));
        }
    }

    #[test]
    fn test_callback_validity() {
        assert!(CallbackKind::Added.valid_for(false));
        assert!(!CallbackKind::Added.valid_for(true));
        assert!(CallbackKind::MovedBefore.valid_for(true));
        assert!(CallbackKind::Removed.valid_for(true));
        assert!(CallbackKind::Removed.valid_for(false));
    }
}
