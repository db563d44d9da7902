//! Replication log entry wire model.

use crate::error::{LiveQueryError, Result};
use crate::selector::Modifier;
use crate::types::{DocumentId, Position};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Operation recorded by a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "c")]
    Command,
    #[serde(rename = "n")]
    Noop,
}

impl OpType {
    pub fn code(self) -> &'static str {
        match self {
            OpType::Insert => "i",
            OpType::Update => "u",
            OpType::Delete => "d",
            OpType::Command => "c",
            OpType::Noop => "n",
        }
    }
}

/// One entry of the replication log.
///
/// Field names follow the stored document shape (`ts`, `op`, `ns`, `o`, `o2`),
/// so entries decode straight from the log's JSON or MessagePack form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Missing on malformed entries; the tailer refuses those.
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub op: OpType,
    /// `<db>.<collection>`, or `<db>.$cmd` for commands.
    #[serde(rename = "ns")]
    pub namespace: String,
    /// Inserted document, update modifier, delete selector or command body.
    #[serde(rename = "o", default)]
    pub object: Value,
    /// Update selector (carries the target `_id`).
    #[serde(rename = "o2", default, skip_serializing_if = "Option::is_none")]
    pub object2: Option<Value>,
}

impl OplogEntry {
    pub fn insert(namespace: impl Into<String>, document: Value) -> Self {
        Self {
            position: None,
            op: OpType::Insert,
            namespace: namespace.into(),
            object: document,
            object2: None,
        }
    }

    pub fn update(namespace: impl Into<String>, id: &DocumentId, modifier: Value) -> Self {
        Self {
            position: None,
            op: OpType::Update,
            namespace: namespace.into(),
            object: modifier,
            object2: Some(json!({ "_id": id.to_json() })),
        }
    }

    pub fn delete(namespace: impl Into<String>, id: &DocumentId) -> Self {
        Self {
            position: None,
            op: OpType::Delete,
            namespace: namespace.into(),
            object: json!({ "_id": id.to_json() }),
            object2: None,
        }
    }

    /// `db.collection.drop()` as logged against `<db>.$cmd`.
    pub fn drop_collection(db_name: &str, collection: &str) -> Self {
        Self {
            position: None,
            op: OpType::Command,
            namespace: format!("{db_name}.$cmd"),
            object: json!({ "drop": collection }),
            object2: None,
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| LiveQueryError::MalformedEntry(e.to_string()))
    }

    pub fn from_msgpack_slice(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Collection part of the namespace, if it lies inside `db_name`.
    pub fn collection_in(&self, db_name: &str) -> Option<&str> {
        self.namespace
            .strip_prefix(db_name)
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|collection| !collection.is_empty())
    }

    /// Collection named by a drop command.
    pub fn dropped_collection(&self) -> Option<&str> {
        match self.op {
            OpType::Command => self.object.get("drop").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Target document id: `o._id` for inserts and deletes, `o2._id` for
    /// updates.
    pub fn document_id(&self) -> Result<DocumentId> {
        let source = match self.op {
            OpType::Insert | OpType::Delete => Some(&self.object),
            OpType::Update => self.object2.as_ref(),
            OpType::Command | OpType::Noop => {
                return Err(LiveQueryError::MalformedEntry(format!(
                    "operation '{}' does not supply a document id",
                    self.op.code()
                )))
            }
        };
        source
            .and_then(|v| v.get("_id"))
            .and_then(DocumentId::from_json)
            .ok_or_else(|| {
                LiveQueryError::MalformedEntry(format!(
                    "'{}' entry on {} without _id",
                    self.op.code(),
                    self.namespace
                ))
            })
    }

    /// The `$set`/`$unset` modifier of an update, or `None` for inserts,
    /// deletes and whole-document replacements.
    pub fn modifier(&self) -> Result<Option<Modifier>> {
        if self.op != OpType::Update {
            return Ok(None);
        }
        let is_modifier = self
            .object
            .as_object()
            .map_or(false, |map| map.keys().any(|k| k.starts_with('$')));
        if !is_modifier {
            return Ok(None);
        }
        Modifier::from_json(&self.object).map(Some)
    }
}
