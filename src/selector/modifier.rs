//! `$set`/`$unset` modifiers as they appear in oplog update entries.

use super::is_numeric_key;
use crate::error::{LiveQueryError, Result};
use crate::types::Fields;
use serde_json::{Map, Value};

/// A field-path level mutation: paths to assign and paths to clear.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Modifier {
    set: Fields,
    unset: Vec<String>,
}

impl Modifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `$set` path.
    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.set.insert(path.into(), value);
        self
    }

    /// Add an `$unset` path.
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    /// Parse `{"$set": {...}, "$unset": {...}}`. Any other operator is rejected.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            LiveQueryError::InvalidModifier(format!("modifier must be an object, got {value}"))
        })?;

        let mut modifier = Modifier::new();
        for (op, args) in map {
            let args = args.as_object().ok_or_else(|| {
                LiveQueryError::InvalidModifier(format!("{op} needs an object argument"))
            })?;
            match op.as_str() {
                "$set" => modifier.set.extend(args.clone()),
                "$unset" => modifier.unset.extend(args.keys().cloned()),
                other => {
                    return Err(LiveQueryError::InvalidModifier(format!(
                        "unsupported modifier operator: {other}"
                    )))
                }
            }
        }
        Ok(modifier)
    }

    /// Every path touched by `$set` or `$unset`.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .map(String::as_str)
            .chain(self.unset.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply in place. A `$set` that has to traverse a scalar fails with
    /// `ModifierConflict`; the document may be partially modified.
    pub fn apply(&self, doc: &mut Value) -> Result<()> {
        for (path, value) in &self.set {
            set_path(doc, path, value.clone())?;
        }
        for path in &self.unset {
            unset_path(doc, path);
        }
        Ok(())
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return Err(LiveQueryError::InvalidModifier("empty path".to_string()));
    };
    if parts.iter().any(|p| p.is_empty()) {
        return Err(LiveQueryError::InvalidModifier(format!("empty segment in '{path}'")));
    }

    let mut target = doc;
    for part in parents {
        target = descend_or_create(target, path, part)?;
    }

    match target {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(path, last)?;
            pad(items, index);
            items[index] = value;
            Ok(())
        }
        _ => Err(conflict(path, last)),
    }
}

fn descend_or_create<'a>(target: &'a mut Value, path: &str, part: &str) -> Result<&'a mut Value> {
    match target {
        Value::Object(map) => Ok(map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => {
            let index = array_index(path, part)?;
            pad(items, index);
            if items[index].is_null() {
                items[index] = Value::Object(Map::new());
            }
            Ok(&mut items[index])
        }
        _ => Err(conflict(path, part)),
    }
}

fn unset_path(doc: &mut Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut target = doc;
    for part in parents {
        target = match child_mut(target, part) {
            Some(next) => next,
            None => return,
        };
    }

    match target {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = Value::Null;
            }
        }
        _ => {}
    }
}

fn child_mut<'a>(value: &'a mut Value, part: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(part),
        Value::Array(items) if is_numeric_key(part) => {
            part.parse::<usize>().ok().and_then(move |i| items.get_mut(i))
        }
        _ => None,
    }
}

fn array_index(path: &str, part: &str) -> Result<usize> {
    if !is_numeric_key(part) {
        return Err(conflict(path, part));
    }
    part.parse::<usize>().map_err(|_| conflict(path, part))
}

fn pad(items: &mut Vec<Value>, index: usize) {
    if items.len() <= index {
        items.resize(index + 1, Value::Null);
    }
}

fn conflict(path: &str, part: &str) -> LiveQueryError {
    LiveQueryError::ModifierConflict {
        path: path.to_string(),
        part: part.to_string(),
    }
}
