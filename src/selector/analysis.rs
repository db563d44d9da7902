//! Static analysis of modifiers against a selector.
//!
//! These checks never consult the store. When the selector is too complex to
//! reason about, the answers degrade to the conservative "yes".

use super::ast::{Clause, Operator, ValuePredicate};
use super::matcher::{predicate_matches, Matcher};
use super::modifier::Modifier;
use super::{is_numeric_key, path_has_numeric_keys};
use crate::error::LiveQueryError;
use serde_json::{Map, Number, Value};

impl Matcher {
    /// Whether applying `modifier` to some document may change whether that
    /// document matches.
    ///
    /// Compares every selector path with every modified path segment by
    /// segment. Numeric segments on the modifier side are skipped unless the
    /// selector also has a numeric segment there, in which case the indices
    /// must agree.
    pub fn affected_by_modifier(&self, modifier: &Modifier) -> bool {
        modifier.paths().any(|modified| {
            let modified: Vec<&str> = modified.split('.').collect();
            self.paths.iter().any(|selector_path| {
                let selector_path: Vec<&str> = selector_path.split('.').collect();
                paths_interact(&selector_path, &modified)
            })
        })
    }

    /// Assuming the document did not match before, whether applying
    /// `modifier` could make it match.
    pub fn can_become_true_by_modifier(&self, modifier: &Modifier) -> bool {
        if !self.affected_by_modifier(modifier) {
            return false;
        }

        if !self.is_simple() {
            return true;
        }

        if self.paths().any(path_has_numeric_keys) || modifier.paths().any(path_has_numeric_keys) {
            return true;
        }

        // Operators only accept scalars here, so a modifier writing below an
        // operator path proves the field is an object and cannot match.
        let expected_scalar_is_object = self.selector.clauses.iter().any(|clause| match clause {
            Clause::Field {
                path,
                predicate: ValuePredicate::Operators(_),
            } => {
                let prefix = format!("{path}.");
                modifier.paths().any(|p| p.starts_with(&prefix))
            }
            _ => false,
        });
        if expected_scalar_is_object {
            return false;
        }

        let Some(ideal) = self.matching_document() else {
            return true;
        };

        let mut doc = ideal.clone();
        match modifier.apply(&mut doc) {
            Ok(()) => self.document_matches(&doc),
            // Setting a property below a scalar: the real document has a
            // different shape and cannot match.
            Err(LiveQueryError::ModifierConflict { .. }) => false,
            Err(_) => true,
        }
    }

    /// A document that matches this selector, or `None` when the selector is
    /// too complex to invert.
    ///
    /// `{"a.b": {"ans": 42}, "foo.bar": null}` yields
    /// `{"a": {"b": {"ans": 42}}, "foo": {"bar": null}}`.
    pub fn matching_document(&self) -> Option<&Value> {
        self.matching_document
            .get_or_init(|| self.build_matching_document())
            .as_ref()
    }

    fn build_matching_document(&self) -> Option<Value> {
        let mut fallback = false;
        let mut root = Value::Object(Map::new());

        for path in &self.paths {
            let Some(predicate) = self.selector.field(path) else {
                fallback = true;
                continue;
            };
            let leaf = match predicate {
                ValuePredicate::Literal(v) => Some(v.clone()),
                ValuePredicate::Operators(ops) => invert_operators(ops, &mut fallback),
            };
            if let Some(leaf) = leaf {
                insert_path(&mut root, path, leaf);
            }
        }

        if fallback {
            None
        } else {
            Some(root)
        }
    }
}

/// Segment-wise prefix comparison of a selector path and a modified path.
fn paths_interact(selector: &[&str], modified: &[&str]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < selector.len() && j < modified.len() {
        let (sel, m) = (selector[i], modified[j]);
        match (is_numeric_key(sel), is_numeric_key(m)) {
            // foo.4.bar is affected by foo.4 but not by foo.3
            (true, true) if sel == m => {
                i += 1;
                j += 1;
            }
            (true, true) => return false,
            // foo.4.bar is not affected by foo.bar
            (true, false) => return false,
            (false, true) => j += 1,
            (false, false) if sel == m => {
                i += 1;
                j += 1;
            }
            (false, false) => return false,
        }
    }
    // One is a prefix of the other.
    true
}

/// Pick a value satisfying an operator object, setting `fallback` when none
/// can be derived.
fn invert_operators(ops: &[Operator], fallback: &mut bool) -> Option<Value> {
    let whole = ValuePredicate::Operators(ops.to_vec());
    let satisfies = |candidate: &Value| predicate_matches(&whole, &[Some(candidate)]);

    if let Some(Operator::Eq(v)) = ops.iter().find(|op| matches!(op, Operator::Eq(_))) {
        return Some(v.clone());
    }

    if let Some(Operator::In(candidates)) = ops.iter().find(|op| matches!(op, Operator::In(_))) {
        // Nothing in the list satisfies the rest of the selector: leave the
        // field out, the document cannot match anyway.
        return candidates.iter().find(|c| satisfies(*c)).cloned();
    }

    if ops.iter().all(Operator::is_range) {
        let mut lower = f64::NEG_INFINITY;
        let mut upper = f64::INFINITY;
        for op in ops {
            match op {
                Operator::Lt(v) | Operator::Lte(v) => match v.as_f64() {
                    Some(b) => upper = upper.min(b),
                    None => *fallback = true,
                },
                Operator::Gt(v) | Operator::Gte(v) => match v.as_f64() {
                    Some(b) => lower = lower.max(b),
                    None => *fallback = true,
                },
                _ => {}
            }
        }

        let middle = match (lower.is_finite(), upper.is_finite()) {
            (true, true) => (lower + upper) / 2.0,
            (true, false) => lower + 1.0,
            (false, true) => upper - 1.0,
            (false, false) => 0.0,
        };
        let Some(number) = Number::from_f64(middle) else {
            *fallback = true;
            return None;
        };
        let candidate = Value::Number(number);
        if !satisfies(&candidate) && (middle == lower || middle == upper) {
            *fallback = true;
        }
        return Some(candidate);
    }

    if ops.iter().all(Operator::is_negation) {
        // Negations only hold scalars in simple selectors, and an empty object
        // equals no scalar.
        return Some(Value::Object(Map::new()));
    }

    *fallback = true;
    None
}

/// Insert `value` at a dotted path, keeping whatever is already there on
/// conflict.
fn insert_path(root: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut node = root;
    for part in parents {
        node = match child_or_insert(node, part) {
            Some(next) => next,
            None => return,
        };
    }

    if let Value::Object(map) = node {
        map.entry((*last).to_string()).or_insert(value);
    }
}

fn child_or_insert<'a>(node: &'a mut Value, part: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => Some(
            map.entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
        ),
        _ => None,
    }
}
