//! Document matching against a parsed selector.

use super::ast::{Clause, Operator, Selector, ValuePredicate};
use super::is_numeric_key;
use crate::error::Result;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// A compiled selector.
///
/// Selectors are immutable once compiled, so derived data such as the
/// synthetic matching document is computed at most once.
#[derive(Debug)]
pub struct Matcher {
    pub(super) selector: Selector,
    pub(super) paths: BTreeSet<String>,
    simple: bool,
    pub(super) matching_document: OnceLock<Option<Value>>,
}

impl Matcher {
    pub fn new(selector: Selector) -> Self {
        let paths = selector.paths();
        let simple = selector.is_simple();
        Self {
            selector,
            paths,
            simple,
            matching_document: OnceLock::new(),
        }
    }

    /// Parse and compile a JSON selector.
    pub fn from_json(selector: &Value) -> Result<Self> {
        Ok(Self::new(Selector::parse(selector)?))
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Document paths this selector depends on.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn is_simple(&self) -> bool {
        self.simple
    }

    pub fn document_matches(&self, doc: &Value) -> bool {
        selector_matches(&self.selector, doc)
    }
}

fn selector_matches(selector: &Selector, doc: &Value) -> bool {
    selector.clauses.iter().all(|clause| clause_matches(clause, doc))
}

fn clause_matches(clause: &Clause, doc: &Value) -> bool {
    match clause {
        Clause::Field { path, predicate } => predicate_matches(predicate, &lookup(doc, path)),
        Clause::And(branches) => branches.iter().all(|s| selector_matches(s, doc)),
        Clause::Or(branches) => branches.iter().any(|s| selector_matches(s, doc)),
        Clause::Nor(branches) => !branches.iter().any(|s| selector_matches(s, doc)),
    }
}

/// Test a predicate against the values found at its path.
pub(super) fn predicate_matches(predicate: &ValuePredicate, branches: &[Option<&Value>]) -> bool {
    match predicate {
        ValuePredicate::Literal(expected) => equality_matches(branches, expected),
        ValuePredicate::Operators(ops) => ops.iter().all(|op| operator_matches(op, branches)),
    }
}

fn operator_matches(op: &Operator, branches: &[Option<&Value>]) -> bool {
    match op {
        Operator::Eq(v) => equality_matches(branches, v),
        Operator::Ne(v) => !equality_matches(branches, v),
        Operator::In(vs) => vs.iter().any(|v| equality_matches(branches, v)),
        Operator::Nin(vs) => !vs.iter().any(|v| equality_matches(branches, v)),
        Operator::Exists(wanted) => branches.iter().any(Option::is_some) == *wanted,
        Operator::Gt(v) => range_matches(branches, v, |o| o == Ordering::Greater),
        Operator::Gte(v) => range_matches(branches, v, |o| o != Ordering::Less),
        Operator::Lt(v) => range_matches(branches, v, |o| o == Ordering::Less),
        Operator::Lte(v) => range_matches(branches, v, |o| o != Ordering::Greater),
    }
}

fn equality_matches(branches: &[Option<&Value>], expected: &Value) -> bool {
    branches.iter().any(|branch| match branch {
        // A missing field equals null.
        None => expected.is_null(),
        Some(value) => {
            values_equal(value, expected)
                || matches!(
                    value,
                    Value::Array(items) if items.iter().any(|item| values_equal(item, expected))
                )
        }
    })
}

fn range_matches(
    branches: &[Option<&Value>],
    bound: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    branches.iter().flatten().any(|value| match value {
        Value::Array(items) => items
            .iter()
            .any(|item| compare(item, bound).map_or(false, &accept)),
        other => compare(other, bound).map_or(false, &accept),
    })
}

/// Ordering between values of the same comparable kind.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Structural equality where numbers compare by value.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Resolve a dotted path to every value it can reach, branching over arrays.
/// `None` marks a branch where the path is missing.
pub(super) fn lookup<'a>(doc: &'a Value, path: &str) -> Vec<Option<&'a Value>> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    lookup_parts(Some(doc), &parts, &mut out);
    out
}

fn lookup_parts<'a>(value: Option<&'a Value>, parts: &[&str], out: &mut Vec<Option<&'a Value>>) {
    let Some((first, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Some(Value::Object(map)) => lookup_parts(map.get(*first), rest, out),
        Some(Value::Array(items)) => {
            let before = out.len();
            if is_numeric_key(first) {
                if let Some(item) = first.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    lookup_parts(Some(item), rest, out);
                }
            }
            for item in items.iter().filter(|item| item.is_object()) {
                lookup_parts(Some(item), parts, out);
            }
            if out.len() == before {
                out.push(None);
            }
        }
        _ => out.push(None),
    }
}
