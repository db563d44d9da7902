//! Selector matching and modifier analysis.
//!
//! This module answers two questions about a live query's selector without
//! touching the store:
//! - Does a document match? (`Matcher::document_matches`)
//! - Could a `$set`/`$unset` mutation move a document into or out of the
//!   match set? (`Matcher::affected_by_modifier`,
//!   `Matcher::can_become_true_by_modifier`)
//!
//! Observe drivers use the second pair to decide between applying an oplog
//! update in place and re-running the query.
//!
//! # Example
//!
//! ```ignore
//! let matcher = Matcher::from_json(&json!({"a.b": {"$gt": 5}}))?;
//! let modifier = Modifier::from_json(&json!({"$set": {"c": 1}}))?;
//! assert!(!matcher.affected_by_modifier(&modifier));
//! ```

mod analysis;
mod ast;
mod matcher;
mod modifier;

pub use ast::{Clause, Operator, Selector, ValuePredicate};
pub use matcher::Matcher;
pub use modifier::Modifier;

/// Numeric path segments address array elements (`a.3.b`).
pub(crate) fn is_numeric_key(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

pub(crate) fn path_has_numeric_keys(path: &str) -> bool {
    path.split('.').any(is_numeric_key)
}
