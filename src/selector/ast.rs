//! Selector syntax tree and its JSON parser.

use crate::error::{LiveQueryError, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// A parsed selector: a conjunction of clauses.
#[derive(Clone, Debug, PartialEq)]
pub struct Selector {
    pub clauses: Vec<Clause>,
}

/// One top-level key of a selector.
#[derive(Clone, Debug, PartialEq)]
pub enum Clause {
    /// `{path: predicate}`
    Field {
        path: String,
        predicate: ValuePredicate,
    },
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Nor(Vec<Selector>),
}

/// What a field path is tested against.
#[derive(Clone, Debug, PartialEq)]
pub enum ValuePredicate {
    /// Plain value: equality.
    Literal(Value),
    /// `{$op: operand, ...}`; all operators must hold.
    Operators(Vec<Operator>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Eq(_) => "$eq",
            Operator::Ne(_) => "$ne",
            Operator::Gt(_) => "$gt",
            Operator::Gte(_) => "$gte",
            Operator::Lt(_) => "$lt",
            Operator::Lte(_) => "$lte",
            Operator::In(_) => "$in",
            Operator::Nin(_) => "$nin",
            Operator::Exists(_) => "$exists",
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Operator::Gt(_) | Operator::Gte(_) | Operator::Lt(_) | Operator::Lte(_)
        )
    }

    pub fn is_negation(&self) -> bool {
        matches!(self, Operator::Ne(_) | Operator::Nin(_))
    }

    /// Scalar-operand comparisons the modifier analysis can invert.
    fn is_simple(&self) -> bool {
        match self {
            Operator::Gt(v) | Operator::Gte(v) | Operator::Lt(v) | Operator::Lte(v) => {
                v.is_number()
            }
            Operator::Eq(v) | Operator::Ne(v) => is_scalar(v),
            Operator::In(vs) | Operator::Nin(vs) => vs.iter().all(is_scalar),
            Operator::Exists(_) => false,
        }
    }

    fn parse(name: &str, operand: &Value) -> Result<Self> {
        let op = match name {
            "$eq" => Operator::Eq(operand.clone()),
            "$ne" => Operator::Ne(operand.clone()),
            "$gt" => Operator::Gt(operand.clone()),
            "$gte" => Operator::Gte(operand.clone()),
            "$lt" => Operator::Lt(operand.clone()),
            "$lte" => Operator::Lte(operand.clone()),
            "$in" => Operator::In(array_operand(name, operand)?),
            "$nin" => Operator::Nin(array_operand(name, operand)?),
            "$exists" => Operator::Exists(truthy(operand)),
            other => {
                return Err(LiveQueryError::InvalidSelector(format!(
                    "unsupported operator: {other}"
                )))
            }
        };
        Ok(op)
    }
}

impl ValuePredicate {
    fn parse(value: &Value) -> Result<Self> {
        let Some(map) = value.as_object() else {
            return Ok(ValuePredicate::Literal(value.clone()));
        };

        let dollar_keys = map.keys().filter(|k| k.starts_with('$')).count();
        if dollar_keys == 0 || map.is_empty() {
            return Ok(ValuePredicate::Literal(value.clone()));
        }
        if dollar_keys != map.len() {
            return Err(LiveQueryError::InvalidSelector(
                "inconsistent operator object: mixes operators and fields".to_string(),
            ));
        }

        let ops = map
            .iter()
            .map(|(name, operand)| Operator::parse(name, operand))
            .collect::<Result<Vec<_>>>()?;
        Ok(ValuePredicate::Operators(ops))
    }

    fn is_simple(&self) -> bool {
        match self {
            ValuePredicate::Literal(_) => true,
            ValuePredicate::Operators(ops) => ops.iter().all(Operator::is_simple),
        }
    }
}

impl Selector {
    /// Parse a JSON selector document.
    pub fn parse(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            LiveQueryError::InvalidSelector(format!("selector must be an object, got {value}"))
        })?;

        let mut clauses = Vec::with_capacity(map.len());
        for (key, sub) in map {
            let clause = match key.as_str() {
                "$and" => Clause::And(parse_branches(key, sub)?),
                "$or" => Clause::Or(parse_branches(key, sub)?),
                "$nor" => Clause::Nor(parse_branches(key, sub)?),
                k if k.starts_with('$') => {
                    return Err(LiveQueryError::InvalidSelector(format!(
                        "unrecognized logical operator: {k}"
                    )))
                }
                path => Clause::Field {
                    path: path.to_string(),
                    predicate: ValuePredicate::parse(sub)?,
                },
            };
            clauses.push(clause);
        }

        Ok(Selector { clauses })
    }

    /// Every document path the selector looks at, including paths nested in
    /// logical operators.
    pub fn paths(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut BTreeSet<String>) {
        for clause in &self.clauses {
            match clause {
                Clause::Field { path, .. } => {
                    out.insert(path.clone());
                }
                Clause::And(branches) | Clause::Or(branches) | Clause::Nor(branches) => {
                    for branch in branches {
                        branch.collect_paths(out);
                    }
                }
            }
        }
    }

    /// True when the selector only uses equality and scalar comparisons on
    /// top-level paths.
    pub fn is_simple(&self) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Field { predicate, .. } => predicate.is_simple(),
            _ => false,
        })
    }

    /// The predicate attached to a top-level path, if any.
    pub fn field(&self, path: &str) -> Option<&ValuePredicate> {
        self.clauses.iter().find_map(|clause| match clause {
            Clause::Field { path: p, predicate } if p == path => Some(predicate),
            _ => None,
        })
    }
}

fn parse_branches(op: &str, value: &Value) -> Result<Vec<Selector>> {
    let items = value.as_array().ok_or_else(|| {
        LiveQueryError::InvalidSelector(format!("{op} needs an array of selectors"))
    })?;
    if items.is_empty() {
        return Err(LiveQueryError::InvalidSelector(format!(
            "{op} needs a non-empty array"
        )));
    }
    items.iter().map(Selector::parse).collect()
}

fn array_operand(op: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| LiveQueryError::InvalidSelector(format!("{op} needs an array")))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn is_scalar(v: &Value) -> bool {
    !matches!(v, Value::Object(_) | Value::Array(_))
}
