//! Query matching.
//!
//! A query is a JSON object mapping field names to conditions. A non-object
//! condition is an equality test; an object condition is a set of comparison
//! operators (`$gt`, `$gte`, `$lt`, `$lte`, `$ne`, `$in`, `$nin`). All clauses,
//! and all operators within a clause, must hold for a document to match.
//!
//! ```rust
//! use shelf_engine::Query;
//! use serde_json::json;
//!
//! let query = Query::parse(&json!({"age": {"$gte": 18, "$lt": 30}})).unwrap();
//! let adult = json!({"_id": "a", "age": 25});
//! assert!(query.matches(adult.as_object().unwrap()));
//! ```

use crate::{document::type_name, error::Result, Document, Error};
use serde_json::Value;
use std::cmp::Ordering;

/// A comparison operator inside an object condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    Ne,
    In,
    Nin,
    /// Unrecognized key. Never matches.
    Unknown(String),
}

impl Operator {
    fn parse(key: &str) -> Self {
        match key {
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$ne" => Operator::Ne,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            other => Operator::Unknown(other.to_string()),
        }
    }

    /// Evaluate this operator against a (possibly missing) field value.
    fn evaluate(&self, value: Option<&Value>, operand: &Value) -> bool {
        match self {
            Operator::Gt => ordering(value, operand) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                ordering(value, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => ordering(value, operand) == Some(Ordering::Less),
            Operator::Lte => matches!(
                ordering(value, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Ne => !value.is_some_and(|v| values_equal(v, operand)),
            Operator::In => match (value, operand) {
                (Some(v), Value::Array(items)) => items.iter().any(|i| values_equal(v, i)),
                _ => false,
            },
            Operator::Nin => match (value, operand) {
                (Some(v), Value::Array(items)) => !items.iter().any(|i| values_equal(v, i)),
                (None, Value::Array(_)) => true,
                _ => false,
            },
            Operator::Unknown(_) => false,
        }
    }
}

/// The condition applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field must equal the value.
    Eq(Value),
    /// Every operator must hold.
    Ops(Vec<(Operator, Value)>),
}

impl Condition {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Condition::Eq(expected) => value.is_some_and(|v| values_equal(v, expected)),
            Condition::Ops(ops) => ops.iter().all(|(op, operand)| op.evaluate(value, operand)),
        }
    }
}

/// A single field clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: String,
    pub condition: Condition,
}

/// A parsed query: an implicit AND of clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// The empty query, matching every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse a JSON query object.
    pub fn parse(query: &Value) -> Result<Self> {
        let fields = query.as_object().ok_or_else(|| {
            Error::InvalidQuery(format!("expected an object, got {}", type_name(query)))
        })?;

        let clauses = fields
            .iter()
            .map(|(field, value)| Clause {
                field: field.clone(),
                condition: match value {
                    Value::Object(ops) => Condition::Ops(
                        ops.iter()
                            .map(|(key, operand)| (Operator::parse(key), operand.clone()))
                            .collect(),
                    ),
                    other => Condition::Eq(other.clone()),
                },
            })
            .collect();

        Ok(Self { clauses })
    }

    /// Add an equality clause.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause {
            field: field.into(),
            condition: Condition::Eq(value.into()),
        });
        self
    }

    /// Whether this query has no clauses.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The clauses of this query.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Check a document against every clause.
    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.condition.matches(doc.get(&clause.field)))
    }

    /// Scalar equality clauses, the ones a field index can answer.
    pub fn index_candidates(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.clauses.iter().filter_map(|clause| match &clause.condition {
            Condition::Eq(value) if is_scalar(value) => Some((clause.field.as_str(), value)),
            _ => None,
        })
    }
}

/// Whether a value is a JSON scalar (not an array or object).
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Equality with numbers compared by value, so `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Order two values of the same kind. Mixed kinds (and missing fields) don't order.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn ordering(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
    compare_values(value?, operand)
}
