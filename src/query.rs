//! Row predicates shared by the loader, the stores and downstream consumers.

use crate::import::batch_id::resolve_batch_id_field;
use crate::model::Model;
use crate::record::Record;
use crate::value::Value;

/// A boolean condition over one table's columns, evaluated with SQL
/// semantics (`NULL` compares unequal to everything).
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    IsNull(String),
    Lt { field: String, value: Value },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In {
            field: field.into(),
            values,
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull(field.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Conjunction that flattens nested `And`s and drops `True`.
    pub fn and(self, other: Predicate) -> Predicate {
        let mut parts = Vec::new();
        for p in [self, other] {
            match p {
                Predicate::True => {}
                Predicate::And(inner) => parts.extend(inner),
                p => parts.push(p),
            }
        }
        match parts.len() {
            0 => Predicate::True,
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::True => true,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(record)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(record)),
            Predicate::Eq { field, value } => record.get(field).sql_eq(value),
            Predicate::In { field, values } => {
                let current = record.get(field);
                values.iter().any(|v| current.sql_eq(v))
            }
            Predicate::IsNull(field) => record.get(field).is_null(),
            Predicate::Lt { field, value } => {
                matches!(record.get(field).sql_cmp(value), Some(std::cmp::Ordering::Less))
            }
        }
    }
}

/// Condition matching `field` against a set of non-null values, optionally
/// also matching `NULL` (which `IN` never does).
///
/// Returns `None` when there is nothing to restrict.
pub fn where_in_values(field: &str, mut values: Vec<Value>, match_null: bool) -> Option<Predicate> {
    let base = match values.len() {
        0 => None,
        1 => Some(Predicate::eq(field, values.remove(0))),
        _ => Some(Predicate::is_in(field, values)),
    };

    if !match_null {
        return base;
    }

    Some(match base {
        Some(base) => Predicate::Or(vec![base, Predicate::is_null(field)]),
        None => Predicate::is_null(field),
    })
}

/// Rows whose batch column is older than `batch_id` or was never set, i.e.
/// rows not seen by the import that stamped `batch_id`.
pub fn missing_after_batch(field: &str, batch_id: &str) -> Predicate {
    Predicate::Or(vec![
        Predicate::lt(field, batch_id),
        Predicate::is_null(field),
    ])
}

/// Reusable "missing after batch" filter that resolves the batch column the
/// same way an import does.
#[derive(Debug, Clone)]
pub struct WhereMissingAfterBatch {
    batch_id: String,
    batch_id_field: Option<String>,
}

impl WhereMissingAfterBatch {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            batch_id_field: None,
        }
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.batch_id_field = Some(field.into());
        self
    }

    pub fn apply(&self, model: &dyn Model) -> Predicate {
        let field = resolve_batch_id_field(self.batch_id_field.as_deref(), model);
        missing_after_batch(&field, &self.batch_id)
    }
}
