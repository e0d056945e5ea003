//! Match-by and update field specifications.

use crate::error::{ImportError, ImportResult};
use crate::record::Record;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Maps a record's field value to the value used for matching.
/// Receives the raw field value and the whole record.
pub type MatchTransform = Arc<dyn Fn(&Value, &Record) -> Value + Send + Sync>;

/// Computes the value written on update from
/// `(new_value, existing_record, incoming_record, field)`.
pub type UpdateTransform = Arc<dyn Fn(&Value, &Record, &Record, &str) -> Value + Send + Sync>;

/// Returns `true` when `(new_value, existing_value, existing_record)` differ.
pub type RawComparator = Arc<dyn Fn(&Value, &Value, &Record) -> bool + Send + Sync>;

pub fn comparator<F>(f: F) -> RawComparator
where
    F: Fn(&Value, &Value, &Record) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One field contributing to the comparison key.
#[derive(Clone)]
pub enum MatchField {
    /// Compared as stored; also pushed into the existing-row query.
    Column(String),
    /// Compared after `transform`; evaluated in memory only.
    Transformed {
        field: String,
        transform: MatchTransform,
    },
}

impl MatchField {
    pub fn column(field: impl Into<String>) -> Self {
        MatchField::Column(field.into())
    }

    pub fn transformed<F>(field: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Value, &Record) -> Value + Send + Sync + 'static,
    {
        MatchField::Transformed {
            field: field.into(),
            transform: Arc::new(transform),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MatchField::Column(field) | MatchField::Transformed { field, .. } => field,
        }
    }

    pub fn is_column(&self) -> bool {
        matches!(self, MatchField::Column(_))
    }
}

impl fmt::Debug for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchField::Column(field) => write!(f, "Column({field:?})"),
            MatchField::Transformed { field, .. } => write!(f, "Transformed({field:?})"),
        }
    }
}

impl From<&str> for MatchField {
    fn from(field: &str) -> Self {
        MatchField::column(field)
    }
}

impl From<String> for MatchField {
    fn from(field: String) -> Self {
        MatchField::Column(field)
    }
}

/// One field written when an existing row is updated.
#[derive(Clone)]
pub enum UpdateField {
    /// Copy the incoming value.
    Copy(String),
    /// Write a constant.
    Static { field: String, value: Value },
    /// Write the transform's result.
    Transformed {
        field: String,
        transform: UpdateTransform,
    },
}

impl UpdateField {
    pub fn copy(field: impl Into<String>) -> Self {
        UpdateField::Copy(field.into())
    }

    pub fn constant(field: impl Into<String>, value: impl Into<Value>) -> Self {
        UpdateField::Static {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn transformed<F>(field: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Value, &Record, &Record, &str) -> Value + Send + Sync + 'static,
    {
        UpdateField::Transformed {
            field: field.into(),
            transform: Arc::new(transform),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            UpdateField::Copy(field)
            | UpdateField::Static { field, .. }
            | UpdateField::Transformed { field, .. } => field,
        }
    }
}

impl fmt::Debug for UpdateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateField::Copy(field) => write!(f, "Copy({field:?})"),
            UpdateField::Static { field, value } => write!(f, "Static({field:?}, {value:?})"),
            UpdateField::Transformed { field, .. } => write!(f, "Transformed({field:?})"),
        }
    }
}

impl From<&str> for UpdateField {
    fn from(field: &str) -> Self {
        UpdateField::copy(field)
    }
}

impl From<String> for UpdateField {
    fn from(field: String) -> Self {
        UpdateField::Copy(field)
    }
}

fn assert_field_name(name: &str, kind: &str) -> ImportResult<()> {
    if name.trim().is_empty() {
        return Err(ImportError::config(format!("empty {kind} field name given")));
    }
    Ok(())
}

pub(crate) fn validate_match_fields(fields: &[MatchField]) -> ImportResult<()> {
    if fields.is_empty() {
        return Err(ImportError::config("at least one match by field is required"));
    }
    for field in fields {
        assert_field_name(field.name(), "match")?;
    }
    Ok(())
}

pub(crate) fn validate_update_fields(fields: &[UpdateField]) -> ImportResult<()> {
    for field in fields {
        assert_field_name(field.name(), "update")?;
    }
    Ok(())
}

/// Names written by an update, in specification order without duplicates.
pub(crate) fn update_field_names(fields: &[UpdateField]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(fields.len());
    for field in fields {
        if !names.iter().any(|n| n == field.name()) {
            names.push(field.name().to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_fields_validation() {
        assert!(validate_match_fields(&[]).unwrap_err().is_config());
        assert!(validate_match_fields(&[MatchField::column(" ")]).is_err());
        assert!(
            validate_match_fields(&[MatchField::transformed("", |v, _| v.clone())]).is_err()
        );
        assert!(validate_match_fields(&["a".into(), MatchField::column("b")]).is_ok());
    }

    #[test]
    fn test_update_fields_validation_allows_empty_list() {
        assert!(validate_update_fields(&[]).is_ok());
        assert!(validate_update_fields(&[UpdateField::constant("", 1)]).is_err());
    }

    #[test]
    fn test_update_field_names_dedupe() {
        let names = update_field_names(&[
            UpdateField::copy("a"),
            UpdateField::constant("b", "x"),
            UpdateField::transformed("a", |v, _, _, _| v.clone()),
        ]);
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_debug_output_names_fields() {
        let field = MatchField::transformed("a", |v, _| v.clone());
        assert_eq!(format!("{field:?}"), "Transformed(\"a\")");
        assert_eq!(format!("{:?}", UpdateField::copy("b")), "Copy(\"b\")");
    }
}
