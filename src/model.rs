//! Target table description and record adapter.
//!
//! A [`Model`] tells the import which table it writes, which column is the
//! primary key, whether timestamps are maintained, and how values are cast and
//! mutated on the tracked-record path. Batch-id capabilities are optional
//! accessors checked once when an import is prepared.

use crate::error::ImportResult;
use crate::import::BatchImport;
use crate::record::{Record, TrackedRecord};
use crate::store::Store;
use crate::value::Value;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Produces the batch id for a new import run.
pub trait GeneratesBatchIds: Send + Sync {
    fn next_batch_id(&self) -> String;
}

impl<F> GeneratesBatchIds for F
where
    F: Fn() -> String + Send + Sync,
{
    fn next_batch_id(&self) -> String {
        self()
    }
}

/// Names the column holding the batch id.
pub trait StoresBatchId: Send + Sync {
    fn batch_id_field(&self) -> String;
}

/// Fixed batch-id column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchIdField(pub String);

impl StoresBatchId for BatchIdField {
    fn batch_id_field(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampColumns {
    pub created_at: String,
    pub updated_at: String,
}

impl TimestampColumns {
    pub fn new(created_at: impl Into<String>, updated_at: impl Into<String>) -> Self {
        Self {
            created_at: created_at.into(),
            updated_at: updated_at.into(),
        }
    }
}

impl Default for TimestampColumns {
    fn default() -> Self {
        Self::new("created_at", "updated_at")
    }
}

/// Attribute casts applied when reading tracked records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cast {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
}

impl Cast {
    pub fn apply(self, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match self {
            Cast::Integer => match value {
                Value::Bool(b) => Value::Int(*b as i64),
                other => other
                    .as_number()
                    .map(|n| Value::Int(n.trunc() as i64))
                    .unwrap_or_else(|| other.clone()),
            },
            Cast::Float => value
                .as_number()
                .map(Value::Float)
                .unwrap_or_else(|| value.clone()),
            Cast::Text => Value::Text(value.to_key_string()),
            Cast::Boolean => Value::Bool(value.truthy()),
            Cast::Timestamp => match value {
                Value::Text(s) => Value::parse_timestamp(s)
                    .map(Value::Timestamp)
                    .unwrap_or_else(|| value.clone()),
                Value::Int(secs) => Utc
                    .timestamp_opt(*secs, 0)
                    .single()
                    .map(Value::Timestamp)
                    .unwrap_or(Value::Null),
                other => other.clone(),
            },
        }
    }
}

/// Record adapter and table description used by a batch import.
pub trait Model: Send + Sync {
    fn table(&self) -> &str;

    /// Primary key column, `None` for keyless tables (which cannot be imported).
    fn key_name(&self) -> Option<&str>;

    fn timestamps(&self) -> Option<&TimestampColumns> {
        None
    }

    /// Read-side conversion of a stored attribute.
    fn cast_attribute(&self, _field: &str, value: &Value) -> Value {
        value.clone()
    }

    /// Write-side conversion of a value assigned to a tracked record.
    fn mutate_attribute(&self, _field: &str, value: Value) -> Value {
        value
    }

    /// Whether `current` is equivalent to the loaded `original` value.
    fn original_is_equivalent(&self, field: &str, current: &Value, original: &Value) -> bool {
        if current == original {
            return true;
        }
        self.cast_attribute(field, current)
            .strict_equivalent(&self.cast_attribute(field, original))
    }

    fn batch_id_generator(&self) -> Option<&dyn GeneratesBatchIds> {
        None
    }

    fn batch_id_storage(&self) -> Option<&dyn StoresBatchId> {
        None
    }

    fn get_attribute(&self, record: &TrackedRecord, field: &str) -> Value {
        self.cast_attribute(field, record.get(field))
    }

    fn set_attribute(&self, record: &mut TrackedRecord, field: &str, value: Value) {
        let stored = self.mutate_attribute(field, value);
        record.set_raw(field, stored);
    }

    /// Build a new tracked record from plain input, running every mutator.
    fn fill(&self, input: Record) -> TrackedRecord {
        let mut tracked = TrackedRecord::new();
        for (field, value) in input {
            self.set_attribute(&mut tracked, &field, value);
        }
        tracked
    }
}

/// Shortcut for starting a [`BatchImport`] from a model value.
pub trait ProvidesBatchImport: Model + Sized + 'static {
    fn batch_import(self, store: Arc<dyn Store>) -> ImportResult<BatchImport> {
        BatchImport::new(self, store)
    }
}

impl<M: Model + 'static> ProvidesBatchImport for M {}

pub type Mutator = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Configurable [`Model`] for plain tables.
///
/// Defaults follow the common convention: key column `id` and
/// `created_at`/`updated_at` timestamps.
#[derive(Clone)]
pub struct TableModel {
    table: String,
    key_name: Option<String>,
    timestamps: Option<TimestampColumns>,
    casts: HashMap<String, Cast>,
    mutators: HashMap<String, Mutator>,
    batch_id_field: Option<BatchIdField>,
    batch_ids: Option<Arc<dyn GeneratesBatchIds>>,
}

impl TableModel {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_name: Some("id".to_string()),
            timestamps: Some(TimestampColumns::default()),
            casts: HashMap::new(),
            mutators: HashMap::new(),
            batch_id_field: None,
            batch_ids: None,
        }
    }

    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.key_name = Some(name.into());
        self
    }

    pub fn without_key(mut self) -> Self {
        self.key_name = None;
        self
    }

    pub fn timestamp_columns(mut self, columns: TimestampColumns) -> Self {
        self.timestamps = Some(columns);
        self
    }

    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = None;
        self
    }

    pub fn cast(mut self, field: impl Into<String>, cast: Cast) -> Self {
        self.casts.insert(field.into(), cast);
        self
    }

    pub fn mutator<F>(mut self, field: impl Into<String>, mutator: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.mutators.insert(field.into(), Arc::new(mutator));
        self
    }

    /// Store batch ids in `field` instead of the default column.
    pub fn batch_id_field(mut self, field: impl Into<String>) -> Self {
        self.batch_id_field = Some(BatchIdField(field.into()));
        self
    }

    /// Generate a batch id for every import of this table.
    pub fn batch_ids<G>(mut self, generator: G) -> Self
    where
        G: GeneratesBatchIds + 'static,
    {
        self.batch_ids = Some(Arc::new(generator));
        self
    }
}

impl fmt::Debug for TableModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableModel")
            .field("table", &self.table)
            .field("key_name", &self.key_name)
            .field("timestamps", &self.timestamps)
            .field("casts", &self.casts)
            .field("mutators", &self.mutators.keys().collect::<Vec<_>>())
            .field("batch_id_field", &self.batch_id_field)
            .field("batch_ids", &self.batch_ids.is_some())
            .finish()
    }
}

impl Model for TableModel {
    fn table(&self) -> &str {
        &self.table
    }

    fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    fn timestamps(&self) -> Option<&TimestampColumns> {
        self.timestamps.as_ref()
    }

    fn cast_attribute(&self, field: &str, value: &Value) -> Value {
        match self.casts.get(field) {
            Some(cast) => cast.apply(value),
            None => value.clone(),
        }
    }

    fn mutate_attribute(&self, field: &str, value: Value) -> Value {
        match self.mutators.get(field) {
            Some(mutator) => mutator(value),
            None => value,
        }
    }

    fn batch_id_generator(&self) -> Option<&dyn GeneratesBatchIds> {
        self.batch_ids.as_deref()
    }

    fn batch_id_storage(&self) -> Option<&dyn StoresBatchId> {
        self.batch_id_field
            .as_ref()
            .map(|field| field as &dyn StoresBatchId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn test_defaults() {
        let model = TableModel::new("test_table");
        assert_eq!(model.table(), "test_table");
        assert_eq!(model.key_name(), Some("id"));
        assert_eq!(Model::timestamps(&model), Some(&TimestampColumns::default()));
        assert!(model.batch_id_generator().is_none());
        assert!(model.batch_id_storage().is_none());
    }

    #[test]
    fn test_integer_cast_normalizes_numeric_strings() {
        let model = TableModel::new("t").cast("n", Cast::Integer);
        assert!(model.original_is_equivalent("n", &Value::from("09"), &Value::Int(9)));
        assert!(!model.original_is_equivalent("n", &Value::from("10"), &Value::Int(9)));
        assert!(!model.original_is_equivalent("n", &Value::Null, &Value::Int(9)));
    }

    #[test]
    fn test_timestamp_cast_compares_instants() {
        let model = TableModel::new("t").cast("d", Cast::Timestamp);
        let stored = Value::from("2024-01-02 03:04:05");
        let parsed = Value::Timestamp(Value::parse_timestamp("2024-01-02T03:04:05Z").unwrap());
        assert!(model.original_is_equivalent("d", &parsed, &stored));
        // without the cast, text and timestamp never match
        let plain = TableModel::new("t");
        assert!(!plain.original_is_equivalent("d", &parsed, &stored));
    }

    #[test]
    fn test_fill_runs_mutators() {
        let model = TableModel::new("t").mutator("a", |v| Value::Text(format!("mutated:{}", v)));
        let tracked = model.fill(record! { "a" => "x", "b" => "y" });
        assert_eq!(tracked.get("a"), &Value::from("mutated:x"));
        assert_eq!(tracked.get("b"), &Value::from("y"));
        assert!(!tracked.exists());
    }

    #[test]
    fn test_batch_capabilities() {
        let model = TableModel::new("t")
            .batch_id_field("c")
            .batch_ids(|| "25".to_string());
        assert_eq!(model.batch_id_generator().unwrap().next_batch_id(), "25");
        assert_eq!(model.batch_id_storage().unwrap().batch_id_field(), "c");
    }

    #[test]
    fn test_provides_batch_import() {
        let store = crate::store::MemoryStore::new();
        store.create_table("t", "id");
        let import = TableModel::new("t").batch_import(Arc::new(store)).unwrap();
        assert_eq!(import.model().table(), "t");

        let keyless = TableModel::new("t").without_key();
        assert!(keyless.batch_import(Arc::new(crate::store::MemoryStore::new())).is_err());
    }

    #[test]
    fn test_boolean_and_text_casts() {
        assert_eq!(Cast::Boolean.apply(&Value::from("0")), Value::Bool(false));
        assert_eq!(Cast::Text.apply(&Value::Int(5)), Value::from("5"));
        assert_eq!(Cast::Float.apply(&Value::from("2.5")), Value::Float(2.5));
        assert_eq!(Cast::Integer.apply(&Value::Null), Value::Null);
    }
}
