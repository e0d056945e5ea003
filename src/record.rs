//! Record representations flowing through an import.
//!
//! A [`Record`] is a bare field map (the bypass representation). A
//! [`TrackedRecord`] pairs the snapshot loaded from the database with the
//! current attributes, so change detection compares against an explicit
//! original instead of hidden state.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;

static NULL: Value = Value::Null;

/// Build a [`Record`] from `field => value` pairs.
///
/// ```
/// use db_batch_import::{record, Value};
///
/// let row = record! { "a" => "x", "b" => 3 };
/// assert_eq!(row.get("b"), &Value::Int(3));
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::Record::new() };
    ($($field:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::Record::new();
        $( record.set($field, $value); )+
        record
    }};
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field value, `Null` when the field is absent.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn value(&self, field: &str) -> Value {
        self.get(field).clone()
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Record {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        map.into_iter().collect()
    }
}

/// A record with a loaded snapshot and its current attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedRecord {
    original: Record,
    attributes: Record,
    exists: bool,
}

impl TrackedRecord {
    /// A fresh record not yet persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a row read from the database; the snapshot equals the attributes.
    pub fn from_loaded(row: Record) -> Self {
        Self {
            original: row.clone(),
            attributes: row,
            exists: true,
        }
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn get(&self, field: &str) -> &Value {
        self.attributes.get(field)
    }

    /// Assign a stored value directly, bypassing any model mutator.
    pub fn set_raw(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.attributes.set(field, value);
    }

    pub fn original(&self) -> &Record {
        &self.original
    }

    pub fn attributes(&self) -> &Record {
        &self.attributes
    }

    pub fn into_attributes(self) -> Record {
        self.attributes
    }

    /// True when the stored attribute differs from the loaded snapshot.
    pub fn is_modified(&self, field: &str) -> bool {
        self.attributes.get(field) != self.original.get(field)
    }
}

/// An item handed to an import.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Plain(Record),
    Tracked(TrackedRecord),
}

impl From<Record> for Incoming {
    fn from(record: Record) -> Self {
        Incoming::Plain(record)
    }
}

impl From<TrackedRecord> for Incoming {
    fn from(record: TrackedRecord) -> Self {
        Incoming::Tracked(record)
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Incoming {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Incoming::Plain(map.into())
    }
}
