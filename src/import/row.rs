//! Mode-aware access to records inside one import.
//!
//! In bypass mode every record is a plain map and values are read as stored.
//! Otherwise records are tracked and reads go through the model's casts,
//! writes through its mutators.

use crate::error::{ImportError, ImportResult};
use crate::model::Model;
use crate::record::{Incoming, Record, TrackedRecord};
use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) enum Row {
    Plain(Record),
    Tracked(TrackedRecord),
}

impl Row {
    pub(crate) fn attributes(&self) -> &Record {
        match self {
            Row::Plain(record) => record,
            Row::Tracked(tracked) => tracked.attributes(),
        }
    }

    pub(crate) fn into_attributes(self) -> Record {
        match self {
            Row::Plain(record) => record,
            Row::Tracked(tracked) => tracked.into_attributes(),
        }
    }

    /// Store a value as-is (batch ids, timestamps, copied attributes).
    pub(crate) fn set_raw(&mut self, field: &str, value: Value) {
        match self {
            Row::Plain(record) => record.set(field, value),
            Row::Tracked(tracked) => tracked.set_raw(field, value),
        }
    }
}

fn tracked_in_bypass() -> ImportError {
    ImportError::precondition(
        "expected plain records instead of tracked records when bypass_model is active",
    )
}

#[derive(Clone, Copy)]
pub(crate) struct RowAccess<'a> {
    pub(crate) model: &'a dyn Model,
    pub(crate) bypass: bool,
}

impl<'a> RowAccess<'a> {
    pub(crate) fn new(model: &'a dyn Model, bypass: bool) -> Self {
        Self { model, bypass }
    }

    pub(crate) fn read(&self, row: &Row, field: &str) -> Value {
        match row {
            Row::Plain(record) => record.value(field),
            Row::Tracked(tracked) => self.model.get_attribute(tracked, field),
        }
    }

    /// Reject items this import cannot convert.
    pub(crate) fn check(&self, item: &Incoming) -> ImportResult<()> {
        if self.bypass && matches!(item, Incoming::Tracked(_)) {
            return Err(tracked_in_bypass());
        }
        Ok(())
    }

    /// Convert an incoming item into this import's row representation.
    pub(crate) fn incoming(&self, item: &Incoming) -> ImportResult<Row> {
        match (self.bypass, item) {
            (true, Incoming::Plain(record)) => Ok(Row::Plain(record.clone())),
            (true, Incoming::Tracked(_)) => Err(tracked_in_bypass()),
            (false, Incoming::Plain(record)) => Ok(Row::Tracked(self.model.fill(record.clone()))),
            (false, Incoming::Tracked(tracked)) => Ok(Row::Tracked(tracked.clone())),
        }
    }

    pub(crate) fn loaded(&self, record: Record) -> Row {
        if self.bypass {
            Row::Plain(record)
        } else {
            Row::Tracked(TrackedRecord::from_loaded(record))
        }
    }

    /// Value to store for an externally supplied `value`.
    pub(crate) fn stored_value(&self, field: &str, value: Value) -> Value {
        if self.bypass {
            value
        } else {
            self.model.mutate_attribute(field, value)
        }
    }

    /// Whether writing `stored` into `existing` changes `field`.
    pub(crate) fn is_field_modified(
        &self,
        field: &str,
        stored: &Value,
        existing: &Row,
        comparator: Option<&crate::import::fields::RawComparator>,
    ) -> bool {
        match existing {
            Row::Tracked(tracked) => {
                !self
                    .model
                    .original_is_equivalent(field, stored, tracked.original().get(field))
            }
            Row::Plain(record) => {
                let existing_value = record.get(field);
                match comparator {
                    Some(comparator) => comparator(stored, existing_value, record),
                    None => {
                        if stored.is_null() && existing_value.is_null() {
                            false
                        } else {
                            !stored.loose_eq(existing_value)
                        }
                    }
                }
            }
        }
    }
}
