//! Dirty-check and merge.
//!
//! Classifies one chunk of incoming rows against the existing rows loaded for
//! it. Matched rows receive every configured update field; a row is written
//! only when at least one field changed, otherwise it is only re-stamped with
//! the batch id (when batching). Unmatched rows become inserts.
//!
//! Several incoming rows matching the same existing row are merged into that
//! row in arrival order and written once.

use crate::error::{ImportError, ImportResult};
use crate::import::fields::{MatchField, RawComparator, UpdateField};
use crate::import::loader::row_key;
use crate::import::row::{Row, RowAccess};
use crate::model::TimestampColumns;
use crate::record::Record;
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Batch id and the column it is written to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchStamp<'a> {
    pub(crate) id: &'a str,
    pub(crate) field: &'a str,
}

/// Everything the merge needs besides the rows themselves.
pub(crate) struct MergeContext<'a> {
    pub(crate) access: RowAccess<'a>,
    pub(crate) match_by: &'a [MatchField],
    pub(crate) update_fields: &'a [UpdateField],
    pub(crate) callback_when: &'a HashSet<String>,
    pub(crate) comparators: &'a HashMap<String, RawComparator>,
    pub(crate) key_name: &'a str,
    pub(crate) batch: Option<BatchStamp<'a>>,
    pub(crate) timestamps: Option<&'a TimestampColumns>,
    pub(crate) now: DateTime<Utc>,
}

/// Outcome of classifying one chunk.
#[derive(Debug, Default)]
pub(crate) struct ChunkPlan {
    pub(crate) to_insert: Vec<Record>,
    pub(crate) to_update: Vec<Record>,
    /// Primary keys of matched rows without changes, to re-stamp.
    pub(crate) batch_id_touch: Vec<Value>,
    /// Updated rows whose change passed the callback trigger condition.
    pub(crate) updated_for_callbacks: Vec<Record>,
    /// Matched rows without changes and without batching.
    pub(crate) unchanged: usize,
}

impl ChunkPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.batch_id_touch.is_empty()
    }
}

struct FieldOutcome {
    is_dirty: bool,
    invoke_callbacks: bool,
}

impl MergeContext<'_> {
    /// Value written for `update` when `incoming` updates `existing`.
    fn update_value(&self, update: &UpdateField, incoming: &Row, existing: &Row) -> Value {
        match update {
            UpdateField::Copy(field) => incoming.attributes().value(field),
            UpdateField::Static { field, value } => self.access.stored_value(field, value.clone()),
            UpdateField::Transformed { field, transform } => {
                let new_value = self.access.read(incoming, field);
                let result = transform(
                    &new_value,
                    existing.attributes(),
                    incoming.attributes(),
                    field,
                );
                self.access.stored_value(field, result)
            }
        }
    }

    /// Apply all update fields onto `existing`, tracking dirty state.
    fn apply_update_fields(&self, incoming: &Row, existing: &mut Row) -> FieldOutcome {
        let mut is_dirty = false;
        let mut invoke_callbacks = false;

        for update in self.update_fields {
            let field = update.name();
            let value = self.update_value(update, incoming, existing);

            // once dirty, only trigger fields still need checking
            let trigger = self.callback_when.contains(field);
            if !is_dirty || (!invoke_callbacks && trigger) {
                let field_dirty =
                    self.access
                        .is_field_modified(field, &value, existing, self.comparators.get(field));
                if field_dirty {
                    is_dirty = true;
                }
                invoke_callbacks = if self.callback_when.is_empty() {
                    is_dirty
                } else {
                    invoke_callbacks || (field_dirty && trigger)
                };
            }

            existing.set_raw(field, value);
        }

        FieldOutcome {
            is_dirty,
            invoke_callbacks,
        }
    }

    fn stamp_update(&self, row: &mut Row) {
        if let Some(batch) = self.batch {
            row.set_raw(batch.field, Value::from(batch.id));
        }
        if let Some(timestamps) = self.timestamps {
            row.set_raw(&timestamps.updated_at, Value::Timestamp(self.now));
        }
    }

    fn stamp_insert(&self, row: &mut Row) {
        if let Some(batch) = self.batch {
            row.set_raw(batch.field, Value::from(batch.id));
        }
        if let Some(timestamps) = self.timestamps {
            row.set_raw(&timestamps.updated_at, Value::Timestamp(self.now));
            row.set_raw(&timestamps.created_at, Value::Timestamp(self.now));
        }
    }

    fn primary_key(&self, row: &Row) -> ImportResult<Value> {
        let key = row.attributes().value(self.key_name);
        if key.is_null() {
            return Err(ImportError::precondition(format!(
                "existing row lacks a value for primary key {}",
                self.key_name
            )));
        }
        Ok(key)
    }

    /// Classify `chunk` against `existing`, in arrival order.
    pub(crate) fn classify(
        &self,
        chunk: Vec<Row>,
        mut existing: HashMap<String, Row>,
    ) -> ImportResult<ChunkPlan> {
        let mut plan = ChunkPlan::default();
        let mut dirty_keys: Vec<String> = Vec::new();
        let mut callback_keys: Vec<String> = Vec::new();
        let mut touch_keys: Vec<String> = Vec::new();

        for mut row in chunk {
            let matched = row_key(self.access, self.match_by, &row)
                .filter(|key| existing.contains_key(key));

            let Some(key) = matched else {
                self.stamp_insert(&mut row);
                plan.to_insert.push(row.into_attributes());
                continue;
            };

            let Some(target) = existing.get_mut(&key) else {
                continue;
            };
            let outcome = self.apply_update_fields(&row, target);

            if outcome.is_dirty {
                self.stamp_update(target);
                if !dirty_keys.contains(&key) {
                    dirty_keys.push(key.clone());
                }
                if outcome.invoke_callbacks && !callback_keys.contains(&key) {
                    callback_keys.push(key);
                }
            } else if self.batch.is_some() {
                if !touch_keys.contains(&key) {
                    touch_keys.push(key);
                }
            } else {
                plan.unchanged += 1;
            }
        }

        for key in &dirty_keys {
            if let Some(row) = existing.get(key) {
                self.primary_key(row)?;
                plan.to_update.push(row.attributes().clone());
            }
        }
        for key in &callback_keys {
            if let Some(row) = existing.get(key) {
                plan.updated_for_callbacks.push(row.attributes().clone());
            }
        }
        for key in touch_keys.iter().filter(|k| !dirty_keys.contains(*k)) {
            if let Some(row) = existing.get(key) {
                plan.batch_id_touch.push(self.primary_key(row)?);
            }
        }

        log::debug!(
            "classified chunk: {} inserts, {} updates, {} batch id touches, {} unchanged",
            plan.to_insert.len(),
            plan.to_update.len(),
            plan.batch_id_touch.len(),
            plan.unchanged
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::fields::comparator;
    use crate::model::TableModel;
    use crate::record;
    use chrono::TimeZone;

    struct Fixture {
        model: TableModel,
        match_by: Vec<MatchField>,
        update_fields: Vec<UpdateField>,
        callback_when: HashSet<String>,
        comparators: HashMap<String, RawComparator>,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new(update_fields: &[&str]) -> Self {
            Self {
                model: TableModel::new("t"),
                match_by: vec![MatchField::column("a")],
                update_fields: update_fields.iter().map(|f| UpdateField::copy(*f)).collect(),
                callback_when: HashSet::new(),
                comparators: HashMap::new(),
                now: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            }
        }

        fn context(&self, bypass: bool, batch: Option<BatchStamp<'static>>) -> MergeContext<'_> {
            MergeContext {
                access: RowAccess::new(&self.model, bypass),
                match_by: &self.match_by,
                update_fields: &self.update_fields,
                callback_when: &self.callback_when,
                comparators: &self.comparators,
                key_name: "id",
                batch,
                timestamps: self.model_timestamps(),
                now: self.now,
            }
        }

        fn model_timestamps(&self) -> Option<&TimestampColumns> {
            crate::model::Model::timestamps(&self.model)
        }
    }

    fn existing(ctx: &MergeContext<'_>, rows: Vec<Record>) -> HashMap<String, Row> {
        rows.into_iter()
            .map(|r| {
                let row = ctx.access.loaded(r);
                (row_key(ctx.access, ctx.match_by, &row).unwrap(), row)
            })
            .collect()
    }

    fn incoming(ctx: &MergeContext<'_>, rows: Vec<Record>) -> Vec<Row> {
        rows.into_iter()
            .map(|r| ctx.access.incoming(&r.into()).unwrap())
            .collect()
    }

    const BATCH: BatchStamp<'static> = BatchStamp {
        id: "19",
        field: "last_batch_id",
    };

    #[test]
    fn test_classifies_insert_update_and_touch() {
        let fixture = Fixture::new(&["b"]);
        let ctx = fixture.context(true, Some(BATCH));
        let found = existing(
            &ctx,
            vec![
                record! { "id" => 1, "a" => "x", "b" => "old" },
                record! { "id" => 2, "a" => "y", "b" => "same" },
            ],
        );
        let chunk = incoming(
            &ctx,
            vec![
                record! { "a" => "x", "b" => "new" },
                record! { "a" => "y", "b" => "same" },
                record! { "a" => "z", "b" => "fresh" },
            ],
        );

        let plan = ctx.classify(chunk, found).unwrap();

        assert_eq!(plan.to_update.len(), 1);
        let updated = &plan.to_update[0];
        assert_eq!(updated.get("b"), &Value::from("new"));
        assert_eq!(updated.get("last_batch_id"), &Value::from("19"));
        assert_eq!(updated.get("updated_at"), &Value::Timestamp(fixture.now));
        assert!(!updated.contains("created_at"));

        assert_eq!(plan.batch_id_touch, vec![Value::Int(2)]);

        assert_eq!(plan.to_insert.len(), 1);
        let inserted = &plan.to_insert[0];
        assert_eq!(inserted.get("created_at"), &Value::Timestamp(fixture.now));
        assert_eq!(inserted.get("last_batch_id"), &Value::from("19"));

        assert_eq!(plan.updated_for_callbacks, plan.to_update);
    }

    #[test]
    fn test_unchanged_without_batching_is_dropped() {
        let fixture = Fixture::new(&["b"]);
        let ctx = fixture.context(true, None);
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => "v" }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "b" => "v" }]), found)
            .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_null_match_value_always_inserts() {
        let fixture = Fixture::new(&["b"]);
        let ctx = fixture.context(true, None);
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x" }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => Value::Null, "b" => "v" }]), found)
            .unwrap();
        assert_eq!(plan.to_insert.len(), 1);
        assert!(plan.to_update.is_empty());
    }

    #[test]
    fn test_callback_trigger_fields() {
        let mut fixture = Fixture::new(&["a", "b"]);
        fixture.callback_when.insert("a".to_string());
        let ctx = fixture.context(true, None);
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => "old" }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "b" => "new" }]), found)
            .unwrap();
        assert_eq!(plan.to_update.len(), 1);
        assert!(plan.updated_for_callbacks.is_empty());
    }

    #[test]
    fn test_trigger_field_checked_after_row_is_dirty() {
        let mut fixture = Fixture::new(&["b", "c"]);
        fixture.match_by = vec![MatchField::column("a")];
        fixture.callback_when.insert("c".to_string());
        let ctx = fixture.context(true, None);
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => 1, "c" => 1 }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "b" => 2, "c" => 2 }]), found)
            .unwrap();
        assert_eq!(plan.updated_for_callbacks.len(), 1);
    }

    #[test]
    fn test_every_field_is_written_even_when_clean() {
        let fixture = Fixture::new(&["b", "c"]);
        let ctx = fixture.context(true, None);
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => 1, "c" => "09" }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "b" => 2, "c" => 9 }]), found)
            .unwrap();
        assert_eq!(plan.to_update[0].get("c"), &Value::Int(9));
    }

    #[test]
    fn test_static_and_transformed_update_values() {
        let mut fixture = Fixture::new(&[]);
        fixture.update_fields = vec![
            UpdateField::constant("b", "fixed"),
            UpdateField::transformed("c", |new, existing, incoming, field| {
                Value::Text(format!(
                    "{}:{}:{}:{}",
                    new,
                    existing.get("c"),
                    incoming.get("a"),
                    field
                ))
            }),
        ];
        let ctx = fixture.context(true, None);
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => "b0", "c" => "c0" }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "c" => "c1" }]), found)
            .unwrap();
        let updated = &plan.to_update[0];
        assert_eq!(updated.get("b"), &Value::from("fixed"));
        assert_eq!(updated.get("c"), &Value::from("c1:c0:x:c"));
    }

    #[test]
    fn test_raw_comparator_suppresses_update() {
        let mut fixture = Fixture::new(&["b"]);
        fixture.comparators.insert(
            "b".to_string(),
            comparator(|new, old, _| new.to_key_string().to_lowercase() != old.to_key_string().to_lowercase()),
        );
        let ctx = fixture.context(true, None);
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => "ABC" }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "b" => "abc" }]), found)
            .unwrap();
        assert!(plan.to_update.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_duplicates_merge_into_one_update() {
        let fixture = Fixture::new(&["b"]);
        let ctx = fixture.context(true, Some(BATCH));
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => "old" }]);
        let plan = ctx
            .classify(
                incoming(
                    &ctx,
                    vec![
                        record! { "a" => "x", "b" => "first" },
                        record! { "a" => "x", "b" => "second" },
                        record! { "a" => "x", "b" => "second" },
                    ],
                ),
                found,
            )
            .unwrap();
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].get("b"), &Value::from("second"));
        assert!(plan.batch_id_touch.is_empty());
        assert_eq!(plan.updated_for_callbacks.len(), 1);
    }

    #[test]
    fn test_existing_row_without_primary_key_is_rejected() {
        let fixture = Fixture::new(&["b"]);
        let ctx = fixture.context(true, Some(BATCH));
        let found = existing(&ctx, vec![record! { "a" => "x", "b" => "same" }]);
        let err = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "b" => "same" }]), found)
            .unwrap_err();
        assert!(matches!(err, ImportError::Precondition(_)));
    }

    #[test]
    fn test_tracked_mode_compares_against_loaded_snapshot() {
        let mut fixture = Fixture::new(&["b"]);
        fixture.model = TableModel::new("t").mutator("b", |v| match v {
            Value::Text(s) => Value::Text(s.trim().to_string()),
            other => other,
        });
        let ctx = fixture.context(false, Some(BATCH));
        let found = existing(&ctx, vec![record! { "id" => 1, "a" => "x", "b" => "v" }]);
        let plan = ctx
            .classify(incoming(&ctx, vec![record! { "a" => "x", "b" => "  v  " }]), found)
            .unwrap();
        assert!(plan.to_update.is_empty());
        assert_eq!(plan.batch_id_touch, vec![Value::Int(1)]);
    }
}
