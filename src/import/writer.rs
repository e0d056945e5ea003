//! Write applier: pushes a classified chunk through the persistence contract.

use crate::error::ImportResult;
use crate::import::merge::{BatchStamp, ChunkPlan};
use crate::store::Connection;
use crate::value::Value;

/// Target table layout for the writes of one import.
pub(crate) struct WriteTarget<'a> {
    pub(crate) table: &'a str,
    pub(crate) key_name: &'a str,
    /// Columns written by updates: update fields, batch column, `updated_at`.
    pub(crate) update_columns: &'a [String],
    pub(crate) batch: Option<BatchStamp<'a>>,
    /// Upper bound on keys per batch-id-only statement.
    pub(crate) touch_chunk_size: usize,
}

/// Rows written per category.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteCounts {
    pub(crate) updated: u64,
    pub(crate) touched: u64,
    pub(crate) inserted: u64,
}

/// Columns of the bulk update, in order, without duplicates.
pub(crate) fn update_columns(
    update_field_names: &[String],
    batch_field: Option<&str>,
    updated_at: Option<&str>,
) -> Vec<String> {
    let mut columns: Vec<String> = Vec::with_capacity(update_field_names.len() + 2);
    let extra = batch_field.into_iter().chain(updated_at);
    for name in update_field_names.iter().map(String::as_str).chain(extra) {
        if !columns.iter().any(|c| c == name) {
            columns.push(name.to_string());
        }
    }
    columns
}

/// Apply updates, then batch-id-only updates, then inserts.
pub(crate) fn apply(
    conn: &mut dyn Connection,
    target: &WriteTarget<'_>,
    plan: &ChunkPlan,
) -> ImportResult<WriteCounts> {
    let mut counts = WriteCounts::default();
    if plan.is_empty() {
        return Ok(counts);
    }

    if !plan.to_update.is_empty() {
        counts.updated = conn.bulk_update(
            target.table,
            &plan.to_update,
            target.key_name,
            target.update_columns,
        )?;
    }

    if let Some(batch) = target.batch {
        let batch_id = Value::from(batch.id);
        for keys in plan.batch_id_touch.chunks(target.touch_chunk_size.max(1)) {
            counts.touched += conn.update_where_key_in(
                target.table,
                target.key_name,
                keys,
                batch.field,
                &batch_id,
            )?;
        }
    }

    if !plan.to_insert.is_empty() {
        counts.inserted = conn.bulk_insert(target.table, &plan.to_insert)?;
    }

    log::trace!(
        "wrote chunk to {}: {} updated, {} touched, {} inserted",
        target.table,
        counts.updated,
        counts.touched,
        counts.inserted
    );
    Ok(counts)
}
