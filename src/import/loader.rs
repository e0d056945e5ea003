//! Existing-row loader.
//!
//! Builds one locked query per chunk covering every column match field, then
//! indexes the returned rows by comparison key. Transformed match fields
//! cannot be evaluated by the database; they only take part in the keys.

use crate::error::ImportResult;
use crate::import::comparison_key::comparison_key_with;
use crate::import::fields::MatchField;
use crate::import::row::{Row, RowAccess};
use crate::query::{Predicate, where_in_values};
use crate::store::Connection;
use crate::value::Value;
use std::collections::{HashMap, HashSet};

/// Comparison key of a row as seen through `access`.
pub(crate) fn row_key(access: RowAccess<'_>, match_by: &[MatchField], row: &Row) -> Option<String> {
    comparison_key_with(match_by, row.attributes(), |field| access.read(row, field))
}

/// Condition selecting every existing row a chunk could match.
///
/// Per column field: its distinct non-null chunk values (`=` for one, `IN`
/// for several), OR'ed with `IS NULL` when some record lacks a value. The
/// per-field conditions are AND'ed.
pub(crate) fn chunk_predicate(access: RowAccess<'_>, match_by: &[MatchField], chunk: &[Row]) -> Predicate {
    let mut predicate = Predicate::True;

    for field in match_by.iter().filter(|f| f.is_column()) {
        let name = field.name();
        let mut seen = HashSet::new();
        let mut values: Vec<Value> = Vec::new();
        let mut has_null = false;

        for row in chunk {
            let value = access.read(row, name);
            if value.is_null() {
                has_null = true;
            } else if seen.insert(value.to_key_string()) {
                values.push(value);
            }
        }

        if let Some(condition) = where_in_values(name, values, has_null) {
            predicate = predicate.and(condition);
        }
    }

    predicate
}

/// Distinct comparison keys of the chunk, in first-seen order.
pub(crate) fn chunk_keys(access: RowAccess<'_>, match_by: &[MatchField], chunk: &[Row]) -> Vec<String> {
    let mut seen = HashSet::new();
    chunk
        .iter()
        .filter_map(|row| row_key(access, match_by, row))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// Lock and load the existing rows for `chunk`, keyed by comparison key.
///
/// The chunk's keys are locked first, so a concurrent import of the same
/// new key waits here instead of inserting a duplicate. Rows without a
/// comparison key can never be matched and are skipped.
pub(crate) fn load_existing(
    conn: &mut dyn Connection,
    table: &str,
    access: RowAccess<'_>,
    match_by: &[MatchField],
    chunk: &[Row],
) -> ImportResult<HashMap<String, Row>> {
    let keys = chunk_keys(access, match_by, chunk);
    if !keys.is_empty() {
        conn.lock_keys(table, &keys)?;
    }

    let predicate = chunk_predicate(access, match_by, chunk);
    let rows = conn.select_for_update(table, &predicate)?;
    let fetched = rows.len();

    let mut existing = HashMap::with_capacity(fetched);
    for record in rows {
        let row = access.loaded(record);
        if let Some(key) = row_key(access, match_by, &row) {
            existing.insert(key, row);
        }
    }

    log::trace!(
        "loaded {} existing rows from {} ({} addressable)",
        fetched,
        table,
        existing.len()
    );
    Ok(existing)
}
