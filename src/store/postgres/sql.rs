//! Statement builders for the PostgreSQL store.
//!
//! Every bound value is wrapped in `CAST($n AS <column type>)` using the
//! target table's declared column types, so dynamically typed values bind
//! regardless of their Rust representation.

use crate::error::{ImportError, ImportResult};
use crate::query::Predicate;
use crate::record::Record;
use crate::value::Value;
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeMap;

/// Upper bound on bind parameters in one PostgreSQL statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Takes one transaction-scoped advisory lock per distinct key hash, in hash
/// order, so imports locking overlapping key sets queue instead of deadlocking.
pub const LOCK_KEYS: &str = "SELECT pg_advisory_xact_lock(hash) FROM \
     (SELECT DISTINCT hashtextextended(name, 0) AS hash FROM unnest($1::text[]) AS name \
     ORDER BY hash) AS locks";

/// Column name to `format_type()` output.
pub type ColumnTypes = BTreeMap<String, String>;

/// Types the row decoder reads directly; every other column is selected as text.
const DECODED_TYPES: &[&str] = &[
    "boolean",
    "smallint",
    "integer",
    "bigint",
    "real",
    "double precision",
    "text",
    "character varying",
    "character",
    "name",
    "timestamp with time zone",
    "timestamp without time zone",
    "date",
    "uuid",
];

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rows that fit in one statement when each row binds `params_per_row`.
pub fn rows_per_statement(params_per_row: usize) -> usize {
    (MAX_BIND_PARAMS / params_per_row.max(1)).max(1)
}

/// Union of the rows' field names, in first-seen order.
pub fn insert_columns(rows: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for field in row.field_names() {
            if !columns.iter().any(|c| c == field) {
                columns.push(field.to_string());
            }
        }
    }
    columns
}

/// Advisory lock names for comparison keys of `table`, sorted and deduplicated.
pub fn lock_names(table: &str, keys: &[String]) -> Vec<String> {
    let mut names: Vec<String> = keys.iter().map(|key| format!("{table}|{key}")).collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// `format_type()` output without its modifier, e.g. `timestamp(0) without
/// time zone` becomes `timestamp without time zone`.
fn base_type(ty: &str) -> String {
    let mut depth = 0usize;
    let mut base = String::with_capacity(ty.len());
    for c in ty.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => base.push(c),
            _ => {}
        }
    }
    base.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_decoded(ty: &str) -> bool {
    DECODED_TYPES.contains(&base_type(ty).as_str())
}

/// Explicit column list for `types`; columns of other types are cast to text.
fn select_list(types: &ColumnTypes) -> String {
    types
        .iter()
        .map(|(column, ty)| {
            let column = quote_ident(column);
            if is_decoded(ty) {
                column
            } else {
                format!("{column}::text AS {column}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_type<'a>(types: &'a ColumnTypes, column: &str) -> ImportResult<&'a str> {
    types
        .get(column)
        .map(String::as_str)
        .ok_or_else(|| ImportError::store(format!("unknown column {column}")))
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: &Value) {
    match value {
        Value::Null => builder.push_bind(None::<String>),
        Value::Bool(b) => builder.push_bind(*b),
        Value::Int(i) => builder.push_bind(*i),
        Value::Float(f) => builder.push_bind(*f),
        Value::Text(s) => builder.push_bind(s.clone()),
        Value::Timestamp(t) => builder.push_bind(*t),
    };
}

fn push_typed(
    builder: &mut QueryBuilder<'static, Postgres>,
    value: &Value,
    column: &str,
    types: &ColumnTypes,
) -> ImportResult<()> {
    let ty = column_type(types, column)?;
    builder.push("CAST(");
    push_value(builder, value);
    builder.push(" AS ");
    builder.push(ty);
    builder.push(")");
    Ok(())
}

fn push_joined(
    builder: &mut QueryBuilder<'static, Postgres>,
    parts: &[Predicate],
    separator: &str,
    types: &ColumnTypes,
) -> ImportResult<()> {
    builder.push("(");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            builder.push(separator);
        }
        push_predicate(builder, part, types)?;
    }
    builder.push(")");
    Ok(())
}

pub fn push_predicate(
    builder: &mut QueryBuilder<'static, Postgres>,
    predicate: &Predicate,
    types: &ColumnTypes,
) -> ImportResult<()> {
    match predicate {
        Predicate::True => {
            builder.push("TRUE");
        }
        Predicate::And(parts) if parts.is_empty() => {
            builder.push("TRUE");
        }
        Predicate::Or(parts) if parts.is_empty() => {
            builder.push("FALSE");
        }
        Predicate::And(parts) => push_joined(builder, parts, " AND ", types)?,
        Predicate::Or(parts) => push_joined(builder, parts, " OR ", types)?,
        Predicate::Eq { field, value } => {
            builder.push(quote_ident(field));
            builder.push(" = ");
            push_typed(builder, value, field, types)?;
        }
        Predicate::In { values, .. } if values.is_empty() => {
            builder.push("FALSE");
        }
        Predicate::In { field, values } => {
            builder.push(quote_ident(field));
            builder.push(" IN (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_typed(builder, value, field, types)?;
            }
            builder.push(")");
        }
        Predicate::IsNull(field) => {
            builder.push(quote_ident(field));
            builder.push(" IS NULL");
        }
        Predicate::Lt { field, value } => {
            builder.push(quote_ident(field));
            builder.push(" < ");
            push_typed(builder, value, field, types)?;
        }
    }
    Ok(())
}

/// `SELECT columns FROM table WHERE …`, with `FOR UPDATE` when `lock` is set.
pub fn select(
    table: &str,
    predicate: &Predicate,
    types: &ColumnTypes,
    lock: bool,
) -> ImportResult<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM {} WHERE ",
        select_list(types),
        quote_ident(table)
    ));
    push_predicate(&mut builder, predicate, types)?;
    if lock {
        builder.push(" FOR UPDATE");
    }
    Ok(builder)
}

/// `UPDATE … FROM (VALUES …) AS batch(…) WHERE target.key = batch.key`
pub fn bulk_update(
    table: &str,
    rows: &[Record],
    key_field: &str,
    fields: &[String],
    types: &ColumnTypes,
) -> ImportResult<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new(format!("UPDATE {} AS target SET ", quote_ident(table)));
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        let column = quote_ident(field);
        builder.push(format!("{column} = batch.{column}"));
    }

    builder.push(" FROM (VALUES ");
    for (r, row) in rows.iter().enumerate() {
        if r > 0 {
            builder.push(", ");
        }
        builder.push("(");
        push_typed(&mut builder, row.get(key_field), key_field, types)?;
        for field in fields {
            builder.push(", ");
            push_typed(&mut builder, row.get(field), field, types)?;
        }
        builder.push(")");
    }

    let mut aliases = vec![quote_ident(key_field)];
    aliases.extend(fields.iter().map(|f| quote_ident(f)));
    let key = quote_ident(key_field);
    builder.push(format!(
        ") AS batch({}) WHERE target.{key} = batch.{key}",
        aliases.join(", ")
    ));
    Ok(builder)
}

/// Multi-row `INSERT`; fields a row lacks are written as `DEFAULT`.
pub fn bulk_insert(
    table: &str,
    columns: &[String],
    rows: &[Record],
    types: &ColumnTypes,
) -> ImportResult<QueryBuilder<'static, Postgres>> {
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_ident(table),
        column_list.join(", ")
    ));

    for (r, row) in rows.iter().enumerate() {
        if r > 0 {
            builder.push(", ");
        }
        builder.push("(");
        for (c, column) in columns.iter().enumerate() {
            if c > 0 {
                builder.push(", ");
            }
            if row.contains(column) {
                push_typed(&mut builder, row.get(column), column, types)?;
            } else {
                builder.push("DEFAULT");
            }
        }
        builder.push(")");
    }
    Ok(builder)
}

/// `UPDATE table SET field = value WHERE key IN (…)`
pub fn update_where_key_in(
    table: &str,
    key_field: &str,
    keys: &[Value],
    field: &str,
    value: &Value,
    types: &ColumnTypes,
) -> ImportResult<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new(format!(
        "UPDATE {} SET {} = ",
        quote_ident(table),
        quote_ident(field)
    ));
    push_typed(&mut builder, value, field, types)?;
    builder.push(" WHERE ");
    push_predicate(&mut builder, &Predicate::is_in(key_field, keys.to_vec()), types)?;
    Ok(builder)
}
