//! PostgreSQL store on sqlx.
//!
//! The import engine is blocking; the store owns a Tokio runtime and drives
//! every query with `block_on`. Do not call it from inside an async context.

mod config;
pub mod sql;

pub use config::PgConfig;

use crate::error::{ImportError, ImportResult};
use crate::query::Predicate;
use crate::record::Record;
use crate::store::{Connection, Store};
use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use sql::ColumnTypes;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Postgres, Row, Transaction, TypeInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// [`Store`] backed by a PostgreSQL connection pool.
pub struct PgStore {
    runtime: Runtime,
    pool: PgPool,
    config: PgConfig,
    column_types: Mutex<HashMap<String, Arc<ColumnTypes>>>,
}

impl PgStore {
    pub fn connect(config: PgConfig) -> ImportResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| ImportError::store(format!("failed to start runtime: {e}")))?;

        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.database_url),
        )?;

        log::info!(
            "connected batch import store (max_connections={})",
            config.max_connections
        );

        Ok(Self {
            runtime,
            pool,
            config,
            column_types: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_env() -> ImportResult<Self> {
        Self::connect(PgConfig::from_env()?)
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a statement without parameters, outside any import.
    pub fn execute(&self, statement: &str) -> ImportResult<u64> {
        let result = self
            .runtime
            .block_on(sqlx::query(statement).execute(&self.pool))?;
        Ok(result.rows_affected())
    }

    /// Forget cached column types, e.g. after altering a table.
    pub fn clear_column_cache(&self) {
        self.column_types.lock().clear();
    }

    /// Declared column types of `table`, loaded through `executor` on first use.
    ///
    /// Inside a transaction the executor must be the transaction's own
    /// connection; a pool of one connection is already exhausted there.
    fn column_types<'c, E>(&self, table: &str, executor: E) -> ImportResult<Arc<ColumnTypes>>
    where
        E: Executor<'c, Database = Postgres>,
    {
        if let Some(types) = self.column_types.lock().get(table) {
            return Ok(types.clone());
        }

        let rows: Vec<(String, String)> = self.runtime.block_on(
            sqlx::query_as(
                r#"SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
                   FROM pg_attribute a
                   WHERE a.attrelid = to_regclass($1)
                     AND a.attnum > 0
                     AND NOT a.attisdropped"#,
            )
            .bind(sql::quote_ident(table))
            .fetch_all(executor),
        )?;

        if rows.is_empty() {
            return Err(ImportError::store(format!("unknown table {table}")));
        }

        let types = Arc::new(rows.into_iter().collect::<ColumnTypes>());
        log::trace!("loaded {} column types for {}", types.len(), table);
        self.column_types
            .lock()
            .insert(table.to_string(), types.clone());
        Ok(types)
    }
}

fn decode_row(row: &PgRow) -> ImportResult<Record> {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value: Value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(i)?.into(),
            "INT2" => row.try_get::<Option<i16>, _>(i)?.map(i64::from).into(),
            "INT4" => row.try_get::<Option<i32>, _>(i)?.into(),
            "INT8" => row.try_get::<Option<i64>, _>(i)?.into(),
            "FLOAT4" => row.try_get::<Option<f32>, _>(i)?.map(f64::from).into(),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.into(),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row.try_get::<Option<String>, _>(i)?.into(),
            "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(i)?.into(),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(i)?
                .map(|t| t.and_utc())
                .into(),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(i)?
                .map(|d| d.to_string())
                .into(),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(i)?
                .map(|u| u.to_string())
                .into(),
            other => {
                return Err(ImportError::Unsupported(format!(
                    "column {} has type {}",
                    column.name(),
                    other
                )));
            }
        };
        record.set(column.name(), value);
    }
    Ok(record)
}

/// Statements executed inside one `PgStore` transaction.
struct PgConnection<'a> {
    store: &'a PgStore,
    tx: &'a mut Transaction<'static, Postgres>,
}

impl PgConnection<'_> {
    fn column_types(&mut self, table: &str) -> ImportResult<Arc<ColumnTypes>> {
        self.store.column_types(table, &mut **self.tx)
    }

    fn fetch(&mut self, table: &str, predicate: &Predicate, lock: bool) -> ImportResult<Vec<Record>> {
        let types = self.column_types(table)?;
        let mut builder = sql::select(table, predicate, &types, lock)?;
        let rows = self
            .store
            .runtime
            .block_on(builder.build().fetch_all(&mut **self.tx))?;
        rows.iter().map(decode_row).collect()
    }
}

impl Connection for PgConnection<'_> {
    fn lock_keys(&mut self, table: &str, keys: &[String]) -> ImportResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let names = sql::lock_names(table, keys);
        let count = names.len();
        self.store.runtime.block_on(
            sqlx::query(sql::LOCK_KEYS)
                .bind(names)
                .execute(&mut **self.tx),
        )?;
        log::trace!("took {} key locks on {}", count, table);
        Ok(())
    }

    fn select_for_update(&mut self, table: &str, predicate: &Predicate) -> ImportResult<Vec<Record>> {
        let rows = self.fetch(table, predicate, true)?;
        log::trace!("selected {} rows for update from {}", rows.len(), table);
        Ok(rows)
    }

    fn bulk_update(
        &mut self,
        table: &str,
        rows: &[Record],
        key_field: &str,
        fields: &[String],
    ) -> ImportResult<u64> {
        if rows.is_empty() || fields.is_empty() {
            return Ok(0);
        }
        let types = self.column_types(table)?;
        let mut updated = 0;

        for chunk in rows.chunks(sql::rows_per_statement(fields.len() + 1)) {
            let mut builder = sql::bulk_update(table, chunk, key_field, fields, &types)?;
            let result = self
                .store
                .runtime
                .block_on(builder.build().execute(&mut **self.tx))?;
            updated += result.rows_affected();
        }

        log::trace!("bulk updated {} rows in {}", updated, table);
        Ok(updated)
    }

    fn bulk_insert(&mut self, table: &str, rows: &[Record]) -> ImportResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let types = self.column_types(table)?;
        let columns = sql::insert_columns(rows);
        if columns.is_empty() {
            return Err(ImportError::store(format!(
                "cannot insert rows without fields into {table}"
            )));
        }
        let mut inserted = 0;

        for chunk in rows.chunks(sql::rows_per_statement(columns.len())) {
            let mut builder = sql::bulk_insert(table, &columns, chunk, &types)?;
            let result = self
                .store
                .runtime
                .block_on(builder.build().execute(&mut **self.tx))?;
            inserted += result.rows_affected();
        }

        log::trace!("bulk inserted {} rows into {}", inserted, table);
        Ok(inserted)
    }

    fn update_where_key_in(
        &mut self,
        table: &str,
        key_field: &str,
        keys: &[Value],
        field: &str,
        value: &Value,
    ) -> ImportResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let types = self.column_types(table)?;
        let mut updated = 0;

        for chunk in keys.chunks(sql::MAX_BIND_PARAMS - 1) {
            let mut builder = sql::update_where_key_in(table, key_field, chunk, field, value, &types)?;
            let result = self
                .store
                .runtime
                .block_on(builder.build().execute(&mut **self.tx))?;
            updated += result.rows_affected();
        }

        log::trace!("set {} on {} rows in {}", field, updated, table);
        Ok(updated)
    }
}

impl Store for PgStore {
    fn run_in_transaction(
        &self,
        table: &str,
        work: &mut dyn FnMut(&mut dyn Connection) -> ImportResult<()>,
    ) -> ImportResult<()> {
        let mut tx = self.runtime.block_on(self.pool.begin())?;

        if let Some(timeout) = self.config.lock_timeout {
            let statement = format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis());
            self.runtime
                .block_on(sqlx::query(&statement).execute(&mut *tx))?;
        }

        let result = work(&mut PgConnection {
            store: self,
            tx: &mut tx,
        });

        match result {
            Ok(()) => {
                self.runtime.block_on(tx.commit())?;
                Ok(())
            }
            Err(err) => {
                log::debug!("rolling back transaction on {}: {}", table, err);
                if let Err(rollback_err) = self.runtime.block_on(tx.rollback()) {
                    log::warn!("rollback on {} failed: {}", table, rollback_err);
                }
                Err(err)
            }
        }
    }

    fn select(&self, table: &str, predicate: &Predicate) -> ImportResult<Vec<Record>> {
        let types = self.column_types(table, &self.pool)?;
        let mut builder = sql::select(table, predicate, &types, false)?;
        let rows = self
            .runtime
            .block_on(builder.build().fetch_all(&self.pool))?;
        rows.iter().map(decode_row).collect()
    }
}
