//! Persistence and transaction contracts.
//!
//! A [`Store`] runs units of work atomically against one table; inside a unit
//! of work the import talks to a [`Connection`]. Two implementations ship with
//! the crate: [`MemoryStore`] for in-process use and tests, and [`PgStore`]
//! for PostgreSQL.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, Statement, StatementKind};
pub use postgres::{PgConfig, PgStore};

use crate::error::{ImportError, ImportResult};
use crate::query::Predicate;
use crate::record::Record;
use crate::value::Value;

/// Statements available inside a transaction.
pub trait Connection {
    /// Serialize writers of the given comparison keys until the transaction
    /// ends, including keys with no row yet.
    fn lock_keys(&mut self, table: &str, keys: &[String]) -> ImportResult<()>;

    /// Rows matching `predicate`, write-locked until the transaction ends.
    fn select_for_update(&mut self, table: &str, predicate: &Predicate) -> ImportResult<Vec<Record>>;

    /// Update rows identified by `key_field`, writing only `fields`.
    ///
    /// # Returns
    /// Number of rows updated
    fn bulk_update(
        &mut self,
        table: &str,
        rows: &[Record],
        key_field: &str,
        fields: &[String],
    ) -> ImportResult<u64>;

    /// Insert rows. Rows may carry different field sets; absent fields take
    /// the column default.
    fn bulk_insert(&mut self, table: &str, rows: &[Record]) -> ImportResult<u64>;

    /// `UPDATE table SET field = value WHERE key_field IN (keys)`
    fn update_where_key_in(
        &mut self,
        table: &str,
        key_field: &str,
        keys: &[Value],
        field: &str,
        value: &Value,
    ) -> ImportResult<u64>;
}

/// Transaction runner.
pub trait Store: Send + Sync {
    /// Run `work` atomically. Commits when it returns `Ok`; otherwise rolls
    /// back and returns its error.
    fn run_in_transaction(
        &self,
        table: &str,
        work: &mut dyn FnMut(&mut dyn Connection) -> ImportResult<()>,
    ) -> ImportResult<()>;

    /// Plain unlocked read.
    fn select(&self, table: &str, predicate: &Predicate) -> ImportResult<Vec<Record>>;
}

/// Run `work` in a transaction and hand back its result.
pub fn transaction<T, F>(store: &dyn Store, table: &str, work: F) -> ImportResult<T>
where
    F: FnOnce(&mut dyn Connection) -> ImportResult<T>,
{
    let mut work = Some(work);
    let mut output = None;

    store.run_in_transaction(table, &mut |conn| {
        let work = work
            .take()
            .ok_or_else(|| ImportError::store("transaction body invoked more than once"))?;
        output = Some(work(conn)?);
        Ok(())
    })?;

    output.ok_or_else(|| ImportError::store("transaction body was not invoked"))
}
