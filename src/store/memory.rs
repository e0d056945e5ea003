//! In-process transactional table store.
//!
//! Tables are keyed row lists guarded by one mutex. A transaction holds the
//! lock from start to commit, so concurrent transactions serialize the way
//! row locks serialize overlapping imports in a database. Rollback restores
//! a snapshot taken when the transaction began.

use crate::error::{ImportError, ImportResult};
use crate::query::Predicate;
use crate::record::Record;
use crate::store::{Connection, Store};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Kind of statement executed against a [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    LockKeys,
    SelectForUpdate,
    BulkUpdate,
    BulkInsert,
    UpdateWhereKeyIn,
}

/// Log entry for one executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub table: String,
    /// Rows passed in (writes), returned (selects) or keys locked.
    pub rows: usize,
    /// Columns written; empty for selects and inserts.
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    key: String,
    rows: Vec<Record>,
    next_id: i64,
}

impl MemoryTable {
    fn position(&self, key: &Value) -> Option<usize> {
        self.rows.iter().position(|row| row.get(&self.key).sql_eq(key))
    }

    fn insert(&mut self, mut row: Record) -> ImportResult<()> {
        let key = row.value(&self.key);
        if key.is_null() {
            row.set(self.key.clone(), self.next_id);
            self.next_id += 1;
        } else {
            if self.position(&key).is_some() {
                return Err(ImportError::store(format!(
                    "duplicate key value {key} violates primary key {}",
                    self.key
                )));
            }
            if let Some(id) = key.as_i64() {
                self.next_id = self.next_id.max(id + 1);
            }
        }
        self.rows.push(row);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    statements: Vec<Statement>,
    fail_next: Option<StatementKind>,
}

impl MemoryState {
    fn table_mut(&mut self, table: &str) -> ImportResult<&mut MemoryTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| ImportError::store(format!("unknown table {table}")))
    }

    fn table(&self, table: &str) -> ImportResult<&MemoryTable> {
        self.tables
            .get(table)
            .ok_or_else(|| ImportError::store(format!("unknown table {table}")))
    }

    fn record(&mut self, kind: StatementKind, table: &str, rows: usize, fields: &[String]) -> ImportResult<()> {
        if self.fail_next == Some(kind) {
            self.fail_next = None;
            return Err(ImportError::store(format!("injected failure for {kind:?} on {table}")));
        }
        log::trace!("memory store: {:?} on {} ({} rows)", kind, table, rows);
        self.statements.push(Statement {
            kind,
            table: table.to_string(),
            rows,
            fields: fields.to_vec(),
        });
        Ok(())
    }
}

/// Transactional in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) a table with the given primary key column.
    pub fn create_table(&self, table: &str, key: &str) {
        self.state.lock().tables.insert(
            table.to_string(),
            MemoryTable {
                key: key.to_string(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
    }

    /// Insert rows outside any transaction, without logging statements.
    pub fn seed<I>(&self, table: &str, rows: I) -> ImportResult<()>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut state = self.state.lock();
        let table = state.table_mut(table)?;
        for row in rows {
            table.insert(row)?;
        }
        Ok(())
    }

    /// All rows in insertion order.
    pub fn rows(&self, table: &str) -> ImportResult<Vec<Record>> {
        Ok(self.state.lock().table(table)?.rows.clone())
    }

    pub fn find(&self, table: &str, key: impl Into<Value>) -> Option<Record> {
        let key = key.into();
        let state = self.state.lock();
        let table = state.tables.get(table)?;
        table.position(&key).map(|i| table.rows[i].clone())
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.state.lock().statements.clone()
    }

    /// Logged statements of one kind.
    pub fn statements_of(&self, kind: StatementKind) -> Vec<Statement> {
        self.state
            .lock()
            .statements
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_statements(&self) {
        self.state.lock().statements.clear();
    }

    /// Make the next statement of `kind` fail.
    pub fn fail_next(&self, kind: StatementKind) {
        self.state.lock().fail_next = Some(kind);
    }
}

struct MemoryConnection<'a> {
    state: &'a mut MemoryState,
}

impl Connection for MemoryConnection<'_> {
    // The transaction already holds the store-wide lock.
    fn lock_keys(&mut self, table: &str, keys: &[String]) -> ImportResult<()> {
        self.state.table(table)?;
        self.state.record(StatementKind::LockKeys, table, keys.len(), &[])
    }

    fn select_for_update(&mut self, table: &str, predicate: &Predicate) -> ImportResult<Vec<Record>> {
        let rows: Vec<Record> = self
            .state
            .table(table)?
            .rows
            .iter()
            .filter(|row| predicate.matches(row))
            .cloned()
            .collect();
        self.state
            .record(StatementKind::SelectForUpdate, table, rows.len(), &[])?;
        Ok(rows)
    }

    fn bulk_update(
        &mut self,
        table: &str,
        rows: &[Record],
        key_field: &str,
        fields: &[String],
    ) -> ImportResult<u64> {
        self.state
            .record(StatementKind::BulkUpdate, table, rows.len(), fields)?;
        let target = self.state.table_mut(table)?;

        let mut updated = 0;
        for row in rows {
            let key = row.get(key_field);
            for stored in target.rows.iter_mut().filter(|r| r.get(key_field).sql_eq(key)) {
                for field in fields {
                    stored.set(field.clone(), row.value(field));
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn bulk_insert(&mut self, table: &str, rows: &[Record]) -> ImportResult<u64> {
        self.state
            .record(StatementKind::BulkInsert, table, rows.len(), &[])?;
        let target = self.state.table_mut(table)?;
        for row in rows {
            target.insert(row.clone())?;
        }
        Ok(rows.len() as u64)
    }

    fn update_where_key_in(
        &mut self,
        table: &str,
        key_field: &str,
        keys: &[Value],
        field: &str,
        value: &Value,
    ) -> ImportResult<u64> {
        self.state.record(
            StatementKind::UpdateWhereKeyIn,
            table,
            keys.len(),
            &[field.to_string()],
        )?;
        let target = self.state.table_mut(table)?;

        let mut updated = 0;
        for stored in target
            .rows
            .iter_mut()
            .filter(|r| keys.iter().any(|k| r.get(key_field).sql_eq(k)))
        {
            stored.set(field, value.clone());
            updated += 1;
        }
        Ok(updated)
    }
}

impl Store for MemoryStore {
    fn run_in_transaction(
        &self,
        table: &str,
        work: &mut dyn FnMut(&mut dyn Connection) -> ImportResult<()>,
    ) -> ImportResult<()> {
        let mut state = self.state.lock();
        state.table(table)?;
        let snapshot = state.tables.clone();

        let result = work(&mut MemoryConnection { state: &mut *state });
        if let Err(err) = &result {
            log::debug!("memory store: rolling back transaction on {}: {}", table, err);
            state.tables = snapshot;
        }
        result
    }

    fn select(&self, table: &str, predicate: &Predicate) -> ImportResult<Vec<Record>> {
        let state = self.state.lock();
        Ok(state
            .table(table)?
            .rows
            .iter()
            .filter(|row| predicate.matches(row))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use std::sync::Arc;
    use std::thread;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table("t", "id");
        store
    }

    #[test]
    fn test_auto_increment_and_duplicate_keys() {
        let store = store();
        store
            .seed("t", [record! { "a" => "x" }, record! { "id" => 10, "a" => "y" }])
            .unwrap();
        store.seed("t", [record! { "a" => "z" }]).unwrap();
        let ids: Vec<Value> = store.rows("t").unwrap().iter().map(|r| r.value("id")).collect();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(10), Value::Int(11)]);

        let err = store.seed("t", [record! { "id" => 10 }]).unwrap_err();
        assert!(matches!(err, ImportError::Store(_)));
    }

    #[test]
    fn test_bulk_update_writes_only_listed_fields() {
        let store = store();
        store.seed("t", [record! { "a" => "x", "b" => "keep" }]).unwrap();
        store
            .run_in_transaction("t", &mut |conn| {
                conn.bulk_update(
                    "t",
                    &[record! { "id" => 1, "a" => "new", "b" => "ignored" }],
                    "id",
                    &["a".to_string()],
                )?;
                Ok(())
            })
            .unwrap();
        let row = store.find("t", 1).unwrap();
        assert_eq!(row.get("a"), &Value::from("new"));
        assert_eq!(row.get("b"), &Value::from("keep"));
    }

    #[test]
    fn test_injected_failure_rolls_back_transaction() {
        let store = store();
        store.seed("t", [record! { "a" => "x" }]).unwrap();
        store.fail_next(StatementKind::BulkInsert);

        let result = store.run_in_transaction("t", &mut |conn| {
            conn.update_where_key_in("t", "id", &[Value::Int(1)], "a", &Value::from("y"))?;
            conn.bulk_insert("t", &[record! { "a" => "z" }])?;
            Ok(())
        });

        assert!(matches!(result, Err(ImportError::Store(_))));
        let rows = store.rows("t").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a"), &Value::from("x"));
        assert_eq!(store.statements_of(StatementKind::UpdateWhereKeyIn).len(), 1);
        assert!(store.statements_of(StatementKind::BulkInsert).is_empty());
    }

    #[test]
    fn test_unknown_table() {
        let store = MemoryStore::new();
        assert!(store.rows("nope").is_err());
        assert!(store.run_in_transaction("nope", &mut |_| Ok(())).is_err());
    }

    #[test]
    fn test_transactions_serialize() {
        let store = Arc::new(store());
        store.seed("t", [record! { "n" => 0 }]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    store
                        .run_in_transaction("t", &mut |conn| {
                            let rows = conn.select_for_update("t", &Predicate::eq("id", 1))?;
                            let n = rows[0].get("n").as_i64().unwrap_or_default();
                            conn.bulk_update(
                                "t",
                                &[record! { "id" => 1, "n" => n + 1 }],
                                "id",
                                &["n".to_string()],
                            )?;
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.find("t", 1).unwrap().get("n"), &Value::Int(8));
    }
}
