//! Batched upsert synchronisation of records into relational tables.
//!
//! A [`BatchImport`] streams records into one table: records matching an
//! existing row (by configurable match fields) update it when one of the
//! update fields changed, all others are inserted. Every row seen by an
//! import can be stamped with a batch id, so rows missing from the latest
//! batch are found with [`WhereMissingAfterBatch`].
//!
//! ```
//! use std::sync::Arc;
//! use db_batch_import::{record, BatchImport, MemoryStore, Store, TableModel, Value, WhereMissingAfterBatch};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.create_table("stock", "id");
//! store.seed("stock", [record! { "sku" => "old", "qty" => 1, "last_batch_id" => 1 }]).unwrap();
//!
//! let model = TableModel::new("stock");
//! let mut import = BatchImport::new(model.clone(), store.clone()).unwrap();
//! import
//!     .match_by(["sku"]).unwrap()
//!     .update_if_exists(["qty"]).unwrap()
//!     .with_batch_id(2, None).unwrap();
//! import.import([record! { "sku" => "new", "qty" => 5 }]).unwrap();
//!
//! let stale = store.select("stock", &WhereMissingAfterBatch::new("2").apply(&model)).unwrap();
//! assert_eq!(stale.len(), 1);
//! assert_eq!(stale[0].get("sku"), &Value::from("old"));
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod import;
pub mod model;
pub mod query;
pub mod record;
pub mod store;
pub mod test_support;
pub mod value;

pub use buffer::{FlushingBuffer, Sink};
pub use config::{DEFAULT_BUFFER_SIZE, ImportConfig};
pub use error::{ImportError, ImportResult};
pub use import::{
    BatchIdSetting, BatchImport, Callbacks, Clock, DEFAULT_BATCH_ID_FIELD, ImportStats,
    MatchField, MatchTransform, PreparedImport, RawComparator, RecordsCallback, UpdateField,
    UpdateTransform, comparator, comparison_key,
};
pub use model::{
    BatchIdField, Cast, GeneratesBatchIds, Model, Mutator, ProvidesBatchImport, StoresBatchId,
    TableModel, TimestampColumns,
};
pub use query::{Predicate, WhereMissingAfterBatch, missing_after_batch, where_in_values};
pub use record::{Incoming, Record, TrackedRecord};
pub use store::{Connection, MemoryStore, PgConfig, PgStore, Statement, StatementKind, Store};
pub use value::Value;
