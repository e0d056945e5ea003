//! Batch reconciliation engine.
//!
//! Streams records into a table, inserting new ones, updating changed ones
//! and stamping a batch id on everything seen:
//!
//! 1. **Buffering** (`prepared`) - Records are collected into chunks
//! 2. **Loading** (`loader`) - Existing counterparts are locked and loaded per chunk
//! 3. **Matching** (`comparison_key`) - Records and rows are paired by comparison key
//! 4. **Merging** (`merge`) - Field-level dirty checks decide insert, update or touch
//! 5. **Writing** (`writer`) - Updates, batch-id touches and inserts, in one transaction
//! 6. **Callbacks** (`callbacks`) - Affected records are delivered in batches after commit
//! 7. **Coordination** (`coordinator`) - Configuration and the per-chunk pipeline
//! 8. **Statistics** (`stats`) - Tracks import metrics
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use db_batch_import::{record, BatchImport, MemoryStore, TableModel, WhereMissingAfterBatch};
//! use db_batch_import::Store;
//!
//! let store = Arc::new(MemoryStore::new());
//! store.create_table("products", "id");
//!
//! let model = TableModel::new("products");
//! let mut import = BatchImport::new(model.clone(), store.clone()).unwrap();
//! import
//!     .match_by(["sku"]).unwrap()
//!     .update_if_exists(["price"]).unwrap()
//!     .with_batch_id(20, None).unwrap();
//!
//! let batch_id = import
//!     .import([record! { "sku" => "a", "price" => 10 }])
//!     .unwrap();
//! assert_eq!(batch_id.as_deref(), Some("20"));
//!
//! let stale = store
//!     .select("products", &WhereMissingAfterBatch::new("20").apply(&model))
//!     .unwrap();
//! assert!(stale.is_empty());
//! ```

pub mod batch_id;
pub mod callbacks;
pub mod comparison_key;
pub mod coordinator;
pub mod fields;
pub(crate) mod loader;
pub(crate) mod merge;
pub mod prepared;
pub(crate) mod row;
pub mod stats;
pub(crate) mod writer;

// Re-export main types
pub use batch_id::{BatchIdSetting, DEFAULT_BATCH_ID_FIELD};
pub use callbacks::{Callbacks, RecordsCallback};
pub use comparison_key::comparison_key;
pub use coordinator::{BatchImport, Clock};
pub use fields::{MatchField, MatchTransform, RawComparator, UpdateField, UpdateTransform, comparator};
pub use prepared::PreparedImport;
pub use stats::ImportStats;
