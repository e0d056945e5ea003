//! Batch import configuration and per-chunk processing.
//!
//! [`BatchImport`] collects the configuration for one target table. Each call
//! to [`BatchImport::prepare`] snapshots that configuration into a
//! [`PreparedImport`] whose buffer feeds a [`ChunkProcessor`]. Per chunk:
//! 1. Convert incoming items into rows for the active mode
//! 2. Lock and load matching existing rows
//! 3. Classify into inserts, updates and batch-id-only touches
//! 4. Write updates, touches and inserts
//! 5. After commit, enqueue affected records for the callbacks
//!
//! Steps 2 to 4 run in one transaction per chunk.

use crate::buffer::{FlushingBuffer, Sink};
use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult};
use crate::import::batch_id::{BatchIdSetting, resolve_batch_id, resolve_batch_id_field};
use crate::import::callbacks::{CallbackDispatcher, Callbacks, RecordsCallback};
use crate::import::fields::{
    MatchField, RawComparator, UpdateField, update_field_names, validate_match_fields,
    validate_update_fields,
};
use crate::import::loader::load_existing;
use crate::import::merge::{BatchStamp, MergeContext};
use crate::import::prepared::PreparedImport;
use crate::import::row::{Row, RowAccess};
use crate::import::stats::ImportStats;
use crate::import::writer::{self, WriteTarget};
use crate::model::Model;
use crate::record::{Incoming, Record};
use crate::store::postgres::sql::MAX_BIND_PARAMS;
use crate::store::{self, Store};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Source of the timestamps written to `created_at`/`updated_at`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

fn buffer_size(size: usize, what: &str) -> ImportResult<NonZeroUsize> {
    NonZeroUsize::new(size)
        .ok_or_else(|| ImportError::config(format!("{what} size must be greater than 0")))
}

/// A chunk's lookup binds up to one value per record and column match field;
/// it has to fit in one statement.
fn check_lookup_size(match_by: &[MatchField], buffer_size: NonZeroUsize) -> ImportResult<()> {
    let columns = match_by.iter().filter(|f| f.is_column()).count().max(1);
    if columns.saturating_mul(buffer_size.get()) > MAX_BIND_PARAMS {
        return Err(ImportError::config(format!(
            "buffer size {buffer_size} with {columns} match columns exceeds {MAX_BIND_PARAMS} lookup values per chunk"
        )));
    }
    Ok(())
}

#[derive(Clone)]
struct ImportSettings {
    match_by: Vec<MatchField>,
    update_fields: Vec<UpdateField>,
    callback_when: HashSet<String>,
    callbacks: Callbacks,
    batch_id: BatchIdSetting,
    batch_id_field: Option<String>,
    buffer_size: NonZeroUsize,
    callback_buffer_size: NonZeroUsize,
    bypass: bool,
    comparators: HashMap<String, RawComparator>,
    clock: Clock,
}

/// Bulk upsert of records into one table.
///
/// ```
/// use std::sync::Arc;
/// use db_batch_import::{record, BatchImport, MemoryStore, TableModel};
///
/// let store = Arc::new(MemoryStore::new());
/// store.create_table("items", "id");
///
/// let mut import = BatchImport::new(TableModel::new("items"), store.clone()).unwrap();
/// import.match_by(["sku"]).unwrap().update_if_exists(["name"]).unwrap();
/// import
///     .import([record! { "sku" => "a-1", "name" => "Anvil" }])
///     .unwrap();
///
/// assert_eq!(store.rows("items").unwrap().len(), 1);
/// ```
pub struct BatchImport {
    model: Arc<dyn Model>,
    store: Arc<dyn Store>,
    settings: ImportSettings,
    last_batch_id: Option<String>,
}

impl BatchImport {
    /// Create an import for `model`, matching by its primary key.
    ///
    /// # Errors
    /// `ImportError::Precondition` when the model has no primary key.
    pub fn new<M>(model: M, store: Arc<dyn Store>) -> ImportResult<Self>
    where
        M: Model + 'static,
    {
        Self::with_shared(Arc::new(model), store)
    }

    pub fn with_shared(model: Arc<dyn Model>, store: Arc<dyn Store>) -> ImportResult<Self> {
        let key_name = match model.key_name() {
            Some(key) if !key.trim().is_empty() => key.to_string(),
            _ => {
                return Err(ImportError::precondition(format!(
                    "batch import requires a primary key; table {} does not have one",
                    model.table()
                )));
            }
        };

        let config = ImportConfig::default();
        let settings = ImportSettings {
            match_by: vec![MatchField::Column(key_name)],
            update_fields: Vec::new(),
            callback_when: HashSet::new(),
            callbacks: Callbacks::default(),
            batch_id: BatchIdSetting::Auto,
            batch_id_field: None,
            buffer_size: buffer_size(config.buffer_size, "buffer")?,
            callback_buffer_size: buffer_size(config.callback_buffer_size, "callback buffer")?,
            bypass: false,
            comparators: HashMap::new(),
            clock: Arc::new(Utc::now),
        };

        Ok(Self {
            model,
            store,
            settings,
            last_batch_id: None,
        })
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Fields which must match for a record to be treated as an existing row.
    ///
    /// A null value in any of these fields never matches, not even another
    /// null, following SQL comparison semantics.
    pub fn match_by<I, F>(&mut self, fields: I) -> ImportResult<&mut Self>
    where
        I: IntoIterator<Item = F>,
        F: Into<MatchField>,
    {
        let fields: Vec<MatchField> = fields.into_iter().map(Into::into).collect();
        validate_match_fields(&fields)?;
        check_lookup_size(&fields, self.settings.buffer_size)?;
        self.settings.match_by = fields;
        Ok(self)
    }

    /// Fields written when a record matches an existing row.
    pub fn update_if_exists<I, F>(&mut self, fields: I) -> ImportResult<&mut Self>
    where
        I: IntoIterator<Item = F>,
        F: Into<UpdateField>,
    {
        let fields: Vec<UpdateField> = fields.into_iter().map(Into::into).collect();
        validate_update_fields(&fields)?;
        self.settings.update_fields = fields;
        Ok(self)
    }

    /// Restrict the "updated" callbacks to rows where one of `fields` changed.
    /// Other changes are still written.
    pub fn on_updated_when<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.callback_when = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_updated<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        self.settings.callbacks.updated.push(Arc::new(callback) as RecordsCallback);
        self
    }

    pub fn on_inserted<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        self.settings.callbacks.inserted.push(Arc::new(callback) as RecordsCallback);
        self
    }

    pub fn on_inserted_or_updated<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        self.settings
            .callbacks
            .inserted_or_updated
            .push(Arc::new(callback) as RecordsCallback);
        self
    }

    /// Use a fixed batch id, optionally stored in `field` instead of the
    /// model's batch column.
    pub fn with_batch_id(
        &mut self,
        batch_id: impl fmt::Display,
        field: Option<&str>,
    ) -> ImportResult<&mut Self> {
        if let Some(field) = field {
            if field.trim().is_empty() {
                return Err(ImportError::config("empty batch id field name given"));
            }
        }
        self.settings.batch_id = BatchIdSetting::Explicit(batch_id.to_string());
        self.settings.batch_id_field = field.map(str::to_string);
        Ok(self)
    }

    /// Do not stamp batch ids, even if the model generates them.
    pub fn without_batch_id(&mut self) -> &mut Self {
        self.settings.batch_id = BatchIdSetting::Disabled;
        self
    }

    /// Set the import buffer size and, optionally, the callback buffer size
    /// (defaults to the import buffer size).
    ///
    /// # Errors
    /// `ImportError::Config` for a zero size, or when one chunk's lookup would
    /// bind more than `MAX_BIND_PARAMS` values.
    pub fn buffer(&mut self, size: usize, callback_size: Option<usize>) -> ImportResult<&mut Self> {
        let size = buffer_size(size, "buffer")?;
        check_lookup_size(&self.settings.match_by, size)?;
        let callback_size = match callback_size {
            Some(n) => buffer_size(n, "callback buffer")?,
            None => size,
        };
        self.settings.buffer_size = size;
        self.settings.callback_buffer_size = callback_size;
        Ok(self)
    }

    /// Apply buffer sizes from an [`ImportConfig`].
    pub fn configure(&mut self, config: ImportConfig) -> ImportResult<&mut Self> {
        self.buffer(config.buffer_size, Some(config.callback_buffer_size))
    }

    /// Work on plain records, skipping casts and mutators.
    ///
    /// Disabling bypass also drops any [`raw_comparators`](Self::raw_comparators).
    pub fn bypass_model(&mut self, enabled: bool) -> &mut Self {
        self.settings.bypass = enabled;
        if !enabled {
            self.settings.comparators.clear();
        }
        self
    }

    /// Per-field comparators deciding whether a new value differs from the
    /// stored one in bypass mode. Other fields use loose comparison with
    /// null equal to null.
    ///
    /// # Errors
    /// `ImportError::Config` unless bypass is enabled.
    pub fn raw_comparators<I, S>(&mut self, comparators: I) -> ImportResult<&mut Self>
    where
        I: IntoIterator<Item = (S, RawComparator)>,
        S: Into<String>,
    {
        if !self.settings.bypass {
            return Err(ImportError::config(
                "raw comparators are only applicable when bypass_model is enabled",
            ));
        }
        self.settings.comparators = comparators
            .into_iter()
            .map(|(field, comparator)| (field.into(), comparator))
            .collect();
        Ok(self)
    }

    /// Replace the clock used for timestamps.
    pub fn clock<F>(&mut self, clock: F) -> &mut Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.settings.clock = Arc::new(clock);
        self
    }

    /// Batch id allocated by the most recent [`prepare`](Self::prepare).
    pub fn last_batch_id(&self) -> Option<&str> {
        self.last_batch_id.as_deref()
    }

    /// Create a streaming import using the current configuration.
    ///
    /// The batch id is resolved here, once, and reused by every chunk.
    pub fn prepare(&mut self) -> PreparedImport {
        let batch_id = resolve_batch_id(&self.settings.batch_id, self.model.as_ref());
        let batch_field =
            resolve_batch_id_field(self.settings.batch_id_field.as_deref(), self.model.as_ref());
        self.last_batch_id = batch_id.clone();

        let update_names = update_field_names(&self.settings.update_fields);
        let updated_at = self.model.timestamps().map(|t| t.updated_at.clone());
        let update_columns = writer::update_columns(
            &update_names,
            batch_id.as_ref().map(|_| batch_field.as_str()),
            updated_at.as_deref(),
        );

        log::debug!(
            "preparing batch import into {} (batch id {:?}, buffer {})",
            self.model.table(),
            batch_id,
            self.settings.buffer_size
        );

        let processor = ChunkProcessor {
            model: self.model.clone(),
            store: self.store.clone(),
            dispatcher: CallbackDispatcher::new(
                self.settings.callback_buffer_size,
                &self.settings.callbacks,
            ),
            settings: self.settings.clone(),
            batch_id: batch_id.clone(),
            batch_field,
            update_columns,
            stats: ImportStats::default(),
        };

        PreparedImport::new(
            FlushingBuffer::new(self.settings.buffer_size, processor),
            batch_id,
        )
    }

    /// Import all `records` and flush; returns the batch id used.
    pub fn import<I, R>(&mut self, records: I) -> ImportResult<Option<String>>
    where
        I: IntoIterator<Item = R>,
        R: Into<Incoming>,
    {
        let mut prepared = self.prepare();
        prepared.add_multiple(records)?;
        prepared.flush()
    }
}

impl fmt::Debug for BatchImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchImport")
            .field("table", &self.model.table())
            .field("match_by", &self.settings.match_by)
            .field("update_fields", &self.settings.update_fields)
            .field("batch_id", &self.settings.batch_id)
            .field("buffer_size", &self.settings.buffer_size)
            .field("bypass", &self.settings.bypass)
            .field("last_batch_id", &self.last_batch_id)
            .finish()
    }
}

/// Buffer sink running the reconciliation pipeline for one chunk.
pub(crate) struct ChunkProcessor {
    model: Arc<dyn Model>,
    store: Arc<dyn Store>,
    settings: ImportSettings,
    batch_id: Option<String>,
    batch_field: String,
    update_columns: Vec<String>,
    dispatcher: CallbackDispatcher,
    stats: ImportStats,
}

impl ChunkProcessor {
    pub(crate) fn stats(&self) -> ImportStats {
        self.stats
    }

    pub(crate) fn pending_callbacks(&self) -> usize {
        self.dispatcher.pending()
    }

    pub(crate) fn dispatcher_mut(&mut self) -> &mut CallbackDispatcher {
        &mut self.dispatcher
    }

    pub(crate) fn table(&self) -> &str {
        self.model.table()
    }

    /// Fail fast on an item the pipeline would reject for the whole chunk.
    pub(crate) fn check(&self, item: &Incoming) -> ImportResult<()> {
        RowAccess::new(self.model.as_ref(), self.settings.bypass).check(item)
    }
}

impl Sink<Incoming> for ChunkProcessor {
    type Error = ImportError;

    fn flush(&mut self, items: &[Incoming]) -> ImportResult<()> {
        let model = self.model.as_ref();
        let table = model.table();
        let key_name = model.key_name().ok_or_else(|| {
            ImportError::precondition(format!("table {table} does not have a primary key"))
        })?;

        let access = RowAccess::new(model, self.settings.bypass);
        let chunk = items
            .iter()
            .map(|item| access.incoming(item))
            .collect::<ImportResult<Vec<Row>>>()?;

        let batch = self.batch_id.as_deref().map(|id| BatchStamp {
            id,
            field: &self.batch_field,
        });
        let merge = MergeContext {
            access,
            match_by: &self.settings.match_by,
            update_fields: &self.settings.update_fields,
            callback_when: &self.settings.callback_when,
            comparators: &self.settings.comparators,
            key_name,
            batch,
            timestamps: model.timestamps(),
            now: (self.settings.clock)(),
        };
        let target = WriteTarget {
            table,
            key_name,
            update_columns: &self.update_columns,
            batch,
            touch_chunk_size: self.settings.buffer_size.get(),
        };
        let match_by = &self.settings.match_by;

        let (plan, counts) = store::transaction(self.store.as_ref(), table, |conn| {
            let existing = load_existing(conn, table, access, match_by, &chunk)?;
            let plan = merge.classify(chunk, existing)?;
            let counts = writer::apply(conn, &target, &plan)?;
            Ok((plan, counts))
        })
        .inspect_err(|err| {
            log::warn!(
                "batch import chunk of {} records into {} rolled back: {}",
                items.len(),
                table,
                err
            );
        })?;

        log::debug!(
            "committed chunk of {} records into {} ({} rows updated, {} touched, {} inserted)",
            items.len(),
            table,
            counts.updated,
            counts.touched,
            counts.inserted
        );

        self.dispatcher
            .dispatch(&plan.to_insert, &plan.updated_for_callbacks);
        self.stats.merge(ImportStats {
            inserted: plan.to_insert.len() as u64,
            updated: plan.to_update.len() as u64,
            batch_id_touched: plan.batch_id_touch.len() as u64,
            unchanged: plan.unchanged as u64,
            chunks: 1,
        });
        Ok(())
    }
}
