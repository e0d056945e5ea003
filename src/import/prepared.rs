//! Streaming front-end of a prepared import.

use crate::buffer::FlushingBuffer;
use crate::error::ImportResult;
use crate::import::coordinator::ChunkProcessor;
use crate::import::stats::ImportStats;
use crate::record::Incoming;
use std::fmt;

/// An import accepting records incrementally.
///
/// Records are buffered and reconciled one chunk at a time whenever the
/// buffer fills; [`flush`](Self::flush) processes the remainder and delivers
/// pending callbacks. Memory use is bounded by the buffer sizes, however many
/// records are streamed in.
pub struct PreparedImport {
    buffer: FlushingBuffer<Incoming, ChunkProcessor>,
    batch_id: Option<String>,
}

impl PreparedImport {
    pub(crate) fn new(
        buffer: FlushingBuffer<Incoming, ChunkProcessor>,
        batch_id: Option<String>,
    ) -> Self {
        Self { buffer, batch_id }
    }

    /// Add one record; processes a chunk when the buffer becomes full.
    ///
    /// A record this import cannot take is rejected before it is buffered.
    /// While a failed chunk still fills the buffer, it is retried first and
    /// the record is not added if that fails again.
    pub fn add(&mut self, record: impl Into<Incoming>) -> ImportResult<&mut Self> {
        let record = record.into();
        self.buffer.sink().check(&record)?;
        self.buffer.add(record)?;
        Ok(self)
    }

    /// Add records from any iterator, lazily.
    pub fn add_multiple<I, R>(&mut self, records: I) -> ImportResult<&mut Self>
    where
        I: IntoIterator<Item = R>,
        R: Into<Incoming>,
    {
        for record in records {
            self.add(record)?;
        }
        Ok(self)
    }

    /// Process buffered records and deliver pending callbacks.
    ///
    /// Safe to call repeatedly. On error the failing chunk stays buffered and
    /// pending callbacks are kept.
    ///
    /// # Returns
    /// The batch id allocated when the import was prepared
    pub fn flush(&mut self) -> ImportResult<Option<String>> {
        self.buffer.flush()?;
        self.buffer.sink_mut().dispatcher_mut().flush_all();

        let stats = self.stats();
        log::info!(
            "batch import into {} flushed: {} inserted, {} updated, {} batch id touches, {} unchanged in {} chunks",
            self.buffer.sink().table(),
            stats.inserted,
            stats.updated,
            stats.batch_id_touched,
            stats.unchanged,
            stats.chunks
        );
        Ok(self.batch_id.clone())
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    /// Totals of all chunks committed so far.
    pub fn stats(&self) -> ImportStats {
        self.buffer.sink().stats()
    }

    /// Records waiting in the import buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop the buffered records, e.g. a chunk the store keeps rejecting,
    /// and hand them back.
    pub fn discard_pending(&mut self) -> Vec<Incoming> {
        let discarded = self.buffer.discard();
        if !discarded.is_empty() {
            log::warn!(
                "discarded {} pending records for {}",
                discarded.len(),
                self.buffer.sink().table()
            );
        }
        discarded
    }

    /// Records waiting in the callback buffers.
    pub fn pending_callbacks(&self) -> usize {
        self.buffer.sink().pending_callbacks()
    }
}

impl fmt::Debug for PreparedImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedImport")
            .field("table", &self.buffer.sink().table())
            .field("batch_id", &self.batch_id)
            .field("pending", &self.pending())
            .field("stats", &self.stats())
            .finish()
    }
}
