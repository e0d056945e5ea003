//! Import statistics tracking.

/// Statistics for one prepared import.
///
/// Counts are accumulated per committed chunk; a chunk that rolled back
/// contributes nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Rows inserted
    pub inserted: u64,
    /// Existing rows written because at least one update field changed
    pub updated: u64,
    /// Unchanged rows whose batch id was refreshed
    pub batch_id_touched: u64,
    /// Unchanged rows left untouched (no batch id active)
    pub unchanged: u64,
    /// Chunks committed
    pub chunks: u64,
}

impl ImportStats {
    /// Merge another ImportStats into this one by summing all counts.
    pub fn merge(&mut self, other: ImportStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.batch_id_touched += other.batch_id_touched;
        self.unchanged += other.unchanged;
        self.chunks += other.chunks;
    }

    /// Rows written in any way.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated + self.batch_id_touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_counts() {
        let mut total = ImportStats {
            inserted: 1,
            updated: 2,
            ..ImportStats::default()
        };
        total.merge(ImportStats {
            inserted: 3,
            batch_id_touched: 4,
            unchanged: 5,
            chunks: 1,
            ..ImportStats::default()
        });
        assert_eq!(
            total,
            ImportStats {
                inserted: 4,
                updated: 2,
                batch_id_touched: 4,
                unchanged: 5,
                chunks: 1,
            }
        );
        assert_eq!(total.written(), 10);
    }
}
