use dashmap::DashMap;

use crate::{AnalyticsRecord, AnalyticsStore, MeteringError};

/// [`AnalyticsStore`] holding the latest record per series point in memory.
#[derive(Debug, Default)]
pub struct MemoryAnalyticsStore {
    records: DashMap<String, AnalyticsRecord>,
}

impl MemoryAnalyticsStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record stored under `series_id` (see [`AnalyticsRecord::series_id`]).
    pub fn get(&self, series_id: &str) -> Option<AnalyticsRecord> {
        self.records.get(series_id).map(|r| r.clone())
    }

    /// Every stored record, in no particular order.
    pub fn records(&self) -> Vec<AnalyticsRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Number of series points stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was stored yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AnalyticsStore for MemoryAnalyticsStore {
    async fn upsert(&self, records: &[AnalyticsRecord]) -> Result<(), MeteringError> {
        for record in records {
            self.records.insert(record.series_id(), record.clone());
        }

        Ok(())
    }
}
