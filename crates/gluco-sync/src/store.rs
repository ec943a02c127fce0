//! # Record Store Seam
//!
//! What the coordinator needs from local storage: import a received batch,
//! export a batch from a cutoff, prune old values.
//!
//! [`gluco_db::Database`] is the production store; [`MemoryRecordStore`]
//! keeps records in a map for tests and embedding.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gluco_core::validation::partition_valid;
use gluco_core::{decode_records, encode_records, GlucoseRecord};
use gluco_db::{Database, ImportReport};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SyncResult;

/// Local storage for glucose records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Adds every valid record whose timestamp is not yet stored.
    ///
    /// A payload that fails to decode stores nothing.
    async fn import_json(&self, json: &str) -> SyncResult<ImportReport>;

    /// Serializes all records at or after `min_timestamp_ms`.
    async fn export_json_since(&self, min_timestamp_ms: i64) -> SyncResult<String>;

    /// Deletes records strictly older than `timestamp_ms`.
    async fn delete_older_than(&self, timestamp_ms: i64) -> SyncResult<u64>;
}

#[async_trait]
impl RecordStore for Database {
    async fn import_json(&self, json: &str) -> SyncResult<ImportReport> {
        Ok(self.glucose().import_json(json).await?)
    }

    async fn export_json_since(&self, min_timestamp_ms: i64) -> SyncResult<String> {
        Ok(self.glucose().export_json_since(min_timestamp_ms).await?)
    }

    async fn delete_older_than(&self, timestamp_ms: i64) -> SyncResult<u64> {
        Ok(self.glucose().delete_older_than(timestamp_ms).await?)
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// Record store backed by an ordered map keyed by timestamp.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<i64, GlucoseRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-filled with `records`.
    pub fn with_records(records: impl IntoIterator<Item = GlucoseRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.timestamp, r)).collect();
        MemoryRecordStore {
            records: RwLock::new(map),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Stored timestamps, oldest first.
    pub async fn timestamps(&self) -> Vec<i64> {
        self.records.read().await.keys().copied().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn import_json(&self, json: &str) -> SyncResult<ImportReport> {
        let records = decode_records(json)?;
        let received = records.len();
        let (valid, rejected) = partition_valid(records);

        let mut map = self.records.write().await;
        let mut inserted = 0;
        for record in valid.iter() {
            if !map.contains_key(&record.timestamp) {
                map.insert(record.timestamp, record.clone());
                inserted += 1;
            }
        }

        let report = ImportReport {
            received,
            inserted,
            duplicates: valid.len() - inserted,
            rejected,
        };
        debug!(?report, "Imported into memory store");
        Ok(report)
    }

    async fn export_json_since(&self, min_timestamp_ms: i64) -> SyncResult<String> {
        let map = self.records.read().await;
        let records: Vec<GlucoseRecord> =
            map.range(min_timestamp_ms..).map(|(_, r)| r.clone()).collect();
        Ok(encode_records(&records)?)
    }

    async fn delete_older_than(&self, timestamp_ms: i64) -> SyncResult<u64> {
        let mut map = self.records.write().await;
        let kept = map.split_off(&timestamp_ms);
        let deleted = map.len() as u64;
        *map = kept;
        Ok(deleted)
    }
}
