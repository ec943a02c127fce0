//! # Glucose Value Repository
//!
//! Storage for sensor readings plus the batch import/export used by the
//! sync channels.
//!
//! ## Import Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Idempotent Batch Import                              │
//! │                                                                         │
//! │  payload (JSON array)                                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  decode_records ── malformed? ──► Err(InvalidPayload), nothing stored  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  partition_valid ── invalid records counted as `rejected`              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  INSERT OR IGNORE INTO glucose_values ... (one per record)      │   │
//! │  │  existing timestamp ──► counted as `duplicates`                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ──► ImportReport { received, inserted, duplicates, rejected }  │
//! │                                                                         │
//! │  Re-importing the same batch inserts nothing.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use gluco_core::validation::partition_valid;
use gluco_core::{decode_records, encode_records, GlucoseRecord};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

/// Outcome of a batch import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    /// Records present in the payload.
    pub received: usize,

    /// Records newly stored.
    pub inserted: usize,

    /// Records whose timestamp was already stored.
    pub duplicates: usize,

    /// Records failing validation.
    pub rejected: usize,
}

/// Repository for glucose values.
#[derive(Debug, Clone)]
pub struct GlucoseRepository {
    pool: SqlitePool,
}

impl GlucoseRepository {
    /// Creates a new GlucoseRepository.
    pub fn new(pool: SqlitePool) -> Self {
        GlucoseRepository { pool }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores records whose timestamp is not yet known.
    ///
    /// Runs in one transaction: either the whole batch is applied or none
    /// of it is. Returns the number of rows actually inserted.
    pub async fn insert_if_absent(&self, records: &[GlucoseRecord]) -> DbResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO glucose_values (timestamp, value, rate, alarm, source)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(record.timestamp)
            .bind(record.value)
            .bind(record.rate)
            .bind(record.alarm)
            .bind(record.source.as_deref())
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;

        debug!(batch = records.len(), inserted = inserted, "Stored glucose values");
        Ok(inserted)
    }

    /// Decodes a JSON batch received from a peer and stores it.
    pub async fn import_json(&self, json: &str) -> DbResult<ImportReport> {
        let records = decode_records(json)?;
        let received = records.len();

        let (valid, rejected) = partition_valid(records);
        let inserted = self.insert_if_absent(&valid).await?;

        let report = ImportReport {
            received,
            inserted,
            duplicates: valid.len() - inserted,
            rejected,
        };

        info!(
            received = report.received,
            inserted = report.inserted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Imported glucose values"
        );

        Ok(report)
    }

    /// Deletes all values older than `cutoff_ms` (exclusive).
    ///
    /// Returns the number of deleted rows.
    pub async fn delete_older_than(&self, cutoff_ms: i64) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM glucose_values WHERE timestamp < ?1")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;

        debug!(cutoff = cutoff_ms, deleted = result.rows_affected(), "Pruned glucose values");
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns all values at or after `min_time_ms`, oldest first.
    pub async fn export_since(&self, min_time_ms: i64) -> DbResult<Vec<GlucoseRecord>> {
        let records = sqlx::query_as::<_, GlucoseRecord>(
            r#"
            SELECT timestamp, value, rate, alarm, source
            FROM glucose_values
            WHERE timestamp >= ?1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(min_time_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Returns the JSON batch of all values at or after `min_time_ms`.
    pub async fn export_json_since(&self, min_time_ms: i64) -> DbResult<String> {
        let records = self.export_since(min_time_ms).await?;
        Ok(encode_records(&records)?)
    }

    /// Counts stored values.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM glucose_values")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Returns the most recent value, if any.
    pub async fn latest(&self) -> DbResult<Option<GlucoseRecord>> {
        let record = sqlx::query_as::<_, GlucoseRecord>(
            r#"
            SELECT timestamp, value, rate, alarm, source
            FROM glucose_values
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Returns the timestamp of the oldest stored value, if any.
    pub async fn oldest_timestamp(&self) -> DbResult<Option<i64>> {
        let oldest: Option<i64> = sqlx::query_scalar("SELECT MIN(timestamp) FROM glucose_values")
            .fetch_one(&self.pool)
            .await?;

        Ok(oldest)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::{Database, DbConfig};

    async fn repo() -> GlucoseRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().glucose()
    }

    fn batch() -> Vec<GlucoseRecord> {
        vec![
            GlucoseRecord::new(1_000, 100),
            GlucoseRecord::new(2_000, 110).with_rate(1.5),
            GlucoseRecord::new(3_000, 120).with_source("Libre"),
        ]
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let repo = repo().await;
        let json = encode_records(&batch()).unwrap();

        let first = repo.import_json(&json).await.unwrap();
        assert_eq!(first.received, 3);
        assert_eq!(first.inserted, 3);
        assert_eq!(first.duplicates, 0);

        let second = repo.import_json(&json).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(repo.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_records() {
        let repo = repo().await;
        let json = r#"[{"timestamp": 1000, "value": 100}, {"timestamp": 2000, "value": 0}]"#;

        let report = repo.import_json(json).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn test_truncated_payload_stores_nothing() {
        let repo = repo().await;

        let err = repo
            .import_json(r#"[{"timestamp": 1000, "value": 100}, {"timest"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidPayload(_)));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_export_since_is_inclusive_and_ordered() {
        let repo = repo().await;
        repo.insert_if_absent(&batch()).await.unwrap();

        let exported = repo.export_since(2_000).await.unwrap();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].timestamp, 2_000);
        assert_eq!(exported[0].rate, Some(1.5));
        assert_eq!(exported[1].source.as_deref(), Some("Libre"));

        let json = repo.export_json_since(i64::MAX).await.unwrap();
        assert_eq!(json, "[]");
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let repo = repo().await;
        repo.insert_if_absent(&batch()).await.unwrap();

        let deleted = repo.delete_older_than(2_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.oldest_timestamp().await.unwrap(), Some(2_000));
        assert_eq!(repo.latest().await.unwrap().unwrap().timestamp, 3_000);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let repo = repo().await;
        assert_eq!(repo.latest().await.unwrap(), None);
        assert_eq!(repo.oldest_timestamp().await.unwrap(), None);
        assert_eq!(repo.insert_if_absent(&[]).await.unwrap(), 0);
    }
}
