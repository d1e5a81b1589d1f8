//! Idempotent, batched value loading.
//!
//! Rows are inserted per attribute table in small transactions. Delivery is
//! at-most-once: a flush that hits an already-persisted key is rolled back
//! as a whole and its rows stay queued for the next flush of the same
//! attribute. Because the offending row is still queued, every later flush
//! of that attribute conflicts as well, so its non-conflicting siblings are
//! dropped rather than written. A queue is only resent when rows were added
//! since its last attempt; whatever is still queued at the end of the call
//! is discarded.
//!
//! Flush points for each attribute:
//! - after the row at every position `i` with `i % batch_size == 0`
//!   (positions count every routed row, including in-run duplicates)
//! - after the attribute's last row
//! - once more at the very end of the call, for queues that gained rows
//!   after their last attempt
//!
//! The content hash of a row is (sensor display name, value, resolved
//! timestamp) and is shared by every table of the call. Rows without a
//! source timestamp all resolve to the single ingestion time of the call,
//! so two of them from one sensor with the same value count as one.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::ValueRow;
use crate::store::{Store, StoreError, StoreResult, TableBatch};

// ---

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// A reading routed to an attribute table, before timestamp resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueCandidate {
    /// Sensor display name, part of the in-run content hash.
    pub sensor_name: String,
    pub s_id: Uuid,
    pub value: String,
    pub api_timestamp: Option<DateTime<Utc>>,
}

/// All candidates for one attribute table, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLoad {
    pub table: String,
    pub rows: Vec<ValueCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub inserted: usize,
    /// Rows dropped before insertion as repeats within the call.
    pub duplicates: usize,
    /// Flushes rolled back because of a key conflict.
    pub conflicts: usize,
    /// Rows still queued when the call ended.
    pub discarded: usize,
}

/// Content hash key: (sensor display name, value, resolved source timestamp).
type ContentKey = (String, String, DateTime<Utc>);

/// Rows of one table waiting for a successful flush.
#[derive(Debug, Default)]
struct Pending {
    rows: Vec<ValueRow>,
    /// Rows were queued since the last flush attempt.
    dirty: bool,
}

impl Pending {
    fn push(&mut self, row: ValueRow) {
        self.rows.push(row);
        self.dirty = true;
    }
}

pub struct Loader<'s, S> {
    store: &'s S,
    batch_size: usize,
    ingested_at: DateTime<Utc>,
    seen: HashSet<ContentKey>,
    report: LoadReport,
}

impl<'s, S: Store> Loader<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Loader {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            ingested_at: Utc::now(),
            seen: HashSet::new(),
            report: LoadReport::default(),
        }
    }

    /// Zero is treated as one.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Ingestion time stamped on every row, and the source time of rows
    /// that arrived without one.
    pub fn ingested_at(mut self, at: DateTime<Utc>) -> Self {
        self.ingested_at = at;
        self
    }

    pub async fn load(mut self, loads: &[TableLoad]) -> StoreResult<LoadReport> {
        // ---
        let mut retry: Vec<(&str, Vec<ValueRow>)> = Vec::new();

        for load in loads {
            let pending = self.load_table(load).await?;
            if pending.dirty {
                retry.push((load.table.as_str(), pending.rows));
            } else {
                self.report.discarded += pending.rows.len();
            }
        }

        if !retry.is_empty() {
            let batches: Vec<TableBatch<'_>> = retry
                .iter()
                .map(|(table, rows)| TableBatch { table, rows })
                .collect();
            let queued: usize = retry.iter().map(|(_, rows)| rows.len()).sum();

            match self.store.insert_values(&batches).await {
                Ok(()) => self.report.inserted += queued,
                Err(StoreError::Conflict(detail)) => {
                    warn!(
                        "Unable to save {} values as they already are in the system: {}",
                        queued, detail
                    );
                    self.report.conflicts += 1;
                    self.report.discarded += queued;
                }
                Err(e) => return Err(e),
            }
        }

        if self.report.discarded > 0 {
            warn!("Discarded {} values left queued behind conflicts", self.report.discarded);
        }
        info!(
            "Loaded {} values ({} duplicates, {} conflicting flushes, {} discarded)",
            self.report.inserted, self.report.duplicates, self.report.conflicts, self.report.discarded
        );
        Ok(self.report)
    }

    /// Load one table; returns what is still queued after its last flush.
    async fn load_table(&mut self, load: &TableLoad) -> StoreResult<Pending> {
        // ---
        let mut pending = Pending::default();

        for (i, candidate) in load.rows.iter().enumerate() {
            let api_timestamp = candidate.api_timestamp.unwrap_or(self.ingested_at);
            let key = (candidate.sensor_name.clone(), candidate.value.clone(), api_timestamp);
            if !self.seen.insert(key) {
                self.report.duplicates += 1;
                continue;
            }

            pending.push(ValueRow {
                s_id: candidate.s_id,
                value: candidate.value.clone(),
                api_timestamp,
                timestamp: Some(self.ingested_at),
            });

            if i % self.batch_size == 0 {
                self.flush(&load.table, &mut pending).await?;
            }
        }

        if pending.dirty {
            self.flush(&load.table, &mut pending).await?;
        }
        Ok(pending)
    }

    /// Commit the queue; on conflict the rows stay queued.
    async fn flush(&mut self, table: &str, pending: &mut Pending) -> StoreResult<()> {
        // ---
        pending.dirty = false;
        let batch = [TableBatch {
            table,
            rows: pending.rows.as_slice(),
        }];
        match self.store.insert_values(&batch).await {
            Ok(()) => {
                debug!("Committed {} rows into {}", pending.rows.len(), table);
                self.report.inserted += pending.rows.len();
                pending.rows.clear();
                Ok(())
            }
            Err(StoreError::Conflict(detail)) => {
                info!(
                    "{}: batch of {} rolled back, value already exists: {}",
                    table,
                    pending.rows.len(),
                    detail
                );
                self.report.conflicts += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Sensor;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        store: MemoryStore,
        sensor: Sensor,
        base: DateTime<Utc>,
    }

    async fn fixture() -> Fixture {
        // ---
        let store = MemoryStore::new();
        let sensor = Sensor::new(1, 1, "BG1");
        store.insert_sensor(&sensor).await.unwrap();
        store.create_value_table("no2_t").await.unwrap();
        Fixture {
            store,
            sensor,
            base: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    impl Fixture {
        fn candidate(&self, value: &str, minutes: i64) -> ValueCandidate {
            ValueCandidate {
                sensor_name: self.sensor.name.clone(),
                s_id: self.sensor.id,
                value: value.to_string(),
                api_timestamp: Some(self.base + Duration::minutes(minutes)),
            }
        }

        fn load(&self, rows: Vec<ValueCandidate>) -> Vec<TableLoad> {
            vec![TableLoad {
                table: "no2_t".to_string(),
                rows,
            }]
        }
    }

    #[tokio::test]
    async fn test_same_row_twice_persists_once() {
        // ---
        let f = fixture().await;
        let loads = f.load(vec![f.candidate("5", 0)]);

        let first = Loader::new(&f.store).load(&loads).await.unwrap();
        let second = Loader::new(&f.store).load(&loads).await.unwrap();

        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.conflicts, 1);
        assert_eq!(second.discarded, 1);
        assert_eq!(f.store.rows("no2_t").len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_hash_across_tables_is_dropped() {
        // ---
        let f = fixture().await;
        f.store.create_value_table("so2_t").await.unwrap();
        let loads = vec![
            TableLoad {
                table: "no2_t".into(),
                rows: vec![f.candidate("80", 0)],
            },
            TableLoad {
                table: "so2_t".into(),
                rows: vec![f.candidate("80", 0)],
            },
        ];

        let report = Loader::new(&f.store).load(&loads).await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(f.store.rows("no2_t").len(), 1);
        assert!(f.store.rows("so2_t").is_empty());
    }

    #[tokio::test]
    async fn test_repeat_hash_within_call_is_dropped() {
        // ---
        let f = fixture().await;
        let loads = f.load(vec![f.candidate("5", 0), f.candidate("5", 0), f.candidate("6", 0)]);

        let report = Loader::new(&f.store).load(&loads).await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.conflicts, 0);
    }

    #[tokio::test]
    async fn test_missing_timestamp_falls_back_to_ingestion_time() {
        // ---
        let f = fixture().await;
        let mut candidate = f.candidate("5", 0);
        candidate.api_timestamp = None;
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();

        Loader::new(&f.store)
            .ingested_at(at)
            .load(&f.load(vec![candidate]))
            .await
            .unwrap();

        let rows = f.store.rows("no2_t");
        assert_eq!(rows[0].api_timestamp, at);
        assert_eq!(rows[0].timestamp, Some(at));
    }

    #[tokio::test]
    async fn test_fresh_rows_flush_in_windows() {
        // ---
        let f = fixture().await;
        let rows: Vec<ValueCandidate> = (0..25).map(|m| f.candidate("1", m)).collect();

        let report = Loader::new(&f.store).load(&f.load(rows)).await.unwrap();

        assert_eq!(report.inserted, 25);
        assert_eq!(report.discarded, 0);
        assert_eq!(f.store.rows("no2_t").len(), 25);
    }

    /// Known at-most-once behaviour: one already-persisted row poisons its
    /// flush window and every later window of the same attribute.
    #[tokio::test]
    async fn test_conflict_drops_co_batched_siblings() {
        // ---
        let f = fixture().await;
        Loader::new(&f.store)
            .load(&f.load(vec![f.candidate("old", 3)]))
            .await
            .unwrap();

        // Position 0 flushes alone; positions 1..=10 share the next window,
        // which contains the conflicting row at position 3. Positions
        // 11..=14 join the queue and conflict once more at the attribute end.
        let mut rows: Vec<ValueCandidate> = (0..15).map(|m| f.candidate("new", m)).collect();
        rows[3] = f.candidate("old", 3);

        let report = Loader::new(&f.store).load(&f.load(rows)).await.unwrap();

        assert_eq!(report.inserted, 1, "only the first window commits");
        assert_eq!(report.conflicts, 2);
        assert_eq!(report.discarded, 14);
        assert_eq!(f.store.rows("no2_t").len(), 2);
    }

    #[tokio::test]
    async fn test_poisoned_attribute_does_not_block_other_tables() {
        // ---
        let f = fixture().await;
        f.store.create_value_table("so2_t").await.unwrap();
        Loader::new(&f.store)
            .load(&f.load(vec![f.candidate("old", 0)]))
            .await
            .unwrap();

        let loads = vec![
            TableLoad {
                table: "no2_t".into(),
                rows: vec![f.candidate("x", 1), f.candidate("old", 0)],
            },
            TableLoad {
                table: "so2_t".into(),
                rows: vec![f.candidate("y", 1), f.candidate("z", 2)],
            },
        ];
        let report = Loader::new(&f.store).load(&loads).await.unwrap();

        assert_eq!(f.store.rows("so2_t").len(), 2);
        assert_eq!(f.store.rows("no2_t").len(), 2);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.discarded, 1);
    }
}
