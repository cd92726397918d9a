//! Durable measurement store.
//!
//! `MetricsStore` is the seam to whatever persists real post-execution
//! measurements. `RedbMetricsStore` is the embedded implementation: typed
//! get/put over a single redb table with JSON values, on disk or in memory
//! (the latter for testing). Its async methods run transactions on the
//! blocking pool since a write commit waits on fsync.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use gridlb_core::{ExecutionStats, Params, canonical_params};

use crate::error::{StoreError, StoreResult};
use crate::tables::MEASUREMENTS;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// A measured execution, ready to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub stats: ExecutionStats,
    /// Complexity derived from `stats` with the workload's measured model.
    pub complexity: u64,
}

/// Persisted form of a measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub workload: String,
    /// Canonical parameter string.
    pub parameters: String,
    pub stats: ExecutionStats,
    pub complexity: u64,
    /// Unix timestamp (seconds) of the measurement.
    pub recorded_at: u64,
}

impl MeasurementRecord {
    /// Build the composite key for the measurements table.
    pub fn table_key(&self) -> String {
        table_key(&self.workload, &self.parameters)
    }
}

fn table_key(workload: &str, canonical_params: &str) -> String {
    format!("{workload}:{canonical_params}")
}

/// Durable store of measured complexities keyed by (workload, canonical params).
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Previously measured complexity, if any.
    async fn lookup(&self, workload: &str, canonical_params: &str) -> StoreResult<Option<u64>>;

    /// Persist a measurement, overwriting any earlier one for the same key.
    async fn store(&self, workload: &str, params: &Params, measurement: &Measurement)
    -> StoreResult<()>;
}

/// Thread-safe measurement store backed by redb.
#[derive(Clone)]
pub struct RedbMetricsStore {
    db: Arc<Database>,
}

impl RedbMetricsStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "measurement store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory measurement store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(MEASUREMENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or update a measurement record.
    pub fn put_record(&self, record: &MeasurementRecord) -> StoreResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MEASUREMENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, complexity = record.complexity, "measurement stored");
        Ok(())
    }

    /// Get a measurement record by workload and canonical parameters.
    pub fn get_record(
        &self,
        workload: &str,
        canonical_params: &str,
    ) -> StoreResult<Option<MeasurementRecord>> {
        let key = table_key(workload, canonical_params);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEASUREMENTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: MeasurementRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

}

#[async_trait]
impl MetricsStore for RedbMetricsStore {
    async fn lookup(&self, workload: &str, canonical_params: &str) -> StoreResult<Option<u64>> {
        let store = self.clone();
        let workload = workload.to_string();
        let canonical = canonical_params.to_string();
        let record = tokio::task::spawn_blocking(move || store.get_record(&workload, &canonical))
            .await
            .map_err(map_err!(Unavailable))??;
        Ok(record.map(|record| record.complexity))
    }

    async fn store(
        &self,
        workload: &str,
        params: &Params,
        measurement: &Measurement,
    ) -> StoreResult<()> {
        let store = self.clone();
        let record = MeasurementRecord {
            workload: workload.to_string(),
            parameters: canonical_params(params),
            stats: measurement.stats,
            complexity: measurement.complexity,
            recorded_at: epoch_secs(),
        };
        tokio::task::spawn_blocking(move || store.put_record(&record))
            .await
            .map_err(map_err!(Unavailable))?
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
