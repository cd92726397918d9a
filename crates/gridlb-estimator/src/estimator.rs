//! Complexity estimator — local cache, then durable store, then regression.
//!
//! ```text
//! estimate(workload, params)
//!   model   = calibration[workload]          (unknown → hard error)
//!   key     = "{workload}|{canonical params}"
//!   cache   hit  → normalize(raw), fresh = entry was approximated
//!   store   hit  → cache(measured), normalize(raw), fresh = false
//!   else         → cache(approximated), normalize(model(params)), fresh = true
//! ```

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gridlb_core::{EstimatorConfig, ExecutionStats, Params, canonical_params};

use crate::cache::LruCache;
use crate::calibration::CalibrationTable;
use crate::error::EstimatorResult;
use crate::store::{Measurement, MetricsStore};

/// Estimated cost of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    /// Normalized complexity score.
    pub value: u64,
    /// The score came from the regression model; the caller should capture
    /// real execution statistics for future calibration.
    pub freshly_approximated: bool,
}

/// Raw (pre-normalization) score held in the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedCost {
    raw: u64,
    approximated: bool,
}

pub struct ComplexityEstimator {
    cache: LruCache<String, CachedCost>,
    store: Arc<dyn MetricsStore>,
    calibration: RwLock<Arc<CalibrationTable>>,
}

impl ComplexityEstimator {
    pub fn new(store: Arc<dyn MetricsStore>, calibration: CalibrationTable, cache_capacity: usize) -> Self {
        Self {
            cache: LruCache::new(cache_capacity),
            store,
            calibration: RwLock::new(Arc::new(calibration)),
        }
    }

    /// Build from config: custom calibration file if set, else the built-in table.
    pub fn from_config(store: Arc<dyn MetricsStore>, config: &EstimatorConfig) -> EstimatorResult<Self> {
        let calibration = match &config.calibration_path {
            Some(path) => CalibrationTable::from_file(path)?,
            None => CalibrationTable::builtin()?,
        };
        info!(
            version = calibration.version,
            workloads = calibration.workloads.len(),
            cache_capacity = config.cache_capacity,
            "complexity estimator initialized"
        );
        Ok(Self::new(store, calibration, config.cache_capacity))
    }

    /// Estimate the cost of running `workload` with `params`.
    pub async fn estimate(&self, workload: &str, params: &Params) -> EstimatorResult<ComplexityEstimate> {
        let workload = workload.to_ascii_lowercase();
        let calibration = self.calibration();
        let model = calibration.model(&workload)?;
        let canonical = canonical_params(params);
        let key = cache_key(&workload, &canonical);

        if let Some(cached) = self.cache.get(&key) {
            debug!(%workload, params = %canonical, raw = cached.raw, "complexity cache hit");
            return Ok(ComplexityEstimate {
                value: model.normalize(cached.raw),
                freshly_approximated: cached.approximated,
            });
        }

        match self.store.lookup(&workload, &canonical).await {
            Ok(Some(raw)) => {
                debug!(%workload, params = %canonical, raw, "complexity found in store");
                self.cache.insert(key, CachedCost { raw, approximated: false });
                return Ok(ComplexityEstimate {
                    value: model.normalize(raw),
                    freshly_approximated: false,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%workload, error = %e, "measurement store lookup failed, using regression");
            }
        }

        let raw = model.approximate(&workload, params)?;
        debug!(%workload, params = %canonical, raw, "complexity approximated");
        self.cache.insert(key, CachedCost { raw, approximated: true });
        Ok(ComplexityEstimate {
            value: model.normalize(raw),
            freshly_approximated: true,
        })
    }

    /// Persist a real measurement and prefer it for future estimates.
    ///
    /// Returns the measured (raw) complexity. The cache is updated even
    /// when the durable write fails.
    pub async fn record_measurement(
        &self,
        workload: &str,
        params: &Params,
        stats: &ExecutionStats,
    ) -> EstimatorResult<u64> {
        let workload = workload.to_ascii_lowercase();
        let complexity = self.calibration().model(&workload)?.measured_complexity(stats);
        let canonical = canonical_params(params);

        self.cache.insert(
            cache_key(&workload, &canonical),
            CachedCost {
                raw: complexity,
                approximated: false,
            },
        );

        self.store
            .store(&workload, params, &Measurement { stats: *stats, complexity })
            .await?;
        debug!(%workload, params = %canonical, complexity, "measurement recorded");
        Ok(complexity)
    }

    /// Swap in a recalibrated table. Cached raw scores stay valid since
    /// normalization is applied on every read.
    pub fn replace_calibration(&self, table: CalibrationTable) {
        info!(version = table.version, "calibration table replaced");
        *self.calibration.write() = Arc::new(table);
    }

    pub fn reload_calibration(&self, path: &Path) -> EstimatorResult<()> {
        self.replace_calibration(CalibrationTable::from_file(path)?);
        Ok(())
    }

    pub fn calibration_version(&self) -> u32 {
        self.calibration.read().version
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    fn calibration(&self) -> Arc<CalibrationTable> {
        Arc::clone(&self.calibration.read())
    }
}

fn cache_key(workload: &str, canonical_params: &str) -> String {
    format!("{workload}|{canonical_params}")
}
