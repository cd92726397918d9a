//! gridlb.toml configuration parser.
//!
//! Every section is optional and falls back to the defaults below.
//! Durations are written as human strings (`"30s"`, `"500ms"`, `"5m"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default complexity capacity of a single worker VM.
pub const DEFAULT_WORKER_CAPACITY: u64 = 44_153_067;

/// Requests cheaper than this go to serverless when no worker has room.
pub const DEFAULT_SERVERLESS_THRESHOLD: u64 = 756_005;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub balancer: BalancerConfig,
    pub estimator: EstimatorConfig,
    pub autoscaler: AutoscalerConfig,
    pub health: HealthCheckConfig,
    /// Workers registered at startup.
    pub workers: Vec<WorkerSpec>,
    pub fleet: FleetConfig,
    pub serverless: Option<ServerlessConfig>,
}

/// What to do when forwarding to the chosen worker fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Surface the failure to the caller.
    #[default]
    FailFast,
    /// Retry on the remaining ranked candidates, one attempt each.
    NextCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub worker_capacity: u64,
    pub serverless_threshold: u64,
    /// Average utilization above which placement spreads load.
    pub spread_threshold: f64,
    /// Average utilization below which placement packs load.
    pub pack_threshold: f64,
    #[serde(with = "duration_str")]
    pub forward_timeout: Duration,
    #[serde(with = "duration_str")]
    pub serverless_timeout: Duration,
    /// Maximum time a request may wait in the overflow queue.
    #[serde(with = "duration_str")]
    pub queue_timeout: Duration,
    /// Period of the queue pump's fallback sweep.
    #[serde(with = "duration_str")]
    pub queue_sweep_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            worker_capacity: DEFAULT_WORKER_CAPACITY,
            serverless_threshold: DEFAULT_SERVERLESS_THRESHOLD,
            spread_threshold: 0.85,
            pack_threshold: 0.25,
            forward_timeout: Duration::from_secs(120),
            serverless_timeout: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(300),
            queue_sweep_interval: Duration::from_secs(1),
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub cache_capacity: usize,
    /// redb file for measured complexities. In-memory when absent.
    pub store_path: Option<PathBuf>,
    /// TOML calibration table overriding the built-in coefficients.
    pub calibration_path: Option<PathBuf>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 5000,
            store_path: None,
            calibration_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub min_workers: usize,
    pub max_workers: usize,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
    /// How far back utilization datapoints are fetched.
    #[serde(with = "duration_str")]
    pub utilization_window: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.85,
            low_threshold: 0.25,
            min_workers: 1,
            max_workers: 5,
            poll_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
            utilization_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Liveness path on each worker.
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            path: "/test".to_string(),
        }
    }
}

/// A worker registered at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Overrides `balancer.worker_capacity`.
    pub capacity: Option<u64>,
}

/// Address pool handed out by the daemon's static fleet on scale-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub slots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerlessConfig {
    /// `host:port` of the function gateway.
    pub endpoint: String,
}

impl GridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the control loops cannot act on.
    pub fn validate(&self) -> ConfigResult<()> {
        let b = &self.balancer;
        if b.worker_capacity == 0 {
            return Err(ConfigError::Invalid("balancer.worker_capacity must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&b.pack_threshold)
            || !(0.0..=1.0).contains(&b.spread_threshold)
            || b.pack_threshold > b.spread_threshold
        {
            return Err(ConfigError::Invalid(
                "balancer thresholds must satisfy 0 <= pack_threshold <= spread_threshold <= 1".into(),
            ));
        }

        let a = &self.autoscaler;
        if a.low_threshold >= a.high_threshold {
            return Err(ConfigError::Invalid(
                "autoscaler.low_threshold must be below high_threshold".into(),
            ));
        }
        if a.min_workers > a.max_workers {
            return Err(ConfigError::Invalid(
                "autoscaler.min_workers must not exceed max_workers".into(),
            ));
        }
        if a.poll_interval.is_zero()
            || self.health.interval.is_zero()
            || b.queue_sweep_interval.is_zero()
        {
            return Err(ConfigError::Invalid("loop intervals must be non-zero".into()));
        }

        for spec in &self.workers {
            if spec.capacity == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "worker {} has zero capacity",
                    spec.id
                )));
            }
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", d.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", d.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s:?}")))
    }
}
