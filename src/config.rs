//! Configuration for the bus, the store and the monitor
//!
//! Configs are plain serde structs with defaults; durations are serialized
//! as milliseconds. Loading them is up to the application, `from_json_str`
//! and `from_json_file` are provided for convenience.

use crate::error::{EventError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Parse a config from a JSON string
pub fn from_json_str<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// Parse a config from a JSON file
pub fn from_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|e| {
        EventError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&json).map_err(|e| {
        EventError::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Worker pool and batching configuration for the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerPoolConfig {
    /// Workers kept alive at all times
    pub min_workers: usize,

    /// Hard ceiling on concurrently running workers
    pub max_workers: usize,

    /// Depth of the bounded task queue
    pub queue_size: usize,

    /// Tasks per batch before an immediate flush
    pub batch_size: usize,

    /// Upper bound on how long a partial batch waits
    #[serde(rename = "batchTimeoutMs", with = "duration_ms")]
    pub batch_timeout: Duration,

    /// Queue utilization above which the pool grows
    pub scale_up_threshold: f64,

    /// Queue utilization below which the pool shrinks
    pub scale_down_threshold: f64,

    /// Minimum time between two scale events
    #[serde(rename = "scaleCooldownMs", with = "duration_ms")]
    pub scale_cooldown: Duration,

    /// How often queue utilization is sampled
    #[serde(rename = "scaleIntervalMs", with = "duration_ms")]
    pub scale_interval: Duration,

    /// Ceiling on how long `stop` waits for in-flight work
    #[serde(rename = "shutdownTimeoutMs", with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Processing-time samples kept for latency statistics
    pub latency_history: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 20,
            queue_size: 1000,
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_cooldown: Duration::from_secs(30),
            scale_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            latency_history: 1000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(EventError::Config("maxWorkers must be >= 1".to_string()));
        }
        if self.min_workers > self.max_workers {
            return Err(EventError::Config(format!(
                "minWorkers ({}) exceeds maxWorkers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.queue_size == 0 {
            return Err(EventError::Config("queueSize must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(EventError::Config("batchSize must be >= 1".to_string()));
        }
        if self.batch_timeout.is_zero() || self.scale_interval.is_zero() {
            return Err(EventError::Config(
                "batchTimeout and scaleInterval must be non-zero".to_string(),
            ));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.scale_up_threshold) || !in_unit(self.scale_down_threshold) {
            return Err(EventError::Config(
                "scale thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(EventError::Config(
                "scaleDownThreshold must be below scaleUpThreshold".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of sealed batches that may wait for processing
    pub fn batch_backlog(&self) -> usize {
        (self.queue_size / self.batch_size.max(1)).max(1)
    }
}

/// Event store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventStoreConfig {
    /// Maximum retained events; 0 disables the bound
    pub max_events: usize,

    /// Maximum age since storage; zero disables retention
    #[serde(rename = "retentionTimeMs", with = "duration_ms")]
    pub retention_time: Duration,

    /// How often a configured snapshot is flushed
    #[serde(rename = "flushIntervalMs", with = "duration_ms")]
    pub flush_interval: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            retention_time: Duration::from_secs(24 * 60 * 60),
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl EventStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(EventError::Config(
                "flushInterval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval of the background retention sweep
    pub fn sweep_interval(&self) -> Duration {
        (self.retention_time / 10).max(Duration::from_secs(1))
    }
}

/// Thresholds that raise monitor alerts when crossed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorThresholds {
    /// Events per second
    pub max_event_rate: f64,

    /// Failed handler invocations / processed invocations
    pub max_error_rate: f64,

    /// Average handler processing time
    #[serde(rename = "maxLatencyMs", with = "duration_ms")]
    pub max_latency: Duration,

    pub max_queue_utilization: f64,

    pub max_worker_utilization: f64,

    /// Minimum events per second; 0 disables the check
    pub min_throughput: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            max_event_rate: 1000.0,
            max_error_rate: 0.05,
            max_latency: Duration::from_secs(1),
            max_queue_utilization: 0.8,
            max_worker_utilization: 0.9,
            min_throughput: 0.0,
        }
    }
}

/// Event monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Sampling period of bus statistics
    #[serde(rename = "metricsIntervalMs", with = "duration_ms")]
    pub metrics_interval: Duration,

    /// Period of health evaluation
    #[serde(rename = "healthIntervalMs", with = "duration_ms")]
    pub health_interval: Duration,

    /// Period of threshold evaluation
    #[serde(rename = "alertIntervalMs", with = "duration_ms")]
    pub alert_interval: Duration,

    /// Data points kept per time series
    pub history_size: usize,

    pub thresholds: MonitorThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(10),
            health_interval: Duration::from_secs(60),
            alert_interval: Duration::from_secs(30),
            history_size: 1000,
            thresholds: MonitorThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.metrics_interval.is_zero()
            || self.health_interval.is_zero()
            || self.alert_interval.is_zero()
        {
            return Err(EventError::Config(
                "monitor intervals must be non-zero".to_string(),
            ));
        }
        if self.history_size == 0 {
            return Err(EventError::Config("historySize must be >= 1".to_string()));
        }
        Ok(())
    }
}
