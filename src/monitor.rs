//! Event bus monitoring
//!
//! `EventMonitor` samples an [`EventBus`] on a fixed period and derives
//! rates, latency percentiles, component health and threshold alerts from
//! those samples. It only reads bus state; it never subscribes to the bus.

use crate::bus::EventBus;
use crate::config::{duration_ms, MonitorConfig, MonitorThresholds};
use crate::error::{EventError, Result};
use crate::pool::PoolStats;
use crate::types::{Event, EventStats, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const COMPONENT: &str = "event monitor";

/// Window used for rate-based alert checks
const ALERT_WINDOW: Duration = Duration::from_secs(300);

/// Called once when an alert is raised
pub type AlertHandler = Arc<dyn Fn(&Alert) + Send + Sync>;

// ─── Report types ───

/// One bus sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatePoint {
    pub at: DateTime<Utc>,
    /// Events per second since the previous sample
    pub rate: f64,
    pub total_events: u64,
    pub processed_tasks: u64,
    pub total_errors: u64,
}

/// Activity over a trailing window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    #[serde(rename = "windowMs", with = "duration_ms")]
    pub window: Duration,
    pub event_count: u64,
    pub event_rate: f64,
    pub error_count: u64,
    /// Failed invocations / completed invocations
    pub error_rate: f64,
    /// Completed handler invocations per second
    pub throughput: f64,
    /// Average age of events passed to `record_event`
    #[serde(rename = "averageLagMs", with = "duration_ms")]
    pub average_lag: Duration,
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStats {
    #[serde(rename = "windowMs", with = "duration_ms")]
    pub window: Duration,
    pub current_rate: f64,
    pub average_rate: f64,
    pub peak_rate: f64,
    pub min_rate: f64,
    pub history: Vec<RatePoint>,
}

/// Handler processing time distribution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    #[serde(rename = "averageMs", with = "duration_ms")]
    pub average: Duration,
    #[serde(rename = "minMs", with = "duration_ms")]
    pub min: Duration,
    #[serde(rename = "maxMs", with = "duration_ms")]
    pub max: Duration,
    #[serde(rename = "p50Ms", with = "duration_ms")]
    pub p50: Duration,
    #[serde(rename = "p95Ms", with = "duration_ms")]
    pub p95: Duration,
    #[serde(rename = "p99Ms", with = "duration_ms")]
    pub p99: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let count = samples.len();
        let total: Duration = samples.iter().sum();
        let pick = |pct: usize| samples[(count * pct / 100).min(count - 1)];
        Self {
            count,
            average: total / count as u32,
            min: samples[0],
            max: samples[count - 1],
            p50: pick(50),
            p95: pick(95),
            p99: pick(99),
        }
    }
}

/// Everything the monitor knows about the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    #[serde(flatten)]
    pub bus: EventStats,
    pub pool: Option<PoolStats>,
    pub error_rate: f64,
    pub current_rate: f64,
    pub peak_rate: f64,
    pub latency: LatencyStats,
    pub subscriptions_by_type: HashMap<EventType, usize>,
    pub subscriptions_by_group: HashMap<String, usize>,
    /// Events passed to `record_event`
    pub recorded_events: u64,
    pub recorded_counts: HashMap<EventType, u64>,
    #[serde(rename = "minLagMs", with = "duration_ms")]
    pub min_lag: Duration,
    #[serde(rename = "maxLagMs", with = "duration_ms")]
    pub max_lag: Duration,
    #[serde(rename = "uptimeMs", with = "duration_ms")]
    pub uptime: Duration,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }

    fn severity(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Warning => 2,
            Self::Critical => 3,
        }
    }

    fn penalty(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 10,
            Self::Warning => 25,
            Self::Critical => 50,
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub component: String,
    pub level: HealthLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Worst component level
    pub overall: HealthLevel,
    /// 0-100
    pub score: u8,
    pub components: BTreeMap<String, HealthLevel>,
    pub issues: Vec<HealthIssue>,
    pub checked_at: DateTime<Utc>,
    #[serde(rename = "uptimeMs", with = "duration_ms")]
    pub uptime: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    EventRate,
    ErrorRate,
    Latency,
    QueueUtilization,
    WorkerUtilization,
    Throughput,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventRate => "event_rate",
            Self::ErrorRate => "error_rate",
            Self::Latency => "latency",
            Self::QueueUtilization => "queue_utilization",
            Self::WorkerUtilization => "worker_utilization",
            Self::Throughput => "throughput",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// A threshold breach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    pub threshold: f64,
    pub value: f64,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Consecutive checks that found the breach
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Prometheus,
}

// ─── Monitor ───

struct LagPoint {
    at: DateTime<Utc>,
    lag: Duration,
}

#[derive(Default)]
struct Samples {
    rates: VecDeque<RatePoint>,
    lags: VecDeque<LagPoint>,
    peak_rate: f64,
    recorded_events: u64,
    recorded_counts: HashMap<EventType, u64>,
    min_lag: Option<Duration>,
    max_lag: Option<Duration>,
    /// `dropped_events` at the previous health check
    dropped_at_last_check: u64,
    last_overall: Option<HealthLevel>,
}

#[derive(Default)]
struct AlertBook {
    active: HashMap<AlertKind, Alert>,
    resolved: VecDeque<Alert>,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: Instant,
}

/// Derives statistics, health and alerts from an event bus
pub struct EventMonitor {
    bus: Arc<EventBus>,
    config: MonitorConfig,
    thresholds: RwLock<MonitorThresholds>,
    samples: Mutex<Samples>,
    alerts: Mutex<AlertBook>,
    alert_handlers: RwLock<HashMap<String, AlertHandler>>,
    running: Mutex<Option<Running>>,
}

impl EventMonitor {
    pub fn new(bus: Arc<EventBus>, config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bus,
            thresholds: RwLock::new(config.thresholds.clone()),
            config,
            samples: Mutex::new(Samples::default()),
            alerts: Mutex::new(AlertBook::default()),
            alert_handlers: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start periodic sampling, health checks and alert evaluation
    ///
    /// The loops stop when `ctx` is cancelled, on [`stop`](Self::stop), or
    /// once the last `Arc` to the monitor is dropped.
    pub async fn start(self: &Arc<Self>, ctx: &CancellationToken) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(EventError::AlreadyRunning(COMPONENT));
        }

        let cancel = ctx.child_token();
        let tracker = TaskTracker::new();
        let weak = Arc::downgrade(self);

        tracker.spawn(periodic(
            weak.clone(),
            cancel.clone(),
            self.config.metrics_interval,
            |monitor| async move {
                monitor.sample();
            },
        ));
        tracker.spawn(periodic(
            weak.clone(),
            cancel.clone(),
            self.config.health_interval,
            |monitor| async move {
                monitor.health().await;
            },
        ));
        tracker.spawn(periodic(
            weak,
            cancel.clone(),
            self.config.alert_interval,
            |monitor| async move {
                monitor.check_alerts().await;
            },
        ));
        tracker.close();

        *running = Some(Running {
            cancel,
            tracker,
            started: Instant::now(),
        });
        tracing::info!(
            metrics_ms = self.config.metrics_interval.as_millis() as u64,
            health_ms = self.config.health_interval.as_millis() as u64,
            alert_ms = self.config.alert_interval.as_millis() as u64,
            "Event monitor started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let running = lock(&self.running)
            .take()
            .ok_or(EventError::NotRunning(COMPONENT))?;
        running.cancel.cancel();
        running.tracker.wait().await;
        tracing::info!("Event monitor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    fn uptime(&self) -> Duration {
        lock(&self.running)
            .as_ref()
            .map_or(Duration::ZERO, |running| running.started.elapsed())
    }

    // ─── Sampling ───

    /// Take one bus sample now
    pub fn sample(&self) -> RatePoint {
        let stats = self.bus.stats();
        let now = Utc::now();
        let mut samples = lock(&self.samples);

        let rate = samples.rates.back().map_or(0.0, |prev| {
            let secs = seconds_between(prev.at, now);
            if secs > 0.0 {
                stats.total_events.saturating_sub(prev.total_events) as f64 / secs
            } else {
                0.0
            }
        });
        let point = RatePoint {
            at: now,
            rate,
            total_events: stats.total_events,
            processed_tasks: stats.processed_tasks,
            total_errors: stats.total_errors(),
        };

        samples.peak_rate = samples.peak_rate.max(rate);
        samples.rates.push_back(point.clone());
        while samples.rates.len() > self.config.history_size {
            samples.rates.pop_front();
        }
        tracing::trace!(rate, total_events = point.total_events, "Bus sampled");
        point
    }

    /// Record delivery of an event; its age feeds the lag figures
    pub fn record_event(&self, event: &Event) {
        let now = Utc::now();
        let lag = (now - event.timestamp).to_std().unwrap_or(Duration::ZERO);
        let mut samples = lock(&self.samples);

        samples.recorded_events += 1;
        *samples
            .recorded_counts
            .entry(event.event_type.clone())
            .or_insert(0) += 1;
        samples.min_lag = Some(samples.min_lag.map_or(lag, |min| min.min(lag)));
        samples.max_lag = Some(samples.max_lag.map_or(lag, |max| max.max(lag)));
        samples.lags.push_back(LagPoint { at: now, lag });
        while samples.lags.len() > self.config.history_size {
            samples.lags.pop_front();
        }
    }

    /// Activity between the newest sample and the last sample taken at or
    /// before `now - window`
    pub fn realtime_stats(&self, window: Duration) -> RealtimeStats {
        let now = Utc::now();
        let cutoff = cutoff(now, window);
        let samples = lock(&self.samples);

        let mut stats = RealtimeStats {
            window,
            collected_at: Some(now),
            ..Default::default()
        };

        let lags: Vec<Duration> = samples
            .lags
            .iter()
            .filter(|point| point.at > cutoff)
            .map(|point| point.lag)
            .collect();
        if !lags.is_empty() {
            stats.average_lag = lags.iter().sum::<Duration>() / lags.len() as u32;
        }

        let Some(latest) = samples.rates.back() else {
            return stats;
        };
        let Some(base) = samples
            .rates
            .iter()
            .rev()
            .find(|point| point.at <= cutoff)
            .or_else(|| samples.rates.front())
        else {
            return stats;
        };

        stats.event_count = latest.total_events.saturating_sub(base.total_events);
        stats.error_count = latest.total_errors.saturating_sub(base.total_errors);
        let processed = latest.processed_tasks.saturating_sub(base.processed_tasks);
        if processed > 0 {
            stats.error_rate = stats.error_count as f64 / processed as f64;
        }
        let secs = seconds_between(base.at, latest.at);
        if secs > 0.0 {
            stats.event_rate = stats.event_count as f64 / secs;
            stats.throughput = processed as f64 / secs;
        }
        stats
    }

    pub fn rate_stats(&self, window: Duration) -> RateStats {
        let cutoff = cutoff(Utc::now(), window);
        let history: Vec<RatePoint> = lock(&self.samples)
            .rates
            .iter()
            .filter(|point| point.at > cutoff)
            .cloned()
            .collect();

        let mut stats = RateStats {
            window,
            ..Default::default()
        };
        let Some(latest) = history.last() else {
            return stats;
        };
        stats.current_rate = latest.rate;
        stats.peak_rate = history.iter().map(|p| p.rate).fold(f64::MIN, f64::max);
        stats.min_rate = history.iter().map(|p| p.rate).fold(f64::MAX, f64::min);
        stats.average_rate = history.iter().map(|p| p.rate).sum::<f64>() / history.len() as f64;
        stats.history = history;
        stats
    }

    pub fn latency_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(self.bus.processing_times())
    }

    pub async fn stats(&self) -> MonitorStats {
        let bus = self.bus.stats();
        let pool = self.bus.pool_stats().await;
        let error_rate = ratio(bus.total_errors(), bus.processed_tasks);
        let latency = self.latency_stats();
        let uptime = self.uptime();
        let samples = lock(&self.samples);

        MonitorStats {
            error_rate,
            current_rate: samples.rates.back().map_or(0.0, |p| p.rate),
            peak_rate: samples.peak_rate,
            latency,
            subscriptions_by_type: self.bus.subscriptions_by_type(),
            subscriptions_by_group: self.bus.subscriptions_by_group(),
            recorded_events: samples.recorded_events,
            recorded_counts: samples.recorded_counts.clone(),
            min_lag: samples.min_lag.unwrap_or_default(),
            max_lag: samples.max_lag.unwrap_or_default(),
            uptime,
            collected_at: Utc::now(),
            bus,
            pool,
        }
    }

    // ─── Health ───

    /// Evaluate component health now
    pub async fn health(&self) -> HealthReport {
        let thresholds = self.thresholds();
        let stats = self.bus.stats();
        let pool = self.bus.pool_stats().await;
        let mut issues = Vec::new();
        let mut components = BTreeMap::new();

        let mut assess = |component: &str, level: HealthLevel, message: Option<String>| {
            components.insert(component.to_string(), level);
            if let Some(message) = message {
                issues.push(HealthIssue {
                    component: component.to_string(),
                    level,
                    message,
                });
            }
        };

        if self.bus.is_running() {
            assess("event_bus", HealthLevel::Healthy, None);
        } else {
            assess(
                "event_bus",
                HealthLevel::Critical,
                Some("event bus is not running".to_string()),
            );
        }

        match &pool {
            None => {
                assess("queue", HealthLevel::Unknown, None);
                assess("workers", HealthLevel::Unknown, None);
            }
            Some(pool) => {
                let queue = pool.queue_utilization();
                if queue >= 1.0 {
                    assess(
                        "queue",
                        HealthLevel::Critical,
                        Some(format!("task queue full ({} tasks)", pool.queue_depth)),
                    );
                } else if queue > thresholds.max_queue_utilization {
                    assess(
                        "queue",
                        HealthLevel::Warning,
                        Some(format!("task queue at {:.0}%", queue * 100.0)),
                    );
                } else {
                    assess("queue", HealthLevel::Healthy, None);
                }

                let workers = pool.worker_utilization();
                if pool.current_workers == 0 && pool.queue_depth > 0 {
                    assess(
                        "workers",
                        HealthLevel::Critical,
                        Some(format!("no workers for {} queued tasks", pool.queue_depth)),
                    );
                } else if workers > thresholds.max_worker_utilization {
                    assess(
                        "workers",
                        HealthLevel::Warning,
                        Some(format!("workers {:.0}% busy", workers * 100.0)),
                    );
                } else {
                    assess("workers", HealthLevel::Healthy, None);
                }
            }
        }

        let dropped_since = {
            let mut samples = lock(&self.samples);
            let since = stats
                .dropped_events
                .saturating_sub(samples.dropped_at_last_check);
            samples.dropped_at_last_check = stats.dropped_events;
            since
        };
        let error_rate = ratio(stats.total_errors(), stats.processed_tasks);
        if error_rate > thresholds.max_error_rate * 2.0 {
            assess(
                "errors",
                HealthLevel::Critical,
                Some(format!("handler error rate {:.1}%", error_rate * 100.0)),
            );
        } else if error_rate > thresholds.max_error_rate {
            assess(
                "errors",
                HealthLevel::Warning,
                Some(format!("handler error rate {:.1}%", error_rate * 100.0)),
            );
        } else if dropped_since > 0 {
            assess(
                "errors",
                HealthLevel::Warning,
                Some(format!("{} events dropped since last check", dropped_since)),
            );
        } else {
            assess("errors", HealthLevel::Healthy, None);
        }

        let overall = components
            .values()
            .copied()
            .max_by_key(HealthLevel::severity)
            .unwrap_or(HealthLevel::Unknown);
        let penalty: u32 = components.values().map(|l| l.penalty() as u32).sum();
        let score = 100u32.saturating_sub(penalty) as u8;

        let previous = lock(&self.samples).last_overall.replace(overall);
        if previous != Some(overall) {
            if overall.severity() > previous.map_or(0, |p| p.severity()) {
                tracing::warn!(%overall, score, issues = issues.len(), "Event bus health degraded");
            } else {
                tracing::info!(%overall, score, "Event bus health changed");
            }
        }

        HealthReport {
            overall,
            score,
            components,
            issues,
            checked_at: Utc::now(),
            uptime: self.uptime(),
        }
    }

    // ─── Alerts ───

    pub fn set_thresholds(&self, thresholds: MonitorThresholds) {
        *self
            .thresholds
            .write()
            .unwrap_or_else(PoisonError::into_inner) = thresholds;
    }

    pub fn thresholds(&self) -> MonitorThresholds {
        self.thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Unresolved alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = lock(&self.alerts).active.values().cloned().collect();
        alerts.sort_by_key(|alert| alert.triggered_at);
        alerts
    }

    /// Recently resolved alerts, oldest first
    pub fn resolved_alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).resolved.iter().cloned().collect()
    }

    pub fn subscribe_alerts(&self, handler: impl Fn(&Alert) + Send + Sync + 'static) -> String {
        let id = format!("alert-sub-{}", uuid::Uuid::new_v4());
        self.alert_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(handler));
        id
    }

    /// Returns false for an unknown id
    pub fn unsubscribe_alerts(&self, id: &str) -> bool {
        self.alert_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Compare current metrics to the thresholds
    ///
    /// Raises alerts for new breaches, bumps the count of ongoing ones and
    /// resolves those back within bounds. Returns the newly raised alerts;
    /// alert handlers are notified of each of them.
    pub async fn check_alerts(&self) -> Vec<Alert> {
        let thresholds = self.thresholds();
        let realtime = self.realtime_stats(ALERT_WINDOW);
        let latency = self.latency_stats();
        let pool = self.bus.pool_stats().await;
        let sampled = lock(&self.samples).rates.len() >= 2;

        let mut checks = vec![
            Check::above(
                AlertKind::EventRate,
                realtime.event_rate,
                thresholds.max_event_rate,
            ),
            Check::above(
                AlertKind::ErrorRate,
                realtime.error_rate,
                thresholds.max_error_rate,
            ),
            Check::above(
                AlertKind::Latency,
                latency.average.as_secs_f64() * 1000.0,
                thresholds.max_latency.as_secs_f64() * 1000.0,
            ),
        ];
        if let Some(pool) = &pool {
            checks.push(Check::above(
                AlertKind::QueueUtilization,
                pool.queue_utilization(),
                thresholds.max_queue_utilization,
            ));
            checks.push(Check::above(
                AlertKind::WorkerUtilization,
                pool.worker_utilization(),
                thresholds.max_worker_utilization,
            ));
        }
        if thresholds.min_throughput > 0.0 && sampled {
            checks.push(Check::below(
                AlertKind::Throughput,
                realtime.throughput,
                thresholds.min_throughput,
            ));
        }

        let raised = self.apply_checks(checks);

        if !raised.is_empty() {
            let handlers: Vec<AlertHandler> = self
                .alert_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for alert in &raised {
                for handler in &handlers {
                    handler(alert);
                }
            }
        }
        raised
    }

    fn apply_checks(&self, checks: Vec<Check>) -> Vec<Alert> {
        let now = Utc::now();
        let mut raised = Vec::new();
        let mut book = lock(&self.alerts);

        for check in checks {
            match (check.breached(), book.active.contains_key(&check.kind)) {
                (true, true) => {
                    if let Some(alert) = book.active.get_mut(&check.kind) {
                        alert.count += 1;
                        alert.value = check.value;
                        alert.level = check.level();
                        alert.message = check.message();
                    }
                }
                (true, false) => {
                    let alert = Alert {
                        id: format!("alert-{}", uuid::Uuid::new_v4()),
                        kind: check.kind,
                        level: check.level(),
                        message: check.message(),
                        threshold: check.threshold,
                        value: check.value,
                        triggered_at: now,
                        resolved_at: None,
                        count: 1,
                    };
                    tracing::warn!(
                        alert_id = %alert.id,
                        kind = %alert.kind,
                        value = alert.value,
                        threshold = alert.threshold,
                        "Alert raised"
                    );
                    book.active.insert(check.kind, alert.clone());
                    raised.push(alert);
                }
                (false, true) => {
                    if let Some(mut alert) = book.active.remove(&check.kind) {
                        alert.resolved_at = Some(now);
                        alert.value = check.value;
                        tracing::info!(alert_id = %alert.id, kind = %alert.kind, "Alert resolved");
                        book.resolved.push_back(alert);
                        while book.resolved.len() > self.config.history_size {
                            book.resolved.pop_front();
                        }
                    }
                }
                (false, false) => {}
            }
        }
        raised
    }

    // ─── Export ───

    pub async fn export_stats(&self, format: ExportFormat) -> Result<String> {
        let stats = self.stats().await;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&stats)?),
            ExportFormat::Csv => Ok(export_csv(&stats)),
            ExportFormat::Prometheus => Ok(export_prometheus(&stats)),
        }
    }
}

struct Check {
    kind: AlertKind,
    value: f64,
    threshold: f64,
    below: bool,
}

impl Check {
    fn above(kind: AlertKind, value: f64, threshold: f64) -> Self {
        Self {
            kind,
            value,
            threshold,
            below: false,
        }
    }

    fn below(kind: AlertKind, value: f64, threshold: f64) -> Self {
        Self {
            kind,
            value,
            threshold,
            below: true,
        }
    }

    fn breached(&self) -> bool {
        if self.below {
            self.value < self.threshold
        } else {
            self.value > self.threshold
        }
    }

    /// Critical at twice the threshold (or half, for minimums)
    fn level(&self) -> AlertLevel {
        let critical = if self.below {
            self.value <= self.threshold / 2.0
        } else {
            self.value >= self.threshold * 2.0
        };
        if critical {
            AlertLevel::Critical
        } else {
            AlertLevel::Warning
        }
    }

    fn message(&self) -> String {
        let bound = if self.below { "below minimum" } else { "above maximum" };
        format!(
            "{} {:.3} {} {:.3}",
            self.kind, self.value, bound, self.threshold
        )
    }
}

/// Run `tick` every `period` until cancelled or the monitor is dropped
async fn periodic<F, Fut>(
    monitor: Weak<EventMonitor>,
    cancel: CancellationToken,
    period: Duration,
    tick: F,
) where
    F: Fn(Arc<EventMonitor>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                tick(monitor).await;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .to_std()
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn sorted<K: Ord + Clone, V: Copy>(map: &HashMap<K, V>) -> Vec<(K, V)> {
    let mut entries: Vec<(K, V)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn export_csv(stats: &MonitorStats) -> String {
    let mut rows: Vec<(String, String, String)> = vec![
        ("total_events".into(), String::new(), stats.bus.total_events.to_string()),
        ("total_subscribers".into(), String::new(), stats.bus.total_subscribers.to_string()),
        ("processed_tasks".into(), String::new(), stats.bus.processed_tasks.to_string()),
        ("dropped_events".into(), String::new(), stats.bus.dropped_events.to_string()),
        ("handler_panics".into(), String::new(), stats.bus.handler_panics.to_string()),
        ("error_rate".into(), String::new(), format!("{:.6}", stats.error_rate)),
        ("current_rate".into(), String::new(), format!("{:.3}", stats.current_rate)),
        ("peak_rate".into(), String::new(), format!("{:.3}", stats.peak_rate)),
        ("latency_avg_ms".into(), String::new(), stats.latency.average.as_millis().to_string()),
        ("latency_p95_ms".into(), String::new(), stats.latency.p95.as_millis().to_string()),
        ("latency_p99_ms".into(), String::new(), stats.latency.p99.as_millis().to_string()),
    ];
    for (event_type, count) in sorted(&stats.bus.event_counts) {
        rows.push(("event_count".into(), event_type.to_string(), count.to_string()));
    }
    for (event_type, count) in sorted(&stats.bus.error_counts) {
        rows.push(("error_count".into(), event_type.to_string(), count.to_string()));
    }
    for (priority, count) in sorted(&stats.bus.priority_counts) {
        rows.push(("priority_count".into(), priority.to_string(), count.to_string()));
    }
    if let Some(pool) = &stats.pool {
        rows.push(("current_workers".into(), String::new(), pool.current_workers.to_string()));
        rows.push(("busy_workers".into(), String::new(), pool.busy_workers.to_string()));
        rows.push(("queue_depth".into(), String::new(), pool.queue_depth.to_string()));
        rows.push(("queue_capacity".into(), String::new(), pool.queue_capacity.to_string()));
    }

    let mut out = String::from("metric,label,value\n");
    for (metric, label, value) in rows {
        out.push_str(&format!("{},{},{}\n", metric, csv_field(&label), value));
    }
    out
}

/// Prometheus text exposition builder
struct Exposition {
    out: String,
}

impl Exposition {
    fn family(&mut self, name: &str, kind: &str, help: &str) -> &mut Self {
        self.out
            .push_str(&format!("# HELP evbus_{} {}\n# TYPE evbus_{} {}\n", name, help, name, kind));
        self
    }

    fn value(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        self.out.push_str(&format!("evbus_{} {}\n", name, value));
        self
    }

    fn labeled(&mut self, name: &str, label: &str, key: &str, value: impl fmt::Display) -> &mut Self {
        let key = key
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n");
        self.out
            .push_str(&format!("evbus_{}{{{}=\"{}\"}} {}\n", name, label, key, value));
        self
    }
}

fn export_prometheus(stats: &MonitorStats) -> String {
    let mut exp = Exposition { out: String::new() };

    exp.family("events_total", "counter", "Events accepted by publish calls")
        .value("events_total", stats.bus.total_events);
    exp.family("events_by_type_total", "counter", "Published events per type");
    for (event_type, count) in sorted(&stats.bus.event_counts) {
        exp.labeled("events_by_type_total", "type", event_type.as_str(), count);
    }
    exp.family("handler_errors_total", "counter", "Failed handler invocations per type");
    for (event_type, count) in sorted(&stats.bus.error_counts) {
        exp.labeled("handler_errors_total", "type", event_type.as_str(), count);
    }
    exp.family("processed_tasks_total", "counter", "Completed handler invocations")
        .value("processed_tasks_total", stats.bus.processed_tasks);
    exp.family("dropped_events_total", "counter", "Async tasks shed under overload")
        .value("dropped_events_total", stats.bus.dropped_events);
    exp.family("handler_panics_total", "counter", "Recovered handler panics")
        .value("handler_panics_total", stats.bus.handler_panics);
    exp.family("subscriptions", "gauge", "Live subscriptions")
        .value("subscriptions", stats.bus.total_subscribers);
    exp.family("error_rate", "gauge", "Failed / completed handler invocations")
        .value("error_rate", stats.error_rate);
    exp.family("event_rate", "gauge", "Events per second at the last sample")
        .value("event_rate", stats.current_rate);
    exp.family("handler_latency_seconds", "gauge", "Handler processing time quantiles");
    for (quantile, value) in [
        ("0.5", stats.latency.p50),
        ("0.95", stats.latency.p95),
        ("0.99", stats.latency.p99),
    ] {
        exp.labeled("handler_latency_seconds", "quantile", quantile, value.as_secs_f64());
    }
    if let Some(pool) = &stats.pool {
        exp.family("workers", "gauge", "Worker pool size by state")
            .labeled("workers", "state", "current", pool.current_workers)
            .labeled("workers", "state", "busy", pool.busy_workers)
            .labeled("workers", "state", "peak", pool.peak_workers);
        exp.family("queue_depth", "gauge", "Tasks waiting in the worker queue")
            .value("queue_depth", pool.queue_depth);
        exp.family("queue_capacity", "gauge", "Worker queue capacity")
            .value("queue_capacity", pool.queue_capacity);
    }
    exp.out
}
