//! Handler execution shared by sync publish, workers and batches
//!
//! `Executor` is the single place where a subscriber handler runs. It times
//! the call, isolates panics, records statistics and routes async failures
//! to the dead-letter sink. `DispatchRuntime` bundles the worker pool and the
//! batch processor that exist while the bus is running.

use crate::batch::BatchProcessor;
use crate::config::WorkerPoolConfig;
use crate::dlq::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::error::{EventError, Result};
use crate::handler::{invoke, HandlerResult};
use crate::pool::{PoolStats, WorkerPool};
use crate::subscription::Subscription;
use crate::types::{Event, EventStats, EventType};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;

/// One event bound to one subscription
pub(crate) struct Task {
    pub event: Arc<Event>,
    pub subscription: Subscription,
    pub priority: i32,
    pub enqueued_at: Instant,
}

impl Task {
    pub fn new(event: Arc<Event>, subscription: Subscription, priority: i32) -> Self {
        Self {
            event,
            subscription,
            priority,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Counts {
    event_counts: HashMap<EventType, u64>,
    error_counts: HashMap<EventType, u64>,
    priority_counts: HashMap<i32, u64>,
    last_event_time: Option<DateTime<Utc>>,
}

/// Bus-wide counters
///
/// Single-field counters are atomics; the per-type maps share one lock.
pub(crate) struct StatsRecorder {
    total_events: AtomicU64,
    dropped_events: AtomicU64,
    handler_panics: AtomicU64,
    processed_tasks: AtomicU64,
    counts: Mutex<Counts>,
    processing_times: Mutex<VecDeque<Duration>>,
    history: usize,
}

impl StatsRecorder {
    pub fn new(history: usize) -> Self {
        Self {
            total_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            processed_tasks: AtomicU64::new(0),
            counts: Mutex::new(Counts::default()),
            processing_times: Mutex::new(VecDeque::with_capacity(history.min(1024))),
            history: history.max(1),
        }
    }

    pub fn record_publish(&self, event_type: &EventType) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.event_counts.entry(event_type.clone()).or_insert(0) += 1;
        counts.last_event_time = Some(Utc::now());
    }

    pub fn record_priority(&self, priority: i32) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.priority_counts.entry(priority).or_insert(0) += 1;
    }

    pub fn record_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, event_type: &EventType, elapsed: Duration, result: &HandlerResult) {
        self.processed_tasks.fetch_add(1, Ordering::Relaxed);
        {
            let mut times = self
                .processing_times
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if times.len() == self.history {
                times.pop_front();
            }
            times.push_back(elapsed);
        }
        if let Err(err) = result {
            if err.is_panic() {
                self.handler_panics.fetch_add(1, Ordering::Relaxed);
            }
            let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
            *counts.error_counts.entry(event_type.clone()).or_insert(0) += 1;
        }
    }

    /// Snapshot of all counters; `total_subscribers` is filled by the bus
    pub fn snapshot(&self) -> EventStats {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        EventStats {
            total_events: self.total_events.load(Ordering::Relaxed),
            total_subscribers: 0,
            event_counts: counts.event_counts.clone(),
            error_counts: counts.error_counts.clone(),
            priority_counts: counts.priority_counts.clone(),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            processed_tasks: self.processed_tasks.load(Ordering::Relaxed),
            last_event_time: counts.last_event_time,
        }
    }

    /// Recent handler processing times, oldest first
    pub fn processing_times(&self) -> Vec<Duration> {
        let times = self
            .processing_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        times.iter().copied().collect()
    }
}

/// Runs handlers with panic isolation and accounting
pub(crate) struct Executor {
    stats: Arc<StatsRecorder>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl Executor {
    pub fn new(stats: Arc<StatsRecorder>, dead_letters: Option<Arc<dyn DeadLetterSink>>) -> Self {
        Self {
            stats,
            dead_letters,
        }
    }

    /// Invoke one subscription for one event and record the outcome
    pub async fn run(&self, subscription: &Subscription, event: Arc<Event>) -> HandlerResult {
        let started = Instant::now();
        let result = invoke(subscription.handler.as_ref(), event.clone()).await;
        let elapsed = started.elapsed();

        self.stats.record_outcome(&event.event_type, elapsed, &result);

        if elapsed > subscription.timeout_hint {
            tracing::warn!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                elapsed_ms = elapsed.as_millis() as u64,
                hint_ms = subscription.timeout_hint.as_millis() as u64,
                "Handler exceeded its timeout hint"
            );
        }

        match &result {
            Ok(()) => tracing::debug!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                "Handler completed"
            ),
            Err(e) => tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                subscription_id = %subscription.id,
                kind = e.as_label(),
                error = %e,
                "Handler failed"
            ),
        }

        result
    }

    /// Run an async task; failures go to the dead-letter sink
    pub async fn execute(&self, task: Task) {
        let queued = task.enqueued_at.elapsed();
        tracing::trace!(
            event_id = %task.event.id,
            priority = task.priority,
            queued_us = queued.as_micros() as u64,
            "Dispatching task"
        );
        if let Err(e) = self.run(&task.subscription, task.event.clone()).await {
            self.dead_letter(task, DeadLetterReason::HandlerFailed(e))
                .await;
        }
    }

    /// Account for a task that could not be accepted anywhere
    pub async fn shed(&self, task: Task) {
        self.stats.record_dropped();
        tracing::warn!(
            event_id = %task.event.id,
            event_type = %task.event.event_type,
            subscription_id = %task.subscription.id,
            "Worker queue and batch backlog full, dropping task"
        );
        self.dead_letter(task, DeadLetterReason::Shed).await;
    }

    async fn dead_letter(&self, task: Task, reason: DeadLetterReason) {
        let Some(sink) = &self.dead_letters else {
            return;
        };
        let letter = DeadLetter::new(task.event, task.subscription.id, reason);
        if let Err(e) = sink.handle(letter).await {
            tracing::error!(error = %e, "Failed to record dead letter");
        }
    }
}

/// Worker pool and batch processor of one running period of the bus
pub(crate) struct DispatchRuntime {
    pool: WorkerPool,
    batch: BatchProcessor,
    tracker: TaskTracker,
}

impl DispatchRuntime {
    pub fn start(config: &WorkerPoolConfig, executor: Arc<Executor>) -> Self {
        let tracker = TaskTracker::new();
        let pool = WorkerPool::start(config, executor.clone(), tracker.clone());
        let batch = BatchProcessor::start(config, executor, tracker.clone());
        Self {
            pool,
            batch,
            tracker,
        }
    }

    /// Offer a task to the worker queue, then to the batch accumulator
    ///
    /// Returns the task back when neither can take it.
    pub fn submit(&self, task: Task) -> std::result::Result<(), Task> {
        let task = match self.pool.try_submit(task) {
            Ok(()) => return Ok(()),
            Err(task) => task,
        };
        self.batch.offer(task)
    }

    pub async fn add_workers(&self, n: usize) {
        self.pool.scale_up(n).await;
    }

    pub async fn retire_workers(&self, n: usize) {
        self.pool.retire(n).await;
    }

    pub async fn pool_stats(&self) -> Option<PoolStats> {
        let mut stats = self.pool.snapshot().await?;
        stats.pending_batch_tasks = self.batch.pending();
        stats.batches_processed = self.batch.batches_processed();
        Some(stats)
    }

    /// Close both queues and wait for every accepted task to finish
    pub async fn drain(&self, budget: Duration) -> Result<()> {
        self.tracker.close();
        let drained = tokio::time::timeout(budget, async {
            self.pool.close().await;
            self.batch.close().await;
            self.tracker.wait().await;
        })
        .await;

        drained.map_err(|_| {
            EventError::Timeout(format!(
                "{} dispatch tasks still running after {}ms",
                self.tracker.len(),
                budget.as_millis()
            ))
        })
    }
}
