//! Elastic worker pool
//!
//! A manager task owns the worker set and is driven by messages: explicit
//! scale requests, snapshots, shutdown, and its own periodic scaling check.
//! The scaling decision itself is the pure [`ScalingPolicy::decide`].
//!
//! Workers pull from one bounded queue. A retired worker only exits between
//! tasks; closing the queue lets every worker drain it before exiting.

use crate::config::WorkerPoolConfig;
use crate::dispatch::{Executor, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Workers added per scale-up step
const SCALE_UP_STEP: usize = 2;

/// Workers retired per scale-down step
const SCALE_DOWN_STEP: usize = 1;

/// Point-in-time view of the worker pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub current_workers: usize,
    pub busy_workers: usize,
    /// Highest worker count observed since start
    pub peak_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub last_scale_at: Option<DateTime<Utc>>,
    /// Tasks waiting in the batch accumulator
    pub pending_batch_tasks: usize,
    pub batches_processed: u64,
}

impl PoolStats {
    pub fn queue_utilization(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        self.queue_depth as f64 / self.queue_capacity as f64
    }

    pub fn worker_utilization(&self) -> f64 {
        if self.current_workers == 0 {
            return 0.0;
        }
        self.busy_workers as f64 / self.current_workers as f64
    }
}

/// Inputs to one scaling decision
#[derive(Debug, Clone, Copy)]
pub struct ScalingInput {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub current_workers: usize,
    /// `None` when the pool has never scaled
    pub since_last_scale: Option<Duration>,
}

/// Outcome of a scaling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Up(usize),
    Down(usize),
}

/// Queue-utilization driven scaling rules
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown: Duration,
}

impl From<&WorkerPoolConfig> for ScalingPolicy {
    fn from(config: &WorkerPoolConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            cooldown: config.scale_cooldown,
        }
    }
}

impl ScalingPolicy {
    pub fn decide(&self, input: ScalingInput) -> ScaleDecision {
        if input.current_workers < self.min_workers {
            return ScaleDecision::Up(self.min_workers - input.current_workers);
        }
        // an empty pool with queued work cannot wait for the cooldown
        if input.current_workers == 0 && input.queue_depth > 0 {
            return ScaleDecision::Up(1.min(self.max_workers));
        }
        if matches!(input.since_last_scale, Some(elapsed) if elapsed < self.cooldown) {
            return ScaleDecision::Hold;
        }

        let utilization = if input.queue_capacity == 0 {
            0.0
        } else {
            input.queue_depth as f64 / input.queue_capacity as f64
        };

        if utilization > self.scale_up_threshold && input.current_workers < self.max_workers {
            let room = self.max_workers - input.current_workers;
            ScaleDecision::Up(SCALE_UP_STEP.min(room))
        } else if utilization < self.scale_down_threshold
            && input.current_workers > self.min_workers
        {
            ScaleDecision::Down(SCALE_DOWN_STEP)
        } else {
            ScaleDecision::Hold
        }
    }
}

#[derive(Default)]
struct Gauges {
    current: AtomicUsize,
    busy: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the live worker count when a worker exits
struct WorkerGuard(Arc<Gauges>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Command {
    /// Re-evaluate scaling now instead of at the next tick
    Wake,
    ScaleUp(usize),
    Retire(usize),
    Snapshot(oneshot::Sender<PoolStats>),
    Shutdown,
}

/// Handle to a running worker pool
pub(crate) struct WorkerPool {
    queue: RwLock<Option<mpsc::Sender<Task>>>,
    commands: mpsc::Sender<Command>,
    gauges: Arc<Gauges>,
}

impl WorkerPool {
    /// Spawn the manager and the initial `min_workers` workers
    pub fn start(config: &WorkerPoolConfig, executor: Arc<Executor>, tracker: TaskTracker) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let (command_tx, command_rx) = mpsc::channel(16);
        let gauges = Arc::new(Gauges::default());

        let mut manager = Manager {
            policy: ScalingPolicy::from(config),
            executor,
            receiver: Arc::new(Mutex::new(queue_rx)),
            queue: queue_tx.downgrade(),
            queue_capacity: config.queue_size.max(1),
            gauges: gauges.clone(),
            workers: Vec::new(),
            tracker: tracker.clone(),
            next_worker_id: 0,
            last_scale: None,
            last_scale_at: None,
            scale_ups: 0,
            scale_downs: 0,
        };
        manager.spawn_workers(config.min_workers);

        tracing::info!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            queue_size = config.queue_size,
            "Worker pool started"
        );

        tracker.spawn(manager.run(command_rx, config.scale_interval));

        Self {
            queue: RwLock::new(Some(queue_tx)),
            commands: command_tx,
            gauges,
        }
    }

    /// Enqueue without waiting; the task is handed back when the queue is full or closed
    pub fn try_submit(&self, task: Task) -> Result<(), Task> {
        let queue = self.queue.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = queue.as_ref() else {
            return Err(task);
        };
        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(task) | TrySendError::Closed(task) => task,
        })?;
        // a pool scaled to zero would otherwise sit on the task until the next tick
        if self.gauges.current.load(Ordering::SeqCst) == 0 {
            let _ = self.commands.try_send(Command::Wake);
        }
        Ok(())
    }

    /// Ask the manager to add up to `n` workers (bounded by `max_workers`)
    pub async fn scale_up(&self, n: usize) {
        let _ = self.commands.send(Command::ScaleUp(n)).await;
    }

    /// Ask the manager to retire up to `n` workers (bounded by `min_workers`)
    pub async fn retire(&self, n: usize) {
        let _ = self.commands.send(Command::Retire(n)).await;
    }

    /// `None` once the manager has shut down
    pub async fn snapshot(&self) -> Option<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Close the queue; workers drain what is left and exit
    pub async fn close(&self) {
        let sender = self
            .queue
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

struct Manager {
    policy: ScalingPolicy,
    executor: Arc<Executor>,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    queue: mpsc::WeakSender<Task>,
    queue_capacity: usize,
    gauges: Arc<Gauges>,
    /// Retire tokens of workers not yet asked to retire, oldest first
    workers: Vec<CancellationToken>,
    tracker: TaskTracker,
    next_worker_id: usize,
    last_scale: Option<Instant>,
    last_scale_at: Option<DateTime<Utc>>,
    scale_ups: u64,
    scale_downs: u64,
}

impl Manager {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Wake) => self.check_scaling(),
                    Some(Command::ScaleUp(n)) => self.scale_up(n),
                    Some(Command::Retire(n)) => self.retire(n),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.check_scaling(),
            }
        }

        // tasks left in a closed queue still need a worker
        if self.gauges.current.load(Ordering::SeqCst) == 0 {
            self.spawn_workers(1);
        }
        tracing::debug!("Worker pool manager stopped");
    }

    fn queue_depth(&self) -> usize {
        self.queue
            .upgrade()
            .map_or(0, |sender| sender.max_capacity() - sender.capacity())
    }

    fn check_scaling(&mut self) {
        let input = ScalingInput {
            queue_depth: self.queue_depth(),
            queue_capacity: self.queue_capacity,
            current_workers: self.gauges.current.load(Ordering::SeqCst),
            since_last_scale: self.last_scale.map(|at| at.elapsed()),
        };
        match self.policy.decide(input) {
            ScaleDecision::Up(n) => self.scale_up(n),
            ScaleDecision::Down(n) => self.retire(n),
            ScaleDecision::Hold => {}
        }
    }

    fn scale_up(&mut self, n: usize) {
        let current = self.gauges.current.load(Ordering::SeqCst);
        let n = n.min(self.policy.max_workers.saturating_sub(current));
        if n == 0 {
            return;
        }
        self.spawn_workers(n);
        self.mark_scaled();
        self.scale_ups += 1;
        tracing::info!(
            added = n,
            workers = self.gauges.current.load(Ordering::SeqCst),
            "Worker pool scaled up"
        );
    }

    fn retire(&mut self, n: usize) {
        let n = n.min(self.workers.len().saturating_sub(self.policy.min_workers));
        if n == 0 {
            return;
        }
        for token in self.workers.drain(self.workers.len() - n..) {
            token.cancel();
        }
        self.mark_scaled();
        self.scale_downs += 1;
        tracing::info!(
            retired = n,
            remaining = self.workers.len(),
            "Worker pool scaled down"
        );
    }

    fn mark_scaled(&mut self) {
        self.last_scale = Some(Instant::now());
        self.last_scale_at = Some(Utc::now());
    }

    fn spawn_workers(&mut self, n: usize) {
        for _ in 0..n {
            let retire = CancellationToken::new();
            let current = self.gauges.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauges.peak.fetch_max(current, Ordering::SeqCst);

            let worker = Worker {
                id: self.next_worker_id,
                receiver: self.receiver.clone(),
                retire: retire.clone(),
                executor: self.executor.clone(),
                guard: WorkerGuard(self.gauges.clone()),
            };
            self.next_worker_id += 1;
            self.workers.push(retire);
            self.tracker.spawn(worker.run());
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            current_workers: self.gauges.current.load(Ordering::SeqCst),
            busy_workers: self.gauges.busy.load(Ordering::SeqCst),
            peak_workers: self.gauges.peak.load(Ordering::SeqCst),
            min_workers: self.policy.min_workers,
            max_workers: self.policy.max_workers,
            queue_depth: self.queue_depth(),
            queue_capacity: self.queue_capacity,
            scale_ups: self.scale_ups,
            scale_downs: self.scale_downs,
            last_scale_at: self.last_scale_at,
            pending_batch_tasks: 0,
            batches_processed: 0,
        }
    }
}

struct Worker {
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    retire: CancellationToken,
    executor: Arc<Executor>,
    guard: WorkerGuard,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "Worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.retire.cancelled() => break,
                task = async { self.receiver.lock().await.recv().await } => task,
            };
            let Some(task) = next else {
                break;
            };

            self.guard.0.busy.fetch_add(1, Ordering::SeqCst);
            self.executor.execute(task).await;
            self.guard.0.busy.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(worker = self.id, "Worker exited");
    }
}
