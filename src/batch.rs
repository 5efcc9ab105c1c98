//! Batch processor
//!
//! Async tasks that find the worker queue full accumulate here. A full
//! accumulator is sealed into a batch immediately; a ticker seals partial
//! ones every `batch_timeout`. Sealed batches wait in a bounded backlog and
//! each batch fans out one concurrent task per entry.

use crate::config::WorkerPoolConfig;
use crate::dispatch::{Executor, Task};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;

struct Accumulator {
    pending: Vec<Task>,
    /// `None` once the processor is closed
    batches: Option<mpsc::Sender<Vec<Task>>>,
}

struct Shared {
    accumulator: Mutex<Accumulator>,
    batch_size: usize,
    batches_processed: AtomicU64,
}

impl Shared {
    /// Seal the pending tasks if the backlog has room
    fn flush(&self) {
        let mut guard = self.accumulator.lock().unwrap_or_else(PoisonError::into_inner);
        let acc = &mut *guard;
        if acc.pending.is_empty() {
            return;
        }
        let Some(sender) = acc.batches.as_ref() else {
            return;
        };
        // a full backlog leaves the tasks pending for the next tick
        if let Ok(permit) = sender.try_reserve() {
            let batch = std::mem::take(&mut acc.pending);
            permit.send(batch);
        };
    }
}

/// Handle to a running batch processor
pub(crate) struct BatchProcessor {
    shared: Arc<Shared>,
}

impl BatchProcessor {
    pub fn start(config: &WorkerPoolConfig, executor: Arc<Executor>, tracker: TaskTracker) -> Self {
        let (tx, rx) = mpsc::channel(config.batch_backlog());
        let shared = Arc::new(Shared {
            accumulator: Mutex::new(Accumulator {
                pending: Vec::with_capacity(config.batch_size),
                batches: Some(tx),
            }),
            batch_size: config.batch_size.max(1),
            batches_processed: AtomicU64::new(0),
        });

        tracker.spawn(run(shared.clone(), rx, executor, config.batch_timeout));

        Self { shared }
    }

    /// Accept a task, sealing a batch when the accumulator fills up
    ///
    /// The task is handed back when sealing would overflow the backlog or
    /// the processor is closed, so every accepted task is deliverable.
    pub fn offer(&self, task: Task) -> Result<(), Task> {
        let mut guard = self
            .shared
            .accumulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let acc = &mut *guard;
        let Some(sender) = acc.batches.as_ref() else {
            return Err(task);
        };

        if acc.pending.len() + 1 < self.shared.batch_size {
            acc.pending.push(task);
            return Ok(());
        }

        let sealed = match sender.try_reserve() {
            Ok(permit) => {
                let mut batch = std::mem::take(&mut acc.pending);
                batch.push(task);
                permit.send(batch);
                Ok(())
            }
            Err(_) => Err(task),
        };
        sealed
    }

    /// Tasks accepted but not yet sealed into a batch
    pub fn pending(&self) -> usize {
        self.shared
            .accumulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    pub fn batches_processed(&self) -> u64 {
        self.shared.batches_processed.load(Ordering::Relaxed)
    }

    /// Seal whatever is pending and close the backlog
    ///
    /// Pending tasks are delivered, never dropped.
    pub async fn close(&self) {
        let (pending, sender) = {
            let mut acc = self
                .shared
                .accumulator
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (std::mem::take(&mut acc.pending), acc.batches.take())
        };
        let Some(sender) = sender else {
            return;
        };
        if !pending.is_empty() {
            tracing::debug!(tasks = pending.len(), "Flushing pending batch on shutdown");
            if let Err(e) = sender.send(pending).await {
                tracing::error!(tasks = e.0.len(), "Batch processor gone, pending tasks lost");
            }
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    mut batches: mpsc::Receiver<Vec<Task>>,
    executor: Arc<Executor>,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + timeout, timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => {
                    process_batch(batch, &executor).await;
                    shared.batches_processed.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            },
            _ = ticker.tick() => shared.flush(),
        }
    }
    tracing::debug!("Batch processor stopped");
}

async fn process_batch(batch: Vec<Task>, executor: &Arc<Executor>) {
    let size = batch.len();
    let started = std::time::Instant::now();

    let mut set = JoinSet::new();
    for task in batch {
        let executor = executor.clone();
        set.spawn(async move { executor.execute(task).await });
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Batch task aborted");
        }
    }

    tracing::debug!(
        batch_size = size,
        elapsed_us = started.elapsed().as_micros() as u64,
        "Batch processed"
    );
}
