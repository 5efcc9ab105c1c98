//! Dead letters for async dispatch
//!
//! Async publish never reports handler failures to the publisher. Instead
//! every failed invocation, and every task shed under backpressure, can be
//! routed to a `DeadLetterSink` configured on the bus.

use crate::error::{HandlerError, Result};
use crate::types::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Why an async task ended up as a dead letter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The handler returned an error or panicked
    HandlerFailed(HandlerError),

    /// Both the worker queue and the batch backlog were full
    Shed,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerFailed(err) => write!(f, "{}", err),
            Self::Shed => f.write_str("dropped: queue and batch backlog full"),
        }
    }
}

/// An undelivered or failed (event, subscription) pair
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: Arc<Event>,

    pub subscription_id: String,

    pub reason: DeadLetterReason,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: Arc<Event>, subscription_id: impl Into<String>, reason: DeadLetterReason) -> Self {
        Self {
            event,
            subscription_id: subscription_id.into(),
            reason,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Destination for dead letters
///
/// Implementations may log, store, forward, or alert on the failure.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of dead letters currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory dead letter queue with a capacity bound
pub struct MemoryDeadLetterQueue {
    letters: RwLock<Vec<DeadLetter>>,
    max_letters: usize,
}

impl MemoryDeadLetterQueue {
    /// `max_letters == 0` keeps everything
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: RwLock::new(Vec::new()),
            max_letters,
        }
    }

    pub async fn clear(&self) {
        self.letters.write().await.clear();
    }
}

impl Default for MemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterQueue {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            event_id = %letter.event.id,
            event_type = %letter.event.event_type,
            subscription_id = %letter.subscription_id,
            reason = %letter.reason,
            "Event dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let overflow = letters.len() - self.max_letters;
            letters.drain(..overflow);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}
