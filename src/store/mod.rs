//! Event store
//!
//! `EventStore` is the persistence contract used for querying and replay.
//! Queries take `limit` and `offset`; a `limit` of 0 means no limit. Time
//! ranges are inclusive on both ends and always come back in chronological
//! order.

mod memory;
mod snapshot;

pub use memory::MemoryEventStore;
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

use crate::error::{HandlerError, Result};
use crate::handler::{handler_fn, EventHandler};
use crate::types::{Event, EventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An event together with the time it was stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: Event,

    pub stored_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            stored_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }
}

/// Indexed event persistence
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Start background maintenance
    async fn start(&self) -> Result<()>;

    /// Stop background maintenance
    async fn stop(&self) -> Result<()>;

    /// Fails when the store is not started or its backend is unhealthy
    async fn health_check(&self) -> Result<()>;

    async fn store(&self, event: Event) -> Result<()>;

    /// Store several events under one critical section
    async fn store_batch(&self, events: Vec<Event>) -> Result<()>;

    /// `NotFound` when no event has this id
    async fn get(&self, id: &str) -> Result<StoredEvent>;

    async fn get_by_type(
        &self,
        event_type: &EventType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredEvent>>;

    async fn get_by_source(
        &self,
        source: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredEvent>>;

    /// Events with `start <= timestamp <= end`, oldest first
    async fn get_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredEvent>>;

    async fn count(&self) -> Result<usize>;

    async fn count_by_type(&self, event_type: &EventType) -> Result<usize>;

    async fn count_by_source(&self, source: &str) -> Result<usize>;

    async fn count_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<usize>;

    /// `NotFound` when no event has this id
    async fn delete(&self, id: &str) -> Result<()>;

    /// Returns the number of removed events
    async fn delete_by_type(&self, event_type: &EventType) -> Result<usize>;

    /// Returns the number of removed events
    async fn delete_by_source(&self, source: &str) -> Result<usize>;

    /// Returns the number of removed events
    async fn delete_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

/// A handler that stores every event it receives
///
/// Subscribe it (typically to `*`) to make published events durable.
pub fn store_handler(store: Arc<dyn EventStore>) -> Arc<dyn EventHandler> {
    handler_fn(move |event: Arc<Event>| {
        let store = store.clone();
        async move {
            store
                .store(Event::clone(&event))
                .await
                .map_err(HandlerError::failed)
        }
    })
}
