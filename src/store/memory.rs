//! In-memory event store
//!
//! One `tokio::sync::RwLock` guards the primary map and the type, source
//! and time indexes, so every insert and removal updates all of them in a
//! single critical section. The time index is kept sorted by event
//! timestamp; equal timestamps keep insertion order.

use super::snapshot::{load_off_thread, save_off_thread, SnapshotStore};
use super::{EventStore, StoredEvent};
use crate::config::EventStoreConfig;
use crate::error::{EventError, Result};
use crate::types::{Event, EventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const COMPONENT: &str = "event store";

#[derive(Default)]
struct Indexes {
    events: HashMap<String, StoredEvent>,
    by_type: HashMap<EventType, Vec<String>>,
    by_source: HashMap<String, Vec<String>>,
    /// (event timestamp, id), sorted by timestamp
    by_time: Vec<(DateTime<Utc>, String)>,
}

impl Indexes {
    /// Insert after lazy retention and capacity eviction
    fn insert(&mut self, stored: StoredEvent, config: &EventStoreConfig) {
        if self.events.contains_key(stored.id()) {
            let id = stored.id().to_string();
            self.remove(&id);
        }
        if !config.retention_time.is_zero() {
            self.sweep_expired(stored.stored_at, config.retention_time);
        }
        if config.max_events > 0 {
            while self.events.len() >= config.max_events {
                if !self.evict_oldest() {
                    break;
                }
            }
        }

        let id = stored.id().to_string();
        let timestamp = stored.event.timestamp;
        self.by_type
            .entry(stored.event.event_type.clone())
            .or_default()
            .push(id.clone());
        self.by_source
            .entry(stored.event.source.clone())
            .or_default()
            .push(id.clone());
        let pos = self.by_time.partition_point(|(ts, _)| *ts <= timestamp);
        self.by_time.insert(pos, (timestamp, id.clone()));
        self.events.insert(id, stored);
    }

    fn remove(&mut self, id: &str) -> Option<StoredEvent> {
        let stored = self.events.remove(id)?;

        detach(&mut self.by_type, &stored.event.event_type, id);
        detach(&mut self.by_source, &stored.event.source, id);

        let timestamp = stored.event.timestamp;
        let start = self.by_time.partition_point(|(ts, _)| *ts < timestamp);
        if let Some(offset) = self.by_time[start..]
            .iter()
            .take_while(|(ts, _)| *ts == timestamp)
            .position(|(_, entry)| entry == id)
        {
            self.by_time.remove(start + offset);
        }

        Some(stored)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, id)) = self.by_time.first().cloned() else {
            return false;
        };
        tracing::debug!(event_id = %id, "Evicting oldest event");
        self.remove(&id).is_some()
    }

    /// Remove events stored more than `retention` before `now`
    fn sweep_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };
        let expired: Vec<String> = self
            .events
            .values()
            .filter(|stored| stored.stored_at < cutoff)
            .map(|stored| stored.id().to_string())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired.len()
    }

    /// Index bounds of `[start, end]` in the time index
    fn time_bounds(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> (usize, usize) {
        let lo = self.by_time.partition_point(|(ts, _)| *ts < start);
        let hi = self.by_time.partition_point(|(ts, _)| *ts <= end);
        (lo, hi.max(lo))
    }

    fn page<'a>(
        &self,
        ids: impl Iterator<Item = &'a String>,
        limit: usize,
        offset: usize,
    ) -> Vec<StoredEvent> {
        let ids = ids.skip(offset);
        let take = if limit == 0 { usize::MAX } else { limit };
        ids.take(take)
            .filter_map(|id| self.events.get(id).cloned())
            .collect()
    }

    fn snapshot(&self) -> Vec<StoredEvent> {
        self.by_time
            .iter()
            .filter_map(|(_, id)| self.events.get(id).cloned())
            .collect()
    }
}

fn detach<K: std::hash::Hash + Eq + Clone>(index: &mut HashMap<K, Vec<String>>, key: &K, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|entry| entry != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

struct Inner {
    config: EventStoreConfig,
    indexes: RwLock<Indexes>,
    snapshot: Option<Arc<dyn SnapshotStore>>,
    dirty: AtomicBool,
}

impl Inner {
    async fn sweep(&self) {
        if self.config.retention_time.is_zero() {
            return;
        }
        let removed = self
            .indexes
            .write()
            .await
            .sweep_expired(Utc::now(), self.config.retention_time);
        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
            tracing::debug!(removed, "Expired events cleaned up");
        }
    }

    async fn flush(&self) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let events = self.indexes.read().await.snapshot();
        if let Err(e) = save_off_thread(snapshot.clone(), events).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

struct Maintenance {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Bounded, retention-aware in-memory event store
///
/// With a [`SnapshotStore`] attached, the contents are loaded on `start`,
/// saved every `flush_interval` when changed, and saved again on `stop`.
pub struct MemoryEventStore {
    inner: Arc<Inner>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl MemoryEventStore {
    pub fn new(config: EventStoreConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_snapshot(config: EventStoreConfig, snapshot: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(snapshot))
    }

    fn build(config: EventStoreConfig, snapshot: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                indexes: RwLock::new(Indexes::default()),
                snapshot,
                dirty: AtomicBool::new(false),
            }),
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.inner.config
    }

    /// Run the retention sweep now
    pub async fn sweep_expired(&self) {
        self.inner.sweep().await;
    }

    /// Save the snapshot now if anything changed
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    fn spawn_maintenance(&self, tracker: &TaskTracker, cancel: &CancellationToken) {
        let config = &self.inner.config;

        if !config.retention_time.is_zero() {
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            let period = config.sweep_interval();
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => inner.sweep().await,
                    }
                }
            });
        }

        if self.inner.snapshot.is_some() {
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            let period = config.flush_interval;
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = inner.flush().await {
                                tracing::error!(error = %e, "Snapshot flush failed");
                            }
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn start(&self) -> Result<()> {
        let mut maintenance = self.maintenance.lock().await;
        if maintenance.is_some() {
            return Err(EventError::AlreadyRunning(COMPONENT));
        }
        self.inner.config.validate()?;

        if let Some(snapshot) = &self.inner.snapshot {
            let loaded = load_off_thread(snapshot.clone()).await?;
            let count = loaded.len();
            let mut indexes = self.inner.indexes.write().await;
            for stored in loaded {
                indexes.insert(stored, &self.inner.config);
            }
            tracing::info!(events = count, "Event store restored from snapshot");
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        self.spawn_maintenance(&tracker, &cancel);
        tracker.close();
        *maintenance = Some(Maintenance { cancel, tracker });

        tracing::info!(
            max_events = self.inner.config.max_events,
            retention_ms = self.inner.config.retention_time.as_millis() as u64,
            "Memory event store started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut maintenance = self.maintenance.lock().await;
        let Some(running) = maintenance.take() else {
            return Err(EventError::NotRunning(COMPONENT));
        };
        running.cancel.cancel();
        running.tracker.wait().await;

        self.inner.flush().await?;
        tracing::info!("Memory event store stopped");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        if self.maintenance.lock().await.is_none() {
            return Err(EventError::NotRunning(COMPONENT));
        }
        Ok(())
    }

    async fn store(&self, event: Event) -> Result<()> {
        let stored = StoredEvent::new(event);
        tracing::debug!(event_id = %stored.id(), event_type = %stored.event.event_type, "Storing event");
        self.inner
            .indexes
            .write()
            .await
            .insert(stored, &self.inner.config);
        self.inner.touch();
        Ok(())
    }

    async fn store_batch(&self, events: Vec<Event>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let count = events.len();
        let mut indexes = self.inner.indexes.write().await;
        for event in events {
            indexes.insert(StoredEvent::new(event), &self.inner.config);
        }
        drop(indexes);
        self.inner.touch();
        tracing::debug!(count, "Stored event batch");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<StoredEvent> {
        self.inner
            .indexes
            .read()
            .await
            .events
            .get(id)
            .cloned()
            .ok_or_else(|| EventError::NotFound(id.to_string()))
    }

    async fn get_by_type(
        &self,
        event_type: &EventType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredEvent>> {
        let indexes = self.inner.indexes.read().await;
        Ok(match indexes.by_type.get(event_type) {
            Some(ids) => indexes.page(ids.iter(), limit, offset),
            None => Vec::new(),
        })
    }

    async fn get_by_source(
        &self,
        source: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredEvent>> {
        let indexes = self.inner.indexes.read().await;
        Ok(match indexes.by_source.get(source) {
            Some(ids) => indexes.page(ids.iter(), limit, offset),
            None => Vec::new(),
        })
    }

    async fn get_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredEvent>> {
        let indexes = self.inner.indexes.read().await;
        let (lo, hi) = indexes.time_bounds(start, end);
        Ok(indexes.page(indexes.by_time[lo..hi].iter().map(|(_, id)| id), limit, offset))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.indexes.read().await.events.len())
    }

    async fn count_by_type(&self, event_type: &EventType) -> Result<usize> {
        let indexes = self.inner.indexes.read().await;
        Ok(indexes.by_type.get(event_type).map_or(0, Vec::len))
    }

    async fn count_by_source(&self, source: &str) -> Result<usize> {
        let indexes = self.inner.indexes.read().await;
        Ok(indexes.by_source.get(source).map_or(0, Vec::len))
    }

    async fn count_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let (lo, hi) = self.inner.indexes.read().await.time_bounds(start, end);
        Ok(hi - lo)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner
            .indexes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EventError::NotFound(id.to_string()))?;
        self.inner.touch();
        Ok(())
    }

    async fn delete_by_type(&self, event_type: &EventType) -> Result<usize> {
        let mut indexes = self.inner.indexes.write().await;
        let ids = indexes.by_type.get(event_type).cloned().unwrap_or_default();
        let removed = ids.iter().filter(|id| indexes.remove(id).is_some()).count();
        drop(indexes);
        if removed > 0 {
            self.inner.touch();
        }
        Ok(removed)
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize> {
        let mut indexes = self.inner.indexes.write().await;
        let ids = indexes.by_source.get(source).cloned().unwrap_or_default();
        let removed = ids.iter().filter(|id| indexes.remove(id).is_some()).count();
        drop(indexes);
        if removed > 0 {
            self.inner.touch();
        }
        Ok(removed)
    }

    async fn delete_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let mut indexes = self.inner.indexes.write().await;
        let (lo, hi) = indexes.time_bounds(start, end);
        let ids: Vec<String> = indexes.by_time[lo..hi]
            .iter()
            .map(|(_, id)| id.clone())
            .collect();
        let removed = ids.iter().filter(|id| indexes.remove(id).is_some()).count();
        drop(indexes);
        if removed > 0 {
            self.inner.touch();
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.indexes.write().await = Indexes::default();
        self.inner.touch();
        tracing::debug!("Event store cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileSnapshotStore, MemorySnapshotStore};
    use chrono::Duration as ChronoDuration;

    fn config(max_events: usize) -> EventStoreConfig {
        EventStoreConfig {
            max_events,
            ..Default::default()
        }
    }

    fn event_at(id: &str, t: &str, source: &str, ts: DateTime<Utc>) -> Event {
        Event::new(t, source, serde_json::json!({}))
            .with_id(id)
            .with_timestamp(ts)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let store = MemoryEventStore::new(config(0));
        let event = Event::new("player.play", "player", serde_json::json!({"song": "1"}));
        store.store(event.clone()).await.unwrap();

        let stored = store.get(&event.id).await.unwrap();
        assert_eq!(stored.event, event);
        assert!(matches!(
            store.get("missing").await,
            Err(EventError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_max_events_evicts_oldest() {
        let store = MemoryEventStore::new(config(3));
        let base = Utc::now();
        for i in 0..5 {
            let ts = base + ChronoDuration::milliseconds(i);
            store
                .store(event_at(&i.to_string(), "a", "s", ts))
                .await
                .unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 3);
        for id in ["0", "1"] {
            assert!(store.get(id).await.is_err());
        }
        for id in ["2", "3", "4"] {
            assert!(store.get(id).await.is_ok());
        }
        assert_eq!(store.count_by_type(&"a".into()).await.unwrap(), 3);
        assert_eq!(store.count_by_source("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_time_range_is_inclusive_and_sorted() {
        let store = MemoryEventStore::new(config(0));
        let t = Utc::now();
        // inserted out of order
        store.store(event_at("late", "a", "s", t + ChronoDuration::hours(1))).await.unwrap();
        store.store(event_at("mid", "a", "s", t)).await.unwrap();
        store.store(event_at("early", "a", "s", t - ChronoDuration::hours(1))).await.unwrap();

        let window = store
            .get_by_time_range(
                t - ChronoDuration::minutes(45),
                t + ChronoDuration::minutes(45),
                0,
                0,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = window.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["mid"]);

        let all = store
            .get_by_time_range(t - ChronoDuration::hours(1), t + ChronoDuration::hours(1), 0, 0)
            .await
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);

        let paged = store
            .get_by_time_range(t - ChronoDuration::hours(2), t + ChronoDuration::hours(2), 1, 1)
            .await
            .unwrap();
        assert_eq!(paged[0].id(), "mid");
        assert_eq!(
            store
                .count_by_time_range(t, t + ChronoDuration::hours(1))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_replaces_entry() {
        let store = MemoryEventStore::new(config(0));
        let t = Utc::now();
        store.store(event_at("x", "a", "one", t)).await.unwrap();
        store.store(event_at("x", "b", "two", t)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.count_by_type(&"a".into()).await.unwrap(), 0);
        assert_eq!(store.count_by_source("two").await.unwrap(), 1);
        assert_eq!(
            store
                .count_by_time_range(t, t)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_deletes_keep_indexes_consistent() {
        let store = MemoryEventStore::new(config(0));
        let t = Utc::now();
        store
            .store_batch(vec![
                event_at("1", "player.play", "player", t),
                event_at("2", "player.stop", "player", t + ChronoDuration::seconds(1)),
                event_at("3", "ui.render", "ui", t + ChronoDuration::seconds(2)),
                event_at("4", "ui.render", "ui", t + ChronoDuration::seconds(3)),
            ])
            .await
            .unwrap();

        store.delete("1").await.unwrap();
        assert!(matches!(store.delete("1").await, Err(EventError::NotFound(_))));
        assert_eq!(store.count_by_source("player").await.unwrap(), 1);

        assert_eq!(store.delete_by_type(&"ui.render".into()).await.unwrap(), 2);
        assert_eq!(store.count_by_source("ui").await.unwrap(), 0);
        assert_eq!(store.count().await.unwrap(), 1);

        store.store(event_at("5", "net.up", "net", t)).await.unwrap();
        assert_eq!(store.delete_by_source("net").await.unwrap(), 1);
        assert_eq!(
            store
                .delete_by_time_range(t, t + ChronoDuration::seconds(10))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(
            store
                .count_by_time_range(t - ChronoDuration::days(1), t + ChronoDuration::days(1))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_type_query_paging() {
        let store = MemoryEventStore::new(config(0));
        for i in 0..5 {
            store
                .store(event_at(&i.to_string(), "a", "s", Utc::now()))
                .await
                .unwrap();
        }
        let page = store.get_by_type(&"a".into(), 2, 1).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(store.get_by_type(&"a".into(), 0, 10).await.unwrap().is_empty());
        assert!(store.get_by_source("nobody", 0, 0).await.unwrap().is_empty());

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[test]
    fn test_retention_sweep_uses_stored_at() {
        let config = EventStoreConfig {
            max_events: 0,
            retention_time: Duration::from_secs(60),
            ..Default::default()
        };
        let mut indexes = Indexes::default();
        let now = Utc::now();

        let mut old = StoredEvent::new(event_at("old", "a", "s", now));
        old.stored_at = now - ChronoDuration::minutes(5);
        indexes.insert(old, &config);
        // event timestamp is old but it was stored just now
        let fresh = StoredEvent::new(event_at("fresh", "a", "s", now - ChronoDuration::days(1)));
        indexes.insert(fresh, &config);

        assert!(!indexes.events.contains_key("old"));
        assert!(indexes.events.contains_key("fresh"));
        assert_eq!(indexes.by_time.len(), 1);
        assert_eq!(indexes.sweep_expired(now + ChronoDuration::minutes(2), config.retention_time), 1);
        assert!(indexes.events.is_empty());
        assert!(indexes.by_type.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_and_health() {
        let store = MemoryEventStore::new(config(0));
        assert!(store.health_check().await.is_err());
        assert!(matches!(store.stop().await, Err(EventError::NotRunning(_))));

        store.start().await.unwrap();
        store.health_check().await.unwrap();
        assert!(matches!(
            store.start().await,
            Err(EventError::AlreadyRunning(_))
        ));

        store.stop().await.unwrap();
        assert!(store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let snapshot = Arc::new(MemorySnapshotStore::default());
        let store = MemoryEventStore::with_snapshot(config(0), snapshot.clone());
        store.start().await.unwrap();
        store
            .store(event_at("kept", "a", "s", Utc::now()))
            .await
            .unwrap();
        store.stop().await.unwrap();
        assert_eq!(snapshot.load().unwrap().len(), 1);

        let restored = MemoryEventStore::with_snapshot(config(0), snapshot);
        restored.start().await.unwrap();
        assert!(restored.get("kept").await.is_ok());
        assert_eq!(restored.count_by_type(&"a".into()).await.unwrap(), 1);
        restored.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_snapshot_flush_and_restore() {
        let dir = std::env::temp_dir().join(format!("evbus-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("events.json");
        let store = MemoryEventStore::with_snapshot(config(0), Arc::new(FileSnapshotStore::new(&path)));
        store.start().await.unwrap();
        store
            .store(event_at("on-disk", "a", "s", Utc::now()))
            .await
            .unwrap();

        store.flush().await.unwrap();
        assert_eq!(FileSnapshotStore::new(&path).load().unwrap().len(), 1);
        // nothing changed since the last save
        std::fs::remove_file(&path).unwrap();
        store.flush().await.unwrap();
        assert!(!path.exists());

        store
            .store(event_at("on-stop", "a", "s", Utc::now()))
            .await
            .unwrap();
        store.stop().await.unwrap();

        let restored = MemoryEventStore::with_snapshot(config(0), Arc::new(FileSnapshotStore::new(&path)));
        restored.start().await.unwrap();
        assert_eq!(restored.count_by_type(&"a".into()).await.unwrap(), 2);
        restored.stop().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
