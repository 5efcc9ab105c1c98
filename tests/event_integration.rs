//! Bus, store and replay integration tests
//!
//! End-to-end scenarios through the public API: delivery ordering, async
//! dispatch through the worker pool, shutdown accounting, persistence via a
//! store handler, and replay back out of the store.

use chrono::{Duration as ChronoDuration, Utc};
use evbus::{
    handler_fn, Event, EventBus, EventError, EventHandler, EventReplayer, EventStore,
    EventStoreConfig, FileSnapshotStore, HandlerError, MemoryEventStore, ReplayOptions,
    ReplayState, SubscribeOptions, WorkerPoolConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn running_bus(config: WorkerPoolConfig) -> Arc<EventBus> {
    let bus = Arc::new(EventBus::with_config(config).unwrap());
    bus.start(&CancellationToken::new()).await.unwrap();
    bus
}

fn counting(count: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
    handler_fn(move |_event: Arc<Event>| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn recording(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn EventHandler> {
    handler_fn(move |_event: Arc<Event>| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(label.to_string());
            Ok(())
        }
    })
}

/// Poll until `done` holds or roughly five seconds have passed
async fn settle(done: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

fn event(event_type: &str, n: usize) -> Event {
    Event::new(event_type, "integration", serde_json::json!({ "n": n }))
}

// ─── Delivery ordering ───────────────────────────────────────────

#[tokio::test]
async fn test_sync_publish_runs_by_priority_then_registration() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    for (label, priority) in [("low-a", 100), ("high", 300), ("low-b", 100), ("mid", 200)] {
        bus.subscribe(
            "order.placed",
            recording(log.clone(), label),
            SubscribeOptions::default().priority(priority),
        )
        .unwrap();
    }

    bus.publish(&CancellationToken::new(), event("order.placed", 1))
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["high", "mid", "low-a", "low-b"]);
}

#[tokio::test]
async fn test_wildcard_subscriber_sees_every_type() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    bus.subscribe(
        "*",
        recording(log.clone(), "all"),
        SubscribeOptions::default().priority(500),
    )
    .unwrap();
    bus.subscribe(
        "order.placed",
        recording(log.clone(), "orders"),
        SubscribeOptions::default().priority(100),
    )
    .unwrap();

    let ctx = CancellationToken::new();
    bus.publish(&ctx, event("order.placed", 1)).await.unwrap();
    bus.publish(&ctx, event("user.login", 2)).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["all", "orders", "all"]);
}

#[tokio::test]
async fn test_filter_skips_only_its_own_handler() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let filtered = Arc::new(AtomicUsize::new(0));
    let plain = Arc::new(AtomicUsize::new(0));

    bus.subscribe_with_filter(
        "order.placed",
        counting(filtered.clone()),
        |event| event.data["n"].as_u64().unwrap_or(0) % 2 == 0,
        SubscribeOptions::default(),
    )
    .unwrap();
    bus.subscribe("order.placed", counting(plain.clone()), SubscribeOptions::default())
        .unwrap();

    let ctx = CancellationToken::new();
    for n in 0..6 {
        bus.publish(&ctx, event("order.placed", n)).await.unwrap();
    }

    assert_eq!(filtered.load(Ordering::SeqCst), 3);
    assert_eq!(plain.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery_immediately() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let count = Arc::new(AtomicUsize::new(0));
    let subscription = bus
        .subscribe("order.placed", counting(count.clone()), SubscribeOptions::default())
        .unwrap();

    let ctx = CancellationToken::new();
    bus.publish(&ctx, event("order.placed", 1)).await.unwrap();
    bus.unsubscribe(&subscription.id).unwrap();
    bus.publish(&ctx, event("order.placed", 2)).await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(matches!(
        bus.unsubscribe(&subscription.id),
        Err(EventError::SubscriptionNotFound(_))
    ));
}

#[tokio::test]
async fn test_handler_can_publish_on_the_same_bus() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let pongs = Arc::new(AtomicUsize::new(0));

    let inner = bus.clone();
    bus.subscribe(
        "game.ping",
        handler_fn(move |event: Arc<Event>| {
            let bus = inner.clone();
            async move {
                let n = event.data["n"].as_u64().unwrap_or(0) as usize;
                bus.publish(&CancellationToken::new(), self::event("game.pong", n))
                    .await
                    .map_err(HandlerError::failed)
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();
    bus.subscribe("game.pong", counting(pongs.clone()), SubscribeOptions::default())
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(2),
        bus.publish(&CancellationToken::new(), event("game.ping", 1)),
    )
    .await
    .expect("re-entrant publish must not deadlock")
    .unwrap();

    assert_eq!(pongs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_handler_does_not_starve_others() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let count = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "order.placed",
        handler_fn(|event: Arc<Event>| async move {
            if event.source == "integration" {
                panic!("boom");
            }
            Ok::<(), HandlerError>(())
        }),
        SubscribeOptions::default().priority(900),
    )
    .unwrap();
    bus.subscribe("order.placed", counting(count.clone()), SubscribeOptions::default())
        .unwrap();

    let result = bus
        .publish(&CancellationToken::new(), event("order.placed", 1))
        .await;

    assert!(matches!(result, Err(EventError::Handler { .. })));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().handler_panics, 1);
    assert!(bus.is_running());
}

// ─── Async dispatch ──────────────────────────────────────────────

#[tokio::test]
async fn test_async_publish_invokes_each_event_exactly_once() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    bus.subscribe(
        "order.placed",
        handler_fn(move |event: Arc<Event>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(event.id.clone());
                Ok(())
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let ctx = CancellationToken::new();
    let mut published = Vec::new();
    for n in 0..50 {
        let event = event("order.placed", n);
        published.push(event.id.clone());
        bus.publish_async(&ctx, event).await.unwrap();
    }

    assert!(settle(|| seen.lock().unwrap().len() >= 50).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    published.sort();
    assert_eq!(seen, published);
    assert_eq!(bus.stats().total_events, 50);
}

#[tokio::test]
async fn test_pool_never_exceeds_max_workers() {
    let config = WorkerPoolConfig {
        min_workers: 1,
        max_workers: 3,
        queue_size: 1000,
        scale_up_threshold: 0.05,
        scale_down_threshold: 0.01,
        scale_interval: Duration::from_millis(5),
        scale_cooldown: Duration::ZERO,
        ..WorkerPoolConfig::default()
    };
    let bus = running_bus(config).await;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    {
        let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
        bus.subscribe(
            "job.run",
            handler_fn(move |_event: Arc<Event>| {
                let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .unwrap();
    }

    let ctx = CancellationToken::new();
    for n in 0..200 {
        bus.publish_async(&ctx, event("job.run", n)).await.unwrap();
    }

    assert!(settle(|| done.load(Ordering::SeqCst) == 200).await);
    assert!(peak.load(Ordering::SeqCst) <= 3);

    let stats = bus.pool_stats().await.unwrap();
    assert!(stats.peak_workers <= 3);
    assert!(stats.current_workers >= 1);
}

#[tokio::test]
async fn test_pool_without_idle_workers_still_delivers_promptly() {
    let config = WorkerPoolConfig {
        min_workers: 0,
        max_workers: 2,
        ..WorkerPoolConfig::default()
    };
    let bus = running_bus(config).await;
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe("job.run", counting(count.clone()), SubscribeOptions::default())
        .unwrap();

    let started = std::time::Instant::now();
    bus.publish_async(&CancellationToken::new(), event("job.run", 1))
        .await
        .unwrap();

    assert!(settle(|| count.load(Ordering::SeqCst) == 1).await);
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ─── Shutdown ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_drains_in_flight_work() {
    let config = WorkerPoolConfig {
        min_workers: 2,
        max_workers: 2,
        ..WorkerPoolConfig::default()
    };
    let bus = running_bus(config).await;
    let count = Arc::new(AtomicUsize::new(0));

    let handled = count.clone();
    bus.subscribe(
        "job.run",
        handler_fn(move |_event: Arc<Event>| {
            let handled = handled.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let ctx = CancellationToken::new();
    for n in 0..10 {
        bus.publish_async(&ctx, event("job.run", n)).await.unwrap();
    }

    bus.stop_within(&ctx, Duration::from_secs(5)).await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert_eq!(bus.stats().processed_tasks, 10);
    assert!(!bus.is_running());
}

#[tokio::test]
async fn test_stop_reports_timeout_when_budget_is_exceeded() {
    let config = WorkerPoolConfig {
        min_workers: 1,
        max_workers: 1,
        ..WorkerPoolConfig::default()
    };
    let bus = running_bus(config).await;
    bus.subscribe(
        "job.run",
        handler_fn(|_event: Arc<Event>| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }),
        SubscribeOptions::default(),
    )
    .unwrap();

    let ctx = CancellationToken::new();
    for n in 0..4 {
        bus.publish_async(&ctx, event("job.run", n)).await.unwrap();
    }

    let result = bus.stop_within(&ctx, Duration::from_millis(30)).await;
    assert!(matches!(result, Err(EventError::Timeout(_))));
    assert!(!bus.is_running());
}

#[tokio::test]
async fn test_publish_after_stop_is_rejected() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let ctx = CancellationToken::new();
    bus.stop(&ctx).await.unwrap();

    let result = bus.publish(&ctx, event("order.placed", 1)).await;
    assert!(matches!(result, Err(EventError::NotRunning(_))));

    bus.start(&ctx).await.unwrap();
    bus.publish(&ctx, event("order.placed", 2)).await.unwrap();
}

// ─── Store ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_store_keeps_only_the_newest_max_events() {
    let store = MemoryEventStore::new(EventStoreConfig {
        max_events: 3,
        ..EventStoreConfig::default()
    });
    let base = Utc::now();
    for n in 0..5 {
        store
            .store(event("order.placed", n).with_id(format!("e{n}")).with_timestamp(
                base + ChronoDuration::seconds(n as i64),
            ))
            .await
            .unwrap();
    }

    assert_eq!(store.count().await.unwrap(), 3);
    assert!(matches!(store.get("e0").await, Err(EventError::NotFound(_))));
    assert!(matches!(store.get("e1").await, Err(EventError::NotFound(_))));
    for id in ["e2", "e3", "e4"] {
        assert_eq!(store.get(id).await.unwrap().id(), id);
    }
}

#[tokio::test]
async fn test_store_range_query_is_inclusive_and_ordered() {
    let store = MemoryEventStore::new(EventStoreConfig::default());
    let now = Utc::now();
    let stamps = [
        ("late", now + ChronoDuration::hours(1)),
        ("early", now - ChronoDuration::hours(1)),
        ("mid", now),
        ("edge", now + ChronoDuration::minutes(45)),
    ];
    for (id, timestamp) in stamps {
        store
            .store(event("order.placed", 0).with_id(id).with_timestamp(timestamp))
            .await
            .unwrap();
    }

    let hits = store
        .get_by_time_range(
            now - ChronoDuration::minutes(45),
            now + ChronoDuration::minutes(45),
            0,
            0,
        )
        .await
        .unwrap();
    let ids: Vec<&str> = hits.iter().map(|stored| stored.id()).collect();
    assert_eq!(ids, vec!["mid", "edge"]);
}

#[tokio::test]
async fn test_snapshot_survives_store_restart() {
    let path = std::env::temp_dir().join(format!("evbus-{}.json", uuid::Uuid::new_v4()));
    let config = EventStoreConfig::default();

    let first = MemoryEventStore::with_snapshot(
        config.clone(),
        Arc::new(FileSnapshotStore::new(path.clone())),
    );
    first.start().await.unwrap();
    for n in 0..4 {
        first.store(event("order.placed", n)).await.unwrap();
    }
    first.stop().await.unwrap();

    let second =
        MemoryEventStore::with_snapshot(config, Arc::new(FileSnapshotStore::new(path.clone())));
    second.start().await.unwrap();
    assert_eq!(second.count().await.unwrap(), 4);
    second.stop().await.unwrap();

    let _ = std::fs::remove_file(&path);
}

// ─── Replay ──────────────────────────────────────────────────────

async fn seeded_store(count: usize) -> Arc<MemoryEventStore> {
    let store = Arc::new(MemoryEventStore::new(EventStoreConfig::default()));
    let base = Utc::now() - ChronoDuration::minutes(10);
    for n in 0..count {
        store
            .store(
                event("order.placed", n)
                    .with_id(format!("e{n}"))
                    .with_timestamp(base + ChronoDuration::seconds(n as i64)),
            )
            .await
            .unwrap();
    }
    store
}

fn fast() -> ReplayOptions {
    ReplayOptions {
        speed: 100.0,
        ..ReplayOptions::default()
    }
}

#[tokio::test]
async fn test_replay_failure_on_third_event_stops_session() {
    let store = seeded_store(5).await;
    let replayer = EventReplayer::new(store);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    replayer.set_event_handler(handler_fn(move |_event: Arc<Event>| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                return Err(HandlerError::failed("third event rejected"));
            }
            Ok(())
        }
    }));

    let result = replayer.replay(&CancellationToken::new(), fast()).await;

    assert!(result.is_err());
    let status = replayer.status();
    assert_eq!(status.state, ReplayState::Error);
    assert_eq!(status.processed_events, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_replay_pause_and_resume_delivers_each_event_once() {
    let store = seeded_store(20).await;
    let replayer = Arc::new(EventReplayer::new(store));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    replayer.set_event_handler(handler_fn(move |event: Arc<Event>| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(event.id.clone());
            Ok(())
        }
    }));

    let options = ReplayOptions {
        speed: 1.0,
        base_interval: Duration::from_millis(5),
        ..ReplayOptions::default()
    };
    let session = {
        let replayer = replayer.clone();
        tokio::spawn(async move { replayer.replay(&CancellationToken::new(), options).await })
    };

    assert!(settle(|| seen.lock().unwrap().len() >= 3).await);
    replayer.pause().unwrap();
    assert_eq!(replayer.status().state, ReplayState::Paused);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let paused_at = seen.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(seen.lock().unwrap().len(), paused_at);

    replayer.resume().unwrap();
    session.await.unwrap().unwrap();

    let expected: Vec<String> = (0..20).map(|n| format!("e{n}")).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    assert_eq!(replayer.status().state, ReplayState::Completed);
}

#[tokio::test]
async fn test_published_events_replay_from_store() {
    let bus = running_bus(WorkerPoolConfig::default()).await;
    let store = Arc::new(MemoryEventStore::new(EventStoreConfig::default()));
    bus.subscribe(
        "*",
        evbus::store_handler(store.clone()),
        SubscribeOptions::default().async_dispatch(false),
    )
    .unwrap();

    let ctx = CancellationToken::new();
    let mut published = Vec::new();
    for n in 0..5 {
        let event = event(if n % 2 == 0 { "order.placed" } else { "user.login" }, n);
        published.push(event.id.clone());
        bus.publish(&ctx, event).await.unwrap();
    }
    assert_eq!(store.count().await.unwrap(), 5);

    let replayer = EventReplayer::new(store.clone());
    let replayed = Arc::new(Mutex::new(Vec::new()));
    let log = replayed.clone();
    replayer.set_event_handler(handler_fn(move |event: Arc<Event>| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(event.id.clone());
            Ok(())
        }
    }));

    replayer.replay(&ctx, fast()).await.unwrap();
    assert_eq!(*replayed.lock().unwrap(), published);

    replayed.lock().unwrap().clear();
    replayer
        .replay_by_type(&ctx, "user.login", fast())
        .await
        .unwrap();
    assert_eq!(
        *replayed.lock().unwrap(),
        vec![published[1].clone(), published[3].clone()]
    );
}
