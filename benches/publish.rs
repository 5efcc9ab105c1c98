//! Performance benchmarks for evbus
//!
//! Run with: cargo bench

use evbus::{
    handler_fn, Event, EventBus, EventStore, EventStoreConfig, MemoryEventStore, SubscribeOptions,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn bench_event_creation(c: &mut Criterion) {
    c.bench_function("Event::new", |b| {
        b.iter(|| Event::new("market.forex", "reuters", serde_json::json!({"rate": 7.35})));
    });
}

fn bench_event_serialization(c: &mut Criterion) {
    let event = Event::new(
        "market.forex",
        "reuters",
        serde_json::json!({"rate": 7.35, "currency": "USD/CNY", "source": "reuters"}),
    );

    c.bench_function("Event serialize", |b| {
        b.iter(|| serde_json::to_vec(&event).unwrap());
    });

    let bytes = serde_json::to_vec(&event).unwrap();
    c.bench_function("Event deserialize", |b| {
        b.iter(|| serde_json::from_slice::<Event>(&bytes).unwrap());
    });
}

fn running_bus(rt: &tokio::runtime::Runtime, subscribers: usize) -> Arc<EventBus> {
    rt.block_on(async {
        let bus = Arc::new(EventBus::new());
        bus.start(&CancellationToken::new()).await.unwrap();
        for i in 0..subscribers {
            bus.subscribe(
                "market.forex",
                handler_fn(|_event: Arc<Event>| async move { Ok(()) }),
                SubscribeOptions::default().priority(i as i32),
            )
            .unwrap();
        }
        bus
    })
}

fn bench_sync_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ctx = CancellationToken::new();

    let mut group = c.benchmark_group("publish_sync");
    for subscribers in [1, 10, 100] {
        let bus = running_bus(&rt, subscribers);
        group.bench_function(format!("{} subscribers", subscribers), |b| {
            b.to_async(&rt).iter(|| async {
                bus.publish(
                    &ctx,
                    Event::new("market.forex", "reuters", serde_json::json!({"rate": 7.35})),
                )
                .await
                .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_async_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ctx = CancellationToken::new();
    let bus = running_bus(&rt, 4);

    c.bench_function("publish_async (4 subscribers)", |b| {
        b.to_async(&rt).iter(|| async {
            bus.publish_async(
                &ctx,
                Event::new("market.forex", "reuters", serde_json::json!({"rate": 7.35})),
            )
            .await
            .unwrap()
        });
    });
}

fn bench_store(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = MemoryEventStore::new(EventStoreConfig {
        max_events: 10_000,
        ..EventStoreConfig::default()
    });

    c.bench_function("MemoryEventStore store", |b| {
        b.to_async(&rt).iter(|| async {
            store
                .store(Event::new("market.forex", "reuters", serde_json::json!({"i": 1})))
                .await
                .unwrap()
        });
    });

    rt.block_on(async {
        store.clear().await.unwrap();
        for i in 0..1000 {
            let event_type = format!("market.topic{}", i % 10);
            store
                .store(Event::new(event_type, "reuters", serde_json::json!({"i": i})))
                .await
                .unwrap();
        }
    });

    c.bench_function("get_by_type (limit 100)", |b| {
        b.to_async(&rt).iter(|| async {
            store
                .get_by_type(&"market.topic3".into(), 100, 0)
                .await
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_event_creation,
    bench_event_serialization,
    bench_sync_publish,
    bench_async_publish,
    bench_store,
);
criterion_main!(benches);
