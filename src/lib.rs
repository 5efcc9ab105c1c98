//! # evbus
//!
//! In-process event infrastructure: a priority-ordered publish/subscribe bus
//! backed by an elastic worker pool and a batch processor, an indexed event
//! store, a replayer that re-drives stored events, and a monitor that derives
//! statistics, health and alerts from the bus.
//!
//! ## Quick Start
//!
//! ```rust
//! use evbus::{handler_fn, Event, EventBus, SubscribeOptions};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new();
//! let ctx = CancellationToken::new();
//! bus.start(&ctx).await?;
//!
//! bus.subscribe(
//!     "player.play",
//!     handler_fn(|event: Arc<Event>| async move {
//!         println!("now playing {}", event.data["song"]);
//!         Ok(())
//!     }),
//!     SubscribeOptions::default().priority(200),
//! )?;
//!
//! bus.publish_async(
//!     &ctx,
//!     Event::new("player.play", "player", serde_json::json!({"song": "s-42"})),
//! )
//! .await?;
//!
//! bus.stop(&ctx).await?;
//! # Ok::<(), evbus::EventError>(())
//! # }).unwrap();
//! ```
//!
//! ## Architecture
//!
//! - **EventBus** — subscription registry, validation and dispatch
//! - **Worker pool / batch processor** — async delivery with bounded queues
//!   and load-based scaling
//! - **EventStore** trait — indexed persistence; `MemoryEventStore` with
//!   retention and optional snapshots
//! - **EventReplayer** — paced, filterable, pausable replay from a store
//! - **EventMonitor** — rates, latency percentiles, health and alerts

pub mod config;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod monitor;
pub mod pool;
pub mod replay;
pub mod store;
pub mod subscription;
pub mod types;
pub mod validation;

mod batch;
mod bus;
mod dispatch;
mod registry;

// Re-export core types
pub use bus::EventBus;
pub use config::{
    from_json_file, from_json_str, EventStoreConfig, MonitorConfig, MonitorThresholds,
    WorkerPoolConfig,
};
pub use dlq::{DeadLetter, DeadLetterReason, DeadLetterSink, MemoryDeadLetterQueue};
pub use error::{EventError, HandlerError, Result};
pub use handler::{handler_fn, EventHandler, HandlerResult};
pub use monitor::{
    Alert, AlertKind, AlertLevel, EventMonitor, ExportFormat, HealthLevel, HealthReport,
    LatencyStats, MonitorStats, RateStats, RealtimeStats,
};
pub use pool::{PoolStats, ScaleDecision, ScalingInput, ScalingPolicy};
pub use replay::{EventReplayer, ReplayOptions, ReplayState, ReplayStatus};
pub use store::{
    store_handler, EventStore, FileSnapshotStore, MemoryEventStore, MemorySnapshotStore,
    SnapshotStore, StoredEvent,
};
pub use subscription::{EventFilter, SubscribeOptions, Subscription};
pub use types::{Event, EventPayload, EventPriority, EventStats, EventType, SubscriberStats};
pub use validation::{DefaultEventValidator, EventTypeInfo, EventTypeRegistry, EventValidator};
