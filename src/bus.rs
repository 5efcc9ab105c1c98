//! In-process event bus
//!
//! `EventBus` owns the subscription registry, the event type registry and,
//! while running, the worker pool and batch processor. Publishing looks up
//! the matching subscriptions (wildcard subscribers included), applies each
//! subscription's filter, then runs the handler inline or hands it to the
//! async dispatch path. No bus lock is held while a handler runs, so
//! handlers may publish on the same bus.

use crate::config::WorkerPoolConfig;
use crate::dispatch::{DispatchRuntime, Executor, StatsRecorder, Task};
use crate::dlq::DeadLetterSink;
use crate::error::{EventError, Result};
use crate::handler::EventHandler;
use crate::pool::PoolStats;
use crate::registry::SubscriptionRegistry;
use crate::subscription::{SubscribeOptions, Subscription};
use crate::types::{Event, EventPriority, EventStats, EventType, SubscriberStats};
use crate::validation::{EventTypeInfo, EventTypeRegistry, EventValidator};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "event bus";

/// Publish/subscribe event bus
///
/// ```rust,no_run
/// use evbus::{handler_fn, Event, EventBus, HandlerResult, SubscribeOptions};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> evbus::Result<()> {
/// let bus = EventBus::new();
/// let ctx = CancellationToken::new();
/// bus.start(&ctx).await?;
///
/// bus.subscribe(
///     "player.play",
///     handler_fn(|event: Arc<Event>| async move {
///         println!("playing {}", event.data["song"]);
///         HandlerResult::Ok(())
///     }),
///     SubscribeOptions::default(),
/// )?;
///
/// bus.publish(&ctx, Event::new("player.play", "player", serde_json::json!({"song": "s-1"})))
///     .await?;
/// bus.stop(&ctx).await?;
/// # Ok(())
/// # }
/// ```
pub struct EventBus {
    config: WorkerPoolConfig,
    subscriptions: SubscriptionRegistry,
    event_types: Arc<EventTypeRegistry>,
    validator: Option<Arc<dyn EventValidator>>,
    stats: Arc<StatsRecorder>,
    executor: Arc<Executor>,

    /// Dispatch machinery of the current running period
    runtime: RwLock<Option<Arc<DispatchRuntime>>>,

    /// Serializes start and stop
    lifecycle: Mutex<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default worker pool configuration
    pub fn new() -> Self {
        Self::build(WorkerPoolConfig::default())
    }

    /// Create a bus with a custom worker pool configuration
    pub fn with_config(config: WorkerPoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: WorkerPoolConfig) -> Self {
        let stats = Arc::new(StatsRecorder::new(config.latency_history));
        Self {
            executor: Arc::new(Executor::new(stats.clone(), None)),
            stats,
            config,
            subscriptions: SubscriptionRegistry::new(),
            event_types: Arc::new(EventTypeRegistry::new()),
            validator: None,
            runtime: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Validate every event before dispatch
    pub fn with_validator(mut self, validator: Arc<dyn EventValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Route failed and shed async tasks to a dead-letter sink
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.executor = Arc::new(Executor::new(self.stats.clone(), Some(sink)));
        self
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    // ─── Lifecycle ───

    /// Start the worker pool and batch processor
    pub async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        let _lifecycle = self.lifecycle.lock().await;
        let mut runtime = self.runtime.write().unwrap_or_else(PoisonError::into_inner);
        if runtime.is_some() {
            return Err(EventError::AlreadyRunning(COMPONENT));
        }
        *runtime = Some(Arc::new(DispatchRuntime::start(
            &self.config,
            self.executor.clone(),
        )));

        tracing::info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            queue_size = self.config.queue_size,
            batch_size = self.config.batch_size,
            "Event bus started"
        );
        Ok(())
    }

    /// Stop within the configured shutdown timeout
    pub async fn stop(&self, ctx: &CancellationToken) -> Result<()> {
        self.stop_within(ctx, self.config.shutdown_timeout).await
    }

    /// Stop, draining accepted async work within `min(budget, shutdown_timeout)`
    ///
    /// The bus stops accepting publishes immediately. If draining does not
    /// finish in time a `Timeout` error reports the tasks still running.
    pub async fn stop_within(&self, ctx: &CancellationToken, budget: Duration) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let runtime = self
            .runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EventError::NotRunning(COMPONENT))?;

        let budget = budget.min(self.config.shutdown_timeout);
        let result = tokio::select! {
            drained = runtime.drain(budget) => drained,
            _ = ctx.cancelled() => Err(EventError::Cancelled),
        };

        match &result {
            Ok(()) => tracing::info!("Event bus stopped"),
            Err(e) => tracing::warn!(error = %e, "Event bus stopped before draining"),
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.current_runtime().is_some()
    }

    fn current_runtime(&self) -> Option<Arc<DispatchRuntime>> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ─── Event types ───

    /// Register an event type; fails if it is already registered
    pub fn register_event_type(&self, event_type: impl Into<EventType>) -> Result<()> {
        self.register_event_type_info(EventTypeInfo::new(event_type))
    }

    pub fn register_event_type_info(&self, info: EventTypeInfo) -> Result<()> {
        let event_type = info.event_type.clone();
        self.event_types.register(info)?;
        tracing::debug!(event_type = %event_type, "Event type registered");
        Ok(())
    }

    pub fn unregister_event_type(&self, event_type: &EventType) -> Result<()> {
        self.event_types.unregister(event_type)?;
        tracing::debug!(event_type = %event_type, "Event type unregistered");
        Ok(())
    }

    pub fn registered_event_types(&self) -> Vec<EventType> {
        self.event_types.list()
    }

    /// The bus's type registry, e.g. for `DefaultEventValidator::with_registry`
    pub fn event_types(&self) -> Arc<EventTypeRegistry> {
        self.event_types.clone()
    }

    // ─── Subscriptions ───

    /// Subscribe a handler to an event type, or to `*` for every event
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let subscription = self
            .subscriptions
            .add(event_type.into(), handler, options)?;
        tracing::debug!(
            subscription_id = %subscription.id,
            event_type = %subscription.event_type,
            priority = subscription.priority,
            async_dispatch = subscription.async_dispatch,
            "Subscription added"
        );
        Ok(subscription)
    }

    /// Subscribe with a filter predicate; rejected events are skipped silently
    pub fn subscribe_with_filter(
        &self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn EventHandler>,
        filter: impl Fn(&Event) -> bool + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.subscribe(event_type, handler, options.filter(filter))
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let removed = self.subscriptions.remove(subscription_id)?;
        tracing::debug!(
            subscription_id = %removed.id,
            event_type = %removed.event_type,
            "Subscription removed"
        );
        Ok(())
    }

    /// Remove every subscription of exactly `event_type`; returns how many
    pub fn unsubscribe_all(&self, event_type: &EventType) -> usize {
        let removed = self.subscriptions.remove_all(event_type);
        tracing::debug!(event_type = %event_type, removed, "Subscriptions removed");
        removed
    }

    /// Remove every subscription carrying `group`; returns how many
    pub fn unsubscribe_group(&self, group: &str) -> usize {
        let removed = self.subscriptions.remove_group(group);
        tracing::debug!(group, removed, "Subscription group removed");
        removed
    }

    /// Suspend (`false`) or resume (`true`) delivery without unsubscribing
    pub fn set_subscription_active(&self, subscription_id: &str, active: bool) -> Result<()> {
        self.subscriptions.set_active(subscription_id, active)?;
        tracing::debug!(subscription_id, active, "Subscription activity changed");
        Ok(())
    }

    /// Unsubscribe everything suspended for longer than `max_idle`; returns how many
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| chrono::Utc::now().checked_sub_signed(idle))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let removed = self.subscriptions.remove_inactive(cutoff);
        if removed > 0 {
            tracing::info!(removed, "Inactive subscriptions cleaned up");
        }
        removed
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.get(subscription_id)
    }

    /// All subscriptions in registration order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.list()
    }

    /// Subscriptions registered for exactly `event_type`
    pub fn subscription_count(&self, event_type: &EventType) -> usize {
        self.subscriptions.count(event_type)
    }

    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.total()
    }

    /// Live subscription count per event type
    pub fn subscriptions_by_type(&self) -> HashMap<EventType, usize> {
        self.subscriptions.type_counts()
    }

    /// Live subscription count per group
    pub fn subscriptions_by_group(&self) -> HashMap<String, usize> {
        self.subscriptions.group_counts()
    }

    // ─── Publishing ───

    /// Publish synchronously
    ///
    /// Every matching subscriber runs inline in priority order. All of them
    /// run even when one fails; the first failure is returned.
    pub async fn publish(&self, ctx: &CancellationToken, event: Event) -> Result<()> {
        self.admit(ctx, &event)?;
        let event = Arc::new(event);
        self.stats.record_publish(&event.event_type);

        let subscriptions = self.subscriptions.matching(&event.event_type);
        if subscriptions.is_empty() {
            tracing::debug!(event_type = %event.event_type, "No subscribers for event type");
            return Ok(());
        }

        let mut first_error = None;
        for subscription in subscriptions.iter().filter(|s| s.accepts(&event)) {
            if ctx.is_cancelled() {
                return Err(first_error.unwrap_or(EventError::Cancelled));
            }
            if let Err(source) = self.executor.run(subscription, event.clone()).await {
                if first_error.is_none() {
                    first_error = Some(EventError::Handler {
                        subscription_id: subscription.id.clone(),
                        source,
                    });
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Alias of [`publish`](Self::publish)
    pub async fn publish_sync(&self, ctx: &CancellationToken, event: Event) -> Result<()> {
        self.publish(ctx, event).await
    }

    /// Publish asynchronously at normal priority
    ///
    /// Returns once every async subscriber's task has been accepted or shed.
    /// Handler failures are logged, counted and dead-lettered, never returned.
    pub async fn publish_async(&self, ctx: &CancellationToken, event: Event) -> Result<()> {
        self.dispatch_async(ctx, event, EventPriority::NORMAL.value())
            .await
    }

    /// Publish asynchronously, recording `priority` in the statistics
    pub async fn publish_with_priority(
        &self,
        ctx: &CancellationToken,
        event: Event,
        priority: impl Into<EventPriority>,
    ) -> Result<()> {
        self.dispatch_async(ctx, event, priority.into().value())
            .await
    }

    async fn dispatch_async(
        &self,
        ctx: &CancellationToken,
        event: Event,
        priority: i32,
    ) -> Result<()> {
        self.admit(ctx, &event)?;
        let runtime = self
            .current_runtime()
            .ok_or(EventError::NotRunning(COMPONENT))?;

        let event = Arc::new(event);
        self.stats.record_publish(&event.event_type);
        self.stats.record_priority(priority);

        for subscription in self.subscriptions.matching(&event.event_type) {
            if !subscription.accepts(&event) {
                continue;
            }
            if ctx.is_cancelled() {
                return Err(EventError::Cancelled);
            }

            if subscription.async_dispatch {
                let task = Task::new(event.clone(), subscription, priority);
                if let Err(task) = runtime.submit(task) {
                    self.executor.shed(task).await;
                }
            } else {
                // failure already logged and counted by the executor
                let _ = self.executor.run(&subscription, event.clone()).await;
            }
        }
        Ok(())
    }

    fn admit(&self, ctx: &CancellationToken, event: &Event) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        if !self.is_running() {
            return Err(EventError::NotRunning(COMPONENT));
        }
        if let Some(validator) = &self.validator {
            validator.validate(event)?;
        }
        Ok(())
    }

    // ─── Introspection ───

    pub fn stats(&self) -> EventStats {
        let mut stats = self.stats.snapshot();
        stats.total_subscribers = self.subscriptions.total();
        stats
    }

    pub fn subscriber_stats(&self) -> SubscriberStats {
        let stats = self.stats.snapshot();
        SubscriberStats {
            total_subscribers: self.subscriptions.total(),
            active_subscribers: self.subscriptions.active_count(),
            events_delivered: stats.processed_tasks,
            delivery_errors: stats.total_errors(),
        }
    }

    /// Recent handler processing times, oldest first
    pub fn processing_times(&self) -> Vec<Duration> {
        self.stats.processing_times()
    }

    /// Worker pool snapshot; `None` while stopped
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.current_runtime()?.pool_stats().await
    }

    /// Add up to `n` workers, bounded by `max_workers`
    pub async fn add_workers(&self, n: usize) -> Result<()> {
        let runtime = self
            .current_runtime()
            .ok_or(EventError::NotRunning(COMPONENT))?;
        runtime.add_workers(n).await;
        Ok(())
    }

    /// Retire up to `n` workers, bounded by `min_workers`
    pub async fn retire_workers(&self, n: usize) -> Result<()> {
        let runtime = self
            .current_runtime()
            .ok_or(EventError::NotRunning(COMPONENT))?;
        runtime.retire_workers(n).await;
        Ok(())
    }
}
