//! Subscriptions and the options used to create them

use crate::handler::EventHandler;
use crate::types::{Event, EventPriority, EventType};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a subscription sees an event
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Default handler timeout hint
pub const DEFAULT_TIMEOUT_HINT: Duration = Duration::from_secs(30);

/// Options for [`EventBus::subscribe`](crate::EventBus::subscribe)
///
/// ```rust
/// use evbus::{EventPriority, SubscribeOptions};
///
/// let opts = SubscribeOptions::default()
///     .priority(EventPriority::HIGH.value())
///     .async_dispatch(false)
///     .group("ui")
///     .filter(|event| event.source == "player");
/// assert_eq!(opts.group.as_deref(), Some("ui"));
/// ```
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Higher values dispatch first
    pub priority: i32,

    /// Dispatch through the worker pool on async publish
    pub async_dispatch: bool,

    /// Expected upper bound for one invocation; slower runs are logged
    pub timeout_hint: Duration,

    /// Optional label for bulk removal
    pub group: Option<String>,

    /// Optional predicate; rejected events are skipped silently
    pub filter: Option<EventFilter>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            priority: EventPriority::NORMAL.value(),
            async_dispatch: true,
            timeout_hint: DEFAULT_TIMEOUT_HINT,
            group: None,
            filter: None,
        }
    }
}

impl SubscribeOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn async_dispatch(mut self, async_dispatch: bool) -> Self {
        self.async_dispatch = async_dispatch;
        self
    }

    pub fn timeout_hint(mut self, timeout: Duration) -> Self {
        self.timeout_hint = timeout;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn filter(mut self, filter: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("priority", &self.priority)
            .field("async_dispatch", &self.async_dispatch)
            .field("timeout_hint", &self.timeout_hint)
            .field("group", &self.group)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// A registered subscription
///
/// Cheap to clone; the handler and filter are shared.
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub event_type: EventType,
    pub priority: i32,
    pub async_dispatch: bool,
    pub timeout_hint: Duration,
    pub group: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Suspended subscriptions stay registered but receive nothing
    pub active: bool,
    /// Set when the subscription was last suspended
    pub deactivated_at: Option<DateTime<Utc>>,
    pub(crate) sequence: u64,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) filter: Option<EventFilter>,
}

impl Subscription {
    pub(crate) fn new(
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
        sequence: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            priority: options.priority,
            async_dispatch: options.async_dispatch,
            timeout_hint: options.timeout_hint,
            group: options.group,
            created_at: Utc::now(),
            active: true,
            deactivated_at: None,
            sequence,
            handler,
            filter: options.filter,
        }
    }

    /// True when the subscription's filter (if any) accepts the event
    pub fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// Dispatch order: priority descending, then registration order
    pub(crate) fn dispatch_order(a: &Subscription, b: &Subscription) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.sequence.cmp(&b.sequence))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .field("async_dispatch", &self.async_dispatch)
            .field("group", &self.group)
            .field("created_at", &self.created_at)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerResult};

    fn noop() -> Arc<dyn EventHandler> {
        handler_fn(|_event: Arc<Event>| async move { HandlerResult::Ok(()) })
    }

    #[test]
    fn test_default_options() {
        let opts = SubscribeOptions::default();
        assert_eq!(opts.priority, 100);
        assert!(opts.async_dispatch);
        assert_eq!(opts.timeout_hint, DEFAULT_TIMEOUT_HINT);
        assert!(opts.group.is_none());
        assert!(opts.filter.is_none());
    }

    #[test]
    fn test_filter_accepts() {
        let sub = Subscription::new(
            "player.play".into(),
            noop(),
            SubscribeOptions::default().filter(|e| e.source == "player"),
            1,
        );
        assert!(sub.accepts(&Event::new("player.play", "player", serde_json::Value::Null)));
        assert!(!sub.accepts(&Event::new("player.play", "ui", serde_json::Value::Null)));
    }

    #[test]
    fn test_dispatch_order_is_priority_then_sequence() {
        let low = Subscription::new("a".into(), noop(), SubscribeOptions::default().priority(0), 1);
        let high_late =
            Subscription::new("a".into(), noop(), SubscribeOptions::default().priority(5), 3);
        let high_early =
            Subscription::new("a".into(), noop(), SubscribeOptions::default().priority(5), 2);

        let mut subs = vec![low, high_late, high_early];
        subs.sort_by(Subscription::dispatch_order);
        let order: Vec<u64> = subs.iter().map(|s| s.sequence).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
