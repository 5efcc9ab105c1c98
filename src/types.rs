//! Core event types for the evbus system
//!
//! All types use camelCase JSON serialization.

use crate::error::{EventError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Hierarchical, dot-separated event type (e.g. `player.play`)
///
/// The special value `*` is the wildcard: subscribers registered for it
/// receive every published event in addition to type-specific subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Wildcard literal
    pub const WILDCARD: &'static str = "*";

    /// Create an event type
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The wildcard type matching every event
    pub fn all() -> Self {
        Self(Self::WILDCARD.to_string())
    }

    /// True for the wildcard type
    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }

    /// True for an empty type string
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First dotted segment, or `"unknown"` when there is none
    pub fn category(&self) -> &str {
        match self.0.split('.').next() {
            Some(first) if !first.is_empty() => first,
            _ => "unknown",
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EventType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Dispatch priority; higher values dispatch first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPriority(pub i32);

impl EventPriority {
    pub const LOW: Self = Self(0);
    pub const NORMAL: Self = Self(100);
    pub const HIGH: Self = Self(200);
    pub const CRITICAL: Self = Self(300);

    pub fn value(self) -> i32 {
        self.0
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for EventPriority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// Payload schema declared by an event type
///
/// Lets producers and handlers exchange typed payloads instead of raw JSON:
///
/// ```rust
/// use evbus::{Event, EventPayload};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct VolumeChanged { volume: f64 }
///
/// impl EventPayload for VolumeChanged {
///     const EVENT_TYPE: &'static str = "player.volume_changed";
/// }
///
/// let event = Event::from_payload("player", &VolumeChanged { volume: 0.5 }).unwrap();
/// let payload: VolumeChanged = event.payload().unwrap();
/// assert_eq!(payload.volume, 0.5);
/// ```
pub trait EventPayload: Serialize + DeserializeOwned {
    /// Event type this payload is published under
    const EVENT_TYPE: &'static str;
}

/// A single immutable event
///
/// Events are created once by a producer and handed to the bus, which fans
/// out shared read-only references (`Arc<Event>`) to handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Event type (e.g., "player.play")
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Producer identifier
    pub source: String,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    /// Event payload — arbitrary JSON data
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    /// Create a new event with auto-generated id and timestamp
    pub fn new(
        event_type: impl Into<EventType>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Create an event from a typed payload
    pub fn from_payload<P: EventPayload>(source: impl Into<String>, payload: &P) -> Result<Self> {
        let data = serde_json::to_value(payload)?;
        Ok(Self::new(P::EVENT_TYPE, source, data))
    }

    /// Decode the payload as `P`, checking that the event type matches
    pub fn payload<P: EventPayload>(&self) -> Result<P> {
        if self.event_type.as_str() != P::EVENT_TYPE {
            return Err(EventError::Validation {
                field: "type".to_string(),
                message: format!(
                    "expected event type '{}', found '{}'",
                    P::EVENT_TYPE,
                    self.event_type
                ),
            });
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Replace the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the creation timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Category derived from the event type
    pub fn category(&self) -> &str {
        self.event_type.category()
    }
}

/// Aggregate bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    /// Events accepted by any publish call
    pub total_events: u64,

    /// Live subscriptions at the time of the snapshot
    pub total_subscribers: usize,

    /// Published events per type
    pub event_counts: HashMap<EventType, u64>,

    /// Handler failures (errors and panics) per type
    pub error_counts: HashMap<EventType, u64>,

    /// Async publishes per priority value
    pub priority_counts: HashMap<i32, u64>,

    /// Async tasks shed because both the queue and the batch backlog were full
    pub dropped_events: u64,

    /// Recovered handler panics
    pub handler_panics: u64,

    /// Handler invocations completed (success or failure)
    pub processed_tasks: u64,

    /// Time of the most recent publish
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Subscriber-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStats {
    pub total_subscribers: usize,
    /// Subscriptions not suspended
    pub active_subscribers: usize,
    /// Completed handler invocations
    pub events_delivered: u64,
    /// Failed handler invocations
    pub delivery_errors: u64,
}

impl EventStats {
    /// Total handler failures across all types
    pub fn total_errors(&self) -> u64 {
        self.error_counts.values().sum()
    }
}
