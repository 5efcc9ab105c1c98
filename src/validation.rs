//! Event type registry and event validation
//!
//! Registering types is optional for dispatch; the registry backs
//! `EventBus::register_event_type` and the optional publish-time validator.

use crate::error::{EventError, Result};
use crate::types::{Event, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Metadata about a registered event type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTypeInfo {
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Grouping label, defaults to the first dotted segment
    pub category: String,

    #[serde(default)]
    pub description: String,

    /// Optional payload schema description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default)]
    pub deprecated: bool,

    pub registered_at: DateTime<Utc>,
}

impl EventTypeInfo {
    pub fn new(event_type: impl Into<EventType>) -> Self {
        let event_type = event_type.into();
        Self {
            category: event_type.category().to_string(),
            event_type,
            description: String::new(),
            schema: None,
            deprecated: false,
            registered_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }
}

/// Registry of known event types
#[derive(Default)]
pub struct EventTypeRegistry {
    types: RwLock<HashMap<EventType, EventTypeInfo>>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type; fails if it is already registered
    pub fn register(&self, info: EventTypeInfo) -> Result<()> {
        if info.event_type.is_empty() {
            return Err(EventError::Config(
                "Event type cannot be empty".to_string(),
            ));
        }
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        if types.contains_key(&info.event_type) {
            return Err(EventError::AlreadyRegistered(info.event_type.to_string()));
        }
        let mut info = info;
        info.registered_at = Utc::now();
        types.insert(info.event_type.clone(), info);
        Ok(())
    }

    pub fn unregister(&self, event_type: &EventType) -> Result<()> {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        types
            .remove(event_type)
            .map(|_| ())
            .ok_or_else(|| EventError::NotRegistered(event_type.to_string()))
    }

    pub fn is_registered(&self, event_type: &EventType) -> bool {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types.contains_key(event_type)
    }

    pub fn info(&self, event_type: &EventType) -> Option<EventTypeInfo> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types.get(event_type).cloned()
    }

    /// All registered types, sorted
    pub fn list(&self) -> Vec<EventType> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<EventType> = types.keys().cloned().collect();
        list.sort();
        list
    }

    pub fn by_category(&self, category: &str) -> Vec<EventTypeInfo> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<EventTypeInfo> = types
            .values()
            .filter(|info| info.category == category)
            .cloned()
            .collect();
        infos.sort_by(|a, b| a.event_type.cmp(&b.event_type));
        infos
    }
}

/// Publish-time event validation
pub trait EventValidator: Send + Sync {
    fn validate(&self, event: &Event) -> Result<()>;
}

/// Checks required fields and, optionally, that the type is registered
pub struct DefaultEventValidator {
    registry: Option<std::sync::Arc<EventTypeRegistry>>,
}

impl DefaultEventValidator {
    /// Structural checks only
    pub fn new() -> Self {
        Self { registry: None }
    }

    /// Structural checks plus registration of the event type
    pub fn with_registry(registry: std::sync::Arc<EventTypeRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }
}

impl Default for DefaultEventValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(field: &str, message: &str) -> EventError {
    EventError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}

impl EventValidator for DefaultEventValidator {
    fn validate(&self, event: &Event) -> Result<()> {
        if event.event_type.is_empty() {
            return Err(invalid("type", "event type cannot be empty"));
        }
        if event.event_type.is_wildcard() {
            return Err(invalid("type", "the wildcard type cannot be published"));
        }
        if let Some(registry) = &self.registry {
            if !registry.is_registered(&event.event_type) {
                return Err(invalid("type", "event type is not registered"));
            }
        }
        if event.id.is_empty() {
            return Err(invalid("id", "event ID cannot be empty"));
        }
        if event.source.is_empty() {
            return Err(invalid("source", "event source cannot be empty"));
        }
        Ok(())
    }
}
