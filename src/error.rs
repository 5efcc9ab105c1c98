//! Error types for evbus

use thiserror::Error;

/// Failure produced by subscriber code
///
/// Separates a handler that returned an error from a handler that panicked
/// and was recovered at the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler reported a business failure
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler panicked; the panic was caught and converted
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create a business failure from any displayable value
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    /// True when this error is a recovered panic
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Short stable label for logs and counters
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Failed(_) => "handler_failed",
            Self::Panicked(_) => "handler_panicked",
        }
    }
}

/// Errors that can occur in the event system
#[derive(Debug, Error)]
pub enum EventError {
    /// Invalid configuration or subscription options
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event type registered twice
    #[error("Event type '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Event type not present in the type registry
    #[error("Event type '{0}' is not registered")]
    NotRegistered(String),

    /// Event failed validation
    #[error("Validation error on field '{field}': {message}")]
    Validation { field: String, message: String },

    /// Unknown subscription id
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Event not found in a store
    #[error("Event not found: {0}")]
    NotFound(String),

    /// A subscriber handler failed during synchronous dispatch
    #[error("Handler for subscription '{subscription_id}' failed: {source}")]
    Handler {
        subscription_id: String,
        #[source]
        source: HandlerError,
    },

    /// Component started twice
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Component used or stopped while not running
    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation not valid for the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A replay session is already active
    #[error("A replay is already in progress")]
    ReplayInProgress,

    /// Nothing left to replay after filtering
    #[error("No events to replay")]
    NoEventsToReplay,

    /// Replay aborted by a handler failure
    #[error("Replay failed on event '{event_id}': {source}")]
    Replay {
        event_id: String,
        #[source]
        source: HandlerError,
    },

    /// Backing storage failure (snapshot file, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventError {
    /// Returns a short stable label (snake_case) for logs and counters
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::NotRegistered(_) => "not_registered",
            Self::Validation { .. } => "validation",
            Self::SubscriptionNotFound(_) => "subscription_not_found",
            Self::NotFound(_) => "not_found",
            Self::Handler { .. } => "handler",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotRunning(_) => "not_running",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidState { .. } => "invalid_state",
            Self::ReplayInProgress => "replay_in_progress",
            Self::NoEventsToReplay => "no_events_to_replay",
            Self::Replay { .. } => "replay",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for event operations
pub type Result<T> = std::result::Result<T, EventError>;
