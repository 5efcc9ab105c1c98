//! Event handler trait and the panic boundary around every invocation

use crate::error::HandlerError;
use crate::types::Event;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Outcome of a single handler invocation
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Subscriber code invoked for matching events
///
/// Implemented for any `Fn(Arc<Event>) -> impl Future<Output = HandlerResult>`,
/// so closures can be registered directly (see [`handler_fn`]).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. The payload is shared and must be treated as read-only.
    async fn handle(&self, event: Arc<Event>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> HandlerResult {
        (self)(event).await
    }
}

/// Wrap an async closure into a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}

/// Run a handler, converting a panic into [`HandlerError::Panicked`]
pub async fn invoke(handler: &dyn EventHandler, event: Arc<Event>) -> HandlerResult {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
