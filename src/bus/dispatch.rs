//! Handler dispatch for consumed messages.
//!
//! Each consuming service owns one `Dispatcher` per queue: a pure mapping
//! from event `type` to an async handler. The dispatcher decodes the
//! envelope, routes it, and reports a `DispatchResult` that the bus turns
//! into an ack decision.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use super::BusError;
use crate::envelope::EventEnvelope;

/// Handler for one event type.
///
/// Broker-level redelivery can occur after a consumer restart, so every
/// handler must be safe to run more than once with the same envelope.
pub trait EventHandler: Send + Sync {
    /// Process an envelope.
    fn handle(
        &self,
        envelope: Arc<EventEnvelope>,
    ) -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> BoxFuture<'static, std::result::Result<(), BusError>>
        + Send
        + Sync,
{
    fn handle(
        &self,
        envelope: Arc<EventEnvelope>,
    ) -> BoxFuture<'static, std::result::Result<(), BusError>> {
        (self.0)(envelope)
    }
}

/// Build an `EventHandler` from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Box<dyn EventHandler>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), BusError>> + Send + 'static,
{
    Box::new(FnHandler(move |envelope| {
        Box::pin(f(envelope)) as BoxFuture<'static, _>
    }))
}

/// Result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Handler ran and succeeded; acknowledge.
    Handled,
    /// No handler registered for this event type. Logged and acknowledged
    /// without action, never requeued, to avoid poison-message loops.
    UnknownType,
    /// Payload was not a valid envelope. No retry will help; acknowledge.
    DecodeError,
    /// Handler returned an error; candidate for redelivery or dead-letter.
    HandlerFailed,
}

impl DispatchResult {
    /// Returns true if the message should be acknowledged (removed from
    /// the queue) rather than retried.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::HandlerFailed)
    }
}

/// Routes envelopes by event type to registered handlers.
///
/// Routes are registered at composition time, then the dispatcher is
/// shared immutably with the bus.
#[derive(Default)]
pub struct Dispatcher {
    routes: HashMap<String, Box<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type, replacing any previous one.
    pub fn route(&mut self, event_type: impl Into<String>, handler: Box<dyn EventHandler>) {
        self.routes.insert(event_type.into(), handler);
    }

    /// Event types this dispatcher understands.
    pub fn event_types(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Decode a delivered payload and route it to its handler.
    pub async fn dispatch(&self, payload: &[u8]) -> DispatchResult {
        let envelope = match EventEnvelope::from_bytes(payload) {
            Ok(envelope) => Arc::new(envelope),
            Err(e) => {
                error!(error = %e, "Failed to decode envelope");
                return DispatchResult::DecodeError;
            }
        };

        let handler = match self.routes.get(&envelope.event_type) {
            Some(handler) => handler,
            None => {
                warn!(event_type = %envelope.event_type, "No handler for event type, ignoring");
                return DispatchResult::UnknownType;
            }
        };

        debug!(event_type = %envelope.event_type, "Dispatching event");

        match handler.handle(Arc::clone(&envelope)).await {
            Ok(()) => DispatchResult::Handled,
            Err(e) => {
                error!(event_type = %envelope.event_type, error = %e, "Handler failed");
                DispatchResult::HandlerFailed
            }
        }
    }
}
