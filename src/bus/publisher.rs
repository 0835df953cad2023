//! Thin publish API used by business logic.
//!
//! Services hold an `EventPublisher` and emit typed events without caring
//! about envelope construction or broker details. Publishing never feeds
//! an error back into the triggering business operation.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::{EventBus, PublishOutcome};
use crate::envelope::EventEnvelope;

/// Per-service handle for emitting events onto the fabric.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// Emit an event with an empty routing key (broadcast to all bindings
    /// on the exchange).
    pub async fn emit(
        &self,
        exchange: &str,
        event_type: &str,
        fields: Map<String, Value>,
    ) -> PublishOutcome {
        self.emit_routed(exchange, "", event_type, fields).await
    }

    /// Emit an event with an explicit routing key.
    pub async fn emit_routed(
        &self,
        exchange: &str,
        routing_key: &str,
        event_type: &str,
        fields: Map<String, Value>,
    ) -> PublishOutcome {
        let envelope = EventEnvelope::with_payload(event_type, fields);
        let outcome = self.bus.publish(exchange, routing_key, &envelope).await;
        debug!(
            exchange = %exchange,
            event_type = %event_type,
            outcome = ?outcome,
            "Emitted event"
        );
        outcome
    }
}
