//! Dead letter publishing.
//!
//! Messages whose handler keeps failing after broker redelivery are routed
//! here instead of being silently dropped or requeued forever. Dead letters
//! land on the durable `herald.dlq` exchange with the source queue as the
//! routing key, giving per-queue isolation for review and replay.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::envelope::{exchange, EventEnvelope};

/// Event type tag carried by dead-letter envelopes.
pub const DEAD_LETTER_TYPE: &str = "DEAD_LETTER";

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),
}

/// A message that exhausted its delivery attempts.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// Queue the message was consumed from.
    pub source_queue: String,
    /// Event type of the failed message, if it decoded.
    pub event_type: String,
    /// Raw payload as delivered.
    pub payload: Vec<u8>,
    /// Why the message was dead-lettered.
    pub reason: String,
    /// Delivery attempts before routing here.
    pub attempts: u32,
    /// When the final failure occurred.
    pub occurred_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Build an entry from a failed delivery.
    pub fn from_delivery(
        source_queue: impl Into<String>,
        payload: Vec<u8>,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let event_type = EventEnvelope::from_bytes(&payload)
            .map(|e| e.event_type)
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            source_queue: source_queue.into(),
            event_type,
            payload,
            reason: reason.into(),
            attempts,
            occurred_at: Utc::now(),
        }
    }

    /// Routing key on the dead-letter exchange.
    pub fn routing_key(&self) -> &str {
        &self.source_queue
    }

    /// Wrap the entry as an envelope for bus transport.
    ///
    /// The original payload is embedded verbatim when it is valid JSON,
    /// otherwise as a lossy string.
    pub fn to_envelope(&self) -> EventEnvelope {
        let payload: Value = serde_json::from_slice(&self.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.payload).into_owned()));

        EventEnvelope::new(DEAD_LETTER_TYPE)
            .field("sourceQueue", self.source_queue.clone())
            .field("eventType", self.event_type.clone())
            .field("payload", payload)
            .field("reason", self.reason.clone())
            .field("attempts", self.attempts)
            .field("occurredAt", self.occurred_at.to_rfc3339())
    }
}

/// Trait for publishing dead letters.
///
/// Implementations handle the actual transport (bus-backed, in-memory,
/// noop).
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter.
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op publisher that logs but doesn't send anywhere.
///
/// Used when no DLQ is configured.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), DlqError> {
        warn!(
            source_queue = %entry.source_queue,
            event_type = %entry.event_type,
            reason = %entry.reason,
            "DLQ not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory publisher using a channel. Used for tests.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetterEntry>,
}

impl ChannelDeadLetterPublisher {
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetterEntry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), DlqError> {
        info!(
            source_queue = %entry.source_queue,
            event_type = %entry.event_type,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(entry)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// Publisher that routes dead letters through an `EventBus` onto the
/// durable dead-letter exchange.
pub struct BusDeadLetterPublisher {
    bus: Arc<dyn EventBus>,
}

impl BusDeadLetterPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DeadLetterPublisher for BusDeadLetterPublisher {
    async fn publish(&self, entry: DeadLetterEntry) -> Result<(), DlqError> {
        let envelope = entry.to_envelope();
        let outcome = self
            .bus
            .publish(exchange::DEAD_LETTER, entry.routing_key(), &envelope)
            .await;

        if outcome.is_published() {
            info!(
                source_queue = %entry.source_queue,
                event_type = %entry.event_type,
                "Dead letter published"
            );
            Ok(())
        } else {
            Err(DlqError::PublishFailed(format!(
                "bus dropped dead letter from queue '{}'",
                entry.source_queue
            )))
        }
    }
}
