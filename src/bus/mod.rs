//! Event bus for async delivery between services.
//!
//! This module contains:
//! - `EventBus` trait: publish to topic exchanges, consume from a bound queue
//! - `Dispatcher`: per-queue routing of envelopes to typed handlers
//! - Bus configuration types
//! - Implementations: AMQP (RabbitMQ), Mock, and the outbox wrapper

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::envelope::EventEnvelope;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod dispatch;
pub mod mock;
#[cfg(feature = "sqlite")]
pub mod outbox;
pub mod publisher;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpEventBus};
pub use dispatch::{handler_fn, DispatchResult, Dispatcher, EventHandler};
pub use mock::MockEventBus;
#[cfg(feature = "sqlite")]
pub use outbox::{spawn_recovery_task, OutboxConfig, RecoveryTaskHandle, SqliteOutboxEventBus};
pub use publisher::EventPublisher;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler for '{event_type}' failed: {message}")]
    Handler { event_type: String, message: String },

    #[error("Envelope decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Subscribe not supported for this bus type")]
    SubscribeNotSupported,
}

/// Result of a publish attempt.
///
/// Publishing is best-effort by design: when the broker is unreachable the
/// message is logged and dropped, and the caller's primary operation
/// proceeds. Callers that need guaranteed delivery wrap the bus in
/// `SqliteOutboxEventBus`, which retains dropped messages for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message.
    Published,
    /// The message was dropped (broker unreachable, channel closed, or the
    /// envelope failed to serialize). Already logged by the bus.
    Dropped,
}

impl PublishOutcome {
    /// Returns true if the broker accepted the message.
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published)
    }
}

/// Interface for event delivery between services.
///
/// Implementations:
/// - `AmqpEventBus`: RabbitMQ via AMQP
/// - `MockEventBus`: in-memory, for tests
/// - `SqliteOutboxEventBus`: outbox wrapper around either
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an envelope to a topic exchange.
    ///
    /// `routing_key` may be empty, meaning broadcast to every binding on
    /// the exchange. Never blocks on broker availability and never returns
    /// an error for infrastructure failures; see `PublishOutcome`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &EventEnvelope,
    ) -> PublishOutcome;

    /// Register the dispatcher that will receive consumed messages.
    async fn subscribe(&self, dispatcher: Arc<Dispatcher>) -> Result<()>;

    /// Start the consume loop for the configured queue.
    async fn start_consuming(&self) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// A queue-to-exchange binding with a routing-key pattern.
///
/// An empty pattern is normalized to `#` (match everything on the
/// exchange).
#[derive(Debug, Clone, Deserialize)]
pub struct QueueBinding {
    /// Exchange to bind against.
    pub exchange: String,
    /// Routing-key pattern, e.g. `blog.#`.
    #[serde(default)]
    pub pattern: String,
}

impl QueueBinding {
    pub fn new(exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            pattern: pattern.into(),
        }
    }

    /// The pattern as sent to the broker.
    pub fn effective_pattern(&self) -> &str {
        if self.pattern.is_empty() {
            "#"
        } else {
            &self.pattern
        }
    }
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP-specific configuration.
    pub amqp: AmqpBusConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            amqp: AmqpBusConfig::default(),
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Queue to consume from (consumer processes only).
    pub queue: Option<String>,
    /// Bindings for the consume queue.
    pub bindings: Vec<QueueBinding>,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            queue: None,
            bindings: Vec::new(),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Mode for event bus initialization.
#[derive(Debug, Clone)]
pub enum EventBusMode {
    /// Publisher-only mode (no consuming).
    Publisher,
    /// Consumer mode for one queue and its bindings.
    Consumer {
        /// Queue name.
        queue: String,
        /// Bindings for the queue.
        bindings: Vec<QueueBinding>,
    },
}

/// Initialize an event bus from configuration.
///
/// Requires the `amqp` feature; the mock and outbox implementations are
/// constructed directly by callers.
#[cfg(feature = "amqp")]
pub async fn init_event_bus(
    config: &MessagingConfig,
    mode: EventBusMode,
) -> Result<Arc<dyn EventBus>> {
    let amqp_config = match mode {
        EventBusMode::Publisher => AmqpConfig::publisher(&config.amqp.url),
        EventBusMode::Consumer { queue, bindings } => {
            AmqpConfig::consumer(&config.amqp.url, queue, bindings)
        }
    };

    let bus = AmqpEventBus::new(amqp_config).await?;
    info!(messaging_type = "amqp", "Event bus initialized");
    Ok(Arc::new(bus))
}
