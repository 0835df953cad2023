//! Mock event bus implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use super::{BusError, DispatchResult, Dispatcher, EventBus, PublishOutcome, Result};
use crate::envelope::EventEnvelope;

/// A message recorded by the mock bus.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: EventEnvelope,
}

/// Mock event bus for testing.
///
/// Records publishes, simulates broker downtime, and delivers payloads
/// straight into the subscribed dispatcher.
#[derive(Default)]
pub struct MockEventBus {
    published: RwLock<Vec<PublishedEvent>>,
    broker_down: RwLock<bool>,
    dropped: RwLock<usize>,
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
}

impl MockEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker being unreachable.
    pub async fn set_broker_down(&self, down: bool) {
        *self.broker_down.write().await = down;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Messages dropped while the broker was down.
    pub async fn dropped_count(&self) -> usize {
        *self.dropped.read().await
    }

    pub async fn take_published(&self) -> Vec<PublishedEvent> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Deliver a raw payload to the subscribed dispatcher, as the broker
    /// would.
    pub async fn deliver(&self, payload: &[u8]) -> Result<DispatchResult> {
        let dispatcher = self
            .dispatcher
            .read()
            .await
            .clone()
            .ok_or_else(|| BusError::Subscribe("No dispatcher subscribed".to_string()))?;

        Ok(dispatcher.dispatch(payload).await)
    }

    /// Deliver an envelope to the subscribed dispatcher.
    pub async fn deliver_envelope(&self, envelope: &EventEnvelope) -> Result<DispatchResult> {
        let payload = envelope.to_bytes()?;
        self.deliver(&payload).await
    }
}

#[async_trait]
impl EventBus for MockEventBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &EventEnvelope,
    ) -> PublishOutcome {
        if *self.broker_down.read().await {
            warn!(
                exchange = %exchange,
                event_type = %envelope.event_type,
                "Mock broker down, dropping message"
            );
            *self.dropped.write().await += 1;
            return PublishOutcome::Dropped;
        }

        self.published.write().await.push(PublishedEvent {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        });
        PublishOutcome::Published
    }

    async fn subscribe(&self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        *self.dispatcher.write().await = Some(dispatcher);
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        if self.dispatcher.read().await.is_none() {
            return Err(BusError::Subscribe(
                "Cannot consume: no dispatcher subscribed".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use crate::envelope::exchange;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_mock_bus_records_publishes() {
        let bus = MockEventBus::new();
        let envelope = EventEnvelope::new("BLOG_LIKED").field("blogId", "b1");

        let outcome = bus
            .publish(exchange::NOTIFICATION_EVENTS, "", &envelope)
            .await;

        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_bus_drops_when_down() {
        let bus = MockEventBus::new();
        bus.set_broker_down(true).await;

        let envelope = EventEnvelope::new("BLOG_LIKED");
        let outcome = bus
            .publish(exchange::NOTIFICATION_EVENTS, "", &envelope)
            .await;

        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(bus.published_count().await, 0);
        assert_eq!(bus.dropped_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_bus_delivers_to_dispatcher() {
        let bus = MockEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let mut dispatcher = Dispatcher::new();
        let counter = Arc::clone(&count);
        dispatcher.route(
            "USER_FOLLOWED",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        bus.subscribe(Arc::new(dispatcher)).await.unwrap();
        bus.start_consuming().await.unwrap();

        let result = bus
            .deliver_envelope(&EventEnvelope::new("USER_FOLLOWED"))
            .await
            .unwrap();

        assert_eq!(result, DispatchResult::Handled);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consume_requires_dispatcher() {
        let bus = MockEventBus::new();
        assert!(bus.start_consuming().await.is_err());
    }
}
