//! AMQP (RabbitMQ) event bus implementation.
//!
//! Publishes envelopes to durable topic exchanges and consumes from a
//! durable queue bound with routing-key patterns. Publishing is
//! fire-and-forget: a broker outage drops the message (logged) rather than
//! blocking or failing the caller's primary operation. The consume loop
//! reconnects forever with exponential backoff.

use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::{
    BusError, DispatchResult, Dispatcher, EventBus, PublishOutcome, QueueBinding, Result,
};
use crate::dlq::{DeadLetterEntry, DeadLetterPublisher, NoopDeadLetterPublisher};
use crate::envelope::{exchange, EventEnvelope};

/// Exchanges declared on every connection.
const EXCHANGES: &[&str] = &[
    exchange::USER_EVENTS,
    exchange::BLOG_EVENTS,
    exchange::COMMENT_EVENTS,
    exchange::NOTIFICATION_EVENTS,
    exchange::MEDIA_EVENTS,
    exchange::EMAIL_EVENTS,
    exchange::DEAD_LETTER,
];

/// Configuration for AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Queue name for consuming (used by consumers).
    pub queue: Option<String>,
    /// Bindings for the consume queue.
    pub bindings: Vec<QueueBinding>,
}

impl AmqpConfig {
    /// Create config for publishing only.
    pub fn publisher(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: None,
            bindings: Vec::new(),
        }
    }

    /// Create config for consuming a queue with the given bindings.
    pub fn consumer(
        url: impl Into<String>,
        queue: impl Into<String>,
        bindings: Vec<QueueBinding>,
    ) -> Self {
        Self {
            url: url.into(),
            queue: Some(queue.into()),
            bindings,
        }
    }
}

/// AMQP event bus implementation using RabbitMQ.
///
/// One pool per constructed instance; services own their bus explicitly
/// and inject it where needed.
pub struct AmqpEventBus {
    pool: Pool,
    config: AmqpConfig,
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
    dlq: Arc<dyn DeadLetterPublisher>,
}

impl AmqpEventBus {
    /// Create a new AMQP event bus.
    ///
    /// The broker connection is established lazily on first use, so
    /// construction succeeds while the broker is down: publishes drop
    /// (logged) and the consumer loop keeps retrying until it connects.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        Self::with_dead_letter_publisher(config, Arc::new(NoopDeadLetterPublisher)).await
    }

    /// Create a bus that routes repeatedly failing deliveries to `dlq`.
    pub async fn with_dead_letter_publisher(
        config: AmqpConfig,
        dlq: Arc<dyn DeadLetterPublisher>,
    ) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        info!(url = %config.url, "AMQP event bus configured");

        Ok(Self {
            pool,
            config,
            dispatcher: RwLock::new(None),
            dlq,
        })
    }

    /// Declare the exchange topology on a channel. Declarations are
    /// idempotent, so every fresh channel runs them.
    async fn declare_exchanges(channel: &Channel) -> Result<()> {
        for name in EXCHANGES {
            channel
                .exchange_declare(
                    name,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BusError::Connection(format!("Failed to declare exchange '{}': {}", name, e))
                })?;
        }
        Ok(())
    }

    /// Get a channel from the pool with the exchanges declared.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        Self::declare_exchanges(&channel).await?;
        Ok(channel)
    }

    /// Consumer loop with automatic reconnection and exponential backoff
    /// with jitter. Deliveries are processed one at a time, preserving
    /// queue FIFO order.
    async fn consume_with_reconnect(
        pool: Pool,
        queue: String,
        bindings: Vec<QueueBinding>,
        dispatcher: Arc<Dispatcher>,
        dlq: Arc<dyn DeadLetterPublisher>,
    ) {
        use futures::StreamExt;
        use std::time::Duration;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            match Self::setup_consumer(&pool, &queue, &bindings).await {
                Ok(mut consumer) => {
                    info!(queue = %queue, "Consumer connected, processing messages");
                    // Reset backoff on successful connection
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                Self::process_delivery(delivery, &queue, &dispatcher, &dlq).await;
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(queue = %queue, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Declare the queue, apply its bindings, and start consuming.
    async fn setup_consumer(
        pool: &Pool,
        queue: &str,
        bindings: &[QueueBinding],
    ) -> Result<lapin::Consumer> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        // Exchanges must exist before the queue can bind to them
        Self::declare_exchanges(&channel).await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        for binding in bindings {
            channel
                .queue_bind(
                    queue,
                    &binding.exchange,
                    binding.effective_pattern(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BusError::Subscribe(format!(
                        "Failed to bind queue to '{}': {}",
                        binding.exchange, e
                    ))
                })?;

            info!(
                queue = %queue,
                exchange = %binding.exchange,
                pattern = %binding.effective_pattern(),
                "Bound queue to exchange"
            );
        }

        let consumer = channel
            .basic_consume(
                queue,
                "herald-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer)
    }

    /// Process a single delivery: dispatch, then ack, requeue, or
    /// dead-letter.
    ///
    /// First handler failure nacks with requeue; a failure on a redelivered
    /// message goes to the DLQ and is acked, bounding retries to one
    /// broker-level redelivery.
    async fn process_delivery(
        delivery: lapin::message::Delivery,
        queue: &str,
        dispatcher: &Arc<Dispatcher>,
        dlq: &Arc<dyn DeadLetterPublisher>,
    ) {
        let result = dispatcher.dispatch(&delivery.data).await;

        if result.should_ack() {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "Failed to ack message");
            }
            return;
        }

        debug_assert_eq!(result, DispatchResult::HandlerFailed);

        if !delivery.redelivered {
            debug!(queue = %queue, "Handler failed on first delivery, requeueing");
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                error!(error = %e, "Failed to nack message");
            }
            return;
        }

        let entry = DeadLetterEntry::from_delivery(
            queue,
            delivery.data.clone(),
            "handler failed after redelivery",
            2,
        );

        if let Err(e) = dlq.publish(entry).await {
            error!(error = %e, queue = %queue, "Failed to publish dead letter");
        }

        // Acked either way: a message that failed twice must not loop.
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, "Failed to ack dead-lettered message");
        }
    }
}

#[async_trait]
impl EventBus for AmqpEventBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &EventEnvelope,
    ) -> PublishOutcome {
        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to serialize envelope, dropping"
                );
                return PublishOutcome::Dropped;
            }
        };

        let channel = match self.get_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(
                    exchange = %exchange,
                    event_type = %envelope.event_type,
                    error = %e,
                    "No channel available, dropping message"
                );
                return PublishOutcome::Dropped;
            }
        };

        let publish = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2), // persistent
            )
            .await;

        match publish {
            Ok(confirm) => match confirm.await {
                Ok(_) => {
                    debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        event_type = %envelope.event_type,
                        "Published event"
                    );
                    PublishOutcome::Published
                }
                Err(e) => {
                    error!(
                        exchange = %exchange,
                        event_type = %envelope.event_type,
                        error = %e,
                        "Publish confirmation failed, dropping message"
                    );
                    PublishOutcome::Dropped
                }
            },
            Err(e) => {
                error!(
                    exchange = %exchange,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Publish failed, dropping message"
                );
                PublishOutcome::Dropped
            }
        }
    }

    async fn subscribe(&self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        if self.config.queue.is_none() {
            return Err(BusError::Subscribe(
                "Cannot subscribe: no queue configured. Use AmqpConfig::consumer()".to_string(),
            ));
        }

        *self.dispatcher.write().await = Some(dispatcher);
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        let queue = self
            .config
            .queue
            .clone()
            .ok_or_else(|| BusError::Subscribe("No queue configured".to_string()))?;

        let dispatcher = self
            .dispatcher
            .read()
            .await
            .clone()
            .ok_or_else(|| BusError::Subscribe("No dispatcher subscribed".to_string()))?;

        let pool = self.pool.clone();
        let bindings = self.config.bindings.clone();
        let dlq = Arc::clone(&self.dlq);

        tokio::spawn(async move {
            Self::consume_with_reconnect(pool, queue, bindings, dispatcher, dlq).await;
        });

        Ok(())
    }
}


/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test --features amqp amqp_integration -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::bus::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_publish_and_consume() {
        let url = amqp_url();
        let queue_name = format!("test-queue-{}", uuid::Uuid::new_v4());

        let publisher = AmqpEventBus::new(AmqpConfig::publisher(&url))
            .await
            .expect("Failed to create publisher");

        let consumer = AmqpEventBus::new(AmqpConfig::consumer(
            &url,
            &queue_name,
            vec![QueueBinding::new(exchange::NOTIFICATION_EVENTS, "")],
        ))
        .await
        .expect("Failed to create consumer");

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel::<String>(10);

        let mut dispatcher = Dispatcher::new();
        let counter = Arc::clone(&count);
        dispatcher.route(
            "BLOG_LIKED",
            handler_fn(move |envelope| {
                let counter = Arc::clone(&counter);
                let tx = tx.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx
                        .send(envelope.str_field("blogId").unwrap_or("").to_string())
                        .await;
                    Ok(())
                }
            }),
        );

        consumer.subscribe(Arc::new(dispatcher)).await.unwrap();
        consumer.start_consuming().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let envelope = EventEnvelope::new("BLOG_LIKED")
            .field("blogId", "b1")
            .field("likerId", "u1");
        let outcome = publisher
            .publish(exchange::NOTIFICATION_EVENTS, "", &envelope)
            .await;
        assert_eq!(outcome, PublishOutcome::Published);

        let blog_id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");

        assert_eq!(blog_id, "b1");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_routing_pattern_filters_messages() {
        let url = amqp_url();
        let queue_name = format!("test-pattern-{}", uuid::Uuid::new_v4());

        let publisher = AmqpEventBus::new(AmqpConfig::publisher(&url))
            .await
            .expect("Failed to create publisher");

        let consumer = AmqpEventBus::new(AmqpConfig::consumer(
            &url,
            &queue_name,
            vec![QueueBinding::new(exchange::BLOG_EVENTS, "blog.#")],
        ))
        .await
        .expect("Failed to create consumer");

        let count = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::clone(&count);
        dispatcher.route(
            "BLOG_DELETED",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        consumer.subscribe(Arc::new(dispatcher)).await.unwrap();
        consumer.start_consuming().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Matches blog.# binding
        publisher
            .publish(
                exchange::BLOG_EVENTS,
                "blog.deleted",
                &EventEnvelope::new("BLOG_DELETED").field("blogId", "b1"),
            )
            .await;
        // Does not match
        publisher
            .publish(
                exchange::BLOG_EVENTS,
                "admin.deleted",
                &EventEnvelope::new("BLOG_DELETED").field("blogId", "b2"),
            )
            .await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
