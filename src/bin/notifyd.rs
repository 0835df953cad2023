//! herald-notifyd: notification consumer daemon
//!
//! Consumes fabric events from AMQP, aggregates them into per-user
//! notifications in SQLite, and pushes live updates to connected clients.
//!
//! ## Architecture
//! ```text
//! [AMQP Events] -> [dispatcher] -> [NotificationService] -> [SQLite]
//!                                         |
//!                                         v
//!                              [ConnectionRegistry] -> [Live clients]
//! ```
//!
//! Deliveries that keep failing after one broker redelivery are routed to
//! the dead-letter exchange via a dedicated publisher connection.
//!
//! ## Configuration
//! - HERALD_CONFIG: path to a YAML config file
//! - HERALD__MESSAGING__AMQP__URL: RabbitMQ connection string
//! - DATABASE_URL: SQLite database for the notification store
//! - JWT_SECRET: secret for verifying connection tokens
//! - HERALD_LOG: tracing filter (default: info)

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herald::bus::{
    spawn_recovery_task, AmqpConfig, AmqpEventBus, Dispatcher, EventBus, QueueBinding,
    SqliteOutboxEventBus,
};
use herald::config::{Config, LOG_ENV_VAR};
use herald::dlq::BusDeadLetterPublisher;
use herald::envelope::exchange;
use herald::notify::{NotificationService, NotificationStore, SqliteNotificationStore};
use herald::realtime::{ConnectionRegistry, JwtTokenVerifier};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting herald-notifyd");

    // Notification store
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.notifications.database_url)
        .await?;
    let store = SqliteNotificationStore::new(pool.clone());
    store.init().await?;
    let store: Arc<dyn NotificationStore> = Arc::new(store);

    // Live connections; identity comes only from verified tokens
    let verifier = JwtTokenVerifier::from_env()
        .ok_or("JWT_SECRET must be set for live connection authentication")?;
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(verifier)));

    let service = Arc::new(NotificationService::new(store, Arc::clone(&registry)));

    // Dead letters go out through a dedicated publisher connection so a
    // wedged consumer channel cannot take the DLQ down with it.
    let amqp_url = config.messaging.amqp.url.as_str();
    let mut dlq_bus: Arc<dyn EventBus> =
        Arc::new(AmqpEventBus::new(AmqpConfig::publisher(amqp_url)).await?);

    // With the outbox enabled, dead letters survive a broker outage too
    let _recovery = if config.outbox.is_enabled() {
        let outbox = Arc::new(SqliteOutboxEventBus::new(
            Arc::clone(&dlq_bus),
            pool.clone(),
            config.outbox.clone(),
        ));
        outbox.init().await?;
        let handle = spawn_recovery_task(Arc::clone(&outbox));
        dlq_bus = outbox;
        Some(handle)
    } else {
        None
    };

    let dlq = Arc::new(BusDeadLetterPublisher::new(dlq_bus));

    let queue = config
        .messaging
        .amqp
        .queue
        .clone()
        .unwrap_or_else(|| config.notifications.queue.clone());
    let bindings = if config.messaging.amqp.bindings.is_empty() {
        vec![
            QueueBinding::new(exchange::NOTIFICATION_EVENTS, ""),
            QueueBinding::new(exchange::BLOG_EVENTS, ""),
        ]
    } else {
        config.messaging.amqp.bindings.clone()
    };

    let consumer = AmqpEventBus::with_dead_letter_publisher(
        AmqpConfig::consumer(amqp_url, queue, bindings),
        dlq,
    )
    .await?;

    let mut dispatcher = Dispatcher::new();
    service.register_handlers(&mut dispatcher);
    info!(
        event_types = ?dispatcher.event_types(),
        "Notification handlers registered"
    );

    consumer.subscribe(Arc::new(dispatcher)).await?;
    consumer.start_consuming().await?;

    info!("herald-notifyd running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
