//! Outbox pattern wrapper for guaranteed event delivery.
//!
//! The plain bus drops messages when the broker is unreachable, and
//! "write locally, then publish" is not atomic: a crash between the two
//! steps silently loses the event. `SqliteOutboxEventBus` wraps any
//! `EventBus` and closes both windows:
//!
//! 1. Write the pending event to the outbox table
//! 2. Publish to the inner bus
//! 3. Delete from the outbox on success
//!
//! Dropped or orphaned events stay in the table and are replayed by the
//! background recovery task. Opt-in via `outbox.enabled` or
//! `HERALD_OUTBOX_ENABLED=true`; services content with best-effort
//! delivery keep the plain bus.

use std::sync::Arc;

use async_trait::async_trait;
use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Dispatcher, EventBus, PublishOutcome, Result};
use crate::envelope::EventEnvelope;

// ============================================================================
// Schema
// ============================================================================

/// Outbox table schema.
#[derive(Iden)]
enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "exchange"]
    Exchange,
    #[iden = "routing_key"]
    RoutingKey,
    #[iden = "payload"]
    Payload,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "retry_count"]
    RetryCount,
}

/// SQL for creating the outbox table.
const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY,
    exchange TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbox_created_at ON outbox(created_at);
"#;

// ============================================================================
// Configuration
// ============================================================================

/// Outbox configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Enable outbox pattern. Default: false.
    /// Can be overridden via HERALD_OUTBOX_ENABLED env var.
    pub enabled: bool,
    /// Maximum replay attempts before a row is abandoned. Default: 10.
    pub max_retries: u32,
    /// Interval in seconds for background recovery. Default: 5.
    pub recovery_interval_secs: u64,
    /// Minimum row age in seconds before recovery picks it up, so rows
    /// mid-publish are not replayed. Default: 30.
    pub min_age_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: std::env::var("HERALD_OUTBOX_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            max_retries: 10,
            recovery_interval_secs: 5,
            min_age_secs: 30,
        }
    }
}

impl OutboxConfig {
    /// Check if outbox is enabled (config or env var).
    pub fn is_enabled(&self) -> bool {
        self.enabled
            || std::env::var("HERALD_OUTBOX_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
    }
}

// ============================================================================
// Implementation
// ============================================================================

/// Outbox wrapper around an inner bus, backed by SQLite.
pub struct SqliteOutboxEventBus {
    inner: Arc<dyn EventBus>,
    pool: SqlitePool,
    config: OutboxConfig,
}

impl SqliteOutboxEventBus {
    /// Create a new outbox-wrapped event bus.
    pub fn new(inner: Arc<dyn EventBus>, pool: SqlitePool, config: OutboxConfig) -> Self {
        Self {
            inner,
            pool,
            config,
        }
    }

    /// Initialize the outbox table schema.
    pub async fn init(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(CREATE_OUTBOX_TABLE).execute(&self.pool).await?;
        info!("Outbox table initialized");
        Ok(())
    }

    /// Number of pending (unpublished) rows.
    pub async fn pending_count(&self) -> std::result::Result<u64, sqlx::Error> {
        let query = Query::select()
            .expr(Expr::col(Outbox::Id).count())
            .from(Outbox::Table)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    /// Replay events that were written but never confirmed published.
    ///
    /// Call periodically from a background task. Returns the number of
    /// rows successfully replayed.
    pub async fn recover_orphaned(&self) -> std::result::Result<u32, sqlx::Error> {
        let age_cutoff = format!("datetime('now', '-{} seconds')", self.config.min_age_secs);

        let select = Query::select()
            .columns([
                Outbox::Id,
                Outbox::Exchange,
                Outbox::RoutingKey,
                Outbox::Payload,
                Outbox::RetryCount,
            ])
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::CreatedAt).lte(Expr::cust(&age_cutoff)))
            .and_where(Expr::col(Outbox::RetryCount).lt(self.config.max_retries as i32))
            .order_by(Outbox::CreatedAt, Order::Asc)
            .limit(100)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;

        let mut recovered = 0u32;
        for row in rows {
            let id: String = row.get("id");
            let exchange: String = row.get("exchange");
            let routing_key: String = row.get("routing_key");
            let payload: Vec<u8> = row.get("payload");
            let retry_count: i32 = row.get("retry_count");

            let envelope = match EventEnvelope::from_bytes(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(id = %id, error = %e, "Failed to decode orphaned event, removing from outbox");
                    self.delete_row(&id).await?;
                    continue;
                }
            };

            if self
                .inner
                .publish(&exchange, &routing_key, &envelope)
                .await
                .is_published()
            {
                self.delete_row(&id).await?;
                recovered += 1;
                debug!(id = %id, exchange = %exchange, "Recovered orphaned event");
            } else {
                warn!(
                    id = %id,
                    retry_count = retry_count + 1,
                    "Failed to recover event, incrementing retry count"
                );
                let update = Query::update()
                    .table(Outbox::Table)
                    .value(Outbox::RetryCount, retry_count + 1)
                    .and_where(Expr::col(Outbox::Id).eq(&id))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&update).execute(&self.pool).await?;
            }
        }

        if recovered > 0 {
            info!(recovered = recovered, "Recovered orphaned events from outbox");
        }

        Ok(recovered)
    }

    async fn delete_row(&self, id: &str) -> std::result::Result<(), sqlx::Error> {
        let delete = Query::delete()
            .from_table(Outbox::Table)
            .and_where(Expr::col(Outbox::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&delete).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for SqliteOutboxEventBus {
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

        let id = Uuid::new_v4().to_string();

        // Step 1: Write to outbox
        let insert = Query::insert()
            .into_table(Outbox::Table)
            .columns([
                Outbox::Id,
                Outbox::Exchange,
                Outbox::RoutingKey,
                Outbox::Payload,
            ])
            .values_panic([
                id.clone().into(),
                exchange.into(),
                routing_key.into(),
                payload.into(),
            ])
            .to_string(SqliteQueryBuilder);

        if let Err(e) = sqlx::query(&insert).execute(&self.pool).await {
            // Degrade to plain publish rather than blocking the caller.
            error!(error = %e, "Outbox insert failed, publishing without guarantee");
            return self.inner.publish(exchange, routing_key, envelope).await;
        }

        debug!(id = %id, exchange = %exchange, "Event written to outbox");

        // Step 2: Publish to inner bus
        let outcome = self.inner.publish(exchange, routing_key, envelope).await;

        // Step 3: Delete from outbox on success
        if outcome.is_published() {
            if let Err(e) = self.delete_row(&id).await {
                // Recovery will replay it; consumers must be idempotent anyway.
                warn!(id = %id, error = %e, "Failed to delete from outbox after successful publish");
            }
        } else {
            debug!(id = %id, "Publish dropped, event remains in outbox for recovery");
        }

        outcome
    }

    async fn subscribe(&self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        self.inner.subscribe(dispatcher).await
    }

    async fn start_consuming(&self) -> Result<()> {
        self.inner.start_consuming().await
    }
}

// ============================================================================
// Background Recovery Task
// ============================================================================

/// Handle to a running recovery task.
pub struct RecoveryTaskHandle {
    cancel: tokio::sync::watch::Sender<bool>,
}

impl RecoveryTaskHandle {
    /// Signal the recovery task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawn a background task that periodically recovers orphaned events.
///
/// Returns a handle that can be used to stop the task.
pub fn spawn_recovery_task(outbox: Arc<SqliteOutboxEventBus>) -> RecoveryTaskHandle {
    let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
    let interval = std::time::Duration::from_secs(outbox.config.recovery_interval_secs);

    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            "Outbox recovery task started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = outbox.recover_orphaned().await {
                        error!(error = %e, "Outbox recovery failed");
                    }
                }
                changed = cancel_rx.changed() => {
                    // A dropped handle stops the task too
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("Outbox recovery task stopped");
                        break;
                    }
                }
            }
        }
    });

    RecoveryTaskHandle { cancel: cancel_tx }
}

// ============================================================================
// Tests
// ============================================================================
