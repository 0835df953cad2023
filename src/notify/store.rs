//! Notification persistence.
//!
//! `NotificationStore` is the seam between the aggregator and storage.
//! The SQLite implementation is the production path; the in-memory one
//! backs tests and single-process setups.
//!
//! Two invariants live here rather than in callers:
//! - the unread count is always computed from rows, never cached
//! - ownership is enforced per query: mutations take the recipient and
//!   match on it, so one user can never touch another's rows

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Notification;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// One page of a recipient's notifications, newest first.
#[derive(Debug, Clone)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    /// Total rows for the recipient, across all pages.
    pub total: u64,
    /// Whether later pages exist.
    pub has_more: bool,
    /// 1-based page number that was served.
    pub page: u32,
    pub limit: u32,
}

/// Persistence interface for notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a notification.
    async fn insert(&self, notification: Notification) -> Result<Notification>;

    /// List a recipient's notifications, newest first. `page` is 1-based.
    async fn list(&self, recipient: &str, page: u32, limit: u32) -> Result<NotificationPage>;

    /// Count the recipient's unread notifications.
    async fn unread_count(&self, recipient: &str) -> Result<u64>;

    /// Mark one notification read. Returns false when the id does not
    /// exist or belongs to another recipient.
    async fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool>;

    /// Mark all of the recipient's notifications read. Returns how many
    /// rows changed.
    async fn mark_all_read(&self, recipient: &str) -> Result<u64>;

    /// Delete one notification, returning it if it existed and belonged
    /// to the recipient.
    async fn delete(&self, recipient: &str, id: Uuid) -> Result<Option<Notification>>;

    /// Delete all of the recipient's notifications. Returns how many rows
    /// were removed.
    async fn delete_all(&self, recipient: &str) -> Result<u64>;

    /// Delete every notification referencing a blog, across all
    /// recipients. Returns the distinct recipients whose rows were
    /// removed, so live counters can be refreshed. Idempotent: a blog
    /// with no rows removes nothing.
    async fn delete_for_blog(&self, blog: &str) -> Result<Vec<String>>;

    /// Delete every notification referencing a comment or any reply
    /// descended from it, across all recipients. Returns the distinct
    /// recipients whose rows were removed.
    async fn delete_comment_thread(&self, comment: &str) -> Result<Vec<String>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory store for tests and single-process setups.
#[derive(Default)]
pub struct MemoryNotificationStore {
    rows: RwLock<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, notification: Notification) -> Result<Notification> {
        self.rows.write().await.push(notification.clone());
        Ok(notification)
    }

    async fn list(&self, recipient: &str, page: u32, limit: u32) -> Result<NotificationPage> {
        let page = page.max(1);
        let rows = self.rows.read().await;

        // Insertion order is creation order; reverse for newest-first.
        let matching: Vec<&Notification> = rows
            .iter()
            .rev()
            .filter(|n| n.recipient == recipient)
            .collect();

        let total = matching.len() as u64;
        // Widened before multiplying: page and limit are client-supplied
        let offset = (page as u64 - 1) * limit as u64;
        let notifications: Vec<Notification> = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        let has_more = (offset + notifications.len() as u64) < total;

        Ok(NotificationPage {
            notifications,
            total,
            has_more,
            page,
            limit,
        })
    }

    async fn unread_count(&self, recipient: &str) -> Result<u64> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|n| n.recipient == recipient && !n.is_read)
            .count() as u64)
    }

    async fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.write().await;
        match rows
            .iter_mut()
            .find(|n| n.id == id && n.recipient == recipient)
        {
            Some(row) => {
                row.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_read(&self, recipient: &str) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let mut changed = 0u64;
        for row in rows
            .iter_mut()
            .filter(|n| n.recipient == recipient && !n.is_read)
        {
            row.is_read = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn delete(&self, recipient: &str, id: Uuid) -> Result<Option<Notification>> {
        let mut rows = self.rows.write().await;
        match rows
            .iter()
            .position(|n| n.id == id && n.recipient == recipient)
        {
            Some(index) => Ok(Some(rows.remove(index))),
            None => Ok(None),
        }
    }

    async fn delete_all(&self, recipient: &str) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|n| n.recipient != recipient);
        Ok((before - rows.len()) as u64)
    }

    async fn delete_for_blog(&self, blog: &str) -> Result<Vec<String>> {
        let mut rows = self.rows.write().await;
        let mut recipients: Vec<String> = Vec::new();
        rows.retain(|n| {
            if n.blog.as_deref() == Some(blog) {
                if !recipients.contains(&n.recipient) {
                    recipients.push(n.recipient.clone());
                }
                false
            } else {
                true
            }
        });
        Ok(recipients)
    }

    async fn delete_comment_thread(&self, comment: &str) -> Result<Vec<String>> {
        let mut rows = self.rows.write().await;
        let mut recipients: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier = vec![comment.to_string()];

        while !frontier.is_empty() {
            frontier.retain(|id| visited.insert(id.clone()));
            if frontier.is_empty() {
                break;
            }

            // Replies to the frontier become the next frontier before
            // their parent rows are removed.
            let children: Vec<String> = rows
                .iter()
                .filter(|n| {
                    n.parent_comment
                        .as_deref()
                        .is_some_and(|p| frontier.iter().any(|f| f == p))
                })
                .filter_map(|n| n.comment.clone())
                .collect();

            rows.retain(|n| {
                let in_frontier = |value: &Option<String>| {
                    value
                        .as_deref()
                        .is_some_and(|v| frontier.iter().any(|f| f == v))
                };
                if in_frontier(&n.comment) || in_frontier(&n.parent_comment) {
                    if !recipients.contains(&n.recipient) {
                        recipients.push(n.recipient.clone());
                    }
                    false
                } else {
                    true
                }
            });

            frontier = children;
        }

        Ok(recipients)
    }
}

// ============================================================================
// SQLite implementation
// ============================================================================

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteNotificationStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;

    use chrono::{DateTime, Utc};
    use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
    use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
    use tracing::info;

    use crate::notify::NotificationType;

    /// Notifications table schema.
    #[derive(Iden)]
    enum Notifications {
        Table,
        #[iden = "id"]
        Id,
        #[iden = "recipient"]
        Recipient,
        #[iden = "sender"]
        Sender,
        #[iden = "notification_type"]
        NotificationType,
        #[iden = "blog"]
        Blog,
        #[iden = "comment"]
        Comment,
        #[iden = "parent_comment"]
        ParentComment,
        #[iden = "message"]
        Message,
        #[iden = "is_read"]
        IsRead,
        #[iden = "metadata"]
        Metadata,
        #[iden = "created_at"]
        CreatedAt,
    }

    /// SQL for creating the notifications table.
    const CREATE_NOTIFICATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    recipient TEXT NOT NULL,
    sender TEXT,
    notification_type TEXT NOT NULL,
    blog TEXT,
    comment TEXT,
    parent_comment TEXT,
    message TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_notifications_blog ON notifications(blog);
CREATE INDEX IF NOT EXISTS idx_notifications_comment ON notifications(comment);
CREATE INDEX IF NOT EXISTS idx_notifications_parent ON notifications(parent_comment);
"#;

    /// SQLite-backed notification store.
    pub struct SqliteNotificationStore {
        pool: SqlitePool,
    }

    impl SqliteNotificationStore {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        /// Initialize the table schema.
        pub async fn init(&self) -> Result<()> {
            sqlx::query(CREATE_NOTIFICATIONS_TABLE)
                .execute(&self.pool)
                .await?;
            info!("Notifications table initialized");
            Ok(())
        }

        fn row_to_notification(row: &SqliteRow) -> Result<Notification> {
            let id: String = row.get("id");
            let id = Uuid::parse_str(&id)
                .map_err(|e| StoreError::Database(format!("invalid notification id: {e}")))?;

            let created_at: String = row.get("created_at");
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::Database(format!("invalid created_at: {e}")))?
                .with_timezone(&Utc);

            let notification_type: String = row.get("notification_type");
            let metadata: String = row.get("metadata");
            let is_read: i64 = row.get("is_read");

            Ok(Notification {
                id,
                recipient: row.get("recipient"),
                sender: row.get("sender"),
                notification_type: NotificationType::parse(&notification_type),
                blog: row.get("blog"),
                comment: row.get("comment"),
                parent_comment: row.get("parent_comment"),
                message: row.get("message"),
                is_read: is_read != 0,
                metadata: serde_json::from_str(&metadata)?,
                created_at,
            })
        }
    }

    #[async_trait]
    impl NotificationStore for SqliteNotificationStore {
        async fn insert(&self, notification: Notification) -> Result<Notification> {
            let metadata = serde_json::to_string(&notification.metadata)?;

            let insert = Query::insert()
                .into_table(Notifications::Table)
                .columns([
                    Notifications::Id,
                    Notifications::Recipient,
                    Notifications::Sender,
                    Notifications::NotificationType,
                    Notifications::Blog,
                    Notifications::Comment,
                    Notifications::ParentComment,
                    Notifications::Message,
                    Notifications::IsRead,
                    Notifications::Metadata,
                    Notifications::CreatedAt,
                ])
                .values_panic([
                    notification.id.to_string().into(),
                    notification.recipient.clone().into(),
                    notification.sender.clone().into(),
                    notification.notification_type.as_str().into(),
                    notification.blog.clone().into(),
                    notification.comment.clone().into(),
                    notification.parent_comment.clone().into(),
                    notification.message.clone().into(),
                    notification.is_read.into(),
                    metadata.into(),
                    notification.created_at.to_rfc3339().into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&insert).execute(&self.pool).await?;
            Ok(notification)
        }

        async fn list(&self, recipient: &str, page: u32, limit: u32) -> Result<NotificationPage> {
            let page = page.max(1);
            let offset = (page - 1) as u64 * limit as u64;

            let count = Query::select()
                .expr(Expr::col(Notifications::Id).count())
                .from(Notifications::Table)
                .and_where(Expr::col(Notifications::Recipient).eq(recipient))
                .to_string(SqliteQueryBuilder);
            let total: i64 = sqlx::query(&count).fetch_one(&self.pool).await?.get(0);

            let select = Query::select()
                .column(sea_query::Asterisk)
                .from(Notifications::Table)
                .and_where(Expr::col(Notifications::Recipient).eq(recipient))
                .order_by(Notifications::CreatedAt, Order::Desc)
                .order_by(Notifications::Id, Order::Desc)
                .limit(limit as u64)
                .offset(offset)
                .to_string(SqliteQueryBuilder);

            let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
            let notifications = rows
                .iter()
                .map(Self::row_to_notification)
                .collect::<Result<Vec<_>>>()?;

            let total = total as u64;
            let has_more = (offset + notifications.len() as u64) < total;

            Ok(NotificationPage {
                notifications,
                total,
                has_more,
                page,
                limit,
            })
        }

        async fn unread_count(&self, recipient: &str) -> Result<u64> {
            let count = Query::select()
                .expr(Expr::col(Notifications::Id).count())
                .from(Notifications::Table)
                .and_where(Expr::col(Notifications::Recipient).eq(recipient))
                .and_where(Expr::col(Notifications::IsRead).eq(false))
                .to_string(SqliteQueryBuilder);

            let total: i64 = sqlx::query(&count).fetch_one(&self.pool).await?.get(0);
            Ok(total as u64)
        }

        async fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool> {
            let update = Query::update()
                .table(Notifications::Table)
                .value(Notifications::IsRead, true)
                .and_where(Expr::col(Notifications::Id).eq(id.to_string()))
                .and_where(Expr::col(Notifications::Recipient).eq(recipient))
                .to_string(SqliteQueryBuilder);

            let result = sqlx::query(&update).execute(&self.pool).await?;
            Ok(result.rows_affected() > 0)
        }

        async fn mark_all_read(&self, recipient: &str) -> Result<u64> {
            let update = Query::update()
                .table(Notifications::Table)
                .value(Notifications::IsRead, true)
                .and_where(Expr::col(Notifications::Recipient).eq(recipient))
                .and_where(Expr::col(Notifications::IsRead).eq(false))
                .to_string(SqliteQueryBuilder);

            let result = sqlx::query(&update).execute(&self.pool).await?;
            Ok(result.rows_affected())
        }

        async fn delete(&self, recipient: &str, id: Uuid) -> Result<Option<Notification>> {
            let select = Query::select()
                .column(sea_query::Asterisk)
                .from(Notifications::Table)
                .and_where(Expr::col(Notifications::Id).eq(id.to_string()))
                .and_where(Expr::col(Notifications::Recipient).eq(recipient))
                .to_string(SqliteQueryBuilder);

            let row = sqlx::query(&select).fetch_optional(&self.pool).await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let notification = Self::row_to_notification(&row)?;

            let delete = Query::delete()
                .from_table(Notifications::Table)
                .and_where(Expr::col(Notifications::Id).eq(id.to_string()))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&delete).execute(&self.pool).await?;

            Ok(Some(notification))
        }

        async fn delete_all(&self, recipient: &str) -> Result<u64> {
            let delete = Query::delete()
                .from_table(Notifications::Table)
                .and_where(Expr::col(Notifications::Recipient).eq(recipient))
                .to_string(SqliteQueryBuilder);

            let result = sqlx::query(&delete).execute(&self.pool).await?;
            Ok(result.rows_affected())
        }

        async fn delete_for_blog(&self, blog: &str) -> Result<Vec<String>> {
            let select = Query::select()
                .distinct()
                .column(Notifications::Recipient)
                .from(Notifications::Table)
                .and_where(Expr::col(Notifications::Blog).eq(blog))
                .to_string(SqliteQueryBuilder);
            let recipients: Vec<String> = sqlx::query(&select)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| row.get("recipient"))
                .collect();

            let delete = Query::delete()
                .from_table(Notifications::Table)
                .and_where(Expr::col(Notifications::Blog).eq(blog))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&delete).execute(&self.pool).await?;

            Ok(recipients)
        }

        async fn delete_comment_thread(&self, comment: &str) -> Result<Vec<String>> {
            let mut recipients: Vec<String> = Vec::new();
            let mut visited: HashSet<String> = HashSet::new();
            let mut frontier = vec![comment.to_string()];

            while !frontier.is_empty() {
                frontier.retain(|id| visited.insert(id.clone()));
                if frontier.is_empty() {
                    break;
                }

                let (affected, delete) = {
                    let matches_frontier = sea_query::Cond::any()
                        .add(Expr::col(Notifications::Comment).is_in(frontier.clone()))
                        .add(Expr::col(Notifications::ParentComment).is_in(frontier.clone()));

                    let affected = Query::select()
                        .distinct()
                        .column(Notifications::Recipient)
                        .from(Notifications::Table)
                        .cond_where(matches_frontier.clone())
                        .to_string(SqliteQueryBuilder);
                    let delete = Query::delete()
                        .from_table(Notifications::Table)
                        .cond_where(matches_frontier)
                        .to_string(SqliteQueryBuilder);
                    (affected, delete)
                };
                for row in sqlx::query(&affected).fetch_all(&self.pool).await? {
                    let recipient: String = row.get("recipient");
                    if !recipients.contains(&recipient) {
                        recipients.push(recipient);
                    }
                }

                let select = Query::select()
                    .column(Notifications::Comment)
                    .from(Notifications::Table)
                    .and_where(Expr::col(Notifications::ParentComment).is_in(frontier.clone()))
                    .and_where(Expr::col(Notifications::Comment).is_not_null())
                    .to_string(SqliteQueryBuilder);
                let children: Vec<String> = sqlx::query(&select)
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(|row| row.get("comment"))
                    .collect();

                sqlx::query(&delete).execute(&self.pool).await?;

                frontier = children;
            }

            Ok(recipients)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NewNotification, NotificationType};

    fn like(recipient: &str, sender: &str, blog: &str) -> Notification {
        NewNotification::new(recipient, NotificationType::Like)
            .sender(sender)
            .blog(blog)
            .into_notification()
    }

    #[tokio::test]
    async fn test_list_pages_newest_first() {
        let store = MemoryNotificationStore::new();
        for i in 0..5 {
            store
                .insert(like("u1", &format!("sender{i}"), "b1"))
                .await
                .unwrap();
        }
        store.insert(like("u2", "other", "b2")).await.unwrap();

        let page = store.list("u1", 1, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.notifications.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.notifications[0].sender.as_deref(), Some("sender4"));

        let last = store.list("u1", 3, 2).await.unwrap();
        assert_eq!(last.notifications.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn test_list_tolerates_huge_page_numbers() {
        let store = MemoryNotificationStore::new();
        for i in 0..3 {
            store
                .insert(like("u1", &format!("sender{i}"), "b1"))
                .await
                .unwrap();
        }

        // page * limit would overflow u32; the offset math must not
        let page = store.list("u1", u32::MAX, u32::MAX).await.unwrap();
        assert!(page.notifications.is_empty());
        assert_eq!(page.total, 3);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_unread_count_tracks_read_state() {
        let store = MemoryNotificationStore::new();
        let a = store.insert(like("u1", "u2", "b1")).await.unwrap();
        store.insert(like("u1", "u3", "b1")).await.unwrap();

        assert_eq!(store.unread_count("u1").await.unwrap(), 2);

        assert!(store.mark_read("u1", a.id).await.unwrap());
        assert_eq!(store.unread_count("u1").await.unwrap(), 1);

        // Already-read rows are not counted again by mark_all_read
        assert_eq!(store.mark_all_read("u1").await.unwrap(), 1);
        assert_eq!(store.unread_count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_enforces_ownership() {
        let store = MemoryNotificationStore::new();
        let a = store.insert(like("u1", "u2", "b1")).await.unwrap();

        assert!(!store.mark_read("u2", a.id).await.unwrap());
        assert_eq!(store.unread_count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_returns_removed_row() {
        let store = MemoryNotificationStore::new();
        let a = store.insert(like("u1", "u2", "b1")).await.unwrap();

        assert!(store.delete("u2", a.id).await.unwrap().is_none());
        let removed = store.delete("u1", a.id).await.unwrap().unwrap();
        assert_eq!(removed.id, a.id);
        assert!(store.delete("u1", a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_for_blog_is_idempotent() {
        let store = MemoryNotificationStore::new();
        store.insert(like("u1", "u2", "b1")).await.unwrap();
        store.insert(like("u3", "u2", "b1")).await.unwrap();
        store.insert(like("u1", "u2", "b2")).await.unwrap();

        let affected = store.delete_for_blog("b1").await.unwrap();
        assert_eq!(affected, vec!["u1".to_string(), "u3".to_string()]);
        assert!(store.delete_for_blog("b1").await.unwrap().is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_comment_thread_walks_replies() {
        let store = MemoryNotificationStore::new();

        // c1 on u1's blog, reply c2 to c1, reply c3 to c2, unrelated c4
        store
            .insert(
                NewNotification::new("u1", NotificationType::Comment)
                    .sender("u2")
                    .comment("c1")
                    .into_notification(),
            )
            .await
            .unwrap();
        store
            .insert(
                NewNotification::new("u2", NotificationType::Reply)
                    .sender("u3")
                    .comment("c2")
                    .parent_comment("c1")
                    .into_notification(),
            )
            .await
            .unwrap();
        store
            .insert(
                NewNotification::new("u3", NotificationType::Reply)
                    .sender("u4")
                    .comment("c3")
                    .parent_comment("c2")
                    .into_notification(),
            )
            .await
            .unwrap();
        store
            .insert(
                NewNotification::new("u1", NotificationType::Comment)
                    .sender("u5")
                    .comment("c4")
                    .into_notification(),
            )
            .await
            .unwrap();

        let mut affected = store.delete_comment_thread("c1").await.unwrap();
        affected.sort();
        assert_eq!(
            affected,
            vec!["u1".to_string(), "u2".to_string(), "u3".to_string()]
        );
        assert_eq!(store.len().await, 1);
        let remaining = store.list("u1", 1, 10).await.unwrap();
        assert_eq!(remaining.notifications[0].comment.as_deref(), Some("c4"));
    }

    #[tokio::test]
    async fn test_delete_comment_thread_handles_cycles() {
        let store = MemoryNotificationStore::new();

        // Corrupt data shaped as a cycle must still terminate
        store
            .insert(
                NewNotification::new("u1", NotificationType::Reply)
                    .comment("c1")
                    .parent_comment("c2")
                    .into_notification(),
            )
            .await
            .unwrap();
        store
            .insert(
                NewNotification::new("u2", NotificationType::Reply)
                    .comment("c2")
                    .parent_comment("c1")
                    .into_notification(),
            )
            .await
            .unwrap();

        assert_eq!(store.delete_comment_thread("c1").await.unwrap().len(), 2);
        assert!(store.is_empty().await);
    }
}
