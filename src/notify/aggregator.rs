//! Event-to-notification aggregation.
//!
//! `NotificationService` owns the read-model rules:
//! - map each fabric event to a notification (actor, recipient, kind)
//! - suppress self-directed notifications before they are persisted
//! - push `NEW_NOTIFICATION` and `UNREAD_COUNT_UPDATE` frames to the
//!   recipient's live connection after every state change
//! - clean up rows when the blog or comment they reference is deleted
//!
//! Handlers are idempotent at the business level: a redelivered deletion
//! removes nothing the second time, and a malformed event is acked after
//! logging rather than retried forever.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{handler_fn, BusError, Dispatcher};
use crate::envelope::{event_type, EventEnvelope};
use crate::realtime::{ConnectionRegistry, PushMessage};

use super::store::{NotificationPage, NotificationStore, Result};
use super::{NewNotification, Notification, NotificationType};

/// Aggregates fabric events into per-user notifications.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    registry: Arc<ConnectionRegistry>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    /// Handle one fabric event.
    ///
    /// Events missing their recipient field are logged and acked; only
    /// store failures bubble up, so the bus retries exactly the work
    /// that can succeed on redelivery.
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<()> {
        match envelope.event_type.as_str() {
            event_type::COMMENT_ADDED => {
                self.create_for(
                    envelope,
                    "creatorId",
                    "userId",
                    NotificationType::Comment,
                    |new, e| {
                        let new = new
                            .blog_opt(e.str_field("blogId"))
                            .comment_opt(e.str_field("commentId"));
                        // The comment text rides along for display
                        match e.str_field("comment") {
                            Some(text) => new.metadata("comment", text),
                            None => new,
                        }
                    },
                )
                .await
            }
            event_type::COMMENT_LIKED => {
                self.create_for(
                    envelope,
                    "commentOwnerId",
                    "likerId",
                    NotificationType::CommentLike,
                    |new, e| new.comment_opt(e.str_field("commentId")),
                )
                .await
            }
            event_type::REPLY_ADDED => {
                self.create_for(
                    envelope,
                    "parentOwnerId",
                    "userId",
                    NotificationType::Reply,
                    |new, e| {
                        new.blog_opt(e.str_field("blogId"))
                            .comment_opt(e.str_field("commentId"))
                            .parent_comment_opt(e.str_field("parentCommentId"))
                    },
                )
                .await
            }
            event_type::BLOG_LIKED => {
                self.create_for(
                    envelope,
                    "creatorId",
                    "likerId",
                    NotificationType::Like,
                    |new, e| new.blog_opt(e.str_field("blogId")),
                )
                .await
            }
            event_type::BLOG_CREATED | event_type::BLOG_UPDATED => {
                self.create_for(
                    envelope,
                    "followerId",
                    "authorId",
                    NotificationType::BlogUpdate,
                    |new, e| new.blog_opt(e.str_field("blogId")),
                )
                .await
            }
            event_type::USER_FOLLOWED => {
                self.create_for(
                    envelope,
                    "followedId",
                    "followerId",
                    NotificationType::Follow,
                    |new, _| new,
                )
                .await
            }
            event_type::BLOG_DELETED => self.handle_blog_deleted(envelope).await,
            event_type::COMMENT_DELETED_FROM_BLOG => self.handle_comment_deleted(envelope).await,
            other => {
                warn!(event_type = %other, "Ignoring unmapped event");
                Ok(())
            }
        }
    }

    async fn create_for(
        &self,
        envelope: &EventEnvelope,
        recipient_field: &str,
        sender_field: &str,
        notification_type: NotificationType,
        enrich: impl FnOnce(NewNotification, &EventEnvelope) -> NewNotification,
    ) -> Result<()> {
        let Some(recipient) = envelope.str_field(recipient_field) else {
            warn!(
                event_type = %envelope.event_type,
                field = %recipient_field,
                "Event missing recipient field, skipping"
            );
            return Ok(());
        };

        let mut new = NewNotification::new(recipient, notification_type);
        if let Some(sender) = envelope.str_field(sender_field) {
            new = new.sender(sender);
        }
        if let Some(message) = envelope.str_field("message") {
            new = new.message(message);
        }
        new = enrich(new, envelope);

        self.create(new).await?;
        Ok(())
    }

    /// Create a notification, push it, and refresh the unread counter.
    ///
    /// Self-directed notifications are suppressed before they reach the
    /// store: `Ok(None)` means nothing was created.
    pub async fn create(&self, new: NewNotification) -> Result<Option<Notification>> {
        if new.is_self_directed() {
            debug!(
                recipient = %new.recipient,
                "Suppressing self-directed notification"
            );
            return Ok(None);
        }

        let notification = self.store.insert(new.into_notification()).await?;
        info!(
            recipient = %notification.recipient,
            notification_type = %notification.notification_type.as_str(),
            "Notification created"
        );

        self.registry
            .push(
                &notification.recipient,
                &PushMessage::NewNotification {
                    notification: notification.clone(),
                },
            )
            .await;
        self.refresh_unread(&notification.recipient).await;

        Ok(Some(notification))
    }

    async fn handle_blog_deleted(&self, envelope: &EventEnvelope) -> Result<()> {
        let Some(blog) = envelope.str_field("blogId") else {
            warn!("BLOG_DELETED missing blogId, skipping");
            return Ok(());
        };

        let affected = self.store.delete_for_blog(blog).await?;
        info!(
            blog = %blog,
            recipients = affected.len(),
            "Removed notifications for deleted blog"
        );
        for recipient in &affected {
            self.refresh_unread(recipient).await;
        }
        Ok(())
    }

    async fn handle_comment_deleted(&self, envelope: &EventEnvelope) -> Result<()> {
        let Some(comment) = envelope.str_field("commentId") else {
            warn!("COMMENT_DELETED_FROM_BLOG missing commentId, skipping");
            return Ok(());
        };

        let affected = self.store.delete_comment_thread(comment).await?;
        info!(
            comment = %comment,
            recipients = affected.len(),
            "Removed notification thread for deleted comment"
        );
        for recipient in &affected {
            self.refresh_unread(recipient).await;
        }
        Ok(())
    }

    // ========================================================================
    // User-facing operations
    // ========================================================================

    /// List a recipient's notifications, newest first.
    pub async fn list(&self, recipient: &str, page: u32, limit: u32) -> Result<NotificationPage> {
        self.store.list(recipient, page, limit).await
    }

    /// The recipient's current unread count, always computed from rows.
    pub async fn unread_count(&self, recipient: &str) -> Result<u64> {
        self.store.unread_count(recipient).await
    }

    /// Mark one notification read. Returns false for an unknown id or a
    /// row owned by someone else.
    pub async fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool> {
        let changed = self.store.mark_read(recipient, id).await?;
        if changed {
            self.refresh_unread(recipient).await;
        }
        Ok(changed)
    }

    /// Mark everything read. The live counter drops to zero.
    pub async fn mark_all_read(&self, recipient: &str) -> Result<u64> {
        let changed = self.store.mark_all_read(recipient).await?;
        self.refresh_unread(recipient).await;
        Ok(changed)
    }

    /// Delete one notification.
    pub async fn delete(&self, recipient: &str, id: Uuid) -> Result<Option<Notification>> {
        let removed = self.store.delete(recipient, id).await?;
        // Deleting an already-read row leaves the counter unchanged.
        if removed.as_ref().is_some_and(|n| !n.is_read) {
            self.refresh_unread(recipient).await;
        }
        Ok(removed)
    }

    /// Delete all of the recipient's notifications.
    pub async fn delete_all(&self, recipient: &str) -> Result<u64> {
        let removed = self.store.delete_all(recipient).await?;
        self.refresh_unread(recipient).await;
        Ok(removed)
    }

    /// Recompute the recipient's unread count and push it.
    ///
    /// A failed recompute is logged, not propagated: the row mutation
    /// that preceded it already committed, and requeueing the event
    /// would duplicate it. The next fetch returns the authoritative
    /// count anyway.
    async fn refresh_unread(&self, recipient: &str) {
        match self.store.unread_count(recipient).await {
            Ok(count) => {
                self.registry
                    .push(recipient, &PushMessage::UnreadCountUpdate { count })
                    .await;
            }
            Err(e) => {
                warn!(
                    recipient = %recipient,
                    error = %e,
                    "Failed to recompute unread count for push"
                );
            }
        }
    }

    // ========================================================================
    // Bus wiring
    // ========================================================================

    /// Register a handler for every event type this service consumes.
    pub fn register_handlers(self: &Arc<Self>, dispatcher: &mut Dispatcher) {
        const HANDLED: &[&str] = &[
            event_type::COMMENT_ADDED,
            event_type::COMMENT_LIKED,
            event_type::REPLY_ADDED,
            event_type::BLOG_LIKED,
            event_type::BLOG_CREATED,
            event_type::BLOG_UPDATED,
            event_type::USER_FOLLOWED,
            event_type::BLOG_DELETED,
            event_type::COMMENT_DELETED_FROM_BLOG,
        ];

        for event in HANDLED.iter().copied() {
            let service = Arc::clone(self);
            dispatcher.route(
                event,
                handler_fn(move |envelope: Arc<EventEnvelope>| {
                    let service = Arc::clone(&service);
                    async move {
                        service.handle_event(&envelope).await.map_err(|e| {
                            BusError::Handler {
                                event_type: envelope.event_type.clone(),
                                message: e.to_string(),
                            }
                        })
                    }
                }),
            );
        }
    }
}

// Option-taking builder steps keep the enrich closures flat.
impl NewNotification {
    fn blog_opt(self, blog: Option<&str>) -> Self {
        match blog {
            Some(blog) => self.blog(blog),
            None => self,
        }
    }

    fn comment_opt(self, comment: Option<&str>) -> Self {
        match comment {
            Some(comment) => self.comment(comment),
            None => self,
        }
    }

    fn parent_comment_opt(self, parent: Option<&str>) -> Self {
        match parent {
            Some(parent) => self.parent_comment(parent),
            None => self,
        }
    }
}
