//! Notification domain: types, persistence, and event aggregation.
//!
//! Notifications are derived facts. Each one records that an actor did
//! something a recipient cares about (liked a blog, replied to a comment,
//! followed them). The aggregator turns fabric events into rows here;
//! the store owns persistence; read state is a per-row flag and the
//! unread counter is always computed from it, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod aggregator;
pub mod store;

pub use aggregator::NotificationService;
#[cfg(feature = "sqlite")]
pub use store::SqliteNotificationStore;
pub use store::{MemoryNotificationStore, NotificationPage, NotificationStore, StoreError};

/// Kinds of notifications the aggregator produces.
///
/// Serializes as a plain kebab-case string on every surface (wire, push
/// frames, store rows); unrecognized strings round-trip via `Custom`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationType {
    /// Someone liked the recipient's blog.
    Like,
    /// Someone commented on the recipient's blog.
    Comment,
    /// Someone started following the recipient.
    Follow,
    /// Someone replied to the recipient's comment.
    Reply,
    /// Someone liked the recipient's comment.
    CommentLike,
    /// A followed author published or updated a blog.
    BlogUpdate,
    /// Escape hatch for types this service did not mint.
    Custom(String),
}

impl NotificationType {
    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Follow => "follow",
            Self::Reply => "reply",
            Self::CommentLike => "comment-like",
            Self::BlogUpdate => "blog-update",
            Self::Custom(tag) => tag,
        }
    }

    /// Parse from the string form. Unknown tags become `Custom`.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "like" => Self::Like,
            "comment" => Self::Comment,
            "follow" => Self::Follow,
            "reply" => Self::Reply,
            "comment-like" => Self::CommentLike,
            "blog-update" => Self::BlogUpdate,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Human-readable message used when the event carries none.
    pub fn default_message(&self) -> &str {
        match self {
            Self::Like => "liked your blog",
            Self::Comment => "commented on your blog",
            Self::Follow => "started following you",
            Self::Reply => "replied to your comment",
            Self::CommentLike => "liked your comment",
            Self::BlogUpdate => "published a new update",
            Self::Custom(_) => "sent you a notification",
        }
    }
}

impl Serialize for NotificationType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NotificationType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

/// A persisted notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Unique identifier, minted at insert.
    pub id: Uuid,
    /// User the notification is for.
    pub recipient: String,
    /// User whose action caused it, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Kind of notification.
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    /// Related blog, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blog: Option<String>,
    /// Related comment, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Parent comment for replies; used for thread cleanup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_comment: Option<String>,
    /// Display message.
    pub message: String,
    /// Whether the recipient has seen it.
    pub is_read: bool,
    /// Free-form extras carried from the source event.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Builder input for creating a notification.
///
/// The store assigns `id`, `is_read` (false) and `created_at`.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient: String,
    pub sender: Option<String>,
    pub notification_type: NotificationType,
    pub blog: Option<String>,
    pub comment: Option<String>,
    pub parent_comment: Option<String>,
    pub message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl NewNotification {
    pub fn new(recipient: impl Into<String>, notification_type: NotificationType) -> Self {
        Self {
            recipient: recipient.into(),
            sender: None,
            notification_type,
            blog: None,
            comment: None,
            parent_comment: None,
            message: None,
            metadata: Map::new(),
        }
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn blog(mut self, blog: impl Into<String>) -> Self {
        self.blog = Some(blog.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn parent_comment(mut self, parent: impl Into<String>) -> Self {
        self.parent_comment = Some(parent.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the actor and the recipient are the same user.
    ///
    /// Users never get notified about their own actions.
    pub fn is_self_directed(&self) -> bool {
        self.sender.as_deref() == Some(self.recipient.as_str())
    }

    /// Materialize into a full notification.
    pub fn into_notification(self) -> Notification {
        let message = self
            .message
            .unwrap_or_else(|| self.notification_type.default_message().to_string());
        Notification {
            id: Uuid::new_v4(),
            recipient: self.recipient,
            sender: self.sender,
            notification_type: self.notification_type,
            blog: self.blog,
            comment: self.comment,
            parent_comment: self.parent_comment,
            message,
            is_read: false,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_directed_detection() {
        let own = NewNotification::new("u1", NotificationType::Like).sender("u1");
        assert!(own.is_self_directed());

        let other = NewNotification::new("u1", NotificationType::Like).sender("u2");
        assert!(!other.is_self_directed());

        let anonymous = NewNotification::new("u1", NotificationType::Like);
        assert!(!anonymous.is_self_directed());
    }

    #[test]
    fn test_default_message_fills_missing() {
        let notification =
            NewNotification::new("u1", NotificationType::Follow).into_notification();
        assert_eq!(notification.message, "started following you");
        assert!(!notification.is_read);
    }

    #[test]
    fn test_explicit_message_kept() {
        let notification = NewNotification::new("u1", NotificationType::Comment)
            .message("alice commented: nice post")
            .into_notification();
        assert_eq!(notification.message, "alice commented: nice post");
    }

    #[test]
    fn test_type_string_round_trip() {
        assert_eq!(NotificationType::parse("reply"), NotificationType::Reply);

        let custom = NotificationType::parse("moderation-flag");
        assert_eq!(custom.as_str(), "moderation-flag");
        assert_eq!(serde_json::to_value(&custom).unwrap(), "moderation-flag");
    }

    #[test]
    fn test_notification_json_shape() {
        let notification = NewNotification::new("u1", NotificationType::CommentLike)
            .sender("u2")
            .comment("c1")
            .into_notification();

        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["type"], "comment-like");
        assert_eq!(json["recipient"], "u1");
        assert_eq!(json["isRead"], false);
        // Unset optional fields are omitted from the wire shape
        assert!(json.get("blog").is_none());
    }
}
