//! Event envelope wire format.
//!
//! Every asynchronous message on the fabric is a flat JSON object carrying
//! a `type` tag plus variant-specific fields. The bus enforces no schema;
//! consumers read the fields they expect and tolerate anything extra or
//! missing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Durable topic exchanges and their naming.
pub mod exchange {
    /// Account lifecycle events.
    pub const USER_EVENTS: &str = "user.events";
    /// Blog document events.
    pub const BLOG_EVENTS: &str = "blog.events";
    /// Comment events (reserved, bound with pattern `comment.#`).
    pub const COMMENT_EVENTS: &str = "comment.events";
    /// Events consumed by the notification service.
    pub const NOTIFICATION_EVENTS: &str = "notification.events";
    /// Image upload/removal events.
    pub const MEDIA_EVENTS: &str = "media.events";
    /// Outbound email events.
    pub const EMAIL_EVENTS: &str = "email.events";
    /// Dead letters, routed per source queue.
    pub const DEAD_LETTER: &str = "herald.dlq";
}

/// The closed set of event `type` tags.
pub mod event_type {
    // user.events
    pub const USER_CREATED: &str = "USER_CREATED";
    pub const USER_VERIFIED: &str = "USER_VERIFIED";
    pub const USER_DELETED: &str = "USER_DELETED";
    pub const USER_LOGGED_IN: &str = "USER_LOGGED_IN";
    pub const PASSWORD_CHANGED: &str = "PASSWORD_CHANGED";
    pub const PROFILE_DELETED: &str = "PROFILE_DELETED";

    // blog.events
    pub const BLOG_CREATED_FOR_USER: &str = "BLOG_CREATED_FOR_USER";
    pub const BLOG_DELETED: &str = "BLOG_DELETED";
    pub const BLOG_SAVED: &str = "BLOG_SAVED";
    pub const BLOG_UNSAVED: &str = "BLOG_UNSAVED";
    pub const BLOG_UNLIKED: &str = "BLOG_UNLIKED";
    pub const COMMENT_ADDED_TO_BLOG: &str = "COMMENT_ADDED_TO_BLOG";
    pub const COMMENT_DELETED_FROM_BLOG: &str = "COMMENT_DELETED_FROM_BLOG";
    pub const CHECK_BLOG_OWNER: &str = "CHECK_BLOG_OWNER";

    // notification.events
    pub const COMMENT_ADDED: &str = "COMMENT_ADDED";
    pub const COMMENT_LIKED: &str = "COMMENT_LIKED";
    pub const REPLY_ADDED: &str = "REPLY_ADDED";
    pub const BLOG_LIKED: &str = "BLOG_LIKED";
    pub const BLOG_CREATED: &str = "BLOG_CREATED";
    pub const BLOG_UPDATED: &str = "BLOG_UPDATED";
    pub const USER_FOLLOWED: &str = "USER_FOLLOWED";

    // media.events
    pub const DELETE_IMAGES: &str = "DELETE_IMAGES";
    pub const UPLOAD_IMAGES: &str = "UPLOAD_IMAGES";

    // email.events
    pub const VERIFICATION_EMAIL: &str = "VERIFICATION_EMAIL";
}

/// A single message on the event fabric.
///
/// Immutable once published: builders consume `self`, and consumers only
/// read. Delivery is always persistent (survives broker restart).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event variant tag.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Variant-specific fields, kept flat on the wire.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Create an envelope with an empty payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
        }
    }

    /// Create an envelope from an existing payload map.
    pub fn with_payload(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Add a payload field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Look up a raw payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Look up a string payload field. Absent or non-string yields `None`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Serialize for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a delivered message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape_is_flat() {
        let envelope = EventEnvelope::new(event_type::BLOG_LIKED)
            .field("blogId", "b1")
            .field("likerId", "u1");

        let json: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "BLOG_LIKED");
        assert_eq!(json["blogId"], "b1");
        assert_eq!(json["likerId"], "u1");
    }

    #[test]
    fn test_envelope_tolerates_unknown_fields() {
        let bytes = br#"{"type":"COMMENT_ADDED","commentId":"c1","futureField":{"nested":true}}"#;
        let envelope = EventEnvelope::from_bytes(bytes).unwrap();

        assert_eq!(envelope.event_type, "COMMENT_ADDED");
        assert_eq!(envelope.str_field("commentId"), Some("c1"));
        assert!(envelope.get("futureField").is_some());
    }

    #[test]
    fn test_missing_field_is_none_not_error() {
        let envelope = EventEnvelope::new(event_type::USER_FOLLOWED);
        assert_eq!(envelope.str_field("followerId"), None);
    }

    #[test]
    fn test_non_string_field_is_none_via_str_accessor() {
        let envelope = EventEnvelope::new("X").field("count", 3);
        assert_eq!(envelope.str_field("count"), None);
        assert_eq!(envelope.get("count"), Some(&Value::from(3)));
    }
}
