//! Live connection registry and push delivery.
//!
//! One live connection per user. Identity comes from a verified token,
//! never from a client-supplied id: the transport layer hands the raw
//! token to `ConnectionRegistry::connect` and only a successful
//! verification yields a registered connection.
//!
//! Push delivery is fire-and-forget. A user without a live connection
//! simply misses the frame; the notification row is already persisted
//! and will be seen on the next fetch.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::Notification;

/// Errors from token verification.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
    #[error("Token verification failed: {0}")]
    Verification(String),
}

/// Verifies a connection token and yields the authenticated user id.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

// ============================================================================
// JWT verifier
// ============================================================================

/// Claims carried by connection tokens.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id (subject).
    sub: String,
    /// Expiration timestamp (Unix).
    exp: u64,
    /// Issued at timestamp (Unix).
    iat: u64,
}

/// HMAC-signed JWT verifier.
pub struct JwtTokenVerifier {
    encoding_key: jsonwebtoken::EncodingKey,
    decoding_key: jsonwebtoken::DecodingKey,
}

impl JwtTokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Build from the `JWT_SECRET` environment variable.
    pub fn from_env() -> Option<Self> {
        let secret = std::env::var("JWT_SECRET").ok()?;
        info!("JWT token verifier initialized");
        Some(Self::new(&secret))
    }

    /// Issue a token for a user, valid for `ttl_secs`.
    pub fn generate(&self, user_id: &str, ttl_secs: u64) -> Result<String, AuthError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| AuthError::Verification(e.to_string()))?
            .as_secs();

        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + ttl_secs,
            iat: now,
        };

        jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Verification(e.to_string()))
    }
}

impl TokenVerifier for JwtTokenVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let validation = jsonwebtoken::Validation::default();
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims.sub)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidToken,
                _ => AuthError::Verification(e.to_string()),
            })
    }
}

/// Fixed token-to-user mapping. Used in tests and local setups.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

// ============================================================================
// Push frames
// ============================================================================

/// Frames pushed to live connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushMessage {
    /// A new notification was created for the recipient.
    NewNotification { notification: Notification },
    /// The recipient's unread count changed.
    UnreadCountUpdate { count: u64 },
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was handed to the user's live connection.
    Delivered,
    /// No live connection for the user; the frame was skipped.
    NotConnected,
}

// ============================================================================
// Registry
// ============================================================================

struct ClientHandle {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

/// Registry of live connections, one per user.
///
/// A second connection for the same user replaces the first. Disconnects
/// carry the connection id so a stale close can never evict a newer
/// connection.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ClientHandle>>,
    verifier: Arc<dyn TokenVerifier>,
}

impl ConnectionRegistry {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            verifier,
        }
    }

    /// Verify the token and register the connection.
    ///
    /// Returns the authenticated user id and the new connection's id.
    pub async fn connect(
        &self,
        token: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> Result<(String, Uuid), AuthError> {
        let user_id = self.verifier.verify(token)?;
        let connection_id = Uuid::new_v4();

        let mut connections = self.connections.write().await;
        if connections
            .insert(
                user_id.clone(),
                ClientHandle {
                    connection_id,
                    sender,
                },
            )
            .is_some()
        {
            info!(user_id = %user_id, "Replaced existing live connection");
        } else {
            debug!(user_id = %user_id, "Registered live connection");
        }

        Ok((user_id, connection_id))
    }

    /// Remove a connection, but only if `connection_id` still owns the
    /// slot. A stale disconnect after a replacement is a no-op.
    pub async fn disconnect(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(handle) if handle.connection_id == connection_id => {
                connections.remove(user_id);
                debug!(user_id = %user_id, "Removed live connection");
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.connections.read().await.contains_key(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Push a frame to one user's live connection.
    pub async fn push(&self, user_id: &str, message: &PushMessage) -> PushOutcome {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to serialize push frame");
                return PushOutcome::NotConnected;
            }
        };

        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(handle) => {
                if handle.sender.send(frame).is_err() {
                    // Receiver is gone; drop the dead handle now rather
                    // than waiting for the disconnect callback.
                    connections.remove(user_id);
                    debug!(user_id = %user_id, "Dropped dead connection during push");
                    PushOutcome::NotConnected
                } else {
                    PushOutcome::Delivered
                }
            }
            None => PushOutcome::NotConnected,
        }
    }

    /// Push a frame to every live connection. Returns how many received
    /// it.
    pub async fn broadcast(&self, message: &PushMessage) -> usize {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to serialize broadcast frame");
                return 0;
            }
        };

        let mut connections = self.connections.write().await;
        let mut delivered = 0;
        connections.retain(|_, handle| {
            if handle.sender.send(frame.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        delivered
    }
}
