// ABOUTME: Core data types and the connection-provider seam to the chat platform
// ABOUTME: IncomingMessage, Credential, HistoryQuery, Connection, and ConnectionProvider

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::pin::Pin;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::error::ProviderError;

/// Largest page a platform history call may return.
pub const MAX_HISTORY_LIMIT: usize = 100;

// =============================================================================
// Incoming Message
// =============================================================================

/// Immutable record of a chat message as delivered by the platform.
///
/// `id` is strictly increasing per platform and is the only ordering key;
/// `timestamp` is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// True for 1:1 direct messages (no guild/server)
    pub is_dm: bool,
    /// User ids mentioned in the message
    #[serde(default)]
    pub mentions: BTreeSet<u64>,
}

impl IncomingMessage {
    pub fn mentions_user(&self, user_id: u64) -> bool {
        self.mentions.contains(&user_id)
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Namespace for deriving identity keys from credentials.
const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d8e_5a3b_4c7d_9e0f_1a2b_3c4d_5e6f);

/// Opaque bot credential, threaded explicitly through every operation.
///
/// Never logged and never serialized. Use [`Credential::identity`] when a
/// stable, non-secret handle for the identity is needed (logs, map keys,
/// watermark scopes).
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Raw token, for handing to a connection provider only.
    pub fn expose(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.trim().is_empty()
    }

    /// Stable identity key derived from the token (UUIDv5).
    pub fn identity(&self) -> IdentityKey {
        IdentityKey(Uuid::new_v5(&IDENTITY_NAMESPACE, self.token.as_bytes()))
    }
}

// Custom Debug impl to redact the token
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("identity", &self.identity())
            .finish()
    }
}

/// Non-secret key identifying one bot identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(Uuid);

impl IdentityKey {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

// =============================================================================
// History queries
// =============================================================================

/// Bounds for a channel history fetch.
///
/// With `after` set, a provider returns the *oldest* `limit` messages whose id
/// is greater than `after`. Without `after`, it returns the *newest* `limit`
/// messages (below `before`, when set). Providers may return either order;
/// callers sort by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryQuery {
    pub before: Option<u64>,
    pub after: Option<u64>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            before: None,
            after: None,
            limit: limit.min(MAX_HISTORY_LIMIT),
        }
    }

    pub fn after(id: u64, limit: usize) -> Self {
        Self {
            before: None,
            after: Some(id),
            limit: limit.min(MAX_HISTORY_LIMIT),
        }
    }
}

// =============================================================================
// Connection Provider
// =============================================================================

/// Boxed stream of inbound platform messages, in platform arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A live duplex channel to the platform bound to one credential.
///
/// The inbound stream ends when the connection drops or is closed.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The bot's own user id on the platform
    fn bot_user_id(&self) -> u64;

    /// Subscribe to inbound messages
    async fn event_stream(&self) -> Result<EventStream, ProviderError>;

    /// Send a message, returning the platform's id for it
    async fn send(&self, channel_id: u64, content: &str) -> Result<u64, ProviderError>;

    /// Fetch channel history within the given bounds
    async fn fetch_history(
        &self,
        channel_id: u64,
        query: HistoryQuery,
    ) -> Result<Vec<IncomingMessage>, ProviderError>;

    /// Release the underlying connection. Must be idempotent.
    async fn close(&self);
}

/// Factory that turns a credential into a live [`Connection`].
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Platform identifier (e.g., "discord", "memory")
    fn platform_id(&self) -> &'static str;

    /// Establish a connection. Fails with `Authentication` for a bad
    /// credential and `Unavailable`/`RateLimited` for outages.
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Connection>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_token() {
        let credential = Credential::new("super-secret-token");
        let debug = format!("{:?}", credential);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret-token"));
    }

    #[test]
    fn test_identity_is_stable_and_distinct() {
        let a = Credential::new("token-a");
        let b = Credential::new("token-b");
        assert_eq!(a.identity(), Credential::new("token-a").identity());
        assert_ne!(a.identity(), b.identity());
        assert!(!a.identity().to_string().contains("token-a"));
    }

    #[test]
    fn test_history_query_caps_limit() {
        assert_eq!(HistoryQuery::latest(500).limit, MAX_HISTORY_LIMIT);
        let q = HistoryQuery::after(42, 10);
        assert_eq!(q.after, Some(42));
        assert_eq!(q.limit, 10);
    }
}
