// ABOUTME: Composable message filter used by waiters and unread-batch filtering
// ABOUTME: A conjunction of optional criteria; an empty filter matches everything

use regex::Regex;

use crate::error::FilterError;
use crate::traits::IncomingMessage;

/// Predicate over incoming messages.
///
/// Every set criterion must hold. `mention_only` is evaluated against the
/// bot identity of the session the filter is applied on.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    channel_id: Option<u64>,
    dm_only: bool,
    mention_only: bool,
    sender_id: Option<u64>,
    content_contains: Option<String>,
    content_regex: Option<Regex>,
}

impl MessageFilter {
    /// Filter that matches every message
    pub fn any() -> Self {
        Self::default()
    }

    pub fn channel(mut self, channel_id: u64) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn dm_only(mut self) -> Self {
        self.dm_only = true;
        self
    }

    pub fn mention_only(mut self) -> Self {
        self.mention_only = true;
        self
    }

    pub fn sender(mut self, user_id: u64) -> Self {
        self.sender_id = Some(user_id);
        self
    }

    pub fn content_contains(mut self, needle: impl Into<String>) -> Self {
        self.content_contains = Some(needle.into());
        self
    }

    /// Match content with a regex (search, not full match).
    pub fn content_regex(mut self, pattern: &str) -> Result<Self, FilterError> {
        self.content_regex = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.channel_id.is_none()
            && !self.dm_only
            && !self.mention_only
            && self.sender_id.is_none()
            && self.content_contains.is_none()
            && self.content_regex.is_none()
    }

    /// Evaluate the filter for a session whose bot user id is `self_id`.
    pub fn matches(&self, message: &IncomingMessage, self_id: u64) -> bool {
        if let Some(channel_id) = self.channel_id {
            if message.channel_id != channel_id {
                return false;
            }
        }
        if self.dm_only && !message.is_dm {
            return false;
        }
        if self.mention_only && !message.mentions_user(self_id) {
            return false;
        }
        if let Some(sender_id) = self.sender_id {
            if message.author_id != sender_id {
                return false;
            }
        }
        if let Some(ref needle) = self.content_contains {
            if !message.content.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(ref regex) = self.content_regex {
            if !regex.is_match(&message.content) {
                return false;
            }
        }
        true
    }
}
