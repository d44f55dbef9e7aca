// ABOUTME: In-process chat platform implementing ConnectionProvider for tests and local runs
// ABOUTME: Bots, channels, and history live in memory; posts are pushed to connected bots' event streams

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ProviderError;
use crate::traits::{
    Connection, ConnectionProvider, Credential, EventStream, HistoryQuery, IncomingMessage,
};

struct ChannelState {
    is_dm: bool,
    members: BTreeSet<u64>,
    messages: Vec<IncomingMessage>,
}

struct Subscriber {
    connection_id: u64,
    bot_user_id: u64,
    tx: mpsc::UnboundedSender<IncomingMessage>,
}

struct PlatformState {
    next_message_id: u64,
    next_connection_id: u64,
    bots: HashMap<String, u64>,
    channels: HashMap<u64, ChannelState>,
    subscribers: Vec<Subscriber>,
    unavailable: bool,
    open_connections: usize,
}

/// A tiny chat platform. Cloning shares the same state.
///
/// Bots only see channels they are members of. Message ids are assigned from
/// one platform-wide counter, so they increase strictly across all channels.
#[derive(Clone)]
pub struct MemoryPlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState {
                next_message_id: 1,
                next_connection_id: 1,
                bots: HashMap::new(),
                channels: HashMap::new(),
                subscribers: Vec::new(),
                unavailable: false,
                open_connections: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept `token` as the credential of bot `bot_user_id`.
    pub fn register_bot(&self, token: &str, bot_user_id: u64) {
        self.lock().bots.insert(token.to_string(), bot_user_id);
    }

    /// Create (or extend) a guild channel with the given members.
    pub fn add_channel(&self, channel_id: u64, members: &[u64]) {
        self.upsert_channel(channel_id, false, members);
    }

    /// Create (or extend) a direct-message channel.
    pub fn add_dm(&self, channel_id: u64, members: &[u64]) {
        self.upsert_channel(channel_id, true, members);
    }

    fn upsert_channel(&self, channel_id: u64, is_dm: bool, members: &[u64]) {
        let mut state = self.lock();
        let channel = state.channels.entry(channel_id).or_insert_with(|| ChannelState {
            is_dm,
            members: BTreeSet::new(),
            messages: Vec::new(),
        });
        channel.members.extend(members.iter().copied());
    }

    /// Make the next assigned message id at least `id`.
    pub fn set_next_message_id(&self, id: u64) {
        let mut state = self.lock();
        state.next_message_id = state.next_message_id.max(id);
    }

    /// Post a message as `author_id`. Unknown channels are created with no
    /// members, so nobody sees the message until bots are added.
    pub fn post(&self, channel_id: u64, author_id: u64, content: &str) -> IncomingMessage {
        self.post_with_mentions(channel_id, author_id, content, &[])
    }

    pub fn post_with_mentions(
        &self,
        channel_id: u64,
        author_id: u64,
        content: &str,
        mentions: &[u64],
    ) -> IncomingMessage {
        let mut state = self.lock();
        post_locked(&mut state, channel_id, author_id, content, mentions)
    }

    /// Drop every live connection of `bot_user_id`, ending their event streams.
    pub fn disconnect(&self, bot_user_id: u64) -> usize {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.bot_user_id != bot_user_id);
        before - state.subscribers.len()
    }

    /// While set, new connections fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    /// Live event subscriptions across all connections.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    /// Stored messages of a channel, ascending by id.
    pub fn messages(&self, channel_id: u64) -> Vec<IncomingMessage> {
        self.lock()
            .channels
            .get(&channel_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }
}

fn post_locked(
    state: &mut PlatformState,
    channel_id: u64,
    author_id: u64,
    content: &str,
    mentions: &[u64],
) -> IncomingMessage {
    let id = state.next_message_id;
    state.next_message_id += 1;

    let channel = state.channels.entry(channel_id).or_insert_with(|| ChannelState {
        is_dm: false,
        members: BTreeSet::new(),
        messages: Vec::new(),
    });
    let message = IncomingMessage {
        id,
        channel_id,
        author_id,
        content: content.to_string(),
        timestamp: Utc::now(),
        is_dm: channel.is_dm,
        mentions: mentions.iter().copied().collect(),
    };
    channel.messages.push(message.clone());

    let members = channel.members.clone();
    state.subscribers.retain(|subscriber| {
        if !members.contains(&subscriber.bot_user_id) {
            return !subscriber.tx.is_closed();
        }
        subscriber.tx.send(message.clone()).is_ok()
    });
    message
}

#[async_trait]
impl ConnectionProvider for MemoryPlatform {
    fn platform_id(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Connection>, ProviderError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(ProviderError::Unavailable(
                "memory platform is offline".to_string(),
            ));
        }
        let bot_user_id = *state
            .bots
            .get(credential.expose())
            .ok_or_else(|| ProviderError::Authentication("unknown bot token".to_string()))?;

        let connection_id = state.next_connection_id;
        state.next_connection_id += 1;
        state.open_connections += 1;

        Ok(Box::new(MemoryConnection {
            platform: self.clone(),
            connection_id,
            bot_user_id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One bot's connection to a [`MemoryPlatform`].
pub struct MemoryConnection {
    platform: MemoryPlatform,
    connection_id: u64,
    bot_user_id: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ProviderError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_member(&self, state: &PlatformState, channel_id: u64) -> Result<(), ProviderError> {
        match state.channels.get(&channel_id) {
            Some(channel) if channel.members.contains(&self.bot_user_id) => Ok(()),
            Some(_) => Err(ProviderError::Platform(format!(
                "missing access to channel {}",
                channel_id
            ))),
            None => Err(ProviderError::Platform(format!(
                "unknown channel {}",
                channel_id
            ))),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn bot_user_id(&self) -> u64 {
        self.bot_user_id
    }

    async fn event_stream(&self) -> Result<EventStream, ProviderError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.platform.lock().subscribers.push(Subscriber {
            connection_id: self.connection_id,
            bot_user_id: self.bot_user_id,
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(&self, channel_id: u64, content: &str) -> Result<u64, ProviderError> {
        self.ensure_open()?;
        let mut state = self.platform.lock();
        self.ensure_member(&state, channel_id)?;
        let message = post_locked(&mut state, channel_id, self.bot_user_id, content, &[]);
        Ok(message.id)
    }

    async fn fetch_history(
        &self,
        channel_id: u64,
        query: HistoryQuery,
    ) -> Result<Vec<IncomingMessage>, ProviderError> {
        self.ensure_open()?;
        let state = self.platform.lock();
        self.ensure_member(&state, channel_id)?;
        let messages = state
            .channels
            .get(&channel_id)
            .map(|c| c.messages.as_slice())
            .unwrap_or_default();

        let in_bounds = |m: &&IncomingMessage| {
            query.after.map_or(true, |after| m.id > after)
                && query.before.map_or(true, |before| m.id < before)
        };

        // Oldest-first after a cursor, newest-first otherwise
        let page = match query.after {
            Some(_) => messages
                .iter()
                .filter(in_bounds)
                .take(query.limit)
                .cloned()
                .collect(),
            None => messages
                .iter()
                .rev()
                .filter(in_bounds)
                .take(query.limit)
                .cloned()
                .collect(),
        };
        Ok(page)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.platform.lock();
        state
            .subscribers
            .retain(|s| s.connection_id != self.connection_id);
        state.open_connections = state.open_connections.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let platform = MemoryPlatform::new();
        let err = platform.connect(&Credential::new("nope")).await.err().unwrap();
        assert!(matches!(err, ProviderError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_history_ordering_and_bounds() {
        let platform = MemoryPlatform::new();
        platform.register_bot("t", 900);
        platform.add_channel(10, &[900]);
        for i in 0..5 {
            platform.post(10, 1, &format!("m{}", i));
        }
        let conn = platform.connect(&Credential::new("t")).await.unwrap();

        let latest = conn.fetch_history(10, HistoryQuery::latest(2)).await.unwrap();
        assert_eq!(latest.iter().map(|m| m.id).collect::<Vec<_>>(), vec![5, 4]);

        let after = conn.fetch_history(10, HistoryQuery::after(2, 2)).await.unwrap();
        assert_eq!(after.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_events_reach_members_only_and_stop_on_close() {
        let platform = MemoryPlatform::new();
        platform.register_bot("a", 1);
        platform.register_bot("b", 2);
        platform.add_channel(10, &[1]);

        let conn_a = platform.connect(&Credential::new("a")).await.unwrap();
        let conn_b = platform.connect(&Credential::new("b")).await.unwrap();
        let mut events_a = conn_a.event_stream().await.unwrap();
        let mut events_b = conn_b.event_stream().await.unwrap();

        let posted = platform.post(10, 50, "hello");
        assert_eq!(events_a.next().await.unwrap(), posted);

        conn_b.close().await;
        assert!(events_b.next().await.is_none());
        assert_eq!(platform.open_connections(), 1);

        conn_a.close().await;
        assert!(events_a.next().await.is_none());
        assert_eq!(platform.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_membership() {
        let platform = MemoryPlatform::new();
        platform.register_bot("t", 900);
        platform.add_channel(10, &[900]);
        platform.add_channel(11, &[901]);
        let conn = platform.connect(&Credential::new("t")).await.unwrap();

        let id = conn.send(10, "hi").await.unwrap();
        assert_eq!(platform.messages(10)[0].id, id);
        assert_eq!(platform.messages(10)[0].author_id, 900);
        assert!(matches!(
            conn.send(11, "hi").await,
            Err(ProviderError::Platform(_))
        ));
    }
}
