// ABOUTME: Discord connection provider built on serenity
// ABOUTME: REST for send/history; the gateway websocket opens lazily on the first event subscription

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    Channel, ChannelId, CreateMessage, GatewayIntents, GetMessages, MessageId, ShardManager,
};
use serenity::http::Http;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use parley_core::{
    Connection, ConnectionProvider, Credential, EventStream, HistoryQuery, IncomingMessage,
    ProviderError,
};

/// Retry hint used when Discord rate limits without a usable header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// How long a new gateway may take to identify and receive READY.
const GATEWAY_READY_TIMEOUT: Duration = Duration::from_secs(30);

type Subscribers = Arc<StdMutex<Vec<mpsc::UnboundedSender<IncomingMessage>>>>;

/// Connects bot tokens to Discord.
#[derive(Debug, Default)]
pub struct DiscordProvider;

impl DiscordProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionProvider for DiscordProvider {
    fn platform_id(&self) -> &'static str {
        "discord"
    }

    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Connection>, ProviderError> {
        let http = Arc::new(Http::new(credential.expose()));
        // Validates the token without opening a gateway
        let current_user = http.get_current_user().await.map_err(map_error)?;
        let bot_user_id = current_user.id.get();
        tracing::debug!(
            identity = %credential.identity(),
            bot_user_id,
            "Discord REST connection established"
        );

        Ok(Box::new(DiscordConnection {
            credential: credential.clone(),
            http,
            bot_user_id,
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            gateway: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct Gateway {
    shard_manager: Arc<ShardManager>,
    task: JoinHandle<()>,
}

/// One bot identity on Discord.
pub struct DiscordConnection {
    credential: Credential,
    http: Arc<Http>,
    bot_user_id: u64,
    subscribers: Subscribers,
    gateway: tokio::sync::Mutex<Option<Gateway>>,
    closed: AtomicBool,
}

impl DiscordConnection {
    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ProviderError::Closed)
        } else {
            Ok(())
        }
    }

    async fn start_gateway(&self) -> Result<Gateway, ProviderError> {
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = GatewayHandler {
            subscribers: Arc::clone(&self.subscribers),
            ready: StdMutex::new(Some(ready_tx)),
        };
        let mut client = Client::builder(self.credential.expose(), intents)
            .event_handler(handler)
            .await
            .map_err(map_error)?;

        let shard_manager = client.shard_manager.clone();
        let subscribers = Arc::clone(&self.subscribers);
        let identity = self.credential.identity();
        let task = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                tracing::warn!(identity = %identity, error = %e, "Discord gateway stopped with error");
            }
            // Ends every event stream of this connection
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });

        if let Err(e) = await_ready(ready_rx, GATEWAY_READY_TIMEOUT).await {
            tracing::warn!(identity = %self.credential.identity(), error = %e, "Discord gateway never became ready");
            shard_manager.shutdown_all().await;
            task.abort();
            return Err(e);
        }

        tracing::info!(identity = %self.credential.identity(), "Discord gateway started");
        Ok(Gateway {
            shard_manager,
            task,
        })
    }

    async fn is_dm_channel(&self, channel_id: ChannelId) -> Result<bool, ProviderError> {
        let channel = channel_id.to_channel(&self.http).await.map_err(map_error)?;
        Ok(matches!(channel, Channel::Private(_)))
    }
}

#[async_trait]
impl Connection for DiscordConnection {
    fn bot_user_id(&self) -> u64 {
        self.bot_user_id
    }

    /// The returned stream sees every message dispatched after READY.
    async fn event_stream(&self) -> Result<EventStream, ProviderError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut gateway = self.gateway.lock().await;
        // Subscribed before the gateway starts so nothing between READY and return is lost
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx.clone());

        if gateway.as_ref().map_or(true, |g| g.task.is_finished()) {
            match self.start_gateway().await {
                Ok(started) => *gateway = Some(started),
                Err(e) => {
                    self.subscribers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|s| !s.same_channel(&tx));
                    return Err(e);
                }
            }
        }
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(&self, channel_id: u64, content: &str) -> Result<u64, ProviderError> {
        self.ensure_open()?;
        let message = ChannelId::new(channel_id)
            .send_message(&self.http, CreateMessage::new().content(content))
            .await
            .map_err(map_error)?;
        Ok(message.id.get())
    }

    async fn fetch_history(
        &self,
        channel_id: u64,
        query: HistoryQuery,
    ) -> Result<Vec<IncomingMessage>, ProviderError> {
        self.ensure_open()?;
        let channel = ChannelId::new(channel_id);
        // REST messages carry no guild id, so DM-ness comes from the channel itself
        let is_dm = self.is_dm_channel(channel).await?;

        let limit = u8::try_from(query.limit.clamp(1, 100)).unwrap_or(100);
        let mut builder = GetMessages::new().limit(limit);
        if let Some(after) = query.after {
            builder = builder.after(MessageId::new(after.max(1)));
        } else if let Some(before) = query.before {
            builder = builder.before(MessageId::new(before.max(1)));
        }

        let messages = channel
            .messages(&self.http, builder)
            .await
            .map_err(map_error)?;
        Ok(messages.iter().map(|m| to_incoming(m, is_dm)).collect())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(gateway) = self.gateway.lock().await.take() {
            gateway.shard_manager.shutdown_all().await;
            if let Err(e) = gateway.task.await {
                tracing::debug!(error = %e, "Discord gateway task ended abnormally");
            }
        }
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!(identity = %self.credential.identity(), "Discord connection closed");
    }
}

struct GatewayHandler {
    subscribers: Subscribers,
    ready: StdMutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl EventHandler for GatewayHandler {
    async fn message(&self, _ctx: Context, msg: Message) {
        let incoming = to_incoming(&msg, msg.guild_id.is_none());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(incoming.clone()).is_ok());
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            user = %ready.user.name,
            user_id = %ready.user.id,
            "Discord gateway ready"
        );
        // Only the first READY completes startup; later ones are reconnects
        if let Some(tx) = self.ready.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    }
}

/// Wait for the gateway's READY signal. A dropped sender means the client
/// stopped before identifying.
async fn await_ready(ready: oneshot::Receiver<()>, limit: Duration) -> Result<(), ProviderError> {
    match tokio::time::timeout(limit, ready).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(ProviderError::Unavailable(
            "gateway stopped before becoming ready".to_string(),
        )),
        Err(_) => Err(ProviderError::Unavailable(format!(
            "gateway did not become ready within {}s",
            limit.as_secs()
        ))),
    }
}

fn to_incoming(msg: &Message, is_dm: bool) -> IncomingMessage {
    let ts = msg.timestamp;
    IncomingMessage {
        id: msg.id.get(),
        channel_id: msg.channel_id.get(),
        author_id: msg.author.id.get(),
        content: msg.content.clone(),
        timestamp: DateTime::from_timestamp(ts.unix_timestamp(), ts.nanosecond())
            .unwrap_or_else(Utc::now),
        is_dm,
        mentions: msg.mentions.iter().map(|u| u.id.get()).collect(),
    }
}

fn map_error(err: SerenityError) -> ProviderError {
    if let SerenityError::Http(ref http_err) = err {
        return match http_err.status_code().map(|s| s.as_u16()) {
            Some(401) => ProviderError::Authentication(err.to_string()),
            Some(429) => ProviderError::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER,
            },
            Some(status) if status >= 500 => ProviderError::Unavailable(err.to_string()),
            Some(_) => ProviderError::Platform(err.to_string()),
            None => ProviderError::Unavailable(err.to_string()),
        };
    }
    match err {
        SerenityError::Gateway(_) => {
            ProviderError::Unavailable(err.to_string())
        }
        _ => ProviderError::Platform(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_await_ready_succeeds_on_signal() {
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        assert!(await_ready(rx, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_await_ready_times_out_as_unavailable() {
        let (_tx, rx) = oneshot::channel::<()>();
        let err = await_ready(rx, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_await_ready_fails_when_client_stops_first() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let err = await_ready(rx, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
