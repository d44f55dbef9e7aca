// ABOUTME: Session lifecycle manager: one live platform connection per unit of work
// ABOUTME: Stateful sessions are shared per credential; ephemeral sessions are private and torn down on release

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{ProviderError, RelayError, SessionEstablishmentError};
use crate::metrics;
use crate::traits::{
    Connection, ConnectionProvider, Credential, EventStream, HistoryQuery, IdentityKey,
    IncomingMessage,
};

// =============================================================================
// Mode and state
// =============================================================================

/// How a session is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One long-lived session per credential, reused until explicitly shut down
    Stateful,
    /// A fresh session per unit of work, closed on release
    Ephemeral,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stateful => "stateful",
            Self::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stateful" => Ok(Self::Stateful),
            "ephemeral" => Ok(Self::Ephemeral),
            _ => anyhow::bail!("Unknown session mode: {}", s),
        }
    }
}

/// Lifecycle state: `Connecting -> Ready -> Closing -> Closed`.
///
/// A [`Session`] only exists once its provider has connected, so it starts in
/// `Ready`. `Connecting` is reported by [`SessionManager::stateful_sessions`]
/// for a stateful slot whose connection is still being established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Closing,
    Closed,
}

// =============================================================================
// Session
// =============================================================================

/// An established connection bound to exactly one credential.
///
/// Cloning is cheap and shares the same connection. Outbound sends are
/// serialized per session, so providers need not be safe for concurrent sends.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    mode: SessionMode,
    identity: IdentityKey,
    platform_id: &'static str,
    bot_user_id: u64,
    connection: Box<dyn Connection>,
    state: Mutex<SessionState>,
    send_lock: tokio::sync::Mutex<()>,
    opened_at: Instant,
}

impl Session {
    fn new(
        mode: SessionMode,
        identity: IdentityKey,
        platform_id: &'static str,
        connection: Box<dyn Connection>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                mode,
                identity,
                platform_id,
                bot_user_id: connection.bot_user_id(),
                connection,
                state: Mutex::new(SessionState::Ready),
                send_lock: tokio::sync::Mutex::new(()),
                opened_at: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.mode
    }

    pub fn identity(&self) -> IdentityKey {
        self.inner.identity
    }

    pub fn platform_id(&self) -> &'static str {
        self.inner.platform_id
    }

    pub fn bot_user_id(&self) -> u64 {
        self.inner.bot_user_id
    }

    pub fn age(&self) -> Duration {
        self.inner.opened_at.elapsed()
    }

    pub fn state(&self) -> SessionState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Ready
    }

    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ProviderError::Closed)
        }
    }

    /// Subscribe to the connection's inbound messages.
    pub async fn event_stream(&self) -> Result<EventStream, ProviderError> {
        self.ensure_open()?;
        self.inner.connection.event_stream().await
    }

    /// Send a message under this session's identity.
    pub async fn send(&self, channel_id: u64, content: &str) -> Result<u64, ProviderError> {
        self.ensure_open()?;
        let _guard = self.inner.send_lock.lock().await;
        self.inner.connection.send(channel_id, content).await
    }

    pub async fn fetch_history(
        &self,
        channel_id: u64,
        query: HistoryQuery,
    ) -> Result<Vec<IncomingMessage>, ProviderError> {
        self.ensure_open()?;
        self.inner.connection.fetch_history(channel_id, query).await
    }

    /// Close the underlying connection. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                SessionState::Closing | SessionState::Closed => return,
                _ => *state = SessionState::Closing,
            }
        }

        self.inner.connection.close().await;

        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;
        metrics::record_session_closed(self.inner.mode.as_str());
        tracing::debug!(
            session_id = %self.inner.id,
            identity = %self.inner.identity,
            mode = %self.inner.mode,
            age_ms = self.age().as_millis() as u64,
            "Session closed"
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("identity", &self.inner.identity)
            .field("platform_id", &self.inner.platform_id)
            .field("bot_user_id", &self.inner.bot_user_id)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Leases
// =============================================================================

enum LeaseKind {
    Ephemeral,
    Stateful(Arc<StatefulSlot>),
}

/// Scoped ownership of a session.
///
/// Call [`SessionLease::release`] on the normal path. If the lease is dropped
/// instead (error propagation, task cancellation), the drop handler still
/// releases it: stateful references are returned immediately and ephemeral
/// connections are closed on a background task.
pub struct SessionLease {
    session: Session,
    kind: LeaseKind,
    released: bool,
}

impl SessionLease {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn release(mut self) {
        self.released = true;
        match &self.kind {
            LeaseKind::Ephemeral => self.session.close().await,
            LeaseKind::Stateful(slot) => slot.release_ref(self.session.id()),
        }
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match &self.kind {
            LeaseKind::Stateful(slot) => slot.release_ref(self.session.id()),
            LeaseKind::Ephemeral => {
                let session = self.session.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        tracing::debug!(
                            session_id = %session.id(),
                            "Ephemeral lease dropped without release, closing in background"
                        );
                        handle.spawn(async move { session.close().await });
                    }
                    Err(_) => tracing::warn!(
                        session_id = %session.id(),
                        "Ephemeral lease dropped outside a runtime; connection left to provider cleanup"
                    ),
                }
            }
        }
    }
}

// =============================================================================
// Stateful slots
// =============================================================================

struct StatefulEntry {
    session: Session,
    refs: usize,
}

/// Per-credential home of a stateful session. `connect_lock` serializes
/// connection establishment for this credential only.
struct StatefulSlot {
    connect_lock: tokio::sync::Mutex<()>,
    entry: Mutex<Option<StatefulEntry>>,
}

impl StatefulSlot {
    fn new() -> Self {
        Self {
            connect_lock: tokio::sync::Mutex::new(()),
            entry: Mutex::new(None),
        }
    }

    fn lock_entry(&self) -> std::sync::MutexGuard<'_, Option<StatefulEntry>> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference to the live session, discarding a dead one.
    fn checkout(&self) -> Option<Session> {
        let mut entry = self.lock_entry();
        match entry.as_ref().map(|live| live.session.is_open()) {
            Some(true) => {
                let live = entry.as_mut()?;
                live.refs += 1;
                Some(live.session.clone())
            }
            Some(false) => {
                *entry = None;
                None
            }
            None => None,
        }
    }

    fn install(&self, session: Session) {
        *self.lock_entry() = Some(StatefulEntry { session, refs: 1 });
    }

    fn release_ref(&self, session_id: Uuid) {
        if let Some(live) = self.lock_entry().as_mut() {
            if live.session.id() == session_id {
                live.refs = live.refs.saturating_sub(1);
            }
        }
    }

    fn take(&self) -> Option<Session> {
        self.lock_entry().take().map(|entry| entry.session)
    }

    fn snapshot(&self) -> (SessionState, usize, Option<Uuid>) {
        let entry = self.lock_entry();
        match entry.as_ref() {
            Some(live) => (live.session.state(), live.refs, Some(live.session.id())),
            None if self.connect_lock.try_lock().is_err() => (SessionState::Connecting, 0, None),
            None => (SessionState::Closed, 0, None),
        }
    }
}

/// Point-in-time view of one stateful session slot.
#[derive(Debug, Clone, Serialize)]
pub struct StatefulSessionInfo {
    pub identity: IdentityKey,
    pub state: SessionState,
    pub refs: usize,
    pub session_id: Option<Uuid>,
}

// =============================================================================
// Session Manager
// =============================================================================

/// Creates sessions per unit of work and guarantees their release.
///
/// There is no default identity: every call names its credential. No lock is
/// held across a network round-trip except the per-credential connect lock of
/// a stateful slot.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    provider: Arc<dyn ConnectionProvider>,
    stateful: Mutex<HashMap<IdentityKey, Arc<StatefulSlot>>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                provider,
                stateful: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn platform_id(&self) -> &'static str {
        self.inner.provider.platform_id()
    }

    /// Obtain a session for `credential`. Never retries.
    pub async fn acquire(
        &self,
        credential: &Credential,
        mode: SessionMode,
    ) -> Result<SessionLease, SessionEstablishmentError> {
        match mode {
            SessionMode::Ephemeral => {
                let session = self.open(credential, SessionMode::Ephemeral).await?;
                Ok(SessionLease {
                    session,
                    kind: LeaseKind::Ephemeral,
                    released: false,
                })
            }
            SessionMode::Stateful => self.acquire_stateful(credential).await,
        }
    }

    /// Return a lease. Equivalent to [`SessionLease::release`].
    pub async fn release(&self, lease: SessionLease) {
        lease.release().await;
    }

    async fn acquire_stateful(
        &self,
        credential: &Credential,
    ) -> Result<SessionLease, SessionEstablishmentError> {
        let identity = credential.identity();
        let slot = {
            let mut slots = self
                .inner
                .stateful
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                slots
                    .entry(identity)
                    .or_insert_with(|| Arc::new(StatefulSlot::new())),
            )
        };

        if let Some(session) = slot.checkout() {
            return Ok(stateful_lease(session, slot));
        }

        let _connecting = slot.connect_lock.lock().await;
        // Another caller may have connected while we waited
        if let Some(session) = slot.checkout() {
            return Ok(stateful_lease(session, Arc::clone(&slot)));
        }

        let session = self.open(credential, SessionMode::Stateful).await?;
        slot.install(session.clone());
        tracing::info!(
            session_id = %session.id(),
            identity = %identity,
            bot_user_id = session.bot_user_id(),
            "Stateful session established"
        );
        Ok(stateful_lease(session, Arc::clone(&slot)))
    }

    async fn open(
        &self,
        credential: &Credential,
        mode: SessionMode,
    ) -> Result<Session, SessionEstablishmentError> {
        let identity = credential.identity();
        if credential.is_empty() {
            metrics::record_session_failure("empty_credential");
            return Err(SessionEstablishmentError {
                identity,
                source: ProviderError::Authentication("empty credential".to_string()),
            });
        }

        tracing::debug!(identity = %identity, mode = %mode, "Opening session");
        match self.inner.provider.connect(credential).await {
            Ok(connection) => {
                let session = Session::new(
                    mode,
                    identity,
                    self.inner.provider.platform_id(),
                    connection,
                );
                metrics::record_session_opened(mode.as_str());
                tracing::debug!(
                    session_id = %session.id(),
                    identity = %identity,
                    mode = %mode,
                    "Session ready"
                );
                Ok(session)
            }
            Err(source) => {
                let reason = match source {
                    ProviderError::Authentication(_) => "authentication",
                    ProviderError::RateLimited { .. } => "rate_limited",
                    ProviderError::Unavailable(_) => "unavailable",
                    _ => "other",
                };
                metrics::record_session_failure(reason);
                tracing::warn!(
                    identity = %identity,
                    mode = %mode,
                    error = %source,
                    "Session establishment failed"
                );
                Err(SessionEstablishmentError { identity, source })
            }
        }
    }

    /// Run `op` with a session that is released on every exit path.
    pub async fn with_session<F, Fut, T>(
        &self,
        credential: &Credential,
        mode: SessionMode,
        op: F,
    ) -> Result<T, RelayError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let lease = self.acquire(credential, mode).await?;
        let result = op(lease.session().clone()).await;
        lease.release().await;
        result.map_err(RelayError::Operation)
    }

    /// Run `op` on a brand-new session that is closed afterwards.
    pub async fn with_ephemeral_session<F, Fut, T>(
        &self,
        credential: &Credential,
        op: F,
    ) -> Result<T, RelayError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.with_session(credential, SessionMode::Ephemeral, op).await
    }

    /// Close the stateful session for `credential`, if any.
    pub async fn close_stateful(&self, credential: &Credential) -> bool {
        let slot = self
            .inner
            .stateful
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&credential.identity());
        match slot.and_then(|slot| slot.take()) {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every stateful session.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<StatefulSlot>> = self
            .inner
            .stateful
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let sessions: Vec<Session> = slots.iter().filter_map(|slot| slot.take()).collect();
        tracing::info!(count = sessions.len(), "Shutting down stateful sessions");
        futures_util::future::join_all(sessions.iter().map(|s| s.close())).await;
    }

    /// Snapshot of all stateful slots.
    pub fn stateful_sessions(&self) -> Vec<StatefulSessionInfo> {
        self.inner
            .stateful
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(identity, slot)| {
                let (state, refs, session_id) = slot.snapshot();
                StatefulSessionInfo {
                    identity: *identity,
                    state,
                    refs,
                    session_id,
                }
            })
            .collect()
    }
}

fn stateful_lease(session: Session, slot: Arc<StatefulSlot>) -> SessionLease {
    SessionLease {
        session,
        kind: LeaseKind::Stateful(slot),
        released: false,
    }
}
