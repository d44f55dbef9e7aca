// ABOUTME: Event waiter registry: suspend until the next inbound message matching a filter
// ABOUTME: One dispatcher task per session fans each event out to every pending wait via oneshot channels

use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::filter::MessageFilter;
use crate::metrics;
use crate::session::Session;
use crate::traits::{EventStream, IncomingMessage};

/// How a wait ended. Only `Matched` carries a message; none of these are errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WaitOutcome {
    Matched { message: IncomingMessage },
    TimedOut,
    Cancelled,
    ConnectionLost,
}

impl WaitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched { .. } => "matched",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::ConnectionLost => "connection_lost",
        }
    }

    pub fn message(&self) -> Option<&IncomingMessage> {
        match self {
            Self::Matched { message } => Some(message),
            _ => None,
        }
    }
}

// =============================================================================
// Dispatcher protocol
// =============================================================================

enum DispatchCommand {
    Register {
        id: u64,
        filter: MessageFilter,
        resolve: oneshot::Sender<WaitOutcome>,
        ack: oneshot::Sender<()>,
    },
    Cancel {
        id: u64,
    },
}

#[derive(Clone)]
struct DispatcherHandle {
    commands: mpsc::UnboundedSender<DispatchCommand>,
}

struct PendingEntry {
    filter: MessageFilter,
    resolve: oneshot::Sender<WaitOutcome>,
    registered_at: Instant,
}

/// Pending waits owned by one dispatcher, mirrored into the registry-wide count.
struct PendingSet {
    entries: HashMap<u64, PendingEntry>,
    total: Arc<AtomicUsize>,
}

impl PendingSet {
    fn new(total: Arc<AtomicUsize>) -> Self {
        Self {
            entries: HashMap::new(),
            total,
        }
    }

    fn insert(&mut self, id: u64, entry: PendingEntry) {
        if self.entries.insert(id, entry).is_none() {
            self.total.fetch_add(1, Ordering::SeqCst);
            metrics::pending_waits_added(1);
        }
    }

    fn remove(&mut self, id: u64) -> Option<PendingEntry> {
        let entry = self.entries.remove(&id)?;
        self.total.fetch_sub(1, Ordering::SeqCst);
        metrics::pending_waits_removed(1);
        Some(entry)
    }

    /// Drop entries whose waiter has already gone away.
    fn prune_abandoned(&mut self) {
        let abandoned: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.resolve.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            self.remove(id);
        }
    }

    /// Offer one event to every pending wait; each match is resolved and removed.
    fn dispatch(&mut self, message: &IncomingMessage, self_id: u64) -> usize {
        self.prune_abandoned();
        let matched: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.filter.matches(message, self_id))
            .map(|(id, _)| *id)
            .collect();
        for id in &matched {
            if let Some(entry) = self.remove(*id) {
                tracing::trace!(
                    wait_id = id,
                    message_id = message.id,
                    waited_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "Wait matched"
                );
                let _ = entry.resolve.send(WaitOutcome::Matched {
                    message: message.clone(),
                });
            }
        }
        matched.len()
    }

    fn resolve_all(&mut self, outcome: &WaitOutcome) -> usize {
        let ids: Vec<u64> = self.entries.keys().copied().collect();
        for id in &ids {
            if let Some(entry) = self.remove(*id) {
                let _ = entry.resolve.send(outcome.clone());
            }
        }
        ids.len()
    }
}

enum DispatcherExit {
    StreamEnded,
    Shutdown,
}

// =============================================================================
// Pending wait handle
// =============================================================================

enum PendingState {
    Registered {
        rx: oneshot::Receiver<WaitOutcome>,
        commands: mpsc::UnboundedSender<DispatchCommand>,
    },
    Resolved(WaitOutcome),
    Done,
}

/// A registered wait. Dropping it before it resolves deregisters it.
pub struct PendingWait {
    id: u64,
    session_id: Uuid,
    shutdown: CancellationToken,
    state: PendingState,
}

impl PendingWait {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Suspend until the wait resolves.
    ///
    /// `timeout` of `None` or zero waits indefinitely; `cancel` (and registry
    /// shutdown) can always interrupt it.
    pub async fn outcome(
        mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let (mut rx, commands) = match std::mem::replace(&mut self.state, PendingState::Done) {
            PendingState::Registered { rx, commands } => (rx, commands),
            PendingState::Resolved(outcome) => return outcome,
            PendingState::Done => return WaitOutcome::Cancelled,
        };

        let deadline = timeout.filter(|t| !t.is_zero());
        let expiry = async move {
            match deadline {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        let interrupted = tokio::select! {
            biased;
            result = &mut rx => return result.unwrap_or(WaitOutcome::ConnectionLost),
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = self.shutdown.cancelled() => WaitOutcome::Cancelled,
            _ = expiry => WaitOutcome::TimedOut,
        };

        let _ = commands.send(DispatchCommand::Cancel { id: self.id });
        rx.close();
        // A match that raced the deadline wins over the interruption
        match rx.try_recv() {
            Ok(outcome @ WaitOutcome::Matched { .. }) => outcome,
            _ => interrupted,
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if let PendingState::Registered { commands, .. } = &self.state {
            let _ = commands.send(DispatchCommand::Cancel { id: self.id });
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of pending waits, keyed by session.
#[derive(Clone)]
pub struct WaiterRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    dispatchers: Mutex<HashMap<Uuid, Arc<OnceCell<DispatcherHandle>>>>,
    next_wait_id: AtomicU64,
    pending_total: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl RegistryInner {
    fn remove_dispatcher(&self, session_id: Uuid) {
        self.dispatchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
    }
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dispatchers: Mutex::new(HashMap::new()),
                next_wait_id: AtomicU64::new(1),
                pending_total: Arc::new(AtomicUsize::new(0)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Number of waits currently registered across all sessions.
    pub fn pending_count(&self) -> usize {
        self.inner.pending_total.load(Ordering::SeqCst)
    }

    /// Number of sessions with a running dispatcher.
    pub fn dispatcher_count(&self) -> usize {
        self.inner
            .dispatchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register a wait and return once the session's dispatcher has accepted it.
    ///
    /// Every event arriving after this returns is offered to the filter;
    /// events the dispatcher had buffered before the registration are not.
    pub async fn register(&self, session: &Session, filter: MessageFilter) -> PendingWait {
        let id = self.inner.next_wait_id.fetch_add(1, Ordering::SeqCst);
        let resolved = |outcome| PendingWait {
            id,
            session_id: session.id(),
            shutdown: self.inner.shutdown.clone(),
            state: PendingState::Resolved(outcome),
        };

        if self.inner.shutdown.is_cancelled() {
            return resolved(WaitOutcome::Cancelled);
        }
        if !session.is_open() {
            return resolved(WaitOutcome::ConnectionLost);
        }
        let Some(handle) = self.dispatcher_for(session).await else {
            return resolved(WaitOutcome::ConnectionLost);
        };

        let (resolve_tx, resolve_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let command = DispatchCommand::Register {
            id,
            filter,
            resolve: resolve_tx,
            ack: ack_tx,
        };
        if handle.commands.send(command).is_err() || ack_rx.await.is_err() {
            return resolved(WaitOutcome::ConnectionLost);
        }

        PendingWait {
            id,
            session_id: session.id(),
            shutdown: self.inner.shutdown.clone(),
            state: PendingState::Registered {
                rx: resolve_rx,
                commands: handle.commands,
            },
        }
    }

    /// Wait for the first message on `session` matching `filter`.
    pub async fn wait(
        &self,
        session: &Session,
        filter: MessageFilter,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let started = Instant::now();
        let pending = self.register(session, filter).await;
        let wait_id = pending.id();
        let outcome = pending.outcome(timeout, cancel).await;

        metrics::record_wait_outcome(outcome.as_str());
        tracing::debug!(
            session_id = %session.id(),
            wait_id,
            outcome = outcome.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Wait resolved"
        );
        outcome
    }

    /// Cancel every pending wait and stop all dispatchers.
    pub fn shutdown(&self) {
        tracing::info!(pending = self.pending_count(), "Shutting down waiter registry");
        self.inner.shutdown.cancel();
    }

    async fn dispatcher_for(&self, session: &Session) -> Option<DispatcherHandle> {
        let cell = {
            let mut dispatchers = self
                .inner
                .dispatchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(dispatchers.entry(session.id()).or_default())
        };

        let result = cell
            .get_or_try_init(|| async {
                let events = session.event_stream().await?;
                Ok::<_, crate::error::ProviderError>(self.spawn_dispatcher(session, events))
            })
            .await;

        match result {
            Ok(handle) => Some(handle.clone()),
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    error = %e,
                    "Could not subscribe to session events"
                );
                self.inner.remove_dispatcher(session.id());
                None
            }
        }
    }

    fn spawn_dispatcher(&self, session: &Session, events: EventStream) -> DispatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(
            session.clone(),
            events,
            rx,
            PendingSet::new(Arc::clone(&self.inner.pending_total)),
            self.inner.shutdown.clone(),
            Arc::downgrade(&self.inner),
        ));
        tracing::debug!(session_id = %session.id(), "Dispatcher started");
        DispatcherHandle { commands: tx }
    }
}

/// Dispatch every event that is ready without waiting. Returns `false` once
/// the stream has ended.
fn drain_ready(events: &mut EventStream, pending: &mut PendingSet, self_id: u64) -> bool {
    while let Some(event) = events.next().now_or_never() {
        match event {
            Some(message) => {
                pending.dispatch(&message, self_id);
            }
            None => return false,
        }
    }
    true
}

async fn run_dispatcher(
    session: Session,
    mut events: EventStream,
    mut commands: mpsc::UnboundedReceiver<DispatchCommand>,
    mut pending: PendingSet,
    shutdown: CancellationToken,
    registry: Weak<RegistryInner>,
) {
    let self_id = session.bot_user_id();

    let exit = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break DispatcherExit::Shutdown,
            command = commands.recv() => match command {
                Some(DispatchCommand::Register { id, filter, resolve, ack }) => {
                    // Events already buffered predate this registration
                    let open = drain_ready(&mut events, &mut pending, self_id);
                    pending.insert(id, PendingEntry {
                        filter,
                        resolve,
                        registered_at: Instant::now(),
                    });
                    let _ = ack.send(());
                    if !open {
                        break DispatcherExit::StreamEnded;
                    }
                }
                Some(DispatchCommand::Cancel { id }) => {
                    pending.remove(id);
                }
                None => break DispatcherExit::Shutdown,
            },
            event = events.next() => match event {
                Some(message) => {
                    pending.dispatch(&message, self_id);
                }
                None => break DispatcherExit::StreamEnded,
            },
        }
    };

    let outcome = match exit {
        DispatcherExit::StreamEnded => {
            session.close().await;
            WaitOutcome::ConnectionLost
        }
        DispatcherExit::Shutdown => WaitOutcome::Cancelled,
    };

    if let Some(registry) = registry.upgrade() {
        registry.remove_dispatcher(session.id());
    }

    // Registrations still in flight get the same outcome as pending ones
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let DispatchCommand::Register { id, filter, resolve, ack } = command {
            pending.insert(
                id,
                PendingEntry {
                    filter,
                    resolve,
                    registered_at: Instant::now(),
                },
            );
            let _ = ack.send(());
        }
    }

    let resolved = pending.resolve_all(&outcome);
    match outcome {
        WaitOutcome::ConnectionLost => tracing::warn!(
            session_id = %session.id(),
            resolved,
            "Session event stream ended; pending waits resolved as connection lost"
        ),
        _ => tracing::debug!(
            session_id = %session.id(),
            resolved,
            "Dispatcher stopped"
        ),
    }
}
