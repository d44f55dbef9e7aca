// ABOUTME: Backlog reconciler: ordered "everything not yet seen" batches relative to a watermark
// ABOUTME: Never auto-advances; the caller acknowledges a batch by advancing the watermark itself

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::BacklogError;
use crate::filter::MessageFilter;
use crate::metrics;
use crate::session::Session;
use crate::traits::{Credential, HistoryQuery, IdentityKey, IncomingMessage, MAX_HISTORY_LIMIT};
use crate::watermark::{AdvanceOutcome, WatermarkStore};

/// Default number of recent messages returned when a scope has no watermark.
pub const DEFAULT_FALLBACK_WINDOW: usize = 100;

/// Default page size for unread batches.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Key under which a watermark is tracked: one bot identity in one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub identity: IdentityKey,
    pub channel_id: u64,
}

impl Scope {
    pub fn new(identity: IdentityKey, channel_id: u64) -> Self {
        Self {
            identity,
            channel_id,
        }
    }

    pub fn for_credential(credential: &Credential, channel_id: u64) -> Self {
        Self::new(credential.identity(), channel_id)
    }

    pub fn for_session(session: &Session, channel_id: u64) -> Self {
        Self::new(session.identity(), channel_id)
    }

    /// Storage key, `<identity>:<channel_id>`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.identity, self.channel_id)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identity, self.channel_id)
    }
}

/// Where a batch's lower bound came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "cursor", rename_all = "snake_case")]
pub enum BatchOrigin {
    /// Messages after the stored watermark
    Watermark(u64),
    /// Messages after a cursor the caller supplied
    Explicit(u64),
    /// No watermark: the most recent messages only. Best-effort; anything
    /// older than the fallback window is never delivered.
    Fallback,
}

impl BatchOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watermark(_) => "watermark",
            Self::Explicit(_) => "explicit",
            Self::Fallback => "fallback",
        }
    }

    pub fn cursor(&self) -> Option<u64> {
        match self {
            Self::Watermark(id) | Self::Explicit(id) => Some(*id),
            Self::Fallback => None,
        }
    }
}

/// One page of unread messages, ascending by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadBatch {
    pub scope_key: String,
    pub messages: Vec<IncomingMessage>,
    /// Highest id in the page, or the starting cursor when the page is empty
    pub next_cursor: Option<u64>,
    pub origin: BatchOrigin,
    /// True when this exact batch was already handed out and not yet acknowledged
    pub redelivered: bool,
    /// The page was full; more messages may follow `next_cursor`
    pub page_full: bool,
}

impl UnreadBatch {
    /// Keep only messages matching `filter`. `next_cursor` is left untouched so
    /// acknowledging the batch also skips what was filtered out.
    pub fn filtered(mut self, filter: &MessageFilter, self_id: u64) -> Self {
        if !filter.is_empty() {
            self.messages.retain(|message| filter.matches(message, self_id));
        }
        self
    }

    pub fn ids(&self) -> Vec<u64> {
        self.messages.iter().map(|m| m.id).collect()
    }
}

/// A batch awaiting acknowledgement, keyed by its origin and page size.
struct InFlight {
    page_size: usize,
    batch: UnreadBatch,
}

/// Computes unread batches and advances watermarks.
///
/// At most one batch per scope is in flight: fetching again from the same
/// origin before advancing returns the same batch, marked
/// `redelivered`.
pub struct BacklogReconciler {
    store: Arc<dyn WatermarkStore>,
    fallback_window: usize,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl BacklogReconciler {
    pub fn new(store: Arc<dyn WatermarkStore>, fallback_window: usize) -> Self {
        Self {
            store,
            fallback_window: fallback_window.clamp(1, MAX_HISTORY_LIMIT),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn fallback_window(&self) -> usize {
        self.fallback_window
    }

    pub fn store(&self) -> &Arc<dyn WatermarkStore> {
        &self.store
    }

    /// Current watermark for `scope`, if one was ever set.
    pub fn watermark(&self, scope: &Scope) -> Result<Option<u64>, BacklogError> {
        self.store.load(&scope.key()).map_err(BacklogError::Store)
    }

    /// Fetch the next page of unread messages for `scope` over `session`.
    ///
    /// `since` overrides the stored watermark for this call only. `page_size`
    /// is clamped to `1..=100`.
    pub async fn fetch_unread(
        &self,
        session: &Session,
        scope: &Scope,
        since: Option<u64>,
        page_size: usize,
    ) -> Result<UnreadBatch, BacklogError> {
        let page_size = page_size.clamp(1, MAX_HISTORY_LIMIT);
        let scope_key = scope.key();

        let origin = match since {
            Some(cursor) => BatchOrigin::Explicit(cursor),
            None => match self.watermark(scope)? {
                Some(cursor) => BatchOrigin::Watermark(cursor),
                None => BatchOrigin::Fallback,
            },
        };
        let start = origin.cursor();

        if let Some(batch) = self.cached(&scope_key, origin, page_size) {
            tracing::debug!(
                scope = %scope_key,
                count = batch.messages.len(),
                "Re-delivering unacknowledged batch"
            );
            return Ok(batch);
        }

        let mut messages = match start {
            Some(cursor) => {
                let mut history = session
                    .fetch_history(scope.channel_id, HistoryQuery::after(cursor, page_size))
                    .await?;
                history.retain(|m| m.id > cursor);
                history
            }
            None => {
                session
                    .fetch_history(scope.channel_id, HistoryQuery::latest(self.fallback_window))
                    .await?
            }
        };
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        let page_full = messages.len() >= page_size;
        messages.truncate(page_size);

        let next_cursor = messages.last().map(|m| m.id).or(start);
        let batch = UnreadBatch {
            scope_key: scope_key.clone(),
            messages,
            next_cursor,
            origin,
            redelivered: false,
            page_full,
        };

        metrics::record_unread_batch(origin.as_str(), batch.messages.len());
        tracing::debug!(
            scope = %scope_key,
            origin = origin.as_str(),
            count = batch.messages.len(),
            next_cursor = ?batch.next_cursor,
            "Fetched unread batch"
        );

        // An empty page is not held back, so new arrivals show up immediately
        if !batch.messages.is_empty() {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    scope_key,
                    InFlight {
                        page_size,
                        batch: batch.clone(),
                    },
                );
        }
        Ok(batch)
    }

    fn cached(
        &self,
        scope_key: &str,
        origin: BatchOrigin,
        page_size: usize,
    ) -> Option<UnreadBatch> {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let held = in_flight.get(scope_key)?;
        // An explicit cursor equal to the watermark is still a different request
        if held.batch.origin != origin || held.page_size != page_size {
            return None;
        }
        let mut batch = held.batch.clone();
        batch.redelivered = true;
        Some(batch)
    }

    /// Move the watermark for `scope` forward to `id`.
    ///
    /// A non-monotonic advance is ignored and logged as a watermark conflict.
    pub fn advance(&self, scope: &Scope, id: u64) -> Result<AdvanceOutcome, BacklogError> {
        let scope_key = scope.key();
        let outcome = self
            .store
            .advance(&scope_key, id)
            .map_err(BacklogError::Store)?;

        metrics::record_watermark_advance(outcome.as_str());
        match outcome {
            AdvanceOutcome::Advanced { previous } => {
                self.in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&scope_key);
                tracing::info!(
                    scope = %scope_key,
                    previous = ?previous,
                    last_seen_id = id,
                    "Watermark advanced"
                );
            }
            AdvanceOutcome::Ignored { current } => {
                tracing::warn!(
                    scope = %scope_key,
                    requested = id,
                    current,
                    "Watermark conflict: advance ignored"
                );
            }
        }
        Ok(outcome)
    }
}
