// ABOUTME: Tests for backlog reconciliation: unread batches, fallback window, and watermark advances
// ABOUTME: Runs against the in-memory platform with both memory and SQLite watermark stores

use std::sync::Arc;

use parley_core::memory::MemoryPlatform;
use parley_core::{
    AdvanceOutcome, BacklogReconciler, BatchOrigin, Credential, MemoryWatermarkStore,
    MessageFilter, Scope, SessionLease, SessionManager, SessionMode, SqliteWatermarkStore,
    WatermarkStore,
};

const BOT: u64 = 900;
const HUMAN: u64 = 42;
const CHANNEL: u64 = 10;

struct Harness {
    platform: MemoryPlatform,
    manager: SessionManager,
    credential: Credential,
}

impl Harness {
    fn new() -> Self {
        let platform = MemoryPlatform::new();
        platform.register_bot("token", BOT);
        platform.add_channel(CHANNEL, &[BOT, HUMAN]);
        let manager = SessionManager::new(Arc::new(platform.clone()));
        Self {
            platform,
            manager,
            credential: Credential::new("token"),
        }
    }

    fn scope(&self) -> Scope {
        Scope::for_credential(&self.credential, CHANNEL)
    }

    async fn session(&self) -> SessionLease {
        self.manager
            .acquire(&self.credential, SessionMode::Ephemeral)
            .await
            .unwrap()
    }

    fn post_many(&self, count: usize) -> Vec<u64> {
        (0..count)
            .map(|i| self.platform.post(CHANNEL, HUMAN, &format!("msg {}", i)).id)
            .collect()
    }
}

fn reconciler(store: Arc<dyn WatermarkStore>) -> BacklogReconciler {
    BacklogReconciler::new(store, 100)
}

#[tokio::test]
async fn test_offline_messages_delivered_in_order_then_empty_after_advance() {
    let h = Harness::new();
    let backlog = reconciler(Arc::new(MemoryWatermarkStore::new()));
    h.platform.set_next_message_id(990);
    h.post_many(11);
    backlog.advance(&h.scope(), 1000).unwrap();

    // Arrivals while the agent was offline
    assert_eq!(h.post_many(3), vec![1001, 1002, 1003]);

    let session = h.session().await;
    let batch = backlog
        .fetch_unread(&session, &h.scope(), None, 20)
        .await
        .unwrap();
    assert_eq!(batch.ids(), vec![1001, 1002, 1003]);
    assert_eq!(batch.next_cursor, Some(1003));
    assert_eq!(batch.origin, BatchOrigin::Watermark(1000));
    assert!(!batch.redelivered);

    let outcome = backlog.advance(&h.scope(), 1003).unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced { previous: Some(1000) });

    let next = backlog
        .fetch_unread(&session, &h.scope(), None, 20)
        .await
        .unwrap();
    assert!(next.messages.is_empty());
    assert_eq!(next.next_cursor, Some(1003));
    session.release().await;
}

#[tokio::test]
async fn test_fallback_window_returns_newest_page_ascending() {
    let h = Harness::new();
    let backlog = reconciler(Arc::new(MemoryWatermarkStore::new()));
    let ids = h.post_many(150);
    let window = &ids[50..];

    let session = h.session().await;
    let batch = backlog
        .fetch_unread(&session, &h.scope(), None, 50)
        .await
        .unwrap();

    // Latest 100, ascending, the oldest 50 of them first
    assert_eq!(batch.origin, BatchOrigin::Fallback);
    assert_eq!(batch.ids(), window[..50].to_vec());
    assert!(batch.ids().windows(2).all(|w| w[0] < w[1]));
    assert_eq!(batch.next_cursor, batch.ids().last().copied());
    assert!(batch.page_full);

    // The cursor picks up where the fallback page stopped
    backlog.advance(&h.scope(), batch.next_cursor.unwrap()).unwrap();
    let rest = backlog
        .fetch_unread(&session, &h.scope(), None, 50)
        .await
        .unwrap();
    assert_eq!(rest.ids(), window[50..].to_vec());
    session.release().await;
}

#[tokio::test]
async fn test_fetch_without_advance_redelivers_identical_batch() {
    let h = Harness::new();
    let backlog = reconciler(Arc::new(MemoryWatermarkStore::new()));
    h.post_many(5);
    backlog.advance(&h.scope(), 2).unwrap();

    let session = h.session().await;
    let first = backlog
        .fetch_unread(&session, &h.scope(), None, 2)
        .await
        .unwrap();
    // New traffic between fetches must not change the held batch
    h.post_many(2);
    let second = backlog
        .fetch_unread(&session, &h.scope(), None, 2)
        .await
        .unwrap();

    assert_eq!(first.ids(), vec![3, 4]);
    assert_eq!(second.messages, first.messages);
    assert_eq!(second.next_cursor, first.next_cursor);
    assert!(second.redelivered);

    backlog.advance(&h.scope(), 4).unwrap();
    let third = backlog
        .fetch_unread(&session, &h.scope(), None, 2)
        .await
        .unwrap();
    assert_eq!(third.ids(), vec![5, 6]);
    assert!(!third.redelivered);
    session.release().await;
}

#[tokio::test]
async fn test_explicit_cursor_overrides_stored_watermark() {
    let h = Harness::new();
    let backlog = reconciler(Arc::new(MemoryWatermarkStore::new()));
    h.post_many(6);
    backlog.advance(&h.scope(), 5).unwrap();

    let session = h.session().await;
    let batch = backlog
        .fetch_unread(&session, &h.scope(), Some(2), 10)
        .await
        .unwrap();
    assert_eq!(batch.origin, BatchOrigin::Explicit(2));
    assert_eq!(batch.ids(), vec![3, 4, 5, 6]);
    assert_eq!(backlog.watermark(&h.scope()).unwrap(), Some(5));
    session.release().await;
}

#[tokio::test]
async fn test_held_batch_not_reused_across_origins() {
    let h = Harness::new();
    let backlog = reconciler(Arc::new(MemoryWatermarkStore::new()));
    h.post_many(4);
    backlog.advance(&h.scope(), 2).unwrap();

    let session = h.session().await;
    let stored = backlog
        .fetch_unread(&session, &h.scope(), None, 10)
        .await
        .unwrap();
    assert_eq!(stored.origin, BatchOrigin::Watermark(2));

    // Same starting id, but named by the caller
    let explicit = backlog
        .fetch_unread(&session, &h.scope(), Some(2), 10)
        .await
        .unwrap();
    assert_eq!(explicit.origin, BatchOrigin::Explicit(2));
    assert_eq!(explicit.ids(), vec![3, 4]);
    assert!(!explicit.redelivered);

    let again = backlog
        .fetch_unread(&session, &h.scope(), Some(2), 10)
        .await
        .unwrap();
    assert_eq!(again.origin, BatchOrigin::Explicit(2));
    assert!(again.redelivered);

    let back = backlog
        .fetch_unread(&session, &h.scope(), None, 10)
        .await
        .unwrap();
    assert_eq!(back.origin, BatchOrigin::Watermark(2));
    assert!(!back.redelivered);
    session.release().await;
}

#[tokio::test]
async fn test_filtered_batch_still_advances_past_skipped_messages() {
    let h = Harness::new();
    let backlog = reconciler(Arc::new(MemoryWatermarkStore::new()));
    backlog.advance(&h.scope(), 1).unwrap();
    h.platform.set_next_message_id(2);
    h.platform.post(CHANNEL, 7, "bot chatter");
    let wanted = h.platform.post(CHANNEL, HUMAN, "question for you");
    h.platform.post(CHANNEL, 7, "more chatter");

    let session = h.session().await;
    let batch = backlog
        .fetch_unread(&session, &h.scope(), None, 10)
        .await
        .unwrap()
        .filtered(&MessageFilter::any().sender(HUMAN), session.bot_user_id());
    assert_eq!(batch.ids(), vec![wanted.id]);
    assert_eq!(batch.next_cursor, Some(4));
    session.release().await;
}

#[test]
fn test_advance_is_monotonic_in_any_order() {
    let backlog = reconciler(Arc::new(MemoryWatermarkStore::new()));
    let scope = Scope::for_credential(&Credential::new("token"), CHANNEL);

    let mut stored = Vec::new();
    for id in [5, 3, 9, 9, 1, 12, 11] {
        backlog.advance(&scope, id).unwrap();
        stored.push(backlog.watermark(&scope).unwrap().unwrap());
    }
    assert_eq!(stored, vec![5, 5, 9, 9, 9, 12, 12]);
    assert_eq!(
        backlog.advance(&scope, 4).unwrap(),
        AdvanceOutcome::Ignored { current: 12 }
    );
}

#[test]
fn test_concurrent_advances_never_move_backwards() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn WatermarkStore> = Arc::new(SqliteWatermarkStore::open(dir.path()).unwrap());

    let handles: Vec<_> = (1..=8u64)
        .map(|worker| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for step in 0..25u64 {
                    // Interleave high and low values across threads
                    let id = if step % 2 == 0 { worker * 100 + step } else { step };
                    store.advance("scope:1", id).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.load("scope:1").unwrap(), Some(824));
}

#[tokio::test]
async fn test_watermark_survives_store_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let h = Harness::new();
    h.post_many(4);

    {
        let backlog = reconciler(Arc::new(SqliteWatermarkStore::open(dir.path()).unwrap()));
        backlog.advance(&h.scope(), 2).unwrap();
    }

    let backlog = reconciler(Arc::new(SqliteWatermarkStore::open(dir.path()).unwrap()));
    let session = h.session().await;
    let batch = backlog
        .fetch_unread(&session, &h.scope(), None, 10)
        .await
        .unwrap();
    assert_eq!(batch.origin, BatchOrigin::Watermark(2));
    assert_eq!(batch.ids(), vec![3, 4]);
    session.release().await;
}
