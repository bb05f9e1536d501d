//! History synchronization: initial window vs delta, older-history
//! paging, truncation, and the gap-rejection integrity property.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::config::EngineConfig;
use chatsync::conversation::{ConversationEngine, EngineEvent};
use chatsync::history::{HistoryError, HistoryIndex};
use chatsync::service::{ServiceError, SyncDelta};
use chatsync::service::scripted::ScriptedService;
use chatsync::store::memory::MemoryStore;
use chatsync::store::{ChatStore, StoreError};

use chatsync_proto::message::{Message, MessageId, MessageKind, Timestamp, UserId};

const ME: UserId = UserId::new(0xA11CE);
const PEER: UserId = UserId::new(0xB0B);

fn peer_message(id: u64, content: &str) -> Message {
    Message {
        id: MessageId::Confirmed(id),
        author: PEER,
        ts: Timestamp::from_millis(id * 1_000),
        updated: 0,
        kind: MessageKind::Text,
        content: content.as_bytes().to_vec(),
        key_id: None,
        backrefs: None,
    }
}

fn test_config(window: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.history_window = window;
    config.transmit.initial_wait = Duration::from_millis(2);
    config.transmit.max_single_wait = Duration::from_millis(10);
    config.sync.initial_wait = Duration::from_millis(2);
    config.sync.max_single_wait = Duration::from_millis(10);
    config
}

async fn open_engine(
    store: Arc<MemoryStore>,
    service: Arc<ScriptedService>,
    window: usize,
) -> (
    ConversationEngine<MemoryStore, ScriptedService>,
    mpsc::Receiver<EngineEvent>,
) {
    ConversationEngine::open(store, service, ME, test_config(window), 64)
        .await
        .unwrap()
}

#[tokio::test]
async fn empty_store_requests_a_full_initial_window() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, _events) = open_engine(store, Arc::clone(&service), 16).await;

    service.queue_sync(Ok(SyncDelta {
        messages: vec![peer_message(1, "one"), peer_message(2, "two")],
        truncate: None,
    }));
    engine.connect().await.unwrap();

    let requests = service.sync_requests();
    assert_eq!(requests, vec![(None, 16)]);
    assert_eq!(engine.history().len(), 2);
    assert_eq!(engine.info().newest, Some(MessageId::Confirmed(2)));
}

#[tokio::test]
async fn reconnect_requests_only_the_delta_past_newest() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, _events) = open_engine(store, Arc::clone(&service), 16).await;

    service.queue_sync(Ok(SyncDelta {
        messages: vec![peer_message(1, "one"), peer_message(2, "two")],
        truncate: None,
    }));
    engine.connect().await.unwrap();

    service.queue_sync(Ok(SyncDelta {
        messages: vec![peer_message(3, "three")],
        truncate: None,
    }));
    engine.connect().await.unwrap();

    let requests = service.sync_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].0, Some(MessageId::Confirmed(2)));
    assert_eq!(engine.history().len(), 3);
    // Idx stays dense across reconnects.
    let idxs: Vec<i64> = engine.history().iter().map(|(idx, _)| idx).collect();
    assert_eq!(idxs, vec![0, 1, 2]);
}

#[tokio::test]
async fn older_history_is_served_from_storage_before_the_server() {
    let store = Arc::new(MemoryStore::new());
    // Ten stored messages, idx 0..=9.
    for i in 0..10_u64 {
        store
            .append_history(i64::try_from(i).unwrap(), &peer_message(100 + i, "stored"))
            .await
            .unwrap();
    }
    let service = Arc::new(ScriptedService::new(0x9000));
    // Sentinel: touching the server here would fail the test.
    service.queue_older(Err(ServiceError::Rejected("should not be called".into())));

    // Window of 4 loads idx 6..=9; older entries stay in storage.
    let (mut engine, _events) = open_engine(store, Arc::clone(&service), 4).await;
    assert_eq!(engine.history().oldest_idx(), Some(6));

    let older = engine.request_older_history(3).await.unwrap();
    let ids: Vec<MessageId> = older.iter().map(|m| m.id).collect();
    assert_eq!(
        ids,
        vec![
            MessageId::Confirmed(105),
            MessageId::Confirmed(104),
            MessageId::Confirmed(103)
        ]
    );
    assert_eq!(engine.history().oldest_idx(), Some(3));
    assert!(!engine.have_all_history());
}

#[tokio::test]
async fn server_fetch_extends_below_zero_and_short_batch_completes_history() {
    let store = Arc::new(MemoryStore::new());
    store.append_history(0, &peer_message(50, "anchor")).await.unwrap();
    let service = Arc::new(ScriptedService::new(0x9000));
    service.queue_older(Ok(vec![
        peer_message(49, "older"),
        peer_message(48, "oldest"),
    ]));

    let (mut engine, _events) = open_engine(Arc::clone(&store), Arc::clone(&service), 8).await;
    let older = engine.request_older_history(5).await.unwrap();

    assert_eq!(older.len(), 2);
    assert_eq!(engine.history().oldest_idx(), Some(-2));
    assert_eq!(store.oldest_stored_idx().await.unwrap(), Some(-2));
    assert_eq!(engine.info().oldest, Some(MessageId::Confirmed(48)));
    // Two returned for five requested: the server has nothing older.
    assert!(engine.have_all_history());
    assert!(store.have_all_history().await.unwrap());

    // Subsequent requests stay local.
    let none = engine.request_older_history(5).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn non_abutting_batch_fails_before_any_partial_write() {
    // Index level: the whole batch is validated up front.
    let mut index = HistoryIndex::new();
    index
        .seed(vec![(5, peer_message(1, "a")), (6, peer_message(2, "b"))])
        .unwrap();
    let err = index
        .extend_oldest(vec![(3, peer_message(3, "gap"))])
        .unwrap_err();
    assert_eq!(
        err,
        HistoryError::Discontinuity {
            expected: 4,
            actual: 3
        }
    );
    assert_eq!(index.oldest_idx(), Some(5));
    assert!(!index.contains(MessageId::Confirmed(3)));

    // Store level: the append commits nothing on a gap.
    let store = MemoryStore::new();
    store.append_history(5, &peer_message(1, "a")).await.unwrap();
    let err = store
        .append_history(3, &peer_message(3, "gap"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Discontinuity(_)));
    assert!(err.is_integrity_violation());
    assert_eq!(store.oldest_stored_idx().await.unwrap(), Some(5));
    assert_eq!(store.idx_of(MessageId::Confirmed(3)).await.unwrap(), None);
}

#[tokio::test]
async fn truncation_in_sync_delta_drops_older_history() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, mut events) = open_engine(Arc::clone(&store), Arc::clone(&service), 16).await;

    service.queue_sync(Ok(SyncDelta {
        messages: vec![
            peer_message(1, "one"),
            peer_message(2, "two"),
            peer_message(3, "three"),
        ],
        truncate: None,
    }));
    engine.connect().await.unwrap();
    while events.try_recv().is_ok() {}

    let mut marker = peer_message(2, "");
    marker.kind = MessageKind::Truncate;
    service.queue_sync(Ok(SyncDelta {
        messages: vec![],
        truncate: Some(marker),
    }));
    engine.connect().await.unwrap();

    // Entry 1 is gone; the marker and entry 3 remain, idx space intact.
    assert_eq!(engine.history().len(), 2);
    assert_eq!(engine.info().oldest, Some(MessageId::Confirmed(2)));
    assert_eq!(store.idx_of(MessageId::Confirmed(1)).await.unwrap(), None);
    let idxs: Vec<i64> = engine.history().iter().map(|(idx, _)| idx).collect();
    assert_eq!(idxs, vec![1, 2]);

    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::HistoryTruncated {
            at: MessageId::Confirmed(2)
        }
    );
    // The marker's kind is recorded durably.
    let (_, marker_row) = store
        .fetch_history(Some(1), 1)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(marker_row.kind, MessageKind::Truncate);
}

#[tokio::test]
async fn unread_count_and_last_text_follow_the_window() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, _events) = open_engine(store, Arc::clone(&service), 16).await;

    service.queue_sync(Ok(SyncDelta {
        messages: vec![peer_message(1, "hello"), peer_message(2, "world")],
        truncate: None,
    }));
    engine.connect().await.unwrap();

    assert_eq!(engine.unread_count().await.unwrap(), 2);
    engine.set_seen(MessageId::Confirmed(2)).await.unwrap();
    assert_eq!(engine.unread_count().await.unwrap(), 0);

    let (idx, msg) = engine.last_text_message(1).await.unwrap().unwrap();
    assert_eq!(idx, 1);
    assert_eq!(msg.text(), Some("world"));
}
