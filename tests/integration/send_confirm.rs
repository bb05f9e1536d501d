//! End-to-end delivery: enqueue, transient failures, confirmation.
//!
//! Verifies the core delivery contract: an enqueued message survives
//! transient transport failures, lands in history exactly once when
//! the server finally acknowledges it, and leaves the outgoing queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::config::EngineConfig;
use chatsync::conversation::{ConversationEngine, EngineEvent};
use chatsync::service::ServiceError;
use chatsync::service::scripted::ScriptedService;
use chatsync::store::memory::MemoryStore;

use chatsync_proto::message::{MessageKind, UserId};

const ME: UserId = UserId::new(0xA11CE);

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transmit.max_attempts = 6;
    config.transmit.initial_wait = Duration::from_millis(2);
    config.transmit.max_single_wait = Duration::from_millis(10);
    config.sync.initial_wait = Duration::from_millis(2);
    config.sync.max_single_wait = Duration::from_millis(10);
    config
}

async fn open_engine(
    store: Arc<MemoryStore>,
    service: Arc<ScriptedService>,
) -> (
    ConversationEngine<MemoryStore, ScriptedService>,
    mpsc::Receiver<EngineEvent>,
) {
    ConversationEngine::open(store, service, ME, test_config(), 64)
        .await
        .unwrap()
}

#[tokio::test]
async fn message_survives_transient_failures_and_confirms_once() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, mut events) = open_engine(Arc::clone(&store), Arc::clone(&service)).await;

    // Two transient failures before the transport lets it through.
    service.queue_send_failures(2, &ServiceError::ConnectionLost);

    let local = engine
        .send_message(MessageKind::Text, b"hold the line".to_vec())
        .await
        .unwrap();

    // Exactly one confirmed entry, none left in the queue.
    assert_eq!(engine.history().len(), 1);
    assert!(engine.outgoing().is_empty());
    assert!(engine.outgoing().manual_items().is_empty());
    assert_eq!(service.send_attempts(), 3);

    let event = events.try_recv().unwrap();
    match event {
        EngineEvent::MessageConfirmed {
            provisional,
            confirmed,
            idx,
        } => {
            assert_eq!(provisional, local);
            assert!(!confirmed.is_provisional());
            assert_eq!(idx, 0);
            assert_eq!(engine.history().idx_of(confirmed), Some(0));
        }
        other => panic!("expected MessageConfirmed, got {other:?}"),
    }
}

#[tokio::test]
async fn confirmed_entry_is_durable_across_restart() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, mut events) = open_engine(Arc::clone(&store), Arc::clone(&service)).await;

    engine
        .send_message(MessageKind::Text, b"persist me".to_vec())
        .await
        .unwrap();
    let confirmed = match events.try_recv().unwrap() {
        EngineEvent::MessageConfirmed { confirmed, .. } => confirmed,
        other => panic!("expected MessageConfirmed, got {other:?}"),
    };

    // Restart: a fresh engine over the same backing store.
    let (reopened, _events) = open_engine(store, Arc::new(ScriptedService::new(0xA000))).await;
    assert_eq!(reopened.info().newest, Some(confirmed));
    assert_eq!(reopened.info().newest_idx, Some(0));
    assert_eq!(reopened.history().len(), 1);
    assert!(reopened.outgoing().is_empty());

    let idx = reopened.history().idx_of(confirmed).unwrap();
    let msg = reopened.history().get(idx).unwrap();
    assert_eq!(msg.text(), Some("persist me"));
}

#[tokio::test]
async fn multiple_sends_preserve_enqueue_order() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, _events) = open_engine(store, Arc::clone(&service)).await;

    for text in ["first", "second", "third"] {
        engine
            .send_message(MessageKind::Text, text.as_bytes().to_vec())
            .await
            .unwrap();
    }

    let transmitted: Vec<String> = service
        .sent_new()
        .iter()
        .filter_map(|m| m.text().map(str::to_owned))
        .collect();
    assert_eq!(transmitted, ["first", "second", "third"]);

    // Idx values are dense and follow send order.
    let texts: Vec<&str> = engine
        .history()
        .iter()
        .filter_map(|(_, m)| m.text())
        .collect();
    assert_eq!(texts, ["first", "second", "third"]);
    assert_eq!(engine.info().newest_idx, Some(2));
}

#[tokio::test]
async fn interleaved_failures_do_not_reorder_deliveries() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, _events) = open_engine(store, Arc::clone(&service)).await;

    engine
        .send_message(MessageKind::Text, b"one".to_vec())
        .await
        .unwrap();
    // The next message fights through a failure first.
    service.queue_send_failure(ServiceError::Timeout);
    engine
        .send_message(MessageKind::Text, b"two".to_vec())
        .await
        .unwrap();

    let transmitted: Vec<String> = service
        .sent_new()
        .iter()
        .filter_map(|m| m.text().map(str::to_owned))
        .collect();
    assert_eq!(transmitted, ["one", "two"]);
}
