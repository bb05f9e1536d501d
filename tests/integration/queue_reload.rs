//! Outgoing-queue durability: persist, reload, and the provisional
//! rewrite path across a simulated restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::config::EngineConfig;
use chatsync::conversation::{ConversationEngine, EngineEvent};
use chatsync::queue::OutgoingQueue;
use chatsync::service::scripted::ScriptedService;
use chatsync::store::memory::MemoryStore;

use chatsync_proto::command::{ManualSendReason, SendOpcode};
use chatsync_proto::message::{BackRefs, KeyId, Message, MessageKind, UserId};

const ME: UserId = UserId::new(0xA11CE);

fn local_message(kind: MessageKind, content: &str) -> Message {
    Message::new_local(ME, kind, content.as_bytes().to_vec())
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transmit.max_attempts = 4;
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
async fn queue_round_trip_preserves_order_and_content() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = OutgoingQueue::load(Arc::clone(&store)).await.unwrap();

    let mut originals = Vec::new();
    for i in 0..5_u64 {
        let mut msg = local_message(MessageKind::Text, &format!("message {i}"));
        if i % 2 == 0 {
            msg.key_id = Some(KeyId::new(u32::try_from(i).unwrap()));
        }
        if i == 3 {
            msg.backrefs = Some(BackRefs {
                seed: 0xfeed + i,
                refs: vec![1, 2, 3],
            });
        }
        queue.enqueue(SendOpcode::New, msg.clone()).await.unwrap();
        originals.push(msg);
    }

    // Simulated restart: reload from the shared backing state.
    let reloaded = OutgoingQueue::load(store).await.unwrap();
    assert_eq!(reloaded.len(), 5);
    let reloaded_msgs: Vec<Message> = reloaded.iter().map(|item| item.msg.clone()).collect();
    assert_eq!(reloaded_msgs, originals);

    // Row ids are strictly ascending in queue order.
    let rowids: Vec<u64> = reloaded.iter().map(|item| item.rowid).collect();
    let mut sorted = rowids.clone();
    sorted.sort_unstable();
    assert_eq!(rowids, sorted);
}

#[tokio::test]
async fn wire_blobs_and_key_ids_survive_reload() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = OutgoingQueue::load(Arc::clone(&store)).await.unwrap();

    let rowid = queue
        .enqueue(SendOpcode::New, local_message(MessageKind::Text, "encrypted"))
        .await
        .unwrap();
    queue
        .attach_wire(rowid, Some(vec![0xDE, 0xAD]), Some(vec![0xBE, 0xEF]))
        .await
        .unwrap();
    queue.confirm_key(rowid, KeyId::new(42)).await.unwrap();

    let reloaded = OutgoingQueue::load(store).await.unwrap();
    let item = reloaded.get(rowid).unwrap();
    assert_eq!(item.wire.as_deref(), Some(&[0xDE_u8, 0xAD][..]));
    assert_eq!(item.key_wire.as_deref(), Some(&[0xBE_u8, 0xEF][..]));
    assert_eq!(item.msg.key_id, Some(KeyId::new(42)));
}

#[tokio::test]
async fn manual_queue_round_trip_keeps_reasons() {
    let store = Arc::new(MemoryStore::new());
    let mut queue = OutgoingQueue::load(Arc::clone(&store)).await.unwrap();

    let first = queue
        .enqueue(SendOpcode::New, local_message(MessageKind::Text, "no key"))
        .await
        .unwrap();
    let second = queue
        .enqueue(SendOpcode::Update, local_message(MessageKind::Text, "too old"))
        .await
        .unwrap();
    queue.demote(first, ManualSendReason::NoKey).await.unwrap();
    queue.demote(second, ManualSendReason::TooOld).await.unwrap();

    let reloaded = OutgoingQueue::load(store).await.unwrap();
    assert!(reloaded.is_empty());
    let manual = reloaded.manual_items();
    assert_eq!(manual.len(), 2);
    assert_eq!(manual[0].rowid, first);
    assert_eq!(manual[0].reason, ManualSendReason::NoKey);
    assert_eq!(manual[1].rowid, second);
    assert_eq!(manual[1].reason, ManualSendReason::TooOld);
}

#[tokio::test]
async fn queued_provisional_edit_is_rewritten_when_the_original_confirms() {
    let store = Arc::new(MemoryStore::new());

    // A crash left a pending post and a queued edit of it behind.
    {
        let mut queue = OutgoingQueue::load(Arc::clone(&store)).await.unwrap();
        let original = local_message(MessageKind::Text, "first draft");
        let provisional = original.id;
        queue.enqueue(SendOpcode::New, original.clone()).await.unwrap();

        let mut edit = original;
        edit.content = b"final text".to_vec();
        edit.bump_updated();
        assert_eq!(edit.id, provisional);
        queue
            .enqueue(SendOpcode::UpdateProvisional, edit)
            .await
            .unwrap();
    }

    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, mut events) = open_engine(Arc::clone(&store), Arc::clone(&service)).await;
    assert_eq!(engine.outgoing().len(), 2);

    engine.connect().await.unwrap();

    // The post confirmed, then the rewritten edit went out as a plain
    // update against the confirmed identity.
    let confirmed = match events.try_recv().unwrap() {
        EngineEvent::MessageConfirmed { confirmed, .. } => confirmed,
        other => panic!("expected MessageConfirmed, got {other:?}"),
    };
    let updates = service.sent_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, confirmed);
    assert_eq!(updates[0].text(), Some("final text"));

    assert!(engine.outgoing().is_empty());
    let idx = engine.history().idx_of(confirmed).unwrap();
    assert_eq!(engine.history().get(idx).unwrap().text(), Some("final text"));
}

#[tokio::test]
async fn edit_of_a_reloaded_pending_post_amends_it_in_place() {
    let store = Arc::new(MemoryStore::new());
    let provisional = {
        let mut queue = OutgoingQueue::load(Arc::clone(&store)).await.unwrap();
        let original = local_message(MessageKind::Text, "draft");
        let id = original.id;
        queue.enqueue(SendOpcode::New, original).await.unwrap();
        id
    };

    let service = Arc::new(ScriptedService::new(0x9000));
    let (mut engine, _events) = open_engine(Arc::clone(&store), Arc::clone(&service)).await;

    // Edit before the queue was ever flushed: the pending row itself
    // is amended, no extra row appears.
    engine
        .edit_message(provisional, b"polished".to_vec())
        .await
        .unwrap();
    assert_eq!(engine.outgoing().len(), 1);
    let item = engine.outgoing().iter().next().unwrap();
    assert_eq!(item.opcode, SendOpcode::New);
    assert_eq!(item.msg.text(), Some("polished"));
    assert_eq!(item.msg.updated, 1);

    engine.connect().await.unwrap();
    let sent = service.sent_new();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text(), Some("polished"));
}
