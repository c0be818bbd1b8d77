/// End-to-end tests across a real relay: document edits, cursor presence,
/// and typing indicators flowing between live WebSocket clients
use std::sync::Arc;
use std::time::Duration;

use document::{Document, DocumentNode};
use parking_lot::Mutex;
use sync::*;
use tokio::time::{sleep, timeout};

/// Starts a relay on a free port and returns its websocket URL.
async fn start_relay() -> String {
    let server = RelayServer::new("127.0.0.1:0");
    let (listener, addr) = server.bind().await.unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{}", addr)
}

async fn connected_client(url: &str) -> Arc<dyn PubSubConnection> {
    let connection: Arc<dyn PubSubConnection> = Arc::new(WsConnection::new(url));
    connection.connect().await.unwrap();
    connection
}

/// Gives the relay time to process subscribe frames already in flight.
async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

/// Polls until the condition holds or a second passes.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(condition(), "condition did not hold within the deadline");
}

#[tokio::test]
async fn document_edits_replicate_across_the_relay() {
    let url = start_relay().await;
    let note = NoteId::new();
    let channel = note_channel(note);

    // Alice and Bob start from the same document
    let base = vec![DocumentNode::element(
        "paragraph",
        vec![DocumentNode::text("hello")],
    )];
    let alice_doc = Document::from(base.clone());
    let bob_doc = Arc::new(Mutex::new(Document::from(base)));

    let alice_conn = connected_client(&url).await;
    let bob_conn = connected_client(&url).await;

    // Bob subscribes to the note channel and applies incoming updates
    let bob_registry = SubscriptionRegistry::new(Arc::clone(&bob_conn));
    let bob_sub = bob_registry.get_instance(UserId::new(), &channel);
    let bob_view = Arc::clone(&bob_doc);
    bob_sub.set_handler(move |envelope: NoteEnvelope| {
        let NoteEnvelope::Note { update } = envelope;
        let mut doc = bob_view.lock();
        match update {
            NoteUpdate::Operations(ops) => {
                let mut next = doc.clone();
                let failed = apply_all(&mut next, &ops);
                assert_eq!(failed, 0, "replicated script must apply cleanly");
                *doc = next;
            }
            NoteUpdate::Snapshot(nodes) => *doc = Document::from(nodes),
        }
    });
    bob_sub.subscribe().await.unwrap();
    settle().await;

    // Alice rewrites her paragraph and adds a second one
    let edited = Document::from(vec![
        DocumentNode::element("paragraph", vec![DocumentNode::text("hello world")]),
        DocumentNode::element("paragraph", vec![DocumentNode::text("new line")]),
    ]);
    let ops = diff(&alice_doc, &edited);
    assert!(!ops.is_empty());

    let payload = serde_json::to_string(&NoteEnvelope::operations(ops)).unwrap();
    alice_conn.publish(&channel, payload).await.unwrap();

    let bob_view = Arc::clone(&bob_doc);
    let expected = edited.clone();
    wait_until(move || *bob_view.lock() == expected).await;

    bob_registry.cleanup_all().await;
}

#[tokio::test]
async fn snapshots_replace_the_remote_document() {
    let url = start_relay().await;
    let note = NoteId::new();
    let channel = note_channel(note);

    let bob_doc = Arc::new(Mutex::new(Document::default()));
    let alice_conn = connected_client(&url).await;
    let bob_conn = connected_client(&url).await;

    let registry = SubscriptionRegistry::new(Arc::clone(&bob_conn));
    let sub = registry.get_instance(UserId::new(), &channel);
    let bob_view = Arc::clone(&bob_doc);
    sub.set_handler(move |envelope: NoteEnvelope| {
        let NoteEnvelope::Note { update } = envelope;
        if let NoteUpdate::Snapshot(nodes) = update {
            *bob_view.lock() = Document::from(nodes);
        }
    });
    sub.subscribe().await.unwrap();
    settle().await;

    let snapshot = vec![DocumentNode::element(
        "heading",
        vec![DocumentNode::text("fresh state")],
    )];
    let payload = serde_json::to_string(&NoteEnvelope::snapshot(snapshot.clone())).unwrap();
    alice_conn.publish(&channel, payload).await.unwrap();

    let bob_view = Arc::clone(&bob_doc);
    let expected = Document::from(snapshot);
    wait_until(move || *bob_view.lock() == expected).await;
}

#[tokio::test]
async fn cursor_updates_flow_into_remote_presence() {
    let url = start_relay().await;
    let note = NoteId::new();
    let channel = cursor_channel(note);

    let alice = UserId::new();
    let bob = UserId::new();

    let alice_conn = connected_client(&url).await;
    let bob_conn = connected_client(&url).await;

    let bob_presence = Arc::new(Mutex::new(PresenceTracker::new()));
    let registry = SubscriptionRegistry::new(Arc::clone(&bob_conn));
    let sub = registry.get_instance(bob, &channel);
    let tracker = Arc::clone(&bob_presence);
    sub.set_handler(move |entry: PresenceEntry| {
        tracker.lock().apply_remote(bob, entry);
    });
    sub.subscribe().await.unwrap();
    settle().await;

    // Alice moves her cursor
    let first = PresenceEntry::new(alice, "alice", 10.0, 20.0);
    let payload = serde_json::to_string(&first).unwrap();
    alice_conn.publish(&channel, payload).await.unwrap();

    let tracker = Arc::clone(&bob_presence);
    wait_until(move || tracker.lock().len() == 1).await;
    {
        let presence = bob_presence.lock();
        let entry = presence.get(&alice).unwrap();
        assert_eq!(entry.x, 10.0);
        assert_eq!(entry.y, 20.0);
    }

    // A stale replay with an older timestamp must not win
    let mut stale = PresenceEntry::new(alice, "alice", 99.0, 99.0);
    stale.last_update = first.last_update - 100;
    let payload = serde_json::to_string(&stale).unwrap();
    alice_conn.publish(&channel, payload).await.unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(bob_presence.lock().get(&alice).unwrap().x, 10.0);
}

#[tokio::test]
async fn typing_indicators_reach_only_the_addressed_friend() {
    let url = start_relay().await;

    let alice = UserId::new();
    let bob = UserId::new();
    let carol = UserId::new();

    let alice_conn = connected_client(&url).await;
    let bob_conn = connected_client(&url).await;
    let carol_conn = connected_client(&url).await;

    let bob_seen = Arc::new(Mutex::new(Vec::new()));
    let carol_seen = Arc::new(Mutex::new(Vec::new()));

    for (user, connection, seen) in [
        (bob, &bob_conn, &bob_seen),
        (carol, &carol_conn, &carol_seen),
    ] {
        let registry = SubscriptionRegistry::new(Arc::clone(connection));
        let sub = registry.get_instance(user, TYPING_CHANNEL);
        let sink = Arc::clone(seen);
        sub.set_handler(move |envelope: TypingEnvelope| {
            if envelope.is_for(user) {
                sink.lock().push(envelope);
            }
        });
        sub.subscribe().await.unwrap();
        settle().await;
    }

    // Alice types to Bob through the throttled broadcaster
    let (emit_tx, mut emit_rx) = tokio::sync::mpsc::unbounded_channel::<TypingEnvelope>();
    let broadcaster = TypingBroadcaster::new(move |envelope| {
        let _ = emit_tx.send(envelope);
    });
    let publisher = Arc::clone(&alice_conn);
    tokio::spawn(async move {
        while let Some(envelope) = emit_rx.recv().await {
            let payload = serde_json::to_string(&envelope).unwrap();
            let _ = publisher.publish(TYPING_CHANNEL, payload).await;
        }
    });

    broadcaster.signal_typing(alice, bob);

    let bob_sink = Arc::clone(&bob_seen);
    wait_until(move || !bob_sink.lock().is_empty()).await;

    let seen = bob_seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].user_id, alice);
    assert!(seen[0].is_typing);
    assert!(carol_seen.lock().is_empty());
}

#[tokio::test]
async fn handlers_can_feed_a_message_queue_consumer() {
    let url = start_relay().await;
    let note = NoteId::new();
    let channel = note_channel(note);

    let alice_conn = connected_client(&url).await;
    let bob_conn = connected_client(&url).await;

    let queue: Arc<MessageQueue<NoteEnvelope>> = Arc::new(MessageQueue::new());
    let registry = SubscriptionRegistry::new(Arc::clone(&bob_conn));
    let sub = registry.get_instance(UserId::new(), &channel);
    let feed = Arc::clone(&queue);
    sub.set_handler(move |envelope: NoteEnvelope| feed.enqueue(envelope));
    sub.subscribe().await.unwrap();
    settle().await;

    let envelope = NoteEnvelope::operations(vec![]);
    let payload = serde_json::to_string(&envelope).unwrap();
    alice_conn.publish(&channel, payload).await.unwrap();

    let received = timeout(Duration::from_secs(2), queue.dequeue())
        .await
        .expect("consumer should be woken")
        .expect("queue should hand over the envelope");
    assert_eq!(received, envelope);
}

#[tokio::test]
async fn unsubscribed_channels_stay_silent() {
    let url = start_relay().await;
    let note = NoteId::new();

    let alice_conn = connected_client(&url).await;
    let bob_conn = connected_client(&url).await;

    let seen = Arc::new(Mutex::new(0usize));
    let registry = SubscriptionRegistry::new(Arc::clone(&bob_conn));
    let sub = registry.get_instance(UserId::new(), &note_channel(note));
    let sink = Arc::clone(&seen);
    sub.set_handler(move |_: serde_json::Value| *sink.lock() += 1);
    sub.subscribe().await.unwrap();
    settle().await;

    // Publishes on unrelated channels never reach Bob's handler
    let other = NoteId::new();
    alice_conn
        .publish(&note_channel(other), "{}".to_string())
        .await
        .unwrap();
    alice_conn
        .publish(&cursor_channel(note), "{}".to_string())
        .await
        .unwrap();

    sleep(Duration::from_millis(150)).await;
    assert_eq!(*seen.lock(), 0);
}
