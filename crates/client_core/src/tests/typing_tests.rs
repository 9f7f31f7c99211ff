use super::*;

use crate::{
    session::ActiveSession,
    test_support::{connected_gateway, identity, FakeTransport, RecordingSink},
};

const ME: i64 = 7;

struct Harness {
    transport: Arc<FakeTransport>,
    sink: Arc<RecordingSink>,
    _session: ActiveSession,
    tracker: Arc<TypingTracker>,
}

fn general() -> ChatScope {
    ChatScope::channel(42)
}

async fn harness() -> Harness {
    let transport = FakeTransport::new();
    let session = ActiveSession::new();
    session.set(Some(general()));
    let gateway = connected_gateway(transport.clone(), identity(ME, "me"), session.reader()).await;
    transport.clear_sent();
    let sink = RecordingSink::new();
    let tracker = TypingTracker::new(
        gateway,
        sink.clone(),
        session.reader(),
        TypingOptions {
            debounce: Duration::from_millis(2000),
            expiry: Duration::from_millis(3000),
        },
    );
    Harness {
        transport,
        sink,
        _session: session,
        tracker,
    }
}

fn typist(scope: ChatScope, user_id: i64, username: &str) -> TypingPayload {
    TypingPayload {
        scope,
        user_id: UserId(user_id),
        username: username.to_string(),
    }
}

#[test]
fn summary_wording() {
    assert_eq!(format_typing_summary(&[]), None);
    assert_eq!(
        format_typing_summary(&["alice"]).as_deref(),
        Some("alice is typing...")
    );
    assert_eq!(
        format_typing_summary(&["alice", "bob"]).as_deref(),
        Some("alice and bob are typing...")
    );
    assert_eq!(
        format_typing_summary(&["alice", "bob", "carol", "dave"]).as_deref(),
        Some("alice and 3 others are typing...")
    );
}

#[tokio::test(start_paused = true)]
async fn burst_announces_once_and_stops_after_silence() {
    let h = harness().await;

    for _ in 0..3 {
        h.tracker.start_typing(general()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(h.transport.sent_names(), vec!["typing:start"]);

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(h.transport.sent_names(), vec!["typing:start", "typing:stop"]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.sent_names(), vec!["typing:start", "typing:stop"]);
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_is_immediate_and_cancels_the_timer() {
    let h = harness().await;

    h.tracker.start_typing(general()).await;
    assert!(h.tracker.stop_typing(general()).await);
    assert_eq!(h.transport.sent_names(), vec!["typing:start", "typing:stop"]);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.transport.sent().len(), 2);
    assert!(!h.tracker.stop_typing(general()).await);
}

#[tokio::test(start_paused = true)]
async fn input_helpers_follow_the_active_chat() {
    let h = harness().await;

    h.tracker.input_changed("h").await;
    h.tracker.input_changed("he").await;
    h.tracker.input_changed("").await;
    h.tracker.input_blurred().await;

    assert_eq!(
        h.transport.sent(),
        vec![
            OutboundEvent::TypingStart { scope: general() },
            OutboundEvent::TypingStop { scope: general() },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn remote_typists_are_summarised_in_arrival_order() {
    let h = harness().await;

    assert!(h.tracker.on_remote_typing(typist(general(), 8, "alice")).await);
    assert!(h.tracker.on_remote_typing(typist(general(), 9, "bob")).await);
    // A refresh keeps alice in first position.
    assert!(h.tracker.on_remote_typing(typist(general(), 8, "alice")).await);
    assert!(h.tracker.on_remote_typing(typist(general(), 10, "carol")).await);

    assert_eq!(
        h.sink.typing_summaries(general()),
        vec![
            Some("alice is typing...".to_string()),
            Some("alice and bob are typing...".to_string()),
            Some("alice and 2 others are typing...".to_string()),
        ]
    );
    let names: Vec<String> = h
        .tracker
        .entries(general())
        .await
        .into_iter()
        .map(|entry| entry.username)
        .collect();
    assert_eq!(names, vec!["alice", "bob", "carol"]);
}

#[tokio::test(start_paused = true)]
async fn own_typing_echo_is_ignored() {
    let h = harness().await;

    assert!(!h.tracker.on_remote_typing(typist(general(), ME, "me")).await);

    assert_eq!(h.tracker.summary(general()).await, None);
    assert!(h.sink.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_indicator_expires_unless_refreshed() {
    let h = harness().await;

    h.tracker.on_remote_typing(typist(general(), 8, "alice")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.tracker.on_remote_typing(typist(general(), 8, "alice")).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        h.tracker.summary(general()).await.as_deref(),
        Some("alice is typing...")
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.tracker.summary(general()).await, None);
    assert_eq!(
        h.sink.typing_summaries(general()).last(),
        Some(&None)
    );
}

#[tokio::test(start_paused = true)]
async fn remote_stop_clears_immediately() {
    let h = harness().await;
    h.tracker.on_remote_typing(typist(general(), 8, "alice")).await;

    assert!(h.tracker.on_remote_stop_typing(typist(general(), 8, "alice")).await);
    assert!(!h.tracker.on_remote_stop_typing(typist(general(), 8, "alice")).await);

    assert_eq!(
        h.sink.typing_summaries(general()),
        vec![Some("alice is typing...".to_string()), None]
    );
}

#[tokio::test(start_paused = true)]
async fn background_chats_are_tracked_but_not_rendered() {
    let h = harness().await;
    let other = ChatScope::direct(3);

    h.tracker.on_remote_typing(typist(other, 8, "alice")).await;
    assert!(h.sink.events().is_empty());
    assert_eq!(
        h.tracker.summary(other).await.as_deref(),
        Some("alice is typing...")
    );

    h.tracker.refresh(other).await;
    assert_eq!(
        h.sink.typing_summaries(other),
        vec![Some("alice is typing...".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn inbound_events_route_to_the_tracker() {
    let h = harness().await;

    h.tracker
        .handle(&InboundEvent::TypingStart(typist(general(), 8, "alice")))
        .await;
    assert_eq!(h.tracker.entries(general()).await.len(), 1);

    h.tracker
        .handle(&InboundEvent::TypingStop(typist(general(), 8, "alice")))
        .await;
    assert!(h.tracker.entries(general()).await.is_empty());
}
