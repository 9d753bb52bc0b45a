use tokio::time::Instant;

use super::*;
use crate::{
    connection::ConnectionStatus,
    test_support::{assert_delay, connected_manager, test_settings, wait_for_status, FakeConnector},
};

const RETRY: Duration = Duration::from_millis(1000);

fn expect_message(text: &str) -> ChatPayload {
    match WireEnvelope::decode(text).expect("envelope").body {
        WireFrame::Message(payload) => payload,
        other => panic!("expected a message frame, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn connected_send_transmits_exactly_once() {
    let (manager, _connector, _harness, mut peer) =
        connected_manager(test_settings(), "42").await;
    let pipeline = SendPipeline::new(manager, RETRY);

    let outcome = pipeline
        .send_message("hi", ConversationId(7), UserId(9))
        .expect("send");
    assert!(matches!(outcome, SendOutcome::Transmitted));

    let payload = expect_message(&peer.next_text().await);
    assert_eq!(payload.conversation_id, ConversationId(7));
    assert_eq!(payload.sender_id, UserId(42));
    assert_eq!(payload.recipient_id, UserId(9));
    assert_eq!(payload.content, "hi");
    assert!(payload.client_message_id.is_some());

    time::sleep(Duration::from_secs(5)).await;
    assert!(peer.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn send_without_session_is_rejected() {
    let (connector, _harness) = FakeConnector::new();
    let manager = ConnectionManager::new(test_settings(), connector);
    let pipeline = SendPipeline::new(manager, RETRY);

    let err = pipeline
        .send_message("hi", ConversationId(7), UserId(9))
        .expect_err("no session");
    assert!(matches!(err, ClientError::NoSession));
    assert_eq!(pipeline.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn deferred_send_goes_out_once_transport_reopens() {
    let mut settings = test_settings();
    settings.reconnect.base_delay_ms = 500;
    let (connector, mut harness) = FakeConnector::new();
    connector.set_failing(true);
    let manager = ConnectionManager::new(settings, connector.clone());
    manager.connect("42").expect("connect");
    harness.next_attempt().await;
    connector.set_failing(false);

    let pipeline = SendPipeline::new(Arc::clone(&manager), RETRY);
    let start = Instant::now();
    let SendOutcome::Deferred(outcome) = pipeline
        .send_message("late", ConversationId(7), UserId(9))
        .expect("send")
    else {
        panic!("transport was closed, send should be deferred");
    };
    assert_eq!(pipeline.pending_count(), 1);

    let mut peer = harness.next_peer().await;
    wait_for_status(&manager, ConnectionStatus::Connected).await;

    let payload = expect_message(&peer.next_text().await);
    assert_delay(start.elapsed(), 1000);
    assert_eq!(payload.content, "late");
    assert_eq!(outcome.await.expect("outcome"), DeferredOutcome::Transmitted);

    time::sleep(Duration::from_secs(5)).await;
    assert!(peer.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn send_during_manual_reconnect_is_deferred() {
    let (manager, _connector, mut harness, _first) =
        connected_manager(test_settings(), "42").await;
    let pipeline = SendPipeline::new(Arc::clone(&manager), RETRY);

    manager.reconnect();
    let SendOutcome::Deferred(outcome) = pipeline
        .send_message("while reconnecting", ConversationId(7), UserId(9))
        .expect("session survives a manual reconnect")
    else {
        panic!("transport was dropped, send should be deferred");
    };

    let mut second = harness.next_peer().await;
    wait_for_status(&manager, ConnectionStatus::Connected).await;
    let payload = expect_message(&second.next_text().await);
    assert_eq!(payload.content, "while reconnecting");
    assert_eq!(payload.sender_id, UserId(42));
    assert_eq!(outcome.await.expect("outcome"), DeferredOutcome::Transmitted);
}

#[tokio::test(start_paused = true)]
async fn deferred_send_is_dropped_when_still_closed() {
    let (connector, mut harness) = FakeConnector::new();
    connector.set_failing(true);
    let manager = ConnectionManager::new(test_settings(), connector.clone());
    manager.connect("42").expect("connect");
    harness.next_attempt().await;

    let pipeline = SendPipeline::new(manager, RETRY);
    let SendOutcome::Deferred(outcome) = pipeline
        .send_message("lost", ConversationId(7), UserId(9))
        .expect("send")
    else {
        panic!("transport was closed, send should be deferred");
    };

    assert_eq!(outcome.await.expect("outcome"), DeferredOutcome::Dropped);
    assert!(harness.peers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn cancelled_retry_never_fires() {
    let (connector, mut harness) = FakeConnector::new();
    connector.set_failing(true);
    let manager = ConnectionManager::new(test_settings(), connector.clone());
    manager.connect("42").expect("connect");
    harness.next_attempt().await;

    let pipeline = SendPipeline::new(manager, RETRY);
    let SendOutcome::Deferred(outcome) = pipeline
        .send_message("cancelled", ConversationId(7), UserId(9))
        .expect("send")
    else {
        panic!("transport was closed, send should be deferred");
    };

    pipeline.cancel_pending();
    assert!(outcome.await.is_err());
    assert_eq!(pipeline.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn typing_notice_is_only_sent_while_open() {
    let (connector, mut harness) = FakeConnector::new();
    connector.set_failing(true);
    let offline = ConnectionManager::new(test_settings(), connector.clone());
    offline.connect("42").expect("connect");
    harness.next_attempt().await;
    let pipeline = SendPipeline::new(offline, RETRY);
    assert!(!pipeline.send_typing(ConversationId(7), true).expect("typing"));

    let (manager, _connector, _harness, mut peer) =
        connected_manager(test_settings(), "42").await;
    let pipeline = SendPipeline::new(manager, RETRY);
    assert!(pipeline.send_typing(ConversationId(7), true).expect("typing"));

    let envelope = WireEnvelope::decode(&peer.next_text().await).expect("envelope");
    assert_eq!(
        envelope.body,
        WireFrame::Typing {
            conversation_id: ConversationId(7),
            user_id: UserId(42),
            is_typing: true,
        }
    );
}
