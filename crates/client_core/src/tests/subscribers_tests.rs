use std::sync::{Arc, Mutex};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{WireEnvelope, WireFrame},
};

use super::*;

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&InboundFrame) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |frame: &InboundFrame| {
        sink.lock().expect("lock").push(frame.payload.clone());
    })
}

#[test]
fn callbacks_run_in_registration_order() {
    let registry = SubscriberRegistry::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first_order = Arc::clone(&order);
    let _first = registry.subscribe(move |_| first_order.lock().expect("lock").push("first"));
    let second_order = Arc::clone(&order);
    let _second = registry.subscribe(move |_| second_order.lock().expect("lock").push("second"));

    let completed = registry.dispatch(&InboundFrame::from_text("hello".into()));

    assert_eq!(completed, 2);
    assert_eq!(*order.lock().expect("lock"), vec!["first", "second"]);
}

#[test]
fn unsubscribe_stops_delivery_of_later_frames() {
    let registry = SubscriberRegistry::new();
    let (seen, callback) = recorder();

    let subscription = registry.subscribe(callback);
    subscription.unsubscribe();

    registry.dispatch(&InboundFrame::from_text("after".into()));
    assert!(seen.lock().expect("lock").is_empty());
    assert!(registry.is_empty());
}

#[test]
fn unsubscribe_removes_only_its_own_callback() {
    let registry = SubscriberRegistry::new();
    let (kept_seen, kept) = recorder();
    let (dropped_seen, dropped) = recorder();

    let _kept = registry.subscribe(kept);
    let dropped_subscription = registry.subscribe(dropped);
    registry.dispatch(&InboundFrame::from_text("one".into()));

    drop(dropped_subscription);
    registry.dispatch(&InboundFrame::from_text("two".into()));

    assert_eq!(*kept_seen.lock().expect("lock"), vec!["one", "two"]);
    assert_eq!(*dropped_seen.lock().expect("lock"), vec!["one"]);
    assert_eq!(registry.len(), 1);
}

#[test]
fn panicking_callback_does_not_block_the_rest() {
    let registry = SubscriberRegistry::new();
    let _faulty = registry.subscribe(|_| panic!("subscriber exploded"));
    let (seen, callback) = recorder();
    let _healthy = registry.subscribe(callback);

    let completed = registry.dispatch(&InboundFrame::from_text("frame".into()));

    assert_eq!(completed, 1);
    assert_eq!(*seen.lock().expect("lock"), vec!["frame"]);
}

#[test]
fn callback_may_unsubscribe_itself_during_dispatch() {
    let registry = SubscriberRegistry::new();
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let (seen, record) = recorder();

    let own_slot = Arc::clone(&slot);
    let subscription = registry.subscribe(move |frame| {
        record(frame);
        own_slot.lock().expect("lock").take();
    });
    *slot.lock().expect("lock") = Some(subscription);

    registry.dispatch(&InboundFrame::from_text("first".into()));
    registry.dispatch(&InboundFrame::from_text("second".into()));

    assert_eq!(*seen.lock().expect("lock"), vec!["first"]);
}

#[test]
fn frames_are_classified_from_their_envelope() {
    let typing = WireEnvelope::new(WireFrame::Typing {
        conversation_id: ConversationId(3),
        user_id: UserId(4),
        is_typing: true,
    })
    .encode()
    .expect("encode");

    let frame = InboundFrame::from_text(typing);
    assert_eq!(frame.kind, FrameKind::Typing);
    assert!(frame.body.is_some());

    let opaque = InboundFrame::from_text("just text".into());
    assert_eq!(opaque.kind, FrameKind::Message);
    assert!(opaque.body.is_none());
    assert_eq!(opaque.payload, "just text");
}
