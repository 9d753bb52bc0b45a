use serde_json::json;

use crate::{
    domain::{ClientMessageId, ConversationId, DeliveryStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatPayload, WireEnvelope, WireFrame, ENVELOPE_VERSION},
};

#[test]
fn message_envelope_uses_tagged_json_shape() {
    let envelope = WireEnvelope::new(WireFrame::Message(ChatPayload {
        conversation_id: ConversationId(7),
        sender_id: UserId(42),
        recipient_id: UserId(9),
        content: "hi".into(),
        client_message_id: None,
        sent_at: None,
    }));

    let value: serde_json::Value =
        serde_json::from_str(&envelope.encode().expect("encode")).expect("json");
    assert_eq!(
        value,
        json!({
            "version": ENVELOPE_VERSION,
            "body": {
                "type": "message",
                "payload": {
                    "conversation_id": 7,
                    "sender_id": 42,
                    "recipient_id": 9,
                    "content": "hi",
                }
            }
        })
    );
}

#[test]
fn decodes_heartbeat_without_payload() {
    let envelope =
        WireEnvelope::decode(r#"{"version":1,"body":{"type":"heartbeat"}}"#).expect("decode");
    assert_eq!(envelope.body, WireFrame::Heartbeat);
}

#[test]
fn decodes_error_frame() {
    let raw = json!({
        "version": 1,
        "body": {"type": "error", "payload": {"code": "conflict", "message": "exists"}}
    })
    .to_string();
    let envelope = WireEnvelope::decode(&raw).expect("decode");
    assert_eq!(
        envelope.body,
        WireFrame::Error(ApiError::new(ErrorCode::Conflict, "exists"))
    );
}

#[test]
fn plain_text_is_not_an_envelope() {
    assert!(WireEnvelope::decode("hello there").is_err());
}

#[test]
fn delivery_status_only_moves_forward() {
    use DeliveryStatus::*;

    assert!(Sending.can_advance_to(Sent));
    assert!(Sending.can_advance_to(Failed));
    assert!(!Sending.can_advance_to(Delivered));
    assert!(!Sending.can_advance_to(Read));

    assert!(Sent.can_advance_to(Delivered));
    assert!(Sent.can_advance_to(Read));
    assert!(Delivered.can_advance_to(Read));

    assert!(!Sent.can_advance_to(Sending));
    assert!(!Read.can_advance_to(Delivered));
    assert!(!Delivered.can_advance_to(Sent));
    assert!(!Sent.can_advance_to(Failed));
    assert!(!Failed.can_advance_to(Sent));
    assert!(!Sent.can_advance_to(Sent));
}

#[test]
fn client_message_ids_are_unique() {
    assert_ne!(ClientMessageId::new(), ClientMessageId::new());
}

#[test]
fn error_code_follows_http_status() {
    assert_eq!(ErrorCode::from_http_status(401), ErrorCode::Unauthorized);
    assert_eq!(ErrorCode::from_http_status(404), ErrorCode::NotFound);
    assert_eq!(ErrorCode::from_http_status(409), ErrorCode::Conflict);
    assert_eq!(ErrorCode::from_http_status(503), ErrorCode::Internal);
}

#[test]
fn api_error_displays_code_and_message() {
    let err = ApiError::new(ErrorCode::RateLimited, "slow down");
    assert_eq!(err.to_string(), "RateLimited: slow down");

    let boxed: Box<dyn std::error::Error> = Box::new(err);
    assert!(boxed.source().is_none());
}
