use chrono::Utc;
use onezone_common::mutation::PageMutation;
use onezone_common::protocol::ws::{ServerMessage, UnlockReason, CURRENT_PROTOCOL_VERSION};
use onezone_relay::ws::{HEARTBEAT_INTERVAL_MS, MAX_FRAME_BYTES};
use serde_json::Value;
use uuid::Uuid;

#[test]
fn websocket_contract_heartbeat_and_frame_limits() {
    assert_eq!(HEARTBEAT_INTERVAL_MS, 15_000);
    assert_eq!(MAX_FRAME_BYTES, 262_144);
}

#[test]
fn websocket_contract_message_shapes() {
    let page_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    let samples = [
        (
            ServerMessage::Connect {
                connection_id: Uuid::new_v4(),
                user_id,
                protocol: CURRENT_PROTOCOL_VERSION.to_string(),
                server_time: Utc::now(),
                heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            },
            "connect",
            &["type", "connection_id", "user_id", "protocol", "server_time", "heartbeat_interval_ms"]
                [..],
        ),
        (
            ServerMessage::PageUpdate {
                page_id,
                seq: 3,
                actor_id: user_id,
                op: PageMutation::Rename { name: "Plan".into() },
            },
            "page_update",
            &["type", "page_id", "seq", "actor_id", "op"][..],
        ),
        (
            ServerMessage::LockPage { page_id, locked_by: user_id, expires_at: Utc::now() },
            "lock_page",
            &["type", "page_id", "locked_by", "expires_at"][..],
        ),
        (
            ServerMessage::UnlockPage {
                page_id,
                previous_holder: Some(user_id),
                reason: UnlockReason::Broken,
            },
            "unlock_page",
            &["type", "page_id", "previous_holder", "reason"][..],
        ),
        (
            ServerMessage::Ack {
                page_id,
                command: "mutate".into(),
                request_id: Some("r-7".into()),
                seq: Some(4),
                version_number: None,
            },
            "ack",
            &["type", "page_id", "command", "request_id", "seq"][..],
        ),
        (
            ServerMessage::Error {
                code: "LOCK_HELD".into(),
                message: "denied: locked_by".into(),
                retryable: false,
                page_id: Some(page_id),
                details: Some(serde_json::json!({ "locked_by": user_id })),
            },
            "error",
            &["type", "code", "message", "retryable", "page_id", "details"][..],
        ),
    ];

    for (message, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(message).expect("ws message should serialize");
        assert_eq!(value["type"], expected_type);
        for key in expected_keys {
            assert!(
                value.get(key).is_some(),
                "serialized `{expected_type}` frame must include `{key}`",
            );
        }
    }
}

#[test]
fn websocket_contract_optional_fields_are_omitted_when_absent() {
    let ack = ServerMessage::Ack {
        page_id: Uuid::new_v4(),
        command: "acquire_lock".into(),
        request_id: None,
        seq: None,
        version_number: None,
    };
    let error = ServerMessage::Error {
        code: "AUTH_INVALID_TOKEN".into(),
        message: "invalid token".into(),
        retryable: false,
        page_id: None,
        details: None,
    };

    let ack_keys = object_keys(&serde_json::to_value(ack).expect("ack should serialize"));
    let error_keys = object_keys(&serde_json::to_value(error).expect("error should serialize"));

    assert_eq!(ack_keys, vec!["command", "page_id", "type"]);
    assert!(!error_keys.contains(&"page_id".to_string()));
    assert!(!error_keys.contains(&"details".to_string()));
}

fn object_keys(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> =
        value.as_object().expect("frame should be an object").keys().cloned().collect();
    keys.sort();
    keys
}
