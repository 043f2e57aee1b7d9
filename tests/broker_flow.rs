//! Integration tests for the broker session state machine: auth, room
//! membership, operation broadcast, presence, sync, and signaling relay.

mod common;

use common::{TestClient, TestServer};
use collab_proto::{ClientMessage, ErrorCode, Operation, ServerMessage};
use serde_json::json;

fn set_op(origin: &str, path: &[&str], value: serde_json::Value) -> Operation {
    Operation::set(origin, path.iter().map(|s| s.to_string()).collect(), value).unwrap()
}

#[tokio::test]
async fn test_auth_then_join_reports_state_and_members() {
    let server = TestServer::spawn().await;

    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    let joined = alice.join("lobby").await;
    match joined {
        ServerMessage::Joined { room_id, user_id, users, .. } => {
            assert_eq!(room_id, "lobby");
            assert_eq!(user_id, "alice");
            assert_eq!(users.len(), 1);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    // Bob joining is announced to Alice.
    let mut bob = TestClient::connect_as(&server.url(), "secret-b").await;
    bob.join("lobby").await;
    let announced = alice
        .recv_until(|m| matches!(m, ServerMessage::UserJoined { .. }))
        .await;
    match announced {
        ServerMessage::UserJoined { user, .. } => assert_eq!(user.id, "bob"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_bad_token_rejected_and_lockout_after_five() {
    let server = TestServer::spawn().await;

    // Retries are allowed on one connection until the lockout trips.
    let mut client = TestClient::connect(&server.url()).await;
    for _ in 0..4 {
        let reply = client.auth("wrong").await;
        assert!(matches!(
            reply,
            ServerMessage::Error { code: ErrorCode::AuthenticationFailed, .. }
        ));
    }
    // Fifth failure inside the window trips the per-IP block and closes.
    let reply = client.auth("wrong").await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::AuthenticationFailed, .. }
    ));

    // A fresh connection from the same IP is refused even with a good token.
    let mut blocked = TestClient::connect(&server.url()).await;
    let reply = blocked.auth("secret-a").await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::AuthenticationFailed, .. }
    ));
}

#[tokio::test]
async fn test_first_message_must_be_auth() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::connect(&server.url()).await;
    client.send(&ClientMessage::Ping).await;
    let reply = client.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::AuthenticationFailed, .. }
    ));
}

#[tokio::test]
async fn test_operation_broadcast_preserves_sender_order() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    let mut bob = TestClient::connect_as(&server.url(), "secret-b").await;
    alice.join("doc").await;
    bob.join("doc").await;
    alice
        .recv_until(|m| matches!(m, ServerMessage::UserJoined { .. }))
        .await;

    let op_a = set_op("node-alice", &["first"], json!(1));
    let op_b = set_op("node-alice", &["second"], json!(2));
    alice
        .send(&ClientMessage::Operation { room_id: "doc".into(), op: op_a.clone() })
        .await;
    alice
        .send(&ClientMessage::Operation { room_id: "doc".into(), op: op_b.clone() })
        .await;

    // Bob observes them in send order (FIFO per socket), tagged with the
    // sender's user id.
    let first = bob
        .recv_until(|m| matches!(m, ServerMessage::Operation { .. }))
        .await;
    match first {
        ServerMessage::Operation { user_id, op, .. } => {
            assert_eq!(user_id, "alice");
            assert_eq!(op.id, op_a.id);
        }
        _ => unreachable!(),
    }
    let second = bob
        .recv_until(|m| matches!(m, ServerMessage::Operation { .. }))
        .await;
    match second {
        ServerMessage::Operation { op, .. } => assert_eq!(op.id, op_b.id),
        _ => unreachable!(),
    }

    // The sender hears its own operations back as well.
    let echo = alice
        .recv_until(|m| matches!(m, ServerMessage::Operation { .. }))
        .await;
    match echo {
        ServerMessage::Operation { op, .. } => assert_eq!(op.id, op_a.id),
        _ => unreachable!(),
    }

    // Broker state converged.
    let room = server.hub.room("doc").unwrap();
    assert_eq!(room.value(), json!({"first": 1, "second": 2}));
}

#[tokio::test]
async fn test_duplicate_operation_applies_once_but_rebroadcasts() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("doc").await;

    let op = set_op("node-alice", &["k"], json!(1));
    for _ in 0..2 {
        alice
            .send(&ClientMessage::Operation { room_id: "doc".into(), op: op.clone() })
            .await;
    }
    // Two echoes arrive (delivery semantics preserved for late joiners).
    for _ in 0..2 {
        alice
            .recv_until(|m| matches!(m, ServerMessage::Operation { .. }))
            .await;
    }
    // But the log holds the operation once.
    let room = server.hub.room("doc").unwrap();
    assert_eq!(room.snapshot().operations.len(), 1);
}

#[tokio::test]
async fn test_operation_requires_membership() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;

    alice
        .send(&ClientMessage::Operation {
            room_id: "never-joined".into(),
            op: set_op("n", &["k"], json!(1)),
        })
        .await;
    let reply = alice.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::PermissionDenied, .. }
    ));
}

#[tokio::test]
async fn test_dangerous_operation_rejected() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("doc").await;

    // Build the wire JSON by hand; the typed constructor would refuse.
    let raw = json!({
        "type": "operation",
        "room_id": "doc",
        "op": {
            "id": uuid::Uuid::new_v4(),
            "timestamp": 1.0,
            "node_id": "evil",
            "path": ["__proto__", "polluted"],
            "op_type": "set",
            "value": true,
        },
    });
    alice.send_raw(raw.to_string()).await;

    let reply = alice.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::InvalidOperation, .. }
    ));
    // The room CRDT is untouched.
    assert_eq!(server.hub.room("doc").unwrap().value(), json!({}));
}

#[tokio::test]
async fn test_room_not_found_when_auto_create_disabled() {
    let config = collabkit::config::BrokerConfig {
        auto_create_rooms: false,
        ..Default::default()
    };
    let server = TestServer::spawn_with(config, None).await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;

    alice.send(&ClientMessage::Join { room_id: "ghost".into() }).await;
    let reply = alice.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::RoomNotFound, .. }
    ));
}

#[tokio::test]
async fn test_presence_broadcast_to_all_members() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    let mut bob = TestClient::connect_as(&server.url(), "secret-b").await;
    alice.join("room").await;
    bob.join("room").await;

    alice
        .send(&ClientMessage::Presence {
            room_id: "room".into(),
            data: json!({"cursor": [3, 4]}),
        })
        .await;

    let seen = bob
        .recv_until(|m| matches!(m, ServerMessage::Presence { .. }))
        .await;
    match seen {
        ServerMessage::Presence { user_id, data, .. } => {
            assert_eq!(user_id, "alice");
            assert_eq!(data, json!({"cursor": [3, 4]}));
        }
        _ => unreachable!(),
    }

    // Presence is transient broker state, scrubbed when the member leaves.
    let room = server.hub.room("room").unwrap();
    assert_eq!(room.presence_of("alice").unwrap(), json!({"cursor": [3, 4]}));
    alice.close().await;
    bob.recv_until(|m| matches!(m, ServerMessage::UserLeft { .. })).await;
    assert!(room.presence_of("alice").is_none());
}

#[tokio::test]
async fn test_sync_request_returns_state_and_newer_operations() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("doc").await;

    let mut early = set_op("node-x", &["a"], json!(1));
    early.timestamp = 10.0;
    let mut late = set_op("node-x", &["b"], json!(2));
    late.timestamp = 20.0;
    for op in [&early, &late] {
        alice
            .send(&ClientMessage::Operation { room_id: "doc".into(), op: op.clone() })
            .await;
    }

    let since = std::collections::HashMap::from([("node-x".to_string(), 10.0)]);
    alice
        .send(&ClientMessage::SyncRequest { room_id: "doc".into(), since: Some(since) })
        .await;

    let sync = alice
        .recv_until(|m| matches!(m, ServerMessage::Sync { .. }))
        .await;
    match sync {
        ServerMessage::Sync { state, operations, .. } => {
            assert_eq!(operations.len(), 1);
            assert_eq!(operations[0].id, late.id);
            assert_eq!(state.operations.len(), 2);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.send(&ClientMessage::Ping).await;
    let reply = alice.recv().await;
    assert!(matches!(reply, ServerMessage::Pong));
}

#[tokio::test]
async fn test_malformed_envelope_answered_with_typed_error() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.send_raw("{not even json".to_string()).await;
    let reply = alice.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::InvalidMessage, .. }
    ));
    // Connection survives a single malformed frame.
    alice.send(&ClientMessage::Ping).await;
    assert!(matches!(alice.recv().await, ServerMessage::Pong));
}

#[tokio::test]
async fn test_rtc_relay_targets_one_member_without_inspection() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    let mut bob = TestClient::connect_as(&server.url(), "secret-b").await;
    let mut carol = TestClient::connect_as(&server.url(), "secret-c").await;
    alice.join("room").await;
    bob.join("room").await;
    carol.join("room").await;

    // Opaque payload: the broker must not inspect or validate SDP bodies.
    let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 46117 2 IN IP4 127.0.0.1"});
    alice
        .send(&ClientMessage::RtcOffer {
            room_id: "room".into(),
            target_user_id: "bob".into(),
            sdp: sdp.clone(),
        })
        .await;

    let relayed = bob
        .recv_until(|m| matches!(m, ServerMessage::RtcOffer { .. }))
        .await;
    match relayed {
        ServerMessage::RtcOffer { from_user_id, sdp: got, .. } => {
            assert_eq!(from_user_id, "alice");
            assert_eq!(got, sdp);
        }
        _ => unreachable!(),
    }

    // Carol, not being the target, hears nothing.
    assert!(carol
        .try_recv(std::time::Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn test_screenshare_start_echoed_to_sharer_and_members() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    let mut bob = TestClient::connect_as(&server.url(), "secret-b").await;
    alice.join("room").await;
    bob.join("room").await;

    alice
        .send(&ClientMessage::ScreenshareStart { room_id: "room".into() })
        .await;

    // Both the sharer and the viewer receive the echo.
    for client in [&mut alice, &mut bob] {
        let started = client
            .recv_until(|m| matches!(m, ServerMessage::ScreenshareStarted { .. }))
            .await;
        match started {
            ServerMessage::ScreenshareStarted { user_id, .. } => assert_eq!(user_id, "alice"),
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_leave_announces_user_left() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    let mut bob = TestClient::connect_as(&server.url(), "secret-b").await;
    alice.join("room").await;
    bob.join("room").await;

    bob.send(&ClientMessage::Leave { room_id: "room".into() }).await;
    let left = alice
        .recv_until(|m| matches!(m, ServerMessage::UserLeft { .. }))
        .await;
    match left {
        ServerMessage::UserLeft { user_id, .. } => assert_eq!(user_id, "bob"),
        _ => unreachable!(),
    }
    assert!(!server.hub.room("room").unwrap().is_member("bob"));
}
