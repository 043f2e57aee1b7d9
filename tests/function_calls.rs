//! Integration tests for server-registered function dispatch: correlation,
//! authorization, failures, and timeouts.

mod common;

use std::time::Duration;

use common::{TestClient, TestServer};
use collabkit::config::BrokerConfig;
use collabkit::state::FunctionEntry;
use collab_proto::{ClientMessage, ErrorCode, ServerMessage};
use serde_json::json;

fn call(room: &str, call_id: &str, name: &str, args: serde_json::Value) -> ClientMessage {
    ClientMessage::Call {
        room_id: room.to_string(),
        call_id: call_id.to_string(),
        function_name: name.to_string(),
        args,
    }
}

#[tokio::test]
async fn test_call_returns_result_to_caller_only() {
    let server = TestServer::spawn().await;
    server.hub.register_function(
        "lobby",
        "echo",
        FunctionEntry::from_fn(|ctx| async move { Ok(json!({"echo": ctx.args})) }),
    );

    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    let mut bob = TestClient::connect_as(&server.url(), "secret-b").await;
    alice.join("lobby").await;
    bob.join("lobby").await;

    alice.send(&call("lobby", "c-1", "echo", json!([1, 2]))).await;
    let reply = alice
        .recv_until(|m| matches!(m, ServerMessage::CallResult { .. }))
        .await;
    match reply {
        ServerMessage::CallResult { call_id, success, result, .. } => {
            assert_eq!(call_id, "c-1");
            assert!(success);
            assert_eq!(result.unwrap(), json!({"echo": [1, 2]}));
        }
        _ => unreachable!(),
    }

    // Bob never sees Alice's result.
    assert!(bob.try_recv(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_concurrent_calls_correlate_by_call_id() {
    let server = TestServer::spawn().await;
    server.hub.register_function(
        "lobby",
        "ident",
        FunctionEntry::from_fn(|ctx| async move { Ok(ctx.args) }),
    );

    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("lobby").await;

    for i in 0..5 {
        alice.send(&call("lobby", &format!("c-{i}"), "ident", json!(i))).await;
    }
    // Calls run concurrently, so completion order is unspecified; each
    // result must still carry exactly its own payload.
    let mut seen = std::collections::HashMap::new();
    for _ in 0..5 {
        let reply = alice
            .recv_until(|m| matches!(m, ServerMessage::CallResult { .. }))
            .await;
        match reply {
            ServerMessage::CallResult { call_id, success, result, .. } => {
                assert!(success);
                seen.insert(call_id, result.unwrap());
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(seen.len(), 5);
    for i in 0..5 {
        assert_eq!(seen[&format!("c-{i}")], json!(i));
    }
}

#[tokio::test]
async fn test_unknown_function() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("lobby").await;

    alice.send(&call("lobby", "c-1", "missing", json!(null))).await;
    let reply = alice.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::FunctionNotFound, .. }
    ));
}

#[tokio::test]
async fn test_bad_function_name_rejected_before_dispatch() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("lobby").await;

    let raw = json!({
        "type": "call",
        "room_id": "lobby",
        "call_id": "c-1",
        "function_name": "no spaces allowed",
        "args": null,
    });
    alice.send_raw(raw.to_string()).await;
    let reply = alice.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::InvalidMessage, .. }
    ));
}

#[tokio::test]
async fn test_handler_failure_reaches_only_the_caller() {
    let server = TestServer::spawn().await;
    server.hub.register_function(
        "lobby",
        "explode",
        FunctionEntry::from_fn(|_ctx| async move {
            Err(anyhow::anyhow!("kaboom"))
        }),
    );

    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("lobby").await;
    alice.send(&call("lobby", "c-1", "explode", json!(null))).await;

    let reply = alice
        .recv_until(|m| matches!(m, ServerMessage::CallResult { .. }))
        .await;
    match reply {
        ServerMessage::CallResult { success, error, .. } => {
            assert!(!success);
            assert!(error.unwrap().contains("kaboom"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_slow_function_times_out_then_fast_call_succeeds() {
    let config = BrokerConfig { function_timeout_secs: 1, ..Default::default() };
    let server = TestServer::spawn_with(config, None).await;
    server.hub.register_function(
        "lobby",
        "slow",
        FunctionEntry::from_fn(|_ctx| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("too late"))
        }),
    );
    server.hub.register_function(
        "lobby",
        "fast",
        FunctionEntry::from_fn(|_ctx| async move { Ok(json!("ok")) }),
    );

    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("lobby").await;

    alice.send(&call("lobby", "c-slow", "slow", json!(null))).await;
    let reply = alice
        .recv_until(|m| matches!(m, ServerMessage::CallResult { .. }))
        .await;
    match reply {
        ServerMessage::CallResult { call_id, success, error, .. } => {
            assert_eq!(call_id, "c-slow");
            assert!(!success);
            assert!(error.unwrap().contains("timed out"));
        }
        _ => unreachable!(),
    }

    // The session is healthy afterwards.
    alice.send(&call("lobby", "c-fast", "fast", json!(null))).await;
    let reply = alice
        .recv_until(|m| matches!(m, ServerMessage::CallResult { .. }))
        .await;
    match reply {
        ServerMessage::CallResult { call_id, success, .. } => {
            assert_eq!(call_id, "c-fast");
            assert!(success);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_requires_auth_blocks_guests() {
    let config = BrokerConfig { allow_anonymous: true, ..Default::default() };
    let server = TestServer::spawn_with(config, None).await;
    server.hub.register_function(
        "lobby",
        "secure",
        FunctionEntry::from_fn(|_ctx| async move { Ok(json!("secret")) })
            .requires_auth(true),
    );

    // Empty token: admitted as guest.
    let mut guest = TestClient::connect_as(&server.url(), "").await;
    guest.join("lobby").await;
    guest.send(&call("lobby", "c-1", "secure", json!(null))).await;
    let reply = guest.recv().await;
    assert!(matches!(
        reply,
        ServerMessage::Error { code: ErrorCode::AuthenticationFailed, .. }
    ));

    // A real principal passes.
    let mut alice = TestClient::connect_as(&server.url(), "secret-a").await;
    alice.join("lobby").await;
    alice.send(&call("lobby", "c-2", "secure", json!(null))).await;
    let reply = alice
        .recv_until(|m| matches!(m, ServerMessage::CallResult { .. }))
        .await;
    assert!(matches!(reply, ServerMessage::CallResult { success: true, .. }));
}
