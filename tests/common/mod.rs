//! Shared test harness: an in-process broker plus a raw WebSocket client
//! speaking the wire protocol directly.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use collabkit::auth::{Principal, StaticTokenProvider};
use collabkit::config::BrokerConfig;
use collabkit::network::Gateway;
use collabkit::state::{Hub, HubParams};
use collabkit::storage::Storage;
use collab_proto::{codec, ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Users every test server knows about.
pub fn test_tokens() -> HashMap<String, Principal> {
    let mut tokens = HashMap::new();
    for (token, id) in [
        ("secret-a", "alice"),
        ("secret-b", "bob"),
        ("secret-c", "carol"),
    ] {
        tokens.insert(
            token.to_string(),
            Principal { id: id.to_string(), name: Some(id.to_string()), roles: vec![] },
        );
    }
    tokens
}

/// An in-process broker bound to an ephemeral port.
pub struct TestServer {
    pub hub: Arc<Hub>,
    pub addr: SocketAddr,
}

impl TestServer {
    /// Spawn with the default test configuration.
    pub async fn spawn() -> Self {
        Self::spawn_with(BrokerConfig::default(), None).await
    }

    /// Spawn with a custom broker configuration and optional storage.
    pub async fn spawn_with(config: BrokerConfig, storage: Option<Arc<dyn Storage>>) -> Self {
        let hub = Arc::new(Hub::new(HubParams {
            config,
            auth: Arc::new(StaticTokenProvider::new(test_tokens())),
            perms: None,
            storage,
        }));
        let gateway = Gateway::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&hub))
            .await
            .expect("bind test gateway");
        let addr = gateway.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = gateway.run().await;
        });
        Self { hub, addr }
    }

    /// WebSocket URL for this server.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.hub.config().path)
    }

    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}

/// A raw wire-level client.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect the transport (no auth yet).
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("websocket connect");
        Self { ws }
    }

    /// Connect and authenticate, panicking on rejection.
    pub async fn connect_as(url: &str, token: &str) -> Self {
        let mut client = Self::connect(url).await;
        let reply = client.auth(token).await;
        match reply {
            ServerMessage::Authenticated { .. } => client,
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    /// Send `auth` and return the broker's reply.
    pub async fn auth(&mut self, token: &str) -> ServerMessage {
        self.send(&ClientMessage::Auth { token: token.to_string() }).await;
        self.recv().await
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &ClientMessage) {
        let text = codec::encode_client(msg).expect("encode");
        self.ws.send(WsMessage::Text(text)).await.expect("send");
    }

    /// Send a raw text frame (for malformed-input tests).
    pub async fn send_raw(&mut self, text: String) {
        self.ws.send(WsMessage::Text(text)).await.expect("send raw");
    }

    /// Receive the next protocol message, answering transport pings.
    pub async fn recv(&mut self) -> ServerMessage {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("no message within timeout")
    }

    /// Receive with an explicit timeout; `None` on timeout or close.
    pub async fn try_recv(&mut self, timeout: Duration) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match frame.ok()? {
                WsMessage::Text(text) => {
                    return Some(codec::decode_server(&text).expect("decodable server message"));
                }
                WsMessage::Ping(payload) => {
                    let _ = self.ws.send(WsMessage::Pong(payload)).await;
                }
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
    }

    /// Receive until `accept` matches, returning the matching message.
    /// Panics when the timeout elapses first.
    pub async fn recv_until<F>(&mut self, accept: F) -> ServerMessage
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no matching message within timeout"
            );
            if let Some(msg) = self.try_recv(Duration::from_millis(500)).await {
                if accept(&msg) {
                    return msg;
                }
            }
        }
    }

    /// Join a room, asserting the `joined` reply.
    pub async fn join(&mut self, room_id: &str) -> ServerMessage {
        self.send(&ClientMessage::Join { room_id: room_id.to_string() }).await;
        self.recv_until(|m| matches!(m, ServerMessage::Joined { .. })).await
    }

    /// Close the transport.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
