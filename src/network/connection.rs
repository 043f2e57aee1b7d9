//! Connection - handles an individual client connection.
//!
//! Each Connection runs in its own Tokio task:
//!
//! ```text
//! Phase 1: WebSocket upgrade (path check) + authentication handshake
//!    |
//! Phase 2: Unified loop (tokio::select!)
//!    - socket reads: bound -> decode -> validate -> rate limit -> dispatch
//!    - outbound queue: responses and room broadcasts, FIFO per socket
//!    - idle ticker: transport-level ping after `message_timeout` quiet
//!    - hub shutdown signal
//! ```
//!
//! The state machine is: accepted -> authenticated -> joined(rooms) ->
//! closed. Repeated size or rate violations close the connection; other
//! faults answer with a typed `error` and keep it open.

use std::net::SocketAddr;
use std::sync::Arc;

use collab_proto::{
    codec, ClientMessage, ErrorCode, Operation, ServerMessage, VersionVector,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::{Response as HttpResponse, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AnonymousProvider, Principal};
use crate::error::{HandlerError, HandlerResult};
use crate::perm::ACTION_JOIN;
use crate::state::{CallFailure, Hub, SessionState};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// A client connection handler.
pub struct Connection {
    conn_id: u64,
    addr: SocketAddr,
    hub: Arc<Hub>,
}

impl Connection {
    /// Create a new connection handler.
    pub fn new(conn_id: u64, addr: SocketAddr, hub: Arc<Hub>) -> Self {
        Self { conn_id, addr, hub }
    }

    /// Run the connection until close.
    #[instrument(skip(self, stream), fields(conn_id = self.conn_id, addr = %self.addr), name = "connection")]
    pub async fn run(self, stream: TcpStream) -> anyhow::Result<()> {
        let expected_path = self.hub.config().path.clone();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp| {
            if req.uri().path() == expected_path {
                Ok(resp)
            } else {
                debug!(path = %req.uri().path(), "rejecting upgrade on wrong path");
                Err(HttpResponse::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Some("not found".to_string()))
                    .expect("static response builds"))
            }
        })
        .await?;

        info!("Client connected");
        let (mut sink, mut source) = ws.split();

        // Phase 1: the first message must be auth.
        let Some(principal) = self.authenticate(&mut sink, &mut source).await? else {
            let _ = sink.close().await;
            return Ok(());
        };

        if !self.hub.try_register_user_conn(&principal.id) {
            let err = HandlerError::TooManyConnections(principal.id.clone());
            send_now(&mut sink, &err.to_server_message(None)).await;
            let _ = sink.close().await;
            return Ok(());
        }

        send_now(
            &mut sink,
            &ServerMessage::Authenticated { user_id: principal.id.clone() },
        )
        .await;
        info!(user_id = %principal.id, "Authenticated");

        let mut session =
            SessionState::new(self.conn_id, principal, self.hub.config().rate_limit);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut shutdown_rx = self.hub.subscribe_shutdown();
        // In-flight function calls; aborted wholesale when the session ends.
        let mut call_tasks = tokio::task::JoinSet::new();

        let idle_period = self.hub.config().message_timeout();
        let mut idle = tokio::time::interval_at(
            tokio::time::Instant::now() + idle_period,
            idle_period,
        );
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Phase 2: unified event loop.
        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        session.touch();
                        if self.ingress(&mut session, &outgoing_tx, &mut call_tasks, &text).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        session.touch();
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        session.touch();
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        let err = HandlerError::InvalidMessage(
                            "binary frames are not part of the protocol".into(),
                        );
                        let _ = outgoing_tx.send(err.to_server_message(None));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                },

                Some(msg) = outgoing_rx.recv() => {
                    match codec::encode_server(&msg) {
                        Ok(text) => {
                            if sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(kind = msg.kind(), error = %e, "cannot encode outbound message");
                        }
                    }
                }

                _ = idle.tick() => {
                    // Quiet connection: probe, never disconnect on idleness.
                    if session.last_seen.elapsed() >= idle_period
                        && sink.send(WsMessage::Ping(Vec::new())).await.is_err()
                    {
                        break;
                    }
                }

                Some(_) = call_tasks.join_next(), if !call_tasks.is_empty() => {}

                _ = shutdown_rx.recv() => {
                    info!("Shutting down connection");
                    break;
                }
            }
        }

        call_tasks.abort_all();
        self.cleanup(&session);
        let _ = sink.close().await;
        Ok(())
    }

    /// Phase 1: wait for a valid `auth` message, enforcing the per-IP
    /// lockout. Returns `None` when the connection should close instead.
    async fn authenticate(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> anyhow::Result<Option<Principal>> {
        let timeout = self.hub.config().message_timeout();
        loop {
            let frame = match tokio::time::timeout(timeout, source.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    debug!("no auth message before timeout");
                    return Ok(None);
                }
            };
            let msg = match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match codec::decode_client_bounded(&text, self.hub.config().max_message_size)
                    {
                        Ok(msg) => msg,
                        Err(e) => {
                            send_now(
                                sink,
                                &HandlerError::Proto(e).to_server_message(None),
                            )
                            .await;
                            return Ok(None);
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = sink.send(WsMessage::Pong(payload)).await;
                    continue;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "read error during handshake");
                    return Ok(None);
                }
            };

            let ClientMessage::Auth { token } = msg else {
                send_now(
                    sink,
                    &ServerMessage::error(
                        ErrorCode::AuthenticationFailed,
                        "first message must be auth",
                        None,
                    ),
                )
                .await;
                return Ok(None);
            };

            let ip = self.addr.ip();
            if self.hub.auth_guard.is_blocked(ip) {
                send_now(
                    sink,
                    &ServerMessage::error(
                        ErrorCode::AuthenticationFailed,
                        "too many failed attempts, try again later",
                        None,
                    ),
                )
                .await;
                return Ok(None);
            }

            match self.resolve_principal(&token).await {
                Some(principal) => {
                    self.hub.auth_guard.record_success(ip);
                    return Ok(Some(principal));
                }
                None => {
                    let blocked_now = self.hub.auth_guard.record_failure(ip);
                    send_now(
                        sink,
                        &ServerMessage::error(
                            ErrorCode::AuthenticationFailed,
                            "authentication failed",
                            None,
                        ),
                    )
                    .await;
                    if blocked_now {
                        info!(%ip, "closing connection after repeated auth failures");
                        return Ok(None);
                    }
                    // Retry allowed until the lockout trips.
                }
            }
        }
    }

    /// Token resolution policy: empty tokens become guests when anonymous
    /// access is on; invalid tokens become guests only when `require_auth`
    /// is off.
    async fn resolve_principal(&self, token: &str) -> Option<Principal> {
        let config = self.hub.config();
        if token.is_empty() {
            return config.allow_anonymous.then(AnonymousProvider::guest);
        }
        match self.hub.auth().authenticate(token).await {
            Ok(principal) => Some(principal),
            Err(e) => {
                debug!(error = %e, "token rejected");
                (!config.require_auth).then(AnonymousProvider::guest)
            }
        }
    }

    /// Ingress pipeline for one text frame. Returns `true` when the
    /// connection must close.
    async fn ingress(
        &self,
        session: &mut SessionState,
        outgoing_tx: &mpsc::UnboundedSender<ServerMessage>,
        call_tasks: &mut tokio::task::JoinSet<()>,
        text: &str,
    ) -> bool {
        let msg = match codec::decode_client_bounded(text, self.hub.config().max_message_size) {
            Ok(msg) => msg,
            Err(e) => {
                let err = HandlerError::Proto(e);
                warn!(code = err.error_code(), "rejecting frame");
                let strike = err.is_strike();
                let _ = outgoing_tx.send(err.to_server_message(None));
                return strike && session.strike();
            }
        };

        if !msg.rate_limit_exempt() && !session.limiter.can_send() {
            let err = HandlerError::RateLimited;
            let _ = outgoing_tx.send(err.to_server_message(msg.room_id().map(String::from)));
            return session.strike();
        }

        let room_hint = msg.room_id().map(String::from);
        if let Err(e) = self.dispatch(session, outgoing_tx, call_tasks, msg).await {
            debug!(code = e.error_code(), "handler error");
            let _ = outgoing_tx.send(e.to_server_message(room_hint));
        }
        false
    }

    fn ensure_joined(session: &SessionState, room_id: &str) -> HandlerResult {
        if session.joined.contains(room_id) {
            Ok(())
        } else {
            Err(HandlerError::NotInRoom(room_id.to_string()))
        }
    }

    async fn dispatch(
        &self,
        session: &mut SessionState,
        outgoing_tx: &mpsc::UnboundedSender<ServerMessage>,
        call_tasks: &mut tokio::task::JoinSet<()>,
        msg: ClientMessage,
    ) -> HandlerResult {
        match msg {
            ClientMessage::Auth { .. } => {
                Err(HandlerError::InvalidMessage("already authenticated".into()))
            }

            ClientMessage::Ping => {
                let _ = outgoing_tx.send(ServerMessage::Pong);
                Ok(())
            }

            ClientMessage::Join { room_id } => {
                self.handle_join(session, outgoing_tx, room_id).await
            }

            ClientMessage::Leave { room_id } => {
                if !session.joined.remove(&room_id) {
                    return Err(HandlerError::NotInRoom(room_id));
                }
                if let Some(room) = self.hub.room(&room_id) {
                    if let Some(user_id) = room.leave(self.conn_id) {
                        room.broadcast(&ServerMessage::UserLeft {
                            room_id: room_id.clone(),
                            user_id,
                        });
                    }
                }
                Ok(())
            }

            ClientMessage::Operation { room_id, op } => {
                self.handle_operation(session, room_id, op).await
            }

            ClientMessage::SyncRequest { room_id, since } => {
                Self::ensure_joined(session, &room_id)?;
                let room = self
                    .hub
                    .room(&room_id)
                    .ok_or_else(|| HandlerError::RoomNotFound(room_id.clone()))?;
                let vector = since.map(VersionVector::from_map);
                let (state, operations) = room.sync_since(vector.as_ref());
                let _ = outgoing_tx.send(ServerMessage::Sync { room_id, state, operations });
                Ok(())
            }

            ClientMessage::Call { room_id, call_id, function_name, args } => self.handle_call(
                session,
                outgoing_tx,
                call_tasks,
                room_id,
                call_id,
                function_name,
                args,
            ),

            ClientMessage::Presence { room_id, data } => {
                Self::ensure_joined(session, &room_id)?;
                let room = self
                    .hub
                    .room(&room_id)
                    .ok_or_else(|| HandlerError::RoomNotFound(room_id.clone()))?;
                room.update_presence(&session.principal.id, &data);
                room.broadcast(&ServerMessage::Presence {
                    room_id,
                    user_id: session.principal.id.clone(),
                    data,
                });
                Ok(())
            }

            ClientMessage::ScreenshareStart { room_id } => {
                Self::ensure_joined(session, &room_id)?;
                let room = self
                    .hub
                    .room(&room_id)
                    .ok_or_else(|| HandlerError::RoomNotFound(room_id.clone()))?;
                // Echoed to the sharer too: offer creation is deferred
                // until this echo arrives.
                room.broadcast(&ServerMessage::ScreenshareStarted {
                    room_id,
                    user_id: session.principal.id.clone(),
                });
                Ok(())
            }

            ClientMessage::ScreenshareStop { room_id } => {
                Self::ensure_joined(session, &room_id)?;
                let room = self
                    .hub
                    .room(&room_id)
                    .ok_or_else(|| HandlerError::RoomNotFound(room_id.clone()))?;
                room.broadcast(&ServerMessage::ScreenshareStopped {
                    room_id,
                    user_id: session.principal.id.clone(),
                });
                Ok(())
            }

            ClientMessage::RtcOffer { room_id, target_user_id, sdp } => self.relay(
                session,
                &room_id,
                &target_user_id,
                ServerMessage::RtcOffer {
                    room_id: room_id.clone(),
                    from_user_id: session.principal.id.clone(),
                    sdp,
                },
            ),

            ClientMessage::RtcAnswer { room_id, target_user_id, sdp } => self.relay(
                session,
                &room_id,
                &target_user_id,
                ServerMessage::RtcAnswer {
                    room_id: room_id.clone(),
                    from_user_id: session.principal.id.clone(),
                    sdp,
                },
            ),

            ClientMessage::RtcIceCandidate { room_id, target_user_id, candidate } => self
                .relay(
                    session,
                    &room_id,
                    &target_user_id,
                    ServerMessage::RtcIceCandidate {
                        room_id: room_id.clone(),
                        from_user_id: session.principal.id.clone(),
                        candidate,
                    },
                ),

            ClientMessage::RemoteControlRequest { room_id, target_user_id } => self.relay(
                session,
                &room_id,
                &target_user_id,
                ServerMessage::RemoteControlRequest {
                    room_id: room_id.clone(),
                    from_user_id: session.principal.id.clone(),
                },
            ),

            ClientMessage::RemoteControlResponse { room_id, target_user_id, approved } => self
                .relay(
                    session,
                    &room_id,
                    &target_user_id,
                    ServerMessage::RemoteControlResponse {
                        room_id: room_id.clone(),
                        from_user_id: session.principal.id.clone(),
                        approved,
                    },
                ),
        }
    }

    async fn handle_join(
        &self,
        session: &mut SessionState,
        outgoing_tx: &mpsc::UnboundedSender<ServerMessage>,
        room_id: String,
    ) -> HandlerResult {
        if let Some(perms) = self.hub.perms() {
            if !perms.check(&session.principal, &room_id, ACTION_JOIN).await {
                return Err(HandlerError::PermissionDenied(format!(
                    "may not join {room_id}"
                )));
            }
        }
        let room = self.hub.get_or_create_room(&room_id).await?;
        let (state, users, newly_added) =
            room.join(&session.principal, self.conn_id, outgoing_tx.clone());
        session.joined.insert(room_id.clone());

        let _ = outgoing_tx.send(ServerMessage::Joined {
            room_id: room_id.clone(),
            user_id: session.principal.id.clone(),
            state,
            users,
        });
        if newly_added {
            room.broadcast_except(
                self.conn_id,
                &ServerMessage::UserJoined { room_id, user: session.principal.user_info() },
            );
        }
        Ok(())
    }

    async fn handle_operation(
        &self,
        session: &SessionState,
        room_id: String,
        op: Operation,
    ) -> HandlerResult {
        Self::ensure_joined(session, &room_id)?;
        let room = self
            .hub
            .room(&room_id)
            .ok_or_else(|| HandlerError::RoomNotFound(room_id.clone()))?;

        let server_ts =
            self.hub.config().use_server_timestamp.then(|| self.hub.clock_now());
        // Duplicates apply as no-ops but are still rebroadcast; operation-id
        // idempotency makes redelivery safe for every member.
        let (canonical, _applied) = room.apply_operation(op, server_ts)?;

        if self.hub.config().save_on_operation {
            self.hub.persist_room(&room).await;
        }

        room.broadcast(&ServerMessage::Operation {
            room_id,
            user_id: session.principal.id.clone(),
            op: canonical,
        });
        Ok(())
    }

    /// Spawn the call so a slow handler never stalls this connection's
    /// ingress; the task is aborted when the session closes. Every
    /// outcome, success or failure, goes to the caller alone.
    fn handle_call(
        &self,
        session: &SessionState,
        outgoing_tx: &mpsc::UnboundedSender<ServerMessage>,
        call_tasks: &mut tokio::task::JoinSet<()>,
        room_id: String,
        call_id: String,
        function_name: String,
        args: serde_json::Value,
    ) -> HandlerResult {
        Self::ensure_joined(session, &room_id)?;
        let room = self
            .hub
            .room(&room_id)
            .ok_or_else(|| HandlerError::RoomNotFound(room_id.clone()))?;

        let caller = session.principal.clone();
        let perms = self.hub.perms().cloned();
        let limit = self.hub.config().function_timeout();
        let tx = outgoing_tx.clone();
        call_tasks.spawn(async move {
            let outcome = room
                .call(&function_name, &caller, args, perms.as_ref(), limit)
                .await;
            let reply = match outcome {
                Ok(result) => ServerMessage::CallResult {
                    room_id,
                    call_id,
                    success: true,
                    result: Some(result),
                    error: None,
                },
                Err(CallFailure::NotFound(name)) => {
                    HandlerError::FunctionNotFound(name).to_server_message(Some(room_id))
                }
                Err(CallFailure::AuthRequired(name)) => HandlerError::AuthenticationFailed(
                    format!("function {name} requires an authenticated caller"),
                )
                .to_server_message(Some(room_id)),
                Err(CallFailure::PermissionDenied(permission)) => HandlerError::PermissionDenied(
                    format!("missing permission {permission}"),
                )
                .to_server_message(Some(room_id)),
                Err(failure @ (CallFailure::Timeout(_) | CallFailure::Failed(_))) => {
                    ServerMessage::CallResult {
                        room_id,
                        call_id,
                        success: false,
                        result: None,
                        error: Some(failure.to_string()),
                    }
                }
            };
            let _ = tx.send(reply);
        });
        Ok(())
    }

    /// Relay an opaque signaling payload to one member's connections.
    fn relay(
        &self,
        session: &SessionState,
        room_id: &str,
        target_user_id: &str,
        msg: ServerMessage,
    ) -> HandlerResult {
        Self::ensure_joined(session, room_id)?;
        let room = self
            .hub
            .room(room_id)
            .ok_or_else(|| HandlerError::RoomNotFound(room_id.to_string()))?;
        let delivered = room.send_to_user(target_user_id, &msg);
        if delivered == 0 {
            // Likely a join/leave race; the peer will re-signal.
            debug!(target = %target_user_id, kind = msg.kind(), "relay target not in room");
        }
        Ok(())
    }

    /// Leave every joined room and release the user's connection slot.
    fn cleanup(&self, session: &SessionState) {
        for room_id in &session.joined {
            if let Some(room) = self.hub.room(room_id) {
                if let Some(user_id) = room.leave(self.conn_id) {
                    room.broadcast(&ServerMessage::UserLeft {
                        room_id: room_id.clone(),
                        user_id,
                    });
                }
            }
        }
        self.hub.unregister_user_conn(&session.principal.id);
    }
}

type Request = tokio_tungstenite::tungstenite::handshake::server::Request;

async fn send_now(sink: &mut WsSink, msg: &ServerMessage) {
    match codec::encode_server(msg) {
        Ok(text) => {
            let _ = sink.send(WsMessage::Text(text)).await;
        }
        Err(e) => warn!(kind = msg.kind(), error = %e, "cannot encode message"),
    }
}
