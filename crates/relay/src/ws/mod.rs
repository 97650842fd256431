// WebSocket gateway: one socket per client, any number of joined pages.
//
// Command replies are written straight to the socket. Page events reach the
// socket through one forwarder task per joined page, funnelled into a single
// outbound queue so the socket has exactly one writer. When a page session
// is torn down, the forwarder joins the replacement session and sends a fresh
// `page_state`, so clients only see SESSION_UNAVAILABLE followed by a resync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use chrono::Utc;
use onezone_common::protocol::ws::{ClientMessage, ServerMessage, CURRENT_PROTOCOL_VERSION};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::enforce_rate_limit;
use crate::auth::jwt::JwtAccessTokenService;
use crate::auth::middleware::{require_bearer_auth, AuthenticatedUser};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode};
use crate::metrics;
use crate::rate_limit::RateBucket;
use crate::server::RelayState;
use crate::session::{SessionError, SessionRegistry};

pub const HEARTBEAT_INTERVAL_MS: u32 = 15_000;
/// Three missed pongs.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64 * 3);
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

pub fn router(state: RelayState, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new()
        .route("/v1/ws", get(ws_upgrade))
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, user.user_id, socket)).await;
    })
}

/// Per-socket bookkeeping.
struct Connection {
    id: Uuid,
    user_id: Uuid,
    state: RelayState,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    /// page id -> event forwarder
    pages: HashMap<Uuid, JoinHandle<()>>,
}

async fn handle_socket(state: RelayState, user_id: Uuid, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let connect = ServerMessage::Connect {
        connection_id,
        user_id,
        protocol: CURRENT_PROTOCOL_VERSION.to_string(),
        server_time: Utc::now(),
        heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
    };
    if send_ws_message(&mut socket, &connect).await.is_err() {
        return;
    }
    info!(connection_id = %connection_id, user_id = %user_id, "websocket connected");

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let mut connection =
        Connection { id: connection_id, user_id, state, outbound, pages: HashMap::new() };

    let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64));
    heartbeat.reset();
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    let disconnect =
                        ServerMessage::Disconnect { reason: "heartbeat_timeout".into() };
                    let _ = send_ws_message(&mut socket, &disconnect).await;
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            Some(event) = outbound_rx.recv() => {
                if send_ws_message(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            received = socket.recv() => {
                let Some(received) = received else {
                    break;
                };
                match received {
                    Ok(Message::Text(raw)) => {
                        let replies = match serde_json::from_str::<ClientMessage>(&raw) {
                            Ok(command) => connection.handle(command).await,
                            Err(error) => vec![invalid_frame(&error)],
                        };
                        let mut closed = false;
                        for reply in &replies {
                            if send_ws_message(&mut socket, reply).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                        connection.touch_presence().await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {
                        let error = SessionError::Invalid("binary frames are not supported".into());
                        if send_ws_message(&mut socket, &error.to_message(None)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        debug!(
                            connection_id = %connection_id,
                            error = %error,
                            "websocket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    connection.close().await;
    info!(connection_id = %connection_id, user_id = %user_id, "websocket disconnected");
}

impl Connection {
    /// Run one client command and return the replies for this socket.
    async fn handle(&mut self, command: ClientMessage) -> Vec<ServerMessage> {
        let started_at = Instant::now();
        let kind = command.kind();
        let page_id = command.page_id();

        let result = self.dispatch(command).await;
        let is_error = result.is_err();
        metrics::record_ws_request(kind, is_error, started_at.elapsed().as_millis() as u64);

        match result {
            Ok(replies) => replies,
            Err(error) => {
                debug!(
                    connection_id = %self.id,
                    page_id = %page_id,
                    command = kind,
                    error = %error,
                    "websocket command failed"
                );
                vec![error.to_message(Some(page_id))]
            }
        }
    }

    async fn dispatch(
        &mut self,
        command: ClientMessage,
    ) -> Result<Vec<ServerMessage>, SessionError> {
        let registry = &self.state.registry;
        let user_id = self.user_id;

        match command {
            ClientMessage::Join { page_id } => {
                if let Some(previous) = self.pages.remove(&page_id) {
                    previous.abort();
                }
                let joined = registry.join(page_id, user_id, self.id).await?;
                let forwarder = spawn_forwarder(
                    registry.clone(),
                    self.id,
                    page_id,
                    user_id,
                    joined.events,
                    self.outbound.clone(),
                );
                self.pages.insert(page_id, forwarder);
                Ok(vec![joined.state.into_message()])
            }
            ClientMessage::Leave { page_id } => {
                if let Some(forwarder) = self.pages.remove(&page_id) {
                    forwarder.abort();
                    registry.leave(page_id, self.id).await;
                }
                Ok(vec![ack(page_id, "leave")])
            }
            ClientMessage::Mutate { page_id, request_id, op } => {
                enforce_rate_limit(&self.state, user_id, RateBucket::Mutate).await?;
                let applied = registry.mutate(page_id, user_id, op).await?;
                Ok(vec![ServerMessage::Ack {
                    page_id,
                    command: "mutate".into(),
                    request_id,
                    seq: Some(applied.seq),
                    version_number: None,
                }])
            }
            ClientMessage::AcquireLock { page_id } => {
                registry.acquire_lock(page_id, user_id).await?;
                Ok(vec![ack(page_id, "acquire_lock")])
            }
            ClientMessage::ReleaseLock { page_id } => {
                registry.release_lock(page_id, user_id).await?;
                Ok(vec![ack(page_id, "release_lock")])
            }
            ClientMessage::Heartbeat { page_id } => {
                registry.heartbeat(page_id, user_id).await?;
                Ok(vec![ack(page_id, "heartbeat")])
            }
            ClientMessage::CursorUpdate { page_id, position, selection } => {
                registry.update_cursor(page_id, user_id, position, selection).await;
                Ok(Vec::new())
            }
            ClientMessage::RestoreVersion { page_id, version_number, request_id } => {
                enforce_rate_limit(&self.state, user_id, RateBucket::Mutate).await?;
                let restored = registry.restore(page_id, user_id, version_number).await?;
                Ok(vec![ServerMessage::Ack {
                    page_id,
                    command: "restore_version".into(),
                    request_id,
                    seq: Some(restored.seq),
                    version_number: Some(restored.version.version_number),
                }])
            }
        }
    }

    /// A live socket counts as activity on every page it has joined.
    async fn touch_presence(&self) {
        for page_id in self.pages.keys() {
            self.state.registry.touch_presence(*page_id, self.user_id).await;
        }
    }

    /// Leave every joined page. Accepted mutations are unaffected.
    async fn close(&mut self) {
        for (page_id, forwarder) in self.pages.drain() {
            forwarder.abort();
            self.state.registry.leave(page_id, self.id).await;
        }
    }
}

fn ack(page_id: Uuid, command: &str) -> ServerMessage {
    ServerMessage::Ack {
        page_id,
        command: command.into(),
        request_id: None,
        seq: None,
        version_number: None,
    }
}

fn invalid_frame(error: &serde_json::Error) -> ServerMessage {
    ServerMessage::Error {
        code: ErrorCode::ValidationFailed.as_str().to_string(),
        message: format!("invalid command frame: {error}"),
        retryable: false,
        page_id: None,
        details: None,
    }
}

/// Copy page events onto the socket queue. A receiver that fell behind is
/// resynchronised with a fresh `page_state` instead of replaying the gap.
/// A stream that closes right after SESSION_UNAVAILABLE is re-joined.
fn spawn_forwarder(
    registry: SessionRegistry,
    connection_id: Uuid,
    page_id: Uuid,
    user_id: Uuid,
    mut events: broadcast::Receiver<ServerMessage>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut torn_down = false;
        loop {
            let message = match events.recv().await {
                Ok(message) => {
                    torn_down = is_session_unavailable(&message);
                    message
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        page_id = %page_id,
                        user_id = %user_id,
                        skipped,
                        "page events lagged; resyncing"
                    );
                    match registry.state(page_id, user_id).await {
                        Ok(state) => state.into_message(),
                        Err(error) => error.to_message(Some(page_id)),
                    }
                }
                Err(broadcast::error::RecvError::Closed) if torn_down => {
                    torn_down = false;
                    match registry.join(page_id, user_id, connection_id).await {
                        Ok(joined) => {
                            info!(
                                connection_id = %connection_id,
                                page_id = %page_id,
                                "rejoined page after session teardown"
                            );
                            events = joined.events;
                            joined.state.into_message()
                        }
                        Err(error) => {
                            warn!(
                                connection_id = %connection_id,
                                page_id = %page_id,
                                error = %error,
                                "rejoin after session teardown failed"
                            );
                            let _ = outbound.send(error.to_message(Some(page_id)));
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if outbound.send(message).is_err() {
                break;
            }
        }
    })
}

fn is_session_unavailable(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error { code, .. } if code == ErrorCode::SessionUnavailable.as_str()
    )
}

async fn send_ws_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
