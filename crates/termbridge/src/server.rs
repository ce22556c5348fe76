//! HTTP surface: the health check and the WebSocket shell endpoint.
//!
//! Each upgraded connection gets exactly one shell session. PTY output flows
//! to the client as binary frames; binary and text frames from the client are
//! written to the PTY unmodified.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{extract_credential, Authenticator, CredentialSource, UserIdentity};
use crate::session::{ConnectionId, SessionError, SessionManager};

pub const HEALTH_PATH: &str = "/health";
pub const SHELL_PATH: &str = "/shell";

/// Close reason sent when the shell could not be started.
pub const LAUNCH_FAILED_REASON: &str = "Failed to create terminal";
/// Close reason sent when the session limit is reached.
pub const LIMIT_REACHED_REASON: &str = "Too many sessions";

/// Shared state for every request.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub auth: Arc<dyn Authenticator>,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancellationToken,
    /// Capacity of each connection's outbound chunk queue.
    pub outbound_capacity: usize,
}

impl AppState {
    pub fn new(
        manager: Arc<SessionManager>,
        auth: Arc<dyn Authenticator>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            manager,
            auth,
            shutdown: CancellationToken::new(),
            outbound_capacity: outbound_capacity.max(1),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(SHELL_PATH, get(shell_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `state.shutdown` is cancelled, then tears down every
/// remaining session.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let local_addr: SocketAddr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();
    let manager = Arc::clone(&state.manager);

    tracing::info!(addr = %local_addr, "Listening for shell connections");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    let remaining = manager.shutdown().await;
    tracing::info!(sessions = remaining, "Server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct ShellQuery {
    token: Option<String>,
}

async fn shell_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ShellQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(credential) = extract_credential(&headers, query.token.as_deref()) else {
        tracing::warn!("Refused connection without credential");
        return (StatusCode::UNAUTHORIZED, "missing credential").into_response();
    };

    if !state.auth.validate_credential(&credential.token) {
        tracing::warn!(source = ?credential.source, "Refused connection with invalid credential");
        return (StatusCode::UNAUTHORIZED, "invalid credential").into_response();
    }

    let Some(user) = state.auth.resolve_user(&credential.token) else {
        tracing::warn!("Credential accepted but maps to no user");
        return (StatusCode::UNAUTHORIZED, "unknown user").into_response();
    };

    // Browsers fail the handshake unless the offered subprotocol is echoed.
    let ws = if credential.source == CredentialSource::Subprotocol {
        ws.protocols([credential.token])
    } else {
        ws
    };

    let connection_id = Uuid::new_v4();
    tracing::info!(connection = %connection_id, user = %user.name, "Accepted shell connection");

    ws.on_upgrade(move |socket| run_connection(socket, state, connection_id, user))
}

/// Why a connection's pump loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    ClientClosed,
    ShellExited,
    SendFailed,
    ReceiveFailed,
    ServerShutdown,
}

async fn run_connection(
    socket: WebSocket,
    state: AppState,
    connection_id: ConnectionId,
    user: UserIdentity,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(state.outbound_capacity);

    if let Err(e) = state.manager.open(connection_id, &user, outbound_tx).await {
        let (code, reason) = match e {
            SessionError::LimitReached(_) => (close_code::AGAIN, LIMIT_REACHED_REASON),
            _ => (close_code::ERROR, LAUNCH_FAILED_REASON),
        };
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(connection = %connection_id, error = %e, "Failed to send close frame");
        }
        return;
    }

    let end = loop {
        tokio::select! {
            chunk = outbound_rx.recv() => match chunk {
                Some(bytes) => {
                    if let Err(e) = sink.send(Message::Binary(bytes)).await {
                        tracing::debug!(connection = %connection_id, error = %e, "Failed to send output");
                        break ConnectionEnd::SendFailed;
                    }
                }
                // Server shutdown may have torn the session down first.
                None if state.shutdown.is_cancelled() => break ConnectionEnd::ServerShutdown,
                None => break ConnectionEnd::ShellExited,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    state.manager.write(&connection_id, &data);
                }
                Some(Ok(Message::Text(text))) => {
                    state.manager.write(&connection_id, text.as_str().as_bytes());
                }
                Some(Ok(Message::Close(_))) | None => break ConnectionEnd::ClientClosed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection = %connection_id, error = %e, "Failed to receive frame");
                    break ConnectionEnd::ReceiveFailed;
                }
            },
            _ = state.shutdown.cancelled() => break ConnectionEnd::ServerShutdown,
        }
    };

    // The output loop may be parked on a full queue; dropping the receiver
    // releases it before teardown joins it.
    drop(outbound_rx);
    state.manager.teardown(&connection_id).await;

    tracing::info!(connection = %connection_id, reason = ?end, "Connection closed");

    let farewell = match end {
        ConnectionEnd::ShellExited => Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static("Shell exited"),
        }),
        ConnectionEnd::ServerShutdown => Some(CloseFrame {
            code: close_code::AWAY,
            reason: Utf8Bytes::from_static("Server shutting down"),
        }),
        _ => None,
    };
    if let Some(frame) = farewell {
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(connection = %connection_id, error = %e, "Failed to send close frame");
        }
    }
}
