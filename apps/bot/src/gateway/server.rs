//! Server mode: accept reverse WebSocket connections from the remote side.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use kestrel_common::id::{prefix, prefixed_ulid};
use tokio_util::sync::CancellationToken;

use crate::auth::middleware::RemoteIdentity;
use crate::error::TransportError;
use crate::AppState;

use super::session::{write_outbound, ConnectionMode, ConnectionRecord, Outbound, SocketHandle};

pub fn router(ws_path: &str) -> Router<AppState> {
    Router::new().route(ws_path, get(ws_upgrade))
}

/// Bind the configured address and serve until `shutdown` fires.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<(), TransportError> {
    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(%addr, ws_path = %state.config.ws_path, "listening for protocol connections");

    axum::serve(listener, state.http_router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(TransportError::Serve)
}

async fn ws_upgrade(ws: WebSocketUpgrade, identity: RemoteIdentity, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, identity, state))
}

fn encode(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Ping => Message::Ping(Default::default()),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        })),
    }
}

async fn handle_connection(socket: WebSocket, identity: RemoteIdentity, state: AppState) {
    let service_id = state.config.service_id.clone();
    let Some(service) = state.services.get(&service_id) else {
        tracing::warn!(%service_id, "service not running, refusing connection");
        return;
    };

    let (ws_tx, ws_rx) = socket.split();
    let (handle, outbound_rx) = SocketHandle::channel();
    let closed = handle.closed_token();
    let writer = tokio::spawn(write_outbound(ws_tx, outbound_rx, closed.clone(), encode));

    let connection_id = prefixed_ulid(prefix::CONNECTION);
    let record = ConnectionRecord::new(
        service_id.clone(),
        connection_id.clone(),
        handle.clone(),
        state.config.api_timeout,
        ConnectionMode::Server,
    );
    // Registered before the first read, so a lifecycle frame always finds it.
    if let Err(e) = state.connections.register(record) {
        tracing::warn!(%connection_id, error = %e, "connection registration failed");
        handle.close("registration failed");
        let _ = writer.await;
        return;
    }
    let _ = handle.ping();

    tracing::info!(
        %connection_id,
        %service_id,
        self_id = identity.self_id,
        "protocol connection opened"
    );

    read_loop(&state, &connection_id, ws_rx, &closed, service.flags.socket_log).await;

    state.connections.close(&connection_id);
    let abandoned = state.correlator.abandon_connection(&connection_id);
    handle.close("connection closed");
    let _ = writer.await;

    tracing::info!(%connection_id, %service_id, abandoned, "protocol connection closed");
}

async fn read_loop(
    state: &AppState,
    connection_id: &str,
    mut ws_rx: SplitStream<WebSocket>,
    closed: &CancellationToken,
    socket_log: bool,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                if socket_log {
                    tracing::debug!(%connection_id, frame = %text.as_str(), "recv");
                }
                state.dispatcher.ingest(connection_id, text.as_str());
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => state.dispatcher.ingest(connection_id, text),
                Err(_) => tracing::warn!(%connection_id, "dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(%connection_id, error = %e, "ws read error");
                break;
            }
        }
    }
}
