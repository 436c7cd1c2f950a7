//! Per-connection state: the socket handle and the live record.

use std::time::Duration;

use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Capacity of a connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close(String),
}

/// The send half of a connection.
///
/// The transport's writer task owns the receiving end and turns each
/// [`Outbound`] into a WebSocket message. Once `closed` is cancelled the
/// handle refuses further sends and the transport tears the socket down.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

/// Returned when the socket can no longer accept frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketClosed;

impl SocketHandle {
    /// Create a handle plus the receiver the writer task drains.
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Queue a text frame. Waits for queue space; fails only once closed.
    pub async fn send_text(&self, text: String) -> Result<(), SocketClosed> {
        if self.is_closed() {
            return Err(SocketClosed);
        }
        self.tx.send(Outbound::Text(text)).await.map_err(|_| SocketClosed)
    }

    /// Queue a transport-level ping without waiting.
    pub fn ping(&self) -> Result<(), SocketClosed> {
        if self.is_closed() {
            return Err(SocketClosed);
        }
        self.tx.try_send(Outbound::Ping).map_err(|_| SocketClosed)
    }

    /// Ask the writer to send a close frame, then mark the handle closed.
    pub fn close(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            let _ = self.tx.try_send(Outbound::Close(reason.to_string()));
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Token cancelled when the handle is closed; transports select on it.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Writer task body shared by both transports.
///
/// Drains queued frames in order, encoding each with `encode`. Stops after a
/// close frame, when every handle is dropped, or when the handle is closed
/// (sending a close frame first).
pub(crate) async fn write_outbound<S, M, F>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    encode: F,
) where
    S: Sink<M> + Unpin,
    F: Fn(Outbound) -> M,
{
    loop {
        let outbound = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            _ = closed.cancelled() => Outbound::Close("connection closed".to_string()),
        };
        let is_close = matches!(outbound, Outbound::Close(_));
        if sink.send(encode(outbound)).await.is_err() || is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Request sent to a client transport's supervisor asking it to re-dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    pub connection_id: String,
}

/// Whether the runtime accepted or dialled the connection.
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    Server,
    Client {
        reconnect: mpsc::UnboundedSender<ReconnectRequest>,
    },
}

struct ConnectionState {
    last_heartbeat: Instant,
    login_id: Option<i64>,
}

/// A registered, live connection.
pub struct ConnectionRecord {
    pub service_id: String,
    pub connection_id: String,
    pub socket: SocketHandle,
    pub api_timeout: Duration,
    pub mode: ConnectionMode,
    pub connected_at: Instant,
    state: Mutex<ConnectionState>,
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionRecord")
            .field("service_id", &self.service_id)
            .field("connection_id", &self.connection_id)
            .field("mode", &self.mode)
            .field("login_id", &state.login_id)
            .field("closed", &self.socket.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionRecord {
    pub fn new(
        service_id: impl Into<String>,
        connection_id: impl Into<String>,
        socket: SocketHandle,
        api_timeout: Duration,
        mode: ConnectionMode,
    ) -> Self {
        let now = Instant::now();
        Self {
            service_id: service_id.into(),
            connection_id: connection_id.into(),
            socket,
            api_timeout,
            mode,
            connected_at: now,
            state: Mutex::new(ConnectionState {
                last_heartbeat: now,
                login_id: None,
            }),
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.state.lock().last_heartbeat
    }

    pub fn touch_heartbeat(&self, now: Instant) {
        let mut state = self.state.lock();
        if now > state.last_heartbeat {
            state.last_heartbeat = now;
        }
    }

    /// Login identity learned from the handshake probe.
    pub fn login_id(&self) -> Option<i64> {
        self.state.lock().login_id
    }

    pub fn set_login_id(&self, login_id: i64) {
        self.state.lock().login_id = Some(login_id);
    }

    /// How far past `timeout` the last heartbeat is, if it is.
    pub fn heartbeat_overrun(&self, now: Instant, timeout: Duration) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_heartbeat());
        (elapsed > timeout).then(|| elapsed - timeout)
    }

    pub fn is_client(&self) -> bool {
        matches!(self.mode, ConnectionMode::Client { .. })
    }

    /// Fire-and-forget re-dial request. Returns `false` for server-mode
    /// connections or when the supervisor is gone.
    pub fn request_reconnect(&self) -> bool {
        match &self.mode {
            ConnectionMode::Server => false,
            ConnectionMode::Client { reconnect } => reconnect
                .send(ReconnectRequest {
                    connection_id: self.connection_id.clone(),
                })
                .is_ok(),
        }
    }
}
