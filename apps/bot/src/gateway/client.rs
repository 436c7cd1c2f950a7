//! Client mode: dial the remote side and keep the connection alive.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kestrel_common::id::{prefix, prefixed_ulid};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TransportError;
use crate::service::ServiceRecord;
use crate::AppState;

use super::session::{write_outbound, ConnectionMode, ConnectionRecord, Outbound, ReconnectRequest, SocketHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential reconnect delay: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts += 1;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Up to 10% extra so a fleet of bots does not re-dial in lockstep.
fn jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Dial, run the session, and re-dial until the service is disposed.
pub async fn run(state: AppState, service: Arc<ServiceRecord>) {
    let shutdown = service.shutdown_token();
    let (reconnect_tx, mut reconnect_rx) = mpsc::unbounded_channel();
    let mut backoff = Backoff::new(state.config.reconnect_interval, state.config.reconnect_max_interval);

    while !shutdown.is_cancelled() {
        match dial(&state.config).await {
            Ok(stream) => {
                backoff.reset();
                run_session(&state, &service, stream, reconnect_tx.clone(), &mut reconnect_rx, &shutdown).await;
            }
            Err(e) => {
                tracing::warn!(
                    service_id = %service.service_id,
                    attempt = backoff.attempts() + 1,
                    error = %e,
                    "dial failed"
                );
            }
        }
        if shutdown.is_cancelled() {
            break;
        }

        let delay = jitter(backoff.next_delay());
        tracing::info!(
            service_id = %service.service_id,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!(service_id = %service.service_id, "client supervisor stopped");
}

async fn dial(config: &Config) -> Result<WsStream, TransportError> {
    let url = config.ws_url.as_deref().ok_or(TransportError::MissingUrl)?;
    let mut request = url.into_client_request()?;
    if let Some(token) = config.access_token.as_deref() {
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    }
    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

fn encode(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Ping => Message::Ping(Default::default()),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

async fn run_session(
    state: &AppState,
    service: &ServiceRecord,
    stream: WsStream,
    reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
    reconnect_rx: &mut mpsc::UnboundedReceiver<ReconnectRequest>,
    shutdown: &CancellationToken,
) {
    let (ws_tx, mut ws_rx) = stream.split();
    let (handle, outbound_rx) = SocketHandle::channel();
    let closed = handle.closed_token();
    let writer = tokio::spawn(write_outbound(ws_tx, outbound_rx, closed.clone(), encode));

    let connection_id = prefixed_ulid(prefix::CONNECTION);
    let record = ConnectionRecord::new(
        service.service_id.clone(),
        connection_id.clone(),
        handle.clone(),
        state.config.api_timeout,
        ConnectionMode::Client { reconnect: reconnect_tx },
    );
    if let Err(e) = state.connections.register(record) {
        tracing::warn!(%connection_id, error = %e, "connection registration failed");
        handle.close("registration failed");
        let _ = writer.await;
        return;
    }
    // Signals aimed at an earlier session are stale.
    while reconnect_rx.try_recv().is_ok() {}

    tracing::info!(%connection_id, service_id = %service.service_id, "protocol connection opened");
    let socket_log = service.flags.socket_log;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = closed.cancelled() => break,
            signal = reconnect_rx.recv() => match signal {
                Some(request) if request.connection_id == connection_id => {
                    tracing::info!(%connection_id, "reconnect requested");
                    break;
                }
                Some(_) => continue,
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if socket_log {
                        tracing::debug!(%connection_id, frame = %text.as_str(), "recv");
                    }
                    state.dispatcher.ingest(&connection_id, text.as_str());
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => state.dispatcher.ingest(&connection_id, text),
                    Err(_) => tracing::warn!(%connection_id, "dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(%connection_id, error = %e, "ws read error");
                    break;
                }
            },
        }
    }

    state.connections.close(&connection_id);
    let abandoned = state.correlator.abandon_connection(&connection_id);
    handle.close("connection closed");
    let _ = writer.await;
    tracing::info!(%connection_id, service_id = %service.service_id, abandoned, "protocol connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(backoff.attempts(), 6);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn cap_below_initial_is_raised() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let delay = jitter(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(10) && delay <= Duration::from_secs(11));
        }
        assert_eq!(jitter(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn dial_without_url_fails() {
        let config = Config::default();
        assert!(matches!(dial(&config).await, Err(TransportError::MissingUrl)));
    }
}
