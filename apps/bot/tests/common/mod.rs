#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use kestrel_bot::commands::CommandRouter;
use kestrel_bot::config::Config;
use kestrel_bot::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const BOT_ID: &str = "10001";

pub fn test_config() -> Config {
    Config {
        service_id: "test".to_string(),
        ..Config::default()
    }
}

/// Start a real TCP server for WebSocket testing. The server runs in the
/// background until the test ends.
pub async fn start_server(config: Config, router: CommandRouter) -> (SocketAddr, AppState) {
    let state = AppState::new(config, router);
    state.start_service().expect("start service");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let app = state.http_router();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// Dial the server with arbitrary upgrade headers.
pub async fn connect_with(
    addr: SocketAddr,
    path: &str,
    headers: &[(&'static str, &str)],
) -> Result<Ws, tungstenite::Error> {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    for (name, value) in headers {
        request
            .headers_mut()
            .insert(*name, HeaderValue::from_str(value).unwrap());
    }
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(ws, _)| ws)
}

/// Dial as a well-behaved protocol implementation.
pub async fn connect(addr: SocketAddr, state: &AppState) -> Ws {
    let token = state.config.access_token.as_deref().map(|t| format!("Bearer {t}"));
    let mut headers = vec![("x-client-role", "Universal"), ("x-self-id", BOT_ID)];
    if let Some(token) = token.as_deref() {
        headers.push(("authorization", token));
    }
    connect_with(addr, &state.config.ws_path, &headers)
        .await
        .expect("ws connect")
}

/// Poll until the service has a registered connection and return its id.
pub async fn wait_for_connection(state: &AppState) -> String {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(record) = state
                .connections
                .connections_for(&state.config.service_id)
                .first()
            {
                return record.connection_id.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection registered")
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next JSON text frame, skipping control frames.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Answer an action request frame with a successful reply.
pub async fn reply_ok(ws: &mut Ws, request: &Value, data: Value) {
    send_json(
        ws,
        serde_json::json!({
            "status": "ok",
            "retcode": 0,
            "data": data,
            "echo": request["echo"].clone(),
        }),
    )
    .await;
}

pub fn private_message(user_id: i64, text: &str) -> Value {
    serde_json::json!({
        "time": 1_700_000_000,
        "self_id": 10001,
        "post_type": "message",
        "message_type": "private",
        "sub_type": "friend",
        "message_id": 1,
        "user_id": user_id,
        "raw_message": text,
        "message": text,
        "sender": { "user_id": user_id, "nickname": "tester" }
    })
}
