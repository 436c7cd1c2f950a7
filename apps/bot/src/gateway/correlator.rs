//! Request/response correlation for outbound action calls.
//!
//! Every call gets a fresh echo token. The pending slot is a oneshot sender
//! keyed by that token; whichever of reply, deadline or connection teardown
//! comes first consumes it, and the slot is removed exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kestrel_common::SnowflakeGenerator;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::models::{ApiResponse, MessageEvent};

use super::events::{ActionCall, ActionFrame};
use super::registry::ConnectionRegistry;
use super::session::ConnectionRecord;

/// Used when the target connection is unknown and no override is given.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingRequest {
    connection_id: String,
    tx: oneshot::Sender<Value>,
}

pub struct RequestCorrelator {
    registry: Arc<ConnectionRegistry>,
    pending: DashMap<String, PendingRequest>,
    tokens: SnowflakeGenerator,
}

/// Removes the pending slot when the awaiting call finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingRequest>,
    echo: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.echo);
    }
}

impl RequestCorrelator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_generator(registry, SnowflakeGenerator::default())
    }

    pub fn with_generator(registry: Arc<ConnectionRegistry>, tokens: SnowflakeGenerator) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            tokens,
        }
    }

    /// Send `call` on `connection_id` and wait for its reply.
    ///
    /// Never fails: transport faults, timeouts and teardown are reported
    /// through the response status.
    pub async fn send(&self, connection_id: &str, call: ActionCall, timeout: Option<Duration>) -> ApiResponse {
        let record = self.registry.lookup(connection_id);
        let timeout = effective_timeout(timeout, record.as_deref());
        let Some(record) = record else {
            tracing::warn!(
                %connection_id,
                action = %call.action,
                timeout_ms = timeout.as_millis() as u64,
                "call on unknown connection"
            );
            return ApiResponse::send_error(format!("connection {connection_id} is not registered"));
        };

        let deadline = Instant::now() + timeout;
        let echo = self.tokens.next_token();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            echo.clone(),
            PendingRequest {
                connection_id: connection_id.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            echo: &echo,
        };

        let frame = ActionFrame {
            action: &call.action,
            params: &call.params,
            echo: &echo,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => return ApiResponse::send_error(format!("failed to encode {}: {e}", call.action)),
        };
        // The enqueue counts against the deadline: a peer that stops reading
        // fills the outbound queue.
        match tokio::time::timeout_at(deadline, record.socket.send_text(text)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::debug!(%connection_id, action = %call.action, %echo, "send failed: socket closed");
                return ApiResponse::send_error("socket closed");
            }
            Err(_) => {
                tracing::debug!(
                    %connection_id,
                    action = %call.action,
                    %echo,
                    timeout_ms = timeout.as_millis() as u64,
                    "call timed out waiting for queue space"
                );
                return ApiResponse::timed_out();
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => ApiResponse::from_frame(&reply),
            Ok(Err(_)) => ApiResponse::observable_error(format!(
                "connection {connection_id} closed before {} replied",
                call.action
            )),
            Err(_) => {
                tracing::debug!(
                    %connection_id,
                    action = %call.action,
                    %echo,
                    timeout_ms = timeout.as_millis() as u64,
                    "call timed out"
                );
                ApiResponse::timed_out()
            }
        }
    }

    /// Deliver a reply frame to the call waiting on `echo`.
    ///
    /// Returns `false` for unmatched tokens (late replies after a timeout,
    /// or tokens this runtime never issued).
    pub fn resolve(&self, echo: &str, frame: Value) -> bool {
        match self.pending.remove(echo) {
            Some((_, pending)) => pending.tx.send(frame).is_ok(),
            None => {
                tracing::debug!(%echo, "unmatched reply");
                false
            }
        }
    }

    /// Drop every pending slot owned by `connection_id`. Their callers
    /// observe `ObservableError` right away. Returns how many were dropped.
    pub fn abandon_connection(&self, connection_id: &str) -> usize {
        let dropped = AtomicUsize::new(0);
        self.pending.retain(|_, pending| {
            let keep = pending.connection_id != connection_id;
            if !keep {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });
        dropped.into_inner()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn effective_timeout(timeout: Option<Duration>, record: Option<&ConnectionRecord>) -> Duration {
    match (timeout, record) {
        (Some(timeout), _) => timeout,
        (None, Some(record)) => record.api_timeout,
        (None, None) => DEFAULT_API_TIMEOUT,
    }
}

// ---------------------------------------------------------------------------
// BotApi
// ---------------------------------------------------------------------------

/// Typed calls bound to one connection.
#[derive(Clone)]
pub struct BotApi {
    correlator: Arc<RequestCorrelator>,
    connection_id: String,
    timeout: Option<Duration>,
}

impl BotApi {
    pub fn new(correlator: Arc<RequestCorrelator>, connection_id: impl Into<String>) -> Self {
        Self {
            correlator,
            connection_id: connection_id.into(),
            timeout: None,
        }
    }

    /// Override the connection's API timeout for calls made through this handle.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn call(&self, action: &str, params: Value) -> ApiResponse {
        self.correlator
            .send(&self.connection_id, ActionCall::new(action, params), self.timeout)
            .await
    }

    pub async fn get_login_info(&self) -> ApiResponse {
        self.call("get_login_info", json!({})).await
    }

    pub async fn send_private_msg(&self, user_id: i64, message: impl Into<Value>) -> ApiResponse {
        self.call(
            "send_private_msg",
            json!({ "user_id": user_id, "message": message.into() }),
        )
        .await
    }

    pub async fn send_group_msg(&self, group_id: i64, message: impl Into<Value>) -> ApiResponse {
        self.call(
            "send_group_msg",
            json!({ "group_id": group_id, "message": message.into() }),
        )
        .await
    }

    pub async fn get_group_member_info(&self, group_id: i64, user_id: i64) -> ApiResponse {
        self.call(
            "get_group_member_info",
            json!({ "group_id": group_id, "user_id": user_id, "no_cache": false }),
        )
        .await
    }

    pub async fn mark_msg_as_read(&self, message_id: i64) -> ApiResponse {
        self.call("mark_msg_as_read", json!({ "message_id": message_id })).await
    }

    /// Answer a message where it came from.
    pub async fn reply(&self, event: &MessageEvent, message: impl Into<Value>) -> ApiResponse {
        match event.group_id.filter(|_| event.is_group()) {
            Some(group_id) => self.send_group_msg(group_id, message).await,
            None => self.send_private_msg(event.user_id, message).await,
        }
    }
}
