//! Wire envelope: outbound calls and inbound frame classification.

use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// post_type values
// ---------------------------------------------------------------------------

pub const POST_MESSAGE: &str = "message";
pub const POST_MESSAGE_SENT: &str = "message_sent";
pub const POST_NOTICE: &str = "notice";
pub const POST_REQUEST: &str = "request";
pub const POST_META_EVENT: &str = "meta_event";

pub const META_HEARTBEAT: &str = "heartbeat";
pub const META_LIFECYCLE: &str = "lifecycle";

// ---------------------------------------------------------------------------
// Outbound call
// ---------------------------------------------------------------------------

/// A remote action before an echo token is attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionCall {
    pub action: String,
    pub params: Value,
}

impl ActionCall {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// `{"action", "params", "echo"}` as sent on the socket.
#[derive(Debug, Serialize)]
pub struct ActionFrame<'a> {
    pub action: &'a str,
    pub params: &'a Value,
    pub echo: &'a str,
}

// ---------------------------------------------------------------------------
// Inbound classification
// ---------------------------------------------------------------------------

/// What an inbound frame is, decided from its top-level fields only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Reply to a call, carrying its echo token.
    Reply(String),
    Message,
    MessageSent,
    Notice,
    Request,
    Heartbeat,
    Lifecycle,
    /// A `meta_event` of a type the runtime does not act on.
    OtherMeta(String),
    Unknown,
}

/// The echo token of a frame, accepting both string and numeric forms.
pub fn echo_token(frame: &Value) -> Option<String> {
    match frame.get("echo")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Classify a frame by `post_type` (and `meta_event_type` for meta events).
///
/// A frame without a recognizable `post_type` is a reply if it carries an
/// echo token, otherwise it is unknown.
pub fn classify(frame: &Value) -> FrameKind {
    let post_type = frame.get("post_type").and_then(Value::as_str);
    match post_type {
        Some(POST_MESSAGE) => FrameKind::Message,
        Some(POST_MESSAGE_SENT) => FrameKind::MessageSent,
        Some(POST_NOTICE) => FrameKind::Notice,
        Some(POST_REQUEST) => FrameKind::Request,
        Some(POST_META_EVENT) => match frame.get("meta_event_type").and_then(Value::as_str) {
            Some(META_HEARTBEAT) => FrameKind::Heartbeat,
            Some(META_LIFECYCLE) => FrameKind::Lifecycle,
            Some(other) => FrameKind::OtherMeta(other.to_string()),
            None => FrameKind::Unknown,
        },
        _ => echo_token(frame).map_or(FrameKind::Unknown, FrameKind::Reply),
    }
}
