//! Typed inbound events.
//!
//! Only the fields the runtime itself reads are typed; everything else is
//! kept in `extra` so subscribers can still reach it. Message segments stay
//! raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a chat message was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Private,
    Group,
}

/// The conversation a message belongs to: who, in which group, on which
/// channel type. Scopes both permissions and continuations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub user_id: i64,
    pub group_id: Option<i64>,
    pub source: SourceType,
}

impl SourceKey {
    pub fn private(user_id: i64) -> Self {
        Self {
            user_id,
            group_id: None,
            source: SourceType::Private,
        }
    }

    pub fn group(group_id: i64, user_id: i64) -> Self {
        Self {
            user_id,
            group_id: Some(group_id),
            source: SourceType::Group,
        }
    }
}

/// Sender block attached to message events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub card: Option<String>,
    /// `owner`, `admin` or `member`; only present for group messages.
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub self_id: i64,
    /// `message`, or `message_sent` for the bot's own outgoing messages.
    pub post_type: String,
    pub message_type: SourceType,
    #[serde(default)]
    pub sub_type: String,
    #[serde(default)]
    pub message_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub sender: Sender,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageEvent {
    pub fn source_key(&self) -> SourceKey {
        match (self.message_type, self.group_id) {
            (SourceType::Group, Some(group_id)) => SourceKey::group(group_id, self.user_id),
            _ => SourceKey::private(self.user_id),
        }
    }

    pub fn is_group(&self) -> bool {
        self.message_type == SourceType::Group
    }

    pub fn is_self_sent(&self) -> bool {
        self.post_type == "message_sent"
    }

    /// Plain text used for pattern matching.
    ///
    /// Prefers `raw_message`; otherwise a string `message`, otherwise the
    /// concatenated `text` segments of an array `message`.
    pub fn text(&self) -> String {
        if !self.raw_message.is_empty() {
            return self.raw_message.clone();
        }
        match &self.message {
            Value::String(s) => s.clone(),
            Value::Array(segments) => segments
                .iter()
                .filter(|seg| seg.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|seg| seg.pointer("/data/text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.time, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeEvent {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub self_id: i64,
    pub notice_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub operator_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub self_id: i64,
    pub request_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub comment: String,
    /// Opaque handle the remote side expects back when approving/rejecting.
    #[serde(default)]
    pub flag: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEvent {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub self_id: i64,
    /// `lifecycle` or `heartbeat`.
    pub meta_event_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    /// Heartbeat interval in milliseconds, as announced by the remote side.
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Any inbound, unsolicited frame after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(MessageEvent),
    Notice(NoticeEvent),
    Request(RequestEvent),
    Meta(MetaEvent),
}

impl Event {
    /// The user that caused the event, used for block-list filtering.
    pub fn sender_id(&self) -> Option<i64> {
        match self {
            Self::Message(e) => Some(e.user_id),
            Self::Notice(e) => e.user_id,
            Self::Request(e) => e.user_id,
            Self::Meta(_) => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageEvent> {
        match self {
            Self::Message(e) => Some(e),
            _ => None,
        }
    }

    /// Parse an event frame by its `post_type`. `message_sent` frames become
    /// [`Event::Message`] with `post_type` preserved.
    pub fn from_value(frame: Value) -> Result<Self, serde_json::Error> {
        let post_type = frame
            .get("post_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match post_type.as_str() {
            "message" | "message_sent" => serde_json::from_value(frame).map(Self::Message),
            "notice" => serde_json::from_value(frame).map(Self::Notice),
            "request" => serde_json::from_value(frame).map(Self::Request),
            "meta_event" => serde_json::from_value(frame).map(Self::Meta),
            other => Err(serde::de::Error::custom(format!("unknown post_type {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group_message() -> Value {
        json!({
            "time": 1_700_000_000,
            "self_id": 10001,
            "post_type": "message",
            "message_type": "group",
            "sub_type": "normal",
            "message_id": 77,
            "group_id": 555,
            "user_id": 42,
            "raw_message": "/echo hi",
            "message": [{"type": "text", "data": {"text": "/echo hi"}}],
            "font": 0,
            "sender": {"user_id": 42, "nickname": "alice", "role": "admin"}
        })
    }

    #[test]
    fn parses_group_message() {
        let event: MessageEvent = serde_json::from_value(group_message()).unwrap();
        assert!(event.is_group());
        assert_eq!(event.source_key(), SourceKey::group(555, 42));
        assert_eq!(event.sender.role.as_deref(), Some("admin"));
        assert_eq!(event.text(), "/echo hi");
        assert_eq!(event.extra.get("font"), Some(&json!(0)));
        assert_eq!(event.timestamp().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn text_falls_back_to_segments() {
        let mut frame = group_message();
        frame["raw_message"] = json!("");
        frame["message"] = json!([
            {"type": "at", "data": {"qq": "10001"}},
            {"type": "text", "data": {"text": " hello"}},
            {"type": "text", "data": {"text": " world"}}
        ]);
        let event: MessageEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(event.text(), " hello world");
    }

    #[test]
    fn private_message_keys_on_user_only() {
        let event: MessageEvent = serde_json::from_value(json!({
            "post_type": "message",
            "message_type": "private",
            "user_id": 9,
            "message": "ping"
        }))
        .unwrap();
        assert_eq!(event.source_key(), SourceKey::private(9));
        assert_eq!(event.text(), "ping");
        assert!(!event.is_self_sent());
    }

    #[test]
    fn notice_sender_is_optional() {
        let notice: NoticeEvent = serde_json::from_value(json!({
            "post_type": "notice",
            "notice_type": "group_increase",
            "group_id": 1,
            "user_id": 2,
            "operator_id": 3
        }))
        .unwrap();
        assert_eq!(Event::Notice(notice).sender_id(), Some(2));
    }

    #[test]
    fn from_value_dispatches_on_post_type() {
        let event = Event::from_value(group_message()).unwrap();
        assert_eq!(event.as_message().unwrap().message_id, 77);

        let request = Event::from_value(json!({
            "post_type": "request",
            "request_type": "friend",
            "user_id": 8,
            "flag": "f-1"
        }))
        .unwrap();
        assert!(matches!(&request, Event::Request(r) if r.flag == "f-1"));
        assert_eq!(request.sender_id(), Some(8));

        assert!(Event::from_value(json!({"post_type": "mystery"})).is_err());
        assert!(Event::from_value(json!({"retcode": 0})).is_err());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let result: Result<MessageEvent, _> = serde_json::from_value(json!({
            "post_type": "message",
            "message_type": "guild",
            "user_id": 1
        }));
        assert!(result.is_err());
    }
}
