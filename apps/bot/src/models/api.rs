//! Outcome of a remote action call.

use serde::Serialize;
use serde_json::Value;

/// Classification of a finished call.
///
/// The first block mirrors the `retcode` values a protocol implementation
/// reports; the second block is produced locally by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Ok,
    Async,
    BadRequest,
    InvalidData,
    Failed,
    Unauthorized,
    Forbidden,
    UnsupportedAction,

    TimeOut,
    NullResponse,
    SocketSendError,
    ObservableError,
    UnknownStatus,
}

impl ApiStatus {
    /// Map a reply's `retcode` onto the known set.
    pub fn from_retcode(retcode: i64) -> Self {
        match retcode {
            0 => Self::Ok,
            1 => Self::Async,
            100 | 1400 => Self::BadRequest,
            102 => Self::InvalidData,
            103 => Self::Failed,
            1401 => Self::Unauthorized,
            1403 => Self::Forbidden,
            1404 => Self::UnsupportedAction,
            _ => Self::UnknownStatus,
        }
    }

    /// Fallback used when a reply carries a `status` string but no `retcode`.
    fn from_status_str(status: &str) -> Self {
        match status {
            "ok" => Self::Ok,
            "async" => Self::Async,
            "failed" => Self::Failed,
            _ => Self::UnknownStatus,
        }
    }

    /// `Ok` and `Async` both mean the remote side accepted the call.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Async)
    }
}

/// Status plus body of a finished call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: ApiStatus,
    /// Raw `retcode`, when the reply carried one.
    pub retcode: Option<i64>,
    /// The reply's `data` member, or `Null`.
    pub data: Value,
    /// Human-readable detail: the reply's `message`/`wording`, or the local
    /// fault description.
    pub message: Option<String>,
}

impl ApiResponse {
    /// Build a response from a reply frame.
    pub fn from_frame(frame: &Value) -> Self {
        let retcode = frame.get("retcode").and_then(Value::as_i64);
        let status_str = frame.get("status").and_then(Value::as_str);
        let data = frame.get("data").cloned().unwrap_or(Value::Null);
        let message = ["message", "wording", "msg"]
            .iter()
            .filter_map(|key| frame.get(*key).and_then(Value::as_str))
            .find(|s| !s.is_empty())
            .map(str::to_string);

        let status = match (retcode, status_str) {
            (Some(code), _) => ApiStatus::from_retcode(code),
            (None, Some(s)) => ApiStatus::from_status_str(s),
            (None, None) if data.is_null() => ApiStatus::NullResponse,
            (None, None) => ApiStatus::UnknownStatus,
        };

        Self {
            status,
            retcode,
            data,
            message,
        }
    }

    pub fn timed_out() -> Self {
        Self::local(ApiStatus::TimeOut, None)
    }

    pub fn send_error(reason: impl Into<String>) -> Self {
        Self::local(ApiStatus::SocketSendError, Some(reason.into()))
    }

    pub fn observable_error(reason: impl Into<String>) -> Self {
        Self::local(ApiStatus::ObservableError, Some(reason.into()))
    }

    fn local(status: ApiStatus, message: Option<String>) -> Self {
        Self {
            status,
            retcode: None,
            data: Value::Null,
            message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
