//! Upgrade-request checks for inbound protocol connections.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::AppState;

pub const CLIENT_ROLE_HEADER: &str = "x-client-role";
pub const SELF_ID_HEADER: &str = "x-self-id";

/// The remote implementation, as announced by its upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteIdentity {
    /// The bot account the remote side is logged in as.
    pub self_id: i64,
}

/// Rejection returned before the upgrade happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRejection {
    status: StatusCode,
    message: &'static str,
}

impl HandshakeRejection {
    fn unauthorized(message: &'static str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message,
        }
    }

    fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl IntoResponse for HandshakeRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.status.canonical_reason().unwrap_or("ERROR"),
                "message": self.message
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl FromRequestParts<AppState> for RemoteIdentity {
    type Rejection = HandshakeRejection;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(expected) = state.config.access_token.as_deref() {
            let presented = presented_token(&parts.headers).or_else(|| query_token(parts.uri.query()));
            if presented != Some(expected) {
                tracing::warn!(uri = %parts.uri, "rejected connection: bad access token");
                return Err(HandshakeRejection::unauthorized("Invalid or missing access token"));
            }
        }
        identify(&parts.headers)
    }
}

/// Validate the role and self-id headers.
pub fn identify(headers: &HeaderMap) -> Result<RemoteIdentity, HandshakeRejection> {
    let role = headers
        .get(CLIENT_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(HandshakeRejection::bad_request("Missing X-Client-Role header"))?;
    if !role.eq_ignore_ascii_case("universal") {
        return Err(HandshakeRejection::bad_request("X-Client-Role must be Universal"));
    }

    let self_id = headers
        .get(SELF_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or(HandshakeRejection::bad_request("Missing or non-numeric X-Self-ID header"))?;

    Ok(RemoteIdentity { self_id })
}

/// `Authorization: Bearer <token>` or `Authorization: Token <token>`.
fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("Token "))
        .map(str::trim)
}

/// `?access_token=<token>`, for implementations that cannot set headers.
fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("access_token="))
}
