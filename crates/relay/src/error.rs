use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use coderoom_common::protocol::ws::ServerEvent;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthInvalidToken,
    RoomFull,
    DuplicateParticipant,
    NotAParticipant,
    TargetUnavailable,
    MalformedPayload,
    RoomFailed,
    NotFound,
    UpgradeRequired,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::RoomFull => "ROOM_FULL",
            Self::DuplicateParticipant => "DUPLICATE_PARTICIPANT",
            Self::NotAParticipant => "NOT_A_PARTICIPANT",
            Self::TargetUnavailable => "TARGET_UNAVAILABLE",
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
            Self::RoomFailed => "ROOM_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::RoomFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::DuplicateParticipant => StatusCode::CONFLICT,
            Self::NotAParticipant => StatusCode::FORBIDDEN,
            Self::TargetUnavailable => StatusCode::GONE,
            Self::MalformedPayload => StatusCode::BAD_REQUEST,
            Self::RoomFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may repeat the same request and expect a
    /// different outcome (after rejoining or waiting).
    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::RoomFull
                | Self::DuplicateParticipant
                | Self::NotAParticipant
                | Self::RoomFailed
                | Self::InternalError
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "invalid identity token",
            Self::RoomFull => "room has reached its participant limit",
            Self::DuplicateParticipant => "replaced by a newer connection for the same user",
            Self::NotAParticipant => "join the room before sending room events",
            Self::TargetUnavailable => "signaling target is not in the room",
            Self::MalformedPayload => "event payload is malformed",
            Self::RoomFailed => "room failed and was closed; reconnect to resync",
            Self::NotFound => "requested resource not found",
            Self::UpgradeRequired => "client protocol version is not supported",
            Self::InternalError => "internal server error",
        }
    }
}

/// Failures of operations applied to a room.
///
/// All of them are reported to the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room is full ({max} participants)")]
    RoomFull { max: usize },
    #[error("replaced by a newer connection for the same user")]
    DuplicateParticipant,
    #[error("not a participant of this room")]
    NotAParticipant,
    #[error("signaling target `{target}` is not in the room")]
    TargetUnavailable { target: String },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("room failed: {0}")]
    RoomFailed(String),
}

impl RoomError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload(reason.into())
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RoomFull { .. } => ErrorCode::RoomFull,
            Self::DuplicateParticipant => ErrorCode::DuplicateParticipant,
            Self::NotAParticipant => ErrorCode::NotAParticipant,
            Self::TargetUnavailable { .. } => ErrorCode::TargetUnavailable,
            Self::MalformedPayload(_) => ErrorCode::MalformedPayload,
            Self::RoomFailed(_) => ErrorCode::RoomFailed,
        }
    }

    /// Error frame for the originating connection.
    pub fn to_event(&self, room_id: Option<&str>) -> ServerEvent {
        let code = self.code();
        ServerEvent::Error {
            code: code.as_str().to_string(),
            message: self.to_string(),
            retryable: code.retryable(),
            room_id: room_id.map(ToOwned::to_owned),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
