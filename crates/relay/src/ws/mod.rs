// Connection gateway: WebSocket upgrade plus the read-only room REST view.

mod connection;
mod handler;
pub mod mailbox;
mod protocol;

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use coderoom_common::types::ParticipantInfo;
use serde::{Deserialize, Serialize};

use crate::auth::{
    jwt::IdentityTokenService,
    middleware::{require_bearer_auth, AuthenticatedUser},
};
use crate::config::GatewayConfig;
use crate::error::{ErrorCode, RelayError};
use crate::room::{validate_room_id, RoomRegistry};

pub use handler::ws_upgrade;

#[derive(Clone)]
pub struct GatewayState {
    pub(crate) token_service: Arc<IdentityTokenService>,
    pub(crate) registry: RoomRegistry,
    pub(crate) config: Arc<GatewayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomParticipantsResponse {
    pub room_id: String,
    pub participants: Vec<ParticipantInfo>,
}

pub fn router(
    token_service: Arc<IdentityTokenService>,
    registry: RoomRegistry,
    config: GatewayConfig,
) -> Router {
    let state = GatewayState {
        token_service: Arc::clone(&token_service),
        registry,
        config: Arc::new(config),
    };
    let auth_layer = middleware::from_fn_with_state(token_service, require_bearer_auth);

    Router::new()
        .route(
            "/v1/rooms/{room_id}/participants",
            get(room_participants).route_layer(auth_layer),
        )
        .route("/v1/ws", get(ws_upgrade))
        .with_state(state)
}

pub async fn room_participants(
    Path(room_id): Path<String>,
    Extension(_user): Extension<AuthenticatedUser>,
    State(state): State<GatewayState>,
) -> Response {
    if let Err(error) = validate_room_id(&room_id) {
        return RelayError::new(ErrorCode::MalformedPayload, error.to_string()).into_response();
    }

    match state.registry.participants(&room_id).await {
        Some(participants) => {
            Json(RoomParticipantsResponse { room_id, participants }).into_response()
        }
        None => RelayError::new(ErrorCode::NotFound, "room has no active session").into_response(),
    }
}
