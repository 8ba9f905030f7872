use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::connection::ConnectionContext;
use super::mailbox::Outbound;
use super::protocol as ws_protocol;
use super::GatewayState;
use crate::auth::middleware::{extract_bearer_token, unauthorized_response, AuthenticatedUser};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, RoomError,
};
use crate::metrics;
use crate::presence::LivenessMonitor;
use crate::protocol;
use crate::room::LeaveReason;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub protocol: Option<String>,
}

/// Authenticates once, then upgrades. Bad tokens never reach the socket loop.
pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(version) = params.protocol.as_deref() {
        if let Err(error) = protocol::require_supported(version) {
            return error.into_response();
        }
    }

    let token = params.token.as_deref().map(str::trim).filter(|token| !token.is_empty()).or_else(
        || {
            headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(extract_bearer_token)
        },
    );
    let Some(token) = token else {
        return unauthorized_response("missing identity token");
    };

    let user = match state.token_service.validate_identity_token(token) {
        Ok(identity) => AuthenticatedUser::from(identity),
        Err(error) => {
            debug!(%error, "rejected identity token");
            return unauthorized_response("invalid identity token");
        }
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes)
        .max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, user, socket)).await;
        })
        .into_response()
}

fn frame_size_exceeded_reason(max_frame_bytes: usize) -> String {
    format!("websocket frame exceeds maximum size of {max_frame_bytes} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: String) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

async fn handle_socket(state: GatewayState, user: AuthenticatedUser, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let config = Arc::clone(&state.config);
    let mut context =
        ConnectionContext::new(user, state.registry.clone(), config.outbound_queue_capacity);
    let mailbox = Arc::clone(&context.mailbox);
    let connection_id = context.connection_id;
    let user_id = context.user.user_id.clone();

    metrics::adjust_active_connections(1);
    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        request_id = %request_id,
        "connection opened"
    );

    // The server pings every heartbeat interval; silence past the liveness
    // timeout ends the connection.
    let mut heartbeat_interval = tokio::time::interval(config.heartbeat_interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut liveness = LivenessMonitor::new(config.liveness_timeout);

    let reason = loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if liveness.is_expired() {
                    warn!(
                        connection_id = %connection_id,
                        user_id = %user_id,
                        silent_ms = liveness.silence().as_millis() as u64,
                        "liveness timeout, disconnecting"
                    );
                    break LeaveReason::Timeout;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break LeaveReason::Disconnected;
                }
            }
            outbound = mailbox.recv() => {
                match outbound {
                    Some(Outbound::Event(event)) => {
                        if ws_protocol::send_event(&mut socket, &event).await.is_err() {
                            break LeaveReason::Disconnected;
                        }
                    }
                    Some(Outbound::Evicted { room_id }) => {
                        context.forget_room(&room_id);
                        info!(
                            connection_id = %connection_id,
                            user_id = %user_id,
                            room_id = %room_id,
                            "evicted by a newer connection"
                        );
                        let error = RoomError::DuplicateParticipant.to_event(Some(&room_id));
                        if ws_protocol::send_event(&mut socket, &error).await.is_err() {
                            break LeaveReason::Disconnected;
                        }
                    }
                    Some(Outbound::Terminate { event }) => {
                        let _ = ws_protocol::send_event(&mut socket, &event).await;
                        close_with(&mut socket, close_code::ERROR, "room failed".to_string()).await;
                        break LeaveReason::Disconnected;
                    }
                    None if mailbox.is_overflowed() => {
                        warn!(
                            connection_id = %connection_id,
                            user_id = %user_id,
                            "outbound queue overflowed, disconnecting"
                        );
                        close_with(
                            &mut socket,
                            close_code::POLICY,
                            "outbound queue overflowed".to_string(),
                        )
                        .await;
                        break LeaveReason::Overflow;
                    }
                    None => break LeaveReason::Disconnected,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break LeaveReason::Disconnected;
                };
                liveness.touch();

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > config.max_frame_bytes {
                            close_with(
                                &mut socket,
                                close_code::SIZE,
                                frame_size_exceeded_reason(config.max_frame_bytes),
                            )
                            .await;
                            break LeaveReason::Disconnected;
                        }

                        match ws_protocol::decode_event(&raw_message) {
                            Ok(event) => context.handle_event(event).await,
                            Err(error) => {
                                metrics::record_ws_event("invalid", true, 0);
                                debug!(connection_id = %connection_id, %error, "undecodable frame");
                                context.reply(
                                    RoomError::malformed(format!("invalid event frame: {error}"))
                                        .to_event(None),
                                );
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        metrics::record_ws_event("invalid", true, 0);
                        context.reply(
                            RoomError::malformed("binary frames are not supported").to_event(None),
                        );
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break LeaveReason::Disconnected;
                        }
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break LeaveReason::Disconnected,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_with(
                                &mut socket,
                                close_code::SIZE,
                                frame_size_exceeded_reason(config.max_frame_bytes),
                            )
                            .await;
                        }
                        break LeaveReason::Disconnected;
                    }
                }
            }
        }
    };

    let joined_rooms = context.joined_rooms().count();
    context.leave_all(reason);
    mailbox.close();
    metrics::adjust_active_connections(-1);
    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        reason = reason.as_str(),
        joined_rooms,
        "connection closed"
    );
}
