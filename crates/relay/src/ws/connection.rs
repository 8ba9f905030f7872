// Per-connection context.
//
// Created when a socket is upgraded and dropped when its loop ends. Every
// client event is applied through it, so the authenticated identity and
// the set of joined rooms are never looked up from shared state.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use coderoom_common::protocol::ws::{ClientEvent, ServerEvent};
use coderoom_common::types::Point;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::mailbox::Mailbox;
use crate::auth::middleware::AuthenticatedUser;
use crate::error::RoomError;
use crate::metrics;
use crate::presence::Participant;
use crate::room::{Caller, LeaveReason, Ping, RoomHandle, RoomRegistry, WhiteboardOp};
use crate::signaling::{CallEventKind, SignalEnvelope};

pub(crate) struct ConnectionContext {
    pub(crate) connection_id: Uuid,
    pub(crate) user: AuthenticatedUser,
    pub(crate) mailbox: Arc<Mailbox>,
    registry: RoomRegistry,
    /// Joined rooms in join order.
    rooms: Vec<(String, RoomHandle)>,
}

impl ConnectionContext {
    pub(crate) fn new(
        user: AuthenticatedUser,
        registry: RoomRegistry,
        queue_capacity: usize,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user,
            mailbox: Arc::new(Mailbox::new(queue_capacity)),
            registry,
            rooms: Vec::new(),
        }
    }

    fn caller(&self) -> Caller {
        Caller { user_id: self.user.user_id.clone(), connection_id: self.connection_id }
    }

    fn participant(&self) -> Participant {
        Participant::new(
            self.user.user_id.clone(),
            self.user.username.clone(),
            self.connection_id,
            &self.mailbox,
        )
    }

    fn room(&self, room_id: &str) -> Result<RoomHandle, RoomError> {
        self.rooms
            .iter()
            .find(|(id, _)| id == room_id)
            .map(|(_, handle)| handle.clone())
            .ok_or(RoomError::NotAParticipant)
    }

    pub(crate) fn joined_rooms(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(|(id, _)| id.as_str())
    }

    /// Drops a room from this connection without telling the room.
    pub(crate) fn forget_room(&mut self, room_id: &str) -> Option<RoomHandle> {
        let index = self.rooms.iter().position(|(id, _)| id == room_id)?;
        Some(self.rooms.remove(index).1)
    }

    /// Queues a reply for this connection only.
    pub(crate) fn reply(&self, event: ServerEvent) {
        if self.mailbox.push_event(event).is_err() {
            debug!(connection_id = %self.connection_id, "reply dropped; mailbox closed");
        }
    }

    /// Applies one client event. Rejections are reported back to this
    /// connection and never reach other participants.
    pub(crate) async fn handle_event(&mut self, event: ClientEvent) {
        let name = event.name();
        let room_id = event.room_id().map(ToOwned::to_owned);
        let started_at = Instant::now();

        let result = self.dispatch(event).await;
        metrics::record_ws_event(name, result.is_err(), started_at.elapsed().as_millis() as u64);

        if let Err(error) = result {
            warn!(
                connection_id = %self.connection_id,
                user_id = %self.user.user_id,
                room_id = room_id.as_deref().unwrap_or("-"),
                event = name,
                code = error.code().as_str(),
                %error,
                "client event rejected"
            );
            self.reply(error.to_event(room_id.as_deref()));
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), RoomError> {
        match event {
            ClientEvent::JoinRoom { room_id } => self.join(room_id).await,
            ClientEvent::LeaveRoom { room_id } => {
                let handle = self.forget_room(&room_id).ok_or(RoomError::NotAParticipant)?;
                handle.leave(self.caller(), LeaveReason::Explicit).await
            }
            ClientEvent::CodeChange { room_id, code, language, .. } => {
                let handle = self.room(&room_id)?;
                handle.apply_code_edit(self.caller(), code, language).await.map(|_| ())
            }
            ClientEvent::ChatMessage { room_id, message, .. } => {
                let handle = self.room(&room_id)?;
                handle.append_chat(self.caller(), message).await.map(|_| ())
            }
            ClientEvent::WhiteboardDraw { room_id, draw_data } => {
                self.whiteboard(&room_id, WhiteboardOp::Draw(draw_data)).await
            }
            ClientEvent::WhiteboardErase { room_id, x, y, radius } => {
                self.whiteboard(&room_id, WhiteboardOp::Erase { center: Point { x, y }, radius })
                    .await
            }
            ClientEvent::WhiteboardClear { room_id } => {
                self.whiteboard(&room_id, WhiteboardOp::Clear).await
            }
            ClientEvent::WhiteboardSyncRequest { room_id } => {
                self.room(&room_id)?.whiteboard_sync(self.caller()).await
            }
            ClientEvent::WhiteboardCursor { room_id, position, color } => {
                self.room(&room_id)?
                    .ping(self.caller(), Ping::WhiteboardCursor { position, color });
                Ok(())
            }
            ClientEvent::CursorPing { room_id, payload } => {
                self.room(&room_id)?.ping(self.caller(), Ping::Generic(payload));
                Ok(())
            }
            ClientEvent::VideoOffer { room_id, offer, to } => {
                self.relay_signal(Some(room_id), to, SignalEnvelope::offer(offer)).await
            }
            ClientEvent::VideoAnswer { room_id, answer, to } => {
                self.relay_signal(room_id, to, SignalEnvelope::answer(answer)).await
            }
            ClientEvent::IceCandidate { room_id, candidate, to } => {
                self.relay_signal(room_id, to, SignalEnvelope::ice_candidate(candidate)).await
            }
            ClientEvent::ScreenShareStart { room_id } => {
                self.room(&room_id)?
                    .broadcast_call_event(self.caller(), CallEventKind::ScreenShareStart)
                    .await
            }
            ClientEvent::ScreenShareStop { room_id } => {
                self.room(&room_id)?
                    .broadcast_call_event(self.caller(), CallEventKind::ScreenShareStop)
                    .await
            }
            ClientEvent::Heartbeat => {
                let server_time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                self.reply(ServerEvent::HeartbeatAck { server_time });
                Ok(())
            }
        }
    }

    async fn join(&mut self, room_id: String) -> Result<(), RoomError> {
        let handle = match self.registry.join(&room_id, self.participant()).await {
            Ok(handle) => handle,
            Err(error) => {
                // A failed rejoin has already removed this connection from the roster.
                self.forget_room(&room_id);
                return Err(error);
            }
        };
        if self.room(&room_id).is_err() {
            info!(
                connection_id = %self.connection_id,
                user_id = %self.user.user_id,
                room_id = %room_id,
                "joined room"
            );
            self.rooms.push((room_id, handle));
        }
        Ok(())
    }

    async fn whiteboard(&self, room_id: &str, op: WhiteboardOp) -> Result<(), RoomError> {
        self.room(room_id)?.apply_whiteboard_op(self.caller(), op).await
    }

    /// Without a room id, the first joined room whose roster holds the
    /// target is used.
    async fn relay_signal(
        &self,
        room_id: Option<String>,
        target: String,
        envelope: SignalEnvelope,
    ) -> Result<(), RoomError> {
        if let Some(room_id) = room_id {
            return self.room(&room_id)?.relay_signal(self.caller(), target, envelope).await;
        }
        if self.rooms.is_empty() {
            return Err(RoomError::NotAParticipant);
        }

        for (_, handle) in &self.rooms {
            match handle.relay_signal(self.caller(), target.clone(), envelope.clone()).await {
                Err(RoomError::TargetUnavailable { .. }) => continue,
                other => return other,
            }
        }
        Err(RoomError::TargetUnavailable { target })
    }

    /// Sends a synthetic leave to every joined room.
    pub(crate) fn leave_all(&mut self, reason: LeaveReason) {
        let caller = self.caller();
        for (room_id, handle) in self.rooms.drain(..) {
            debug!(
                connection_id = %self.connection_id,
                user_id = %caller.user_id,
                room_id = %room_id,
                reason = reason.as_str(),
                "leaving room on disconnect"
            );
            handle.leave_detached(caller.clone(), reason);
        }
    }
}
