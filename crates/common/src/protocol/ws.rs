// WebSocket event types for the coderoom.v1 room protocol.
//
// Every frame is one JSON object tagged by its event name, e.g.
// `{"type": "code-change", "roomId": "r1", "code": "...", "language": "rust"}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChatMessage, CursorPosition, DrawData, ParticipantInfo};

pub const CURRENT_PROTOCOL_VERSION: &str = "coderoom.v1";

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        room_id: String,
    },

    LeaveRoom {
        room_id: String,
    },

    /// Whole-document replace. `user_id` is accepted for older clients and ignored.
    CodeChange {
        room_id: String,
        code: String,
        language: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// `user_id`, `username` and `timestamp` are client hints; the room
    /// assigns the authoritative values.
    ChatMessage {
        room_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },

    WhiteboardDraw {
        room_id: String,
        draw_data: DrawData,
    },

    WhiteboardErase {
        room_id: String,
        x: f64,
        y: f64,
        radius: f64,
    },

    WhiteboardClear {
        room_id: String,
    },

    WhiteboardSyncRequest {
        room_id: String,
    },

    WhiteboardCursor {
        room_id: String,
        position: CursorPosition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },

    CursorPing {
        room_id: String,
        payload: Value,
    },

    VideoOffer {
        room_id: String,
        offer: Value,
        to: String,
    },

    VideoAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        answer: Value,
        to: String,
    },

    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        candidate: Value,
        to: String,
    },

    ScreenShareStart {
        room_id: String,
    },

    ScreenShareStop {
        room_id: String,
    },

    Heartbeat,
}

impl ClientEvent {
    /// Wire name of the event, used for logging and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::CodeChange { .. } => "code-change",
            Self::ChatMessage { .. } => "chat-message",
            Self::WhiteboardDraw { .. } => "whiteboard-draw",
            Self::WhiteboardErase { .. } => "whiteboard-erase",
            Self::WhiteboardClear { .. } => "whiteboard-clear",
            Self::WhiteboardSyncRequest { .. } => "whiteboard-sync-request",
            Self::WhiteboardCursor { .. } => "whiteboard-cursor",
            Self::CursorPing { .. } => "cursor-ping",
            Self::VideoOffer { .. } => "video-offer",
            Self::VideoAnswer { .. } => "video-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::ScreenShareStart { .. } => "screen-share-start",
            Self::ScreenShareStop { .. } => "screen-share-stop",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Room the event is scoped to, when the client named one.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::CodeChange { room_id, .. }
            | Self::ChatMessage { room_id, .. }
            | Self::WhiteboardDraw { room_id, .. }
            | Self::WhiteboardErase { room_id, .. }
            | Self::WhiteboardClear { room_id }
            | Self::WhiteboardSyncRequest { room_id }
            | Self::WhiteboardCursor { room_id, .. }
            | Self::CursorPing { room_id, .. }
            | Self::VideoOffer { room_id, .. }
            | Self::ScreenShareStart { room_id }
            | Self::ScreenShareStop { room_id } => Some(room_id),
            Self::VideoAnswer { room_id, .. } | Self::IceCandidate { room_id, .. } => {
                room_id.as_deref()
            }
            Self::Heartbeat => None,
        }
    }
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Full roster, sent to a participant right after it joins.
    RoomParticipants {
        room_id: String,
        participants: Vec<ParticipantInfo>,
    },

    UserJoined {
        room_id: String,
        #[serde(flatten)]
        participant: ParticipantInfo,
    },

    UserLeft {
        room_id: String,
        user_id: String,
        username: String,
    },

    /// Resync: the current document.
    CodeSync {
        room_id: String,
        code: String,
        language: String,
        revision: u64,
    },

    /// Delta: a newer document accepted from another participant.
    CodeUpdate {
        room_id: String,
        code: String,
        language: String,
        revision: u64,
        user_id: String,
    },

    /// Resync: retained chat transcript in acceptance order.
    ChatHistory {
        room_id: String,
        messages: Vec<ChatMessage>,
    },

    NewMessage {
        room_id: String,
        message: ChatMessage,
    },

    WhiteboardUpdate {
        room_id: String,
        draw_data: DrawData,
        user_id: String,
        username: String,
    },

    WhiteboardErased {
        room_id: String,
        object_ids: Vec<String>,
        user_id: String,
    },

    WhiteboardCleared {
        room_id: String,
        user_id: String,
    },

    WhiteboardSync {
        room_id: String,
        objects: Vec<DrawData>,
    },

    WhiteboardCursor {
        room_id: String,
        user_id: String,
        position: CursorPosition,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },

    CursorPing {
        room_id: String,
        user_id: String,
        payload: Value,
    },

    VideoOffer {
        room_id: String,
        offer: Value,
        from: String,
        username: String,
    },

    VideoAnswer {
        room_id: String,
        answer: Value,
        from: String,
    },

    IceCandidate {
        room_id: String,
        candidate: Value,
        from: String,
    },

    UserScreenSharing {
        room_id: String,
        user_id: String,
        username: String,
    },

    UserStoppedScreenSharing {
        room_id: String,
        user_id: String,
        username: String,
    },

    HeartbeatAck {
        server_time: String,
    },

    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
}

impl ServerEvent {
    /// Ephemeral events may be dropped under backpressure; everything else
    /// must be delivered or the connection torn down.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            Self::WhiteboardCursor { .. } | Self::CursorPing { .. } | Self::HeartbeatAck { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomParticipants { .. } => "room-participants",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::CodeSync { .. } => "code-sync",
            Self::CodeUpdate { .. } => "code-update",
            Self::ChatHistory { .. } => "chat-history",
            Self::NewMessage { .. } => "new-message",
            Self::WhiteboardUpdate { .. } => "whiteboard-update",
            Self::WhiteboardErased { .. } => "whiteboard-erased",
            Self::WhiteboardCleared { .. } => "whiteboard-cleared",
            Self::WhiteboardSync { .. } => "whiteboard-sync",
            Self::WhiteboardCursor { .. } => "whiteboard-cursor",
            Self::CursorPing { .. } => "cursor-ping",
            Self::VideoOffer { .. } => "video-offer",
            Self::VideoAnswer { .. } => "video-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::UserScreenSharing { .. } => "user-screen-sharing",
            Self::UserStoppedScreenSharing { .. } => "user-stopped-screen-sharing",
            Self::HeartbeatAck { .. } => "heartbeat-ack",
            Self::Error { .. } => "error",
        }
    }
}
