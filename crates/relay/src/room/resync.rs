// Point-in-time room state handed to a joining participant.
//
// The snapshot is captured inside the same serialized room operation that
// admits the join, so every later delta is strictly newer than it.

use coderoom_common::protocol::ws::ServerEvent;
use coderoom_common::types::{ChatMessage, DrawData, ParticipantInfo};

use super::session::CodeDocument;

#[derive(Debug, Clone, PartialEq)]
pub struct ResyncSnapshot {
    pub room_id: String,
    pub participants: Vec<ParticipantInfo>,
    pub document: CodeDocument,
    pub objects: Vec<DrawData>,
    pub chat: Vec<ChatMessage>,
    /// Room sequence number the snapshot reflects.
    pub sequence: u64,
}

impl ResyncSnapshot {
    /// Events in the order a joining client receives them.
    pub fn to_events(&self) -> Vec<ServerEvent> {
        vec![
            ServerEvent::RoomParticipants {
                room_id: self.room_id.clone(),
                participants: self.participants.clone(),
            },
            ServerEvent::CodeSync {
                room_id: self.room_id.clone(),
                code: self.document.content.clone(),
                language: self.document.language.clone(),
                revision: self.document.revision,
            },
            ServerEvent::WhiteboardSync {
                room_id: self.room_id.clone(),
                objects: self.objects.clone(),
            },
            ServerEvent::ChatHistory { room_id: self.room_id.clone(), messages: self.chat.clone() },
        ]
    }
}
