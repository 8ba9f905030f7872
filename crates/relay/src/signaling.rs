// Point-to-point WebRTC signaling and call-state notifications.
//
// Payloads are opaque: offers, answers and ICE candidates are forwarded
// exactly as the browser produced them.

use coderoom_common::protocol::ws::ServerEvent;
use serde_json::Value;

use crate::error::RoomError;
use crate::presence::{Participant, Roster};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub payload: Value,
}

impl SignalEnvelope {
    pub fn offer(payload: Value) -> Self {
        Self { kind: SignalKind::Offer, payload }
    }

    pub fn answer(payload: Value) -> Self {
        Self { kind: SignalKind::Answer, payload }
    }

    pub fn ice_candidate(payload: Value) -> Self {
        Self { kind: SignalKind::IceCandidate, payload }
    }

    /// The event the target receives, stamped with the sender's identity.
    pub fn into_event(self, room_id: &str, sender: &Participant) -> ServerEvent {
        let room_id = room_id.to_string();
        let from = sender.user_id.clone();
        match self.kind {
            SignalKind::Offer => ServerEvent::VideoOffer {
                room_id,
                offer: self.payload,
                from,
                username: sender.username.clone(),
            },
            SignalKind::Answer => ServerEvent::VideoAnswer { room_id, answer: self.payload, from },
            SignalKind::IceCandidate => {
                ServerEvent::IceCandidate { room_id, candidate: self.payload, from }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEventKind {
    ScreenShareStart,
    ScreenShareStop,
}

impl CallEventKind {
    pub fn into_event(self, room_id: &str, sender: &Participant) -> ServerEvent {
        let room_id = room_id.to_string();
        let user_id = sender.user_id.clone();
        let username = sender.username.clone();
        match self {
            Self::ScreenShareStart => ServerEvent::UserScreenSharing { room_id, user_id, username },
            Self::ScreenShareStop => {
                ServerEvent::UserStoppedScreenSharing { room_id, user_id, username }
            }
        }
    }
}

/// Resolves a signaling target within the room.
///
/// The sender must be a member and may not address itself.
pub fn resolve_target<'a>(
    roster: &'a Roster,
    sender: &Participant,
    target: &str,
) -> Result<&'a Participant, RoomError> {
    if target.trim().is_empty() {
        return Err(RoomError::malformed("signaling target must not be empty"));
    }
    if target == sender.user_id {
        return Err(RoomError::malformed("signaling target must be another participant"));
    }
    roster.get(target).ok_or_else(|| RoomError::TargetUnavailable { target: target.to_string() })
}
