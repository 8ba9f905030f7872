// Room membership and connection liveness.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use coderoom_common::protocol::ws::ServerEvent;
use coderoom_common::types::ParticipantInfo;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::RoomError;
use crate::ws::mailbox::{Mailbox, Outbound};

/// One connection's membership in one room.
///
/// The room only holds a weak reference to the connection's mailbox; a
/// dropped connection shows up as a failed delivery and is reaped.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub connection_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    mailbox: Weak<Mailbox>,
}

impl Participant {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        connection_id: Uuid,
        mailbox: &Arc<Mailbox>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            username: username.into(),
            connection_id,
            joined_at: now,
            last_seen: now,
            mailbox: Arc::downgrade(mailbox),
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            joined_at: self.joined_at,
        }
    }

    /// Queue an event; `false` means the connection is gone or overflowed.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        self.send(Outbound::Event(event))
    }

    pub fn send(&self, item: Outbound) -> bool {
        match self.mailbox.upgrade() {
            Some(mailbox) => mailbox.push(item).is_ok(),
            None => false,
        }
    }

    fn is_connection(&self, user_id: &str, connection_id: Uuid) -> bool {
        self.user_id == user_id && self.connection_id == connection_id
    }
}

#[derive(Debug)]
pub enum Admission {
    Joined,
    /// Same connection joined again; membership is unchanged.
    Rejoined,
    /// A newer connection took over the user's slot.
    Replaced { stale: Participant },
}

/// Participants of a room in join order, at most one entry per user.
#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn admit(
        &mut self,
        mut participant: Participant,
        max_participants: usize,
    ) -> Result<Admission, RoomError> {
        if let Some(index) = self.position(&participant.user_id) {
            let existing = &mut self.participants[index];
            if existing.connection_id == participant.connection_id {
                existing.username = participant.username;
                existing.last_seen = participant.last_seen;
                return Ok(Admission::Rejoined);
            }
            participant.joined_at = Utc::now();
            let stale = self.participants.remove(index);
            self.participants.push(participant);
            return Ok(Admission::Replaced { stale });
        }

        if self.participants.len() >= max_participants {
            return Err(RoomError::RoomFull { max: max_participants });
        }
        self.participants.push(participant);
        Ok(Admission::Joined)
    }

    /// Removes the member only if it is still the given connection.
    pub fn remove(&mut self, user_id: &str, connection_id: Uuid) -> Option<Participant> {
        let index =
            self.participants.iter().position(|p| p.is_connection(user_id, connection_id))?;
        Some(self.participants.remove(index))
    }

    pub fn member(&self, user_id: &str, connection_id: Uuid) -> Result<&Participant, RoomError> {
        self.participants
            .iter()
            .find(|p| p.is_connection(user_id, connection_id))
            .ok_or(RoomError::NotAParticipant)
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.position(user_id).is_some()
    }

    pub fn touch(&mut self, user_id: &str, connection_id: Uuid, at: DateTime<Utc>) {
        if let Some(participant) =
            self.participants.iter_mut().find(|p| p.is_connection(user_id, connection_id))
        {
            participant.last_seen = at;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn infos(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(Participant::info).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Empties the roster, handing back everyone who was in it.
    pub fn drain(&mut self) -> Vec<Participant> {
        std::mem::take(&mut self.participants)
    }

    fn position(&self, user_id: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.user_id == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Joined,
    Left,
}

#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub room_id: String,
    pub participant: ParticipantInfo,
    pub kind: PresenceKind,
    pub at: DateTime<Utc>,
}

impl PresenceEvent {
    pub fn joined(room_id: &str, participant: &Participant) -> Self {
        Self::new(room_id, participant, PresenceKind::Joined)
    }

    pub fn left(room_id: &str, participant: &Participant) -> Self {
        Self::new(room_id, participant, PresenceKind::Left)
    }

    fn new(room_id: &str, participant: &Participant, kind: PresenceKind) -> Self {
        Self { room_id: room_id.to_string(), participant: participant.info(), kind, at: Utc::now() }
    }

    pub fn to_server_event(&self) -> ServerEvent {
        match self.kind {
            PresenceKind::Joined => ServerEvent::UserJoined {
                room_id: self.room_id.clone(),
                participant: self.participant.clone(),
            },
            PresenceKind::Left => ServerEvent::UserLeft {
                room_id: self.room_id.clone(),
                user_id: self.participant.user_id.clone(),
                username: self.participant.username.clone(),
            },
        }
    }
}

/// Inbound-traffic watchdog for one connection.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    last_seen: Instant,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self { last_seen: Instant::now(), timeout }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn silence(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_seen)
    }

    pub fn is_expired(&self) -> bool {
        self.silence() > self.timeout
    }
}
