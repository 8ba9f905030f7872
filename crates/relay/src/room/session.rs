// Authoritative state of one room.
//
// Every method runs to completion without awaiting; the owning actor calls
// them one at a time, which is what orders edits, board ops and chat the
// same way for every participant.

use std::collections::VecDeque;

use chrono::Utc;
use coderoom_common::protocol::ws::ServerEvent;
use coderoom_common::types::{ChatMessage, CursorPosition, ParticipantInfo};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::resync::ResyncSnapshot;
use super::whiteboard::{Whiteboard, WhiteboardOp};
use crate::config::RoomLimits;
use crate::error::RoomError;
use crate::presence::{Admission, Participant, PresenceEvent, Roster};
use crate::signaling::{self, CallEventKind, SignalEnvelope};
use crate::ws::mailbox::Outbound;

pub const DEFAULT_LANGUAGE: &str = "javascript";

/// Whole-document state. Edits replace it; the last accepted edit wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDocument {
    pub content: String,
    pub language: String,
    pub revision: u64,
}

impl Default for CodeDocument {
    fn default() -> Self {
        Self { content: String::new(), language: DEFAULT_LANGUAGE.to_string(), revision: 0 }
    }
}

/// The connection an operation is performed on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub connection_id: Uuid,
}

/// Best-effort presence payloads. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Ping {
    WhiteboardCursor { position: CursorPosition, color: Option<String> },
    Generic(Value),
}

#[derive(Debug)]
pub struct RoomSession {
    room_id: String,
    limits: RoomLimits,
    document: CodeDocument,
    whiteboard: Whiteboard,
    chat: VecDeque<ChatMessage>,
    roster: Roster,
    sequence: u64,
}

impl RoomSession {
    pub fn new(room_id: impl Into<String>, limits: RoomLimits) -> Self {
        Self {
            room_id: room_id.into(),
            limits,
            document: CodeDocument::default(),
            whiteboard: Whiteboard::default(),
            chat: VecDeque::new(),
            roster: Roster::default(),
            sequence: 0,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Admits a participant, queues its resync snapshot and announces it.
    ///
    /// The snapshot is queued before any later delta can be, so the
    /// participant sees no gap and no duplicate. A connection that cannot
    /// take the whole snapshot is not admitted.
    pub fn join(&mut self, participant: Participant) -> Result<ResyncSnapshot, RoomError> {
        let user_id = participant.user_id.clone();
        let connection_id = participant.connection_id;

        let admission = self.roster.admit(participant, self.limits.max_participants)?;
        let newcomer = self.roster.member(&user_id, connection_id)?.clone();

        match &admission {
            Admission::Replaced { stale } => {
                info!(
                    room_id = %self.room_id,
                    user_id = %user_id,
                    stale_connection_id = %stale.connection_id,
                    connection_id = %connection_id,
                    "evicting stale connection for duplicate participant"
                );
                stale.send(Outbound::Evicted { room_id: self.room_id.clone() });
            }
            Admission::Joined => {
                info!(room_id = %self.room_id, user_id = %user_id, "participant joined");
            }
            Admission::Rejoined => {
                debug!(room_id = %self.room_id, user_id = %user_id, "participant resynced");
            }
        }

        self.sequence += 1;
        let snapshot = self.snapshot();
        let delivered = snapshot.to_events().into_iter().all(|event| newcomer.deliver(event));
        if !delivered {
            warn!(room_id = %self.room_id, user_id = %user_id, "joining connection went away");
            self.roster.remove(&user_id, connection_id);
            if !matches!(admission, Admission::Joined) {
                let left = PresenceEvent::left(&self.room_id, &newcomer).to_server_event();
                self.broadcast(left, None);
            }
            return Err(RoomError::RoomFailed("resync could not be delivered".to_string()));
        }

        if !matches!(admission, Admission::Rejoined) {
            let joined = PresenceEvent::joined(&self.room_id, &newcomer).to_server_event();
            self.broadcast(joined, Some(&user_id));
        }
        Ok(snapshot)
    }

    pub fn leave(&mut self, caller: &Caller) -> Result<PresenceEvent, RoomError> {
        let gone = self
            .roster
            .remove(&caller.user_id, caller.connection_id)
            .ok_or(RoomError::NotAParticipant)?;
        self.sequence += 1;
        info!(room_id = %self.room_id, user_id = %gone.user_id, "participant left");

        let event = PresenceEvent::left(&self.room_id, &gone);
        self.broadcast(event.to_server_event(), None);
        Ok(event)
    }

    /// Replaces the document and returns the new revision.
    pub fn apply_code_edit(
        &mut self,
        caller: &Caller,
        content: String,
        language: String,
    ) -> Result<u64, RoomError> {
        let sender = self.member(caller)?;
        if content.len() > self.limits.max_code_bytes {
            return Err(RoomError::malformed(format!(
                "code exceeds {} bytes",
                self.limits.max_code_bytes
            )));
        }
        if language.trim().is_empty() {
            return Err(RoomError::malformed("language must not be empty"));
        }

        self.document.content = content;
        self.document.language = language;
        self.document.revision += 1;
        self.sequence += 1;
        debug!(
            room_id = %self.room_id,
            user_id = %sender.user_id,
            revision = self.document.revision,
            bytes = self.document.content.len(),
            "code edit accepted"
        );

        let update = ServerEvent::CodeUpdate {
            room_id: self.room_id.clone(),
            code: self.document.content.clone(),
            language: self.document.language.clone(),
            revision: self.document.revision,
            user_id: sender.user_id.clone(),
        };
        self.broadcast(update, Some(&sender.user_id));
        Ok(self.document.revision)
    }

    /// Applies a board op and forwards the op itself to everyone else.
    pub fn apply_whiteboard_op(
        &mut self,
        caller: &Caller,
        op: WhiteboardOp,
    ) -> Result<(), RoomError> {
        let sender = self.member(caller)?;
        let op_name = op.name();

        let event = match op {
            WhiteboardOp::Draw(draw_data) => {
                self.whiteboard.upsert(
                    draw_data.clone(),
                    &sender.user_id,
                    self.limits.max_whiteboard_objects,
                )?;
                Some(ServerEvent::WhiteboardUpdate {
                    room_id: self.room_id.clone(),
                    draw_data,
                    user_id: sender.user_id.clone(),
                    username: sender.username.clone(),
                })
            }
            WhiteboardOp::Erase { center, radius } => {
                let object_ids = self.whiteboard.erase(center, radius)?;
                (!object_ids.is_empty()).then(|| ServerEvent::WhiteboardErased {
                    room_id: self.room_id.clone(),
                    object_ids,
                    user_id: sender.user_id.clone(),
                })
            }
            WhiteboardOp::Clear => {
                self.whiteboard.clear();
                Some(ServerEvent::WhiteboardCleared {
                    room_id: self.room_id.clone(),
                    user_id: sender.user_id.clone(),
                })
            }
        };

        self.sequence += 1;
        debug!(
            room_id = %self.room_id,
            user_id = %sender.user_id,
            op = op_name,
            objects = self.whiteboard.len(),
            "whiteboard op accepted"
        );
        if let Some(event) = event {
            self.broadcast(event, Some(&sender.user_id));
        }
        Ok(())
    }

    /// Appends a message and echoes it to every participant, sender included.
    pub fn append_chat(&mut self, caller: &Caller, body: &str) -> Result<ChatMessage, RoomError> {
        let sender = self.member(caller)?;
        if body.trim().is_empty() {
            return Err(RoomError::malformed("chat message must not be empty"));
        }
        if body.len() > self.limits.max_chat_bytes {
            return Err(RoomError::malformed(format!(
                "chat message exceeds {} bytes",
                self.limits.max_chat_bytes
            )));
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            user_id: sender.user_id.clone(),
            username: sender.username.clone(),
            message: body.to_string(),
            timestamp: Utc::now(),
        };
        self.chat.push_back(message.clone());
        while self.chat.len() > self.limits.chat_history_limit {
            self.chat.pop_front();
        }
        self.sequence += 1;

        self.broadcast(
            ServerEvent::NewMessage { room_id: self.room_id.clone(), message: message.clone() },
            None,
        );
        Ok(message)
    }

    /// Forwards a cursor or presence ping to everyone else. May be shed under load.
    pub fn cursor_or_presence_ping(
        &mut self,
        caller: &Caller,
        ping: Ping,
    ) -> Result<(), RoomError> {
        let sender = self.member(caller)?;
        let event = match ping {
            Ping::WhiteboardCursor { position, color } => ServerEvent::WhiteboardCursor {
                room_id: self.room_id.clone(),
                user_id: sender.user_id.clone(),
                position,
                username: sender.username.clone(),
                color,
            },
            Ping::Generic(payload) => ServerEvent::CursorPing {
                room_id: self.room_id.clone(),
                user_id: sender.user_id.clone(),
                payload,
            },
        };
        self.broadcast(event, Some(&sender.user_id));
        Ok(())
    }

    /// Sends the full board to the caller only.
    pub fn whiteboard_sync(&mut self, caller: &Caller) -> Result<(), RoomError> {
        let sender = self.member(caller)?;
        let event = ServerEvent::WhiteboardSync {
            room_id: self.room_id.clone(),
            objects: self.whiteboard.snapshot(),
        };
        self.send_to(&sender, event);
        Ok(())
    }

    pub fn relay_signal(
        &mut self,
        caller: &Caller,
        target: &str,
        envelope: SignalEnvelope,
    ) -> Result<(), RoomError> {
        let sender = self.member(caller)?;
        let recipient = signaling::resolve_target(&self.roster, &sender, target)?.clone();
        let event = envelope.into_event(&self.room_id, &sender);
        if self.send_to(&recipient, event) {
            Ok(())
        } else {
            Err(RoomError::TargetUnavailable { target: target.to_string() })
        }
    }

    pub fn broadcast_call_event(
        &mut self,
        caller: &Caller,
        kind: CallEventKind,
    ) -> Result<(), RoomError> {
        let sender = self.member(caller)?;
        info!(room_id = %self.room_id, user_id = %sender.user_id, ?kind, "call event");
        self.broadcast(kind.into_event(&self.room_id, &sender), Some(&sender.user_id));
        Ok(())
    }

    /// Disconnects everyone with a `ROOM_FAILED` error. Returns how many were dropped.
    pub fn fail(&mut self, reason: &str) -> usize {
        let event = RoomError::RoomFailed(reason.to_string()).to_event(Some(&self.room_id));
        let participants = self.roster.drain();
        for participant in &participants {
            participant.send(Outbound::Terminate { event: event.clone() });
        }
        participants.len()
    }

    pub fn snapshot(&self) -> ResyncSnapshot {
        ResyncSnapshot {
            room_id: self.room_id.clone(),
            participants: self.roster.infos(),
            document: self.document.clone(),
            objects: self.whiteboard.snapshot(),
            chat: self.chat.iter().cloned().collect(),
            sequence: self.sequence,
        }
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.roster.infos()
    }

    pub fn document(&self) -> &CodeDocument {
        &self.document
    }

    pub fn whiteboard(&self) -> &Whiteboard {
        &self.whiteboard
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    fn member(&mut self, caller: &Caller) -> Result<Participant, RoomError> {
        let participant = self.roster.member(&caller.user_id, caller.connection_id)?.clone();
        self.roster.touch(&caller.user_id, caller.connection_id, Utc::now());
        Ok(participant)
    }

    /// Delivers to one participant, reaping it if its connection is gone.
    fn send_to(&mut self, participant: &Participant, event: ServerEvent) -> bool {
        if participant.deliver(event) {
            return true;
        }
        if let Some(gone) = self.roster.remove(&participant.user_id, participant.connection_id) {
            warn!(
                room_id = %self.room_id,
                user_id = %gone.user_id,
                "dropping unreachable participant"
            );
            self.broadcast(PresenceEvent::left(&self.room_id, &gone).to_server_event(), None);
        }
        false
    }

    /// Delivers to every participant except `exclude`.
    ///
    /// Participants whose mailbox is gone or overflowed are removed and
    /// announced as left to the rest.
    fn broadcast(&mut self, event: ServerEvent, exclude: Option<&str>) {
        let mut pending = VecDeque::from([(event, exclude.map(ToOwned::to_owned))]);
        while let Some((event, exclude)) = pending.pop_front() {
            let unreachable: Vec<(String, Uuid)> = self
                .roster
                .iter()
                .filter(|p| exclude.as_deref() != Some(p.user_id.as_str()))
                .filter(|p| !p.deliver(event.clone()))
                .map(|p| (p.user_id.clone(), p.connection_id))
                .collect();

            for (user_id, connection_id) in unreachable {
                if let Some(gone) = self.roster.remove(&user_id, connection_id) {
                    warn!(
                        room_id = %self.room_id,
                        user_id = %gone.user_id,
                        event = event.name(),
                        "dropping unreachable participant"
                    );
                    self.sequence += 1;
                    let left = PresenceEvent::left(&self.room_id, &gone).to_server_event();
                    pending.push_back((left, None));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use coderoom_common::types::{DrawData, Point, ShapeKind};
    use serde_json::json;

    use super::*;
    use crate::ws::mailbox::Mailbox;

    struct Client {
        caller: Caller,
        mailbox: Arc<Mailbox>,
    }

    impl Client {
        fn new(user_id: &str) -> Self {
            Self::with_capacity(user_id, 64)
        }

        fn with_capacity(user_id: &str, capacity: usize) -> Self {
            Self {
                caller: Caller { user_id: user_id.to_string(), connection_id: Uuid::new_v4() },
                mailbox: Arc::new(Mailbox::new(capacity)),
            }
        }

        fn participant(&self) -> Participant {
            Participant::new(
                self.caller.user_id.clone(),
                self.caller.user_id.to_uppercase(),
                self.caller.connection_id,
                &self.mailbox,
            )
        }

        fn join(&self, room: &mut RoomSession) -> ResyncSnapshot {
            room.join(self.participant()).expect("join should succeed")
        }

        fn drain(&self) -> Vec<Outbound> {
            std::iter::from_fn(|| self.mailbox.try_recv()).collect()
        }

        fn events(&self) -> Vec<ServerEvent> {
            self.drain()
                .into_iter()
                .filter_map(|item| match item {
                    Outbound::Event(event) => Some(event),
                    _ => None,
                })
                .collect()
        }

        fn event_names(&self) -> Vec<&'static str> {
            self.events().iter().map(ServerEvent::name).collect()
        }
    }

    fn room() -> RoomSession {
        RoomSession::new("r1", RoomLimits::default())
    }

    fn stroke(id: &str, x: f64) -> DrawData {
        DrawData {
            id: id.to_string(),
            kind: ShapeKind::Pen,
            points: vec![Point { x, y: 0.0 }, Point { x: x + 1.0, y: 0.0 }],
            bounds: None,
            text: None,
            color: "#ff0000".to_string(),
            width: 2.0,
        }
    }

    fn board_ids(room: &RoomSession) -> Vec<String> {
        room.whiteboard().snapshot().into_iter().map(|object| object.id).collect()
    }

    #[test]
    fn join_queues_resync_then_streams_deltas() {
        let mut room = room();
        let a = Client::new("a");
        a.join(&mut room);

        assert_eq!(
            a.event_names(),
            vec!["room-participants", "code-sync", "whiteboard-sync", "chat-history"]
        );

        let b = Client::new("b");
        b.join(&mut room);
        assert_eq!(a.event_names(), vec!["user-joined"]);
        match &b.events()[0] {
            ServerEvent::RoomParticipants { participants, .. } => {
                let ids: Vec<_> = participants.iter().map(|p| p.user_id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn last_code_edit_wins_and_sender_gets_no_echo() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        a.drain();
        b.drain();

        room.apply_code_edit(&a.caller, "print(1)".into(), "python".into()).unwrap();
        room.apply_code_edit(&b.caller, "print(2)".into(), "python".into()).unwrap();

        assert_eq!(
            a.events(),
            vec![ServerEvent::CodeUpdate {
                room_id: "r1".into(),
                code: "print(2)".into(),
                language: "python".into(),
                revision: 2,
                user_id: "b".into(),
            }]
        );
        let b_events = b.events();
        assert_eq!(b_events.len(), 1);
        assert!(matches!(
            &b_events[0],
            ServerEvent::CodeUpdate { code, revision: 1, .. } if code == "print(1)"
        ));
        assert_eq!(room.document().content, "print(2)");
        assert_eq!(room.document().revision, 2);

        let c = Client::new("c");
        let snapshot = c.join(&mut room);
        assert_eq!(snapshot.document.content, "print(2)");
        assert_eq!(snapshot.document.revision, 2);
        assert!(c.events().contains(&ServerEvent::CodeSync {
            room_id: "r1".into(),
            code: "print(2)".into(),
            language: "python".into(),
            revision: 2,
        }));
    }

    #[test]
    fn draw_clear_draw_converges_to_last_object() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        a.drain();
        b.drain();

        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Draw(stroke("s1", 0.0))).unwrap();
        room.apply_whiteboard_op(&b.caller, WhiteboardOp::Clear).unwrap();
        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Draw(stroke("s2", 5.0))).unwrap();

        assert_eq!(board_ids(&room), vec!["s2"]);
        assert_eq!(a.event_names(), vec!["whiteboard-cleared"]);
        assert_eq!(b.event_names(), vec!["whiteboard-update", "whiteboard-update"]);
    }

    #[test]
    fn repeated_clear_is_a_no_op() {
        let mut room = room();
        let a = Client::new("a");
        a.join(&mut room);
        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Draw(stroke("s1", 0.0))).unwrap();

        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Clear).unwrap();
        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Clear).unwrap();
        assert!(room.whiteboard().is_empty());
    }

    #[test]
    fn erase_broadcasts_removed_ids() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Draw(stroke("s1", 0.0))).unwrap();
        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Draw(stroke("s2", 50.0))).unwrap();
        b.drain();

        room.apply_whiteboard_op(
            &a.caller,
            WhiteboardOp::Erase { center: Point { x: 0.5, y: 0.0 }, radius: 2.0 },
        )
        .unwrap();

        assert_eq!(
            b.events(),
            vec![ServerEvent::WhiteboardErased {
                room_id: "r1".into(),
                object_ids: vec!["s1".into()],
                user_id: "a".into(),
            }]
        );
        assert_eq!(board_ids(&room), vec!["s2"]);
    }

    #[test]
    fn chat_is_echoed_to_everyone_and_bounded() {
        let limits = RoomLimits { chat_history_limit: 2, ..RoomLimits::default() };
        let mut room = RoomSession::new("r1", limits);
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        a.drain();
        b.drain();

        for body in ["one", "two", "three"] {
            room.append_chat(&a.caller, body).unwrap();
        }

        assert_eq!(a.event_names(), vec!["new-message"; 3]);
        assert_eq!(b.event_names(), vec!["new-message"; 3]);
        let retained: Vec<_> = room.snapshot().chat.into_iter().map(|m| m.message).collect();
        assert_eq!(retained, vec!["two", "three"]);
    }

    #[test]
    fn chat_identity_comes_from_the_session() {
        let mut room = room();
        let a = Client::new("a");
        a.join(&mut room);

        let message = room.append_chat(&a.caller, "hello").unwrap();
        assert_eq!(message.user_id, "a");
        assert_eq!(message.username, "A");
        assert!(room.append_chat(&a.caller, "   ").is_err());
    }

    #[test]
    fn non_participant_operations_are_rejected_without_mutation() {
        let mut room = room();
        let a = Client::new("a");
        let outsider = Client::new("z");
        a.join(&mut room);
        a.drain();
        let before = room.sequence();

        assert_eq!(
            room.apply_code_edit(&outsider.caller, "x".into(), "rust".into()),
            Err(RoomError::NotAParticipant)
        );
        assert_eq!(
            room.apply_whiteboard_op(&outsider.caller, WhiteboardOp::Clear),
            Err(RoomError::NotAParticipant)
        );
        assert_eq!(
            room.append_chat(&outsider.caller, "hi").unwrap_err(),
            RoomError::NotAParticipant
        );
        assert_eq!(room.leave(&outsider.caller).unwrap_err(), RoomError::NotAParticipant);

        assert_eq!(room.sequence(), before);
        assert_eq!(room.document(), &CodeDocument::default());
        assert!(a.drain().is_empty());
    }

    #[test]
    fn malformed_edits_do_not_reach_others() {
        let limits = RoomLimits { max_code_bytes: 4, ..RoomLimits::default() };
        let mut room = RoomSession::new("r1", limits);
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        b.drain();

        assert!(matches!(
            room.apply_code_edit(&a.caller, "too long".into(), "rust".into()),
            Err(RoomError::MalformedPayload(_))
        ));
        assert!(matches!(
            room.apply_code_edit(&a.caller, "ok".into(), " ".into()),
            Err(RoomError::MalformedPayload(_))
        ));
        assert!(b.drain().is_empty());
        assert_eq!(room.document().revision, 0);
    }

    #[test]
    fn full_room_rejects_new_users() {
        let limits = RoomLimits { max_participants: 1, ..RoomLimits::default() };
        let mut room = RoomSession::new("r1", limits);
        Client::new("a").join(&mut room);

        let err = room.join(Client::new("b").participant()).unwrap_err();
        assert_eq!(err, RoomError::RoomFull { max: 1 });
        assert_eq!(room.participants().len(), 1);
    }

    #[test]
    fn duplicate_identity_evicts_the_stale_connection() {
        let mut room = room();
        let first = Client::new("a");
        let second = Client::new("a");
        let b = Client::new("b");
        first.join(&mut room);
        b.join(&mut room);
        first.drain();
        b.drain();

        second.join(&mut room);

        assert_eq!(first.drain(), vec![Outbound::Evicted { room_id: "r1".into() }]);
        assert_eq!(b.event_names(), vec!["user-joined"]);
        assert_eq!(room.participants().len(), 2);

        assert_eq!(room.leave(&first.caller).unwrap_err(), RoomError::NotAParticipant);
        assert!(room.leave(&second.caller).is_ok());
        assert_eq!(b.event_names(), vec!["user-left"]);
    }

    #[test]
    fn leave_is_announced_once_to_the_remaining_roster() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        a.drain();

        room.leave(&b.caller).unwrap();
        assert!(room.leave(&b.caller).is_err());

        assert_eq!(
            a.events(),
            vec![ServerEvent::UserLeft {
                room_id: "r1".into(),
                user_id: "b".into(),
                username: "B".into(),
            }]
        );
    }

    #[test]
    fn signals_reach_only_the_target() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        let c = Client::new("c");
        for client in [&a, &b, &c] {
            client.join(&mut room);
        }
        for client in [&a, &b, &c] {
            client.drain();
        }

        let offer = json!({"type": "offer", "sdp": "v=0"});
        room.relay_signal(&a.caller, "b", SignalEnvelope::offer(offer.clone())).unwrap();

        assert_eq!(
            b.events(),
            vec![ServerEvent::VideoOffer {
                room_id: "r1".into(),
                offer,
                from: "a".into(),
                username: "A".into(),
            }]
        );
        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());
    }

    #[test]
    fn signaling_a_departed_peer_fails() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        room.leave(&b.caller).unwrap();

        let err = room
            .relay_signal(&a.caller, "b", SignalEnvelope::answer(json!({"sdp": "v=0"})))
            .unwrap_err();
        assert_eq!(err, RoomError::TargetUnavailable { target: "b".into() });
    }

    #[test]
    fn signaling_a_dropped_connection_reaps_it() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        a.drain();
        drop(b.mailbox);

        let err = room
            .relay_signal(&a.caller, "b", SignalEnvelope::ice_candidate(json!({"candidate": ""})))
            .unwrap_err();
        assert_eq!(err, RoomError::TargetUnavailable { target: "b".into() });
        assert_eq!(a.event_names(), vec!["user-left"]);
        assert_eq!(room.participants().len(), 1);
    }

    #[test]
    fn screen_share_events_skip_the_sharer() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        a.drain();
        b.drain();

        room.broadcast_call_event(&a.caller, CallEventKind::ScreenShareStart).unwrap();

        assert!(a.drain().is_empty());
        assert_eq!(b.event_names(), vec!["user-screen-sharing"]);
    }

    #[test]
    fn join_fails_when_the_resync_does_not_fit() {
        let mut room = room();
        let a = Client::new("a");
        a.join(&mut room);
        a.drain();

        let tiny = Client::with_capacity("tiny", 3);
        let result = room.join(tiny.participant());

        assert!(matches!(result, Err(RoomError::RoomFailed(_))));
        assert!(tiny.mailbox.is_overflowed());
        assert_eq!(room.participants().len(), 1);
        assert!(a.drain().is_empty(), "a never-admitted user is not announced");
    }

    #[test]
    fn failed_rejoin_is_announced_as_a_leave() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::with_capacity("b", 4);
        a.join(&mut room);
        b.join(&mut room);
        a.drain();

        // b's queue still holds its first resync, so a second one overflows it.
        assert!(room.join(b.participant()).is_err());
        assert_eq!(room.participants().len(), 1);
        assert_eq!(a.event_names(), vec!["user-left"]);
    }

    #[test]
    fn overflowed_participant_is_removed_and_announced() {
        let mut room = room();
        let a = Client::new("a");
        let slow = Client::with_capacity("slow", 4);
        a.join(&mut room);
        slow.join(&mut room);
        a.drain();

        room.apply_code_edit(&a.caller, "x".into(), "rust".into()).unwrap();

        assert!(slow.mailbox.is_overflowed());
        assert_eq!(room.participants().len(), 1);
        assert_eq!(a.event_names(), vec!["user-left"]);
    }

    #[test]
    fn cursor_pings_are_shed_not_fatal() {
        let mut room = room();
        let a = Client::new("a");
        let slow = Client::with_capacity("slow", 4);
        a.join(&mut room);
        slow.join(&mut room);

        for x in 0..10 {
            let ping = Ping::WhiteboardCursor {
                position: CursorPosition { x: f64::from(x), y: 0.0 },
                color: None,
            };
            room.cursor_or_presence_ping(&a.caller, ping).unwrap();
        }

        assert_eq!(room.participants().len(), 2);
        assert!(!slow.mailbox.is_closed());
    }

    #[test]
    fn whiteboard_sync_goes_to_the_requester_only() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        room.apply_whiteboard_op(&a.caller, WhiteboardOp::Draw(stroke("s1", 0.0))).unwrap();
        a.drain();
        b.drain();

        room.whiteboard_sync(&b.caller).unwrap();

        assert!(a.drain().is_empty());
        match b.events().as_slice() {
            [ServerEvent::WhiteboardSync { objects, .. }] => assert_eq!(objects[0].id, "s1"),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn failure_terminates_every_connection() {
        let mut room = room();
        let a = Client::new("a");
        let b = Client::new("b");
        a.join(&mut room);
        b.join(&mut room);
        a.drain();
        b.drain();

        assert_eq!(room.fail("boom"), 2);

        for client in [&a, &b] {
            match client.drain().as_slice() {
                [Outbound::Terminate { event: ServerEvent::Error { code, room_id, .. } }] => {
                    assert_eq!(code, "ROOM_FAILED");
                    assert_eq!(room_id.as_deref(), Some("r1"));
                }
                other => panic!("unexpected items {other:?}"),
            }
        }
        assert!(room.is_empty());
    }
}
