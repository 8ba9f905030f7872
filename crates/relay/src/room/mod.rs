// Room registry: room id -> live room actor.

pub mod actor;
pub mod resync;
pub mod session;
pub mod whiteboard;

use std::collections::HashMap;
use std::sync::Arc;

use coderoom_common::types::ParticipantInfo;
use tokio::sync::Mutex;
use tracing::info;

pub use actor::{LeaveReason, RoomHandle};
pub use session::{Caller, Ping};
pub use whiteboard::WhiteboardOp;

use crate::config::RoomLimits;
use crate::error::RoomError;
use crate::metrics;
use crate::presence::Participant;
use actor::RoomMap;

pub const MAX_ROOM_ID_CHARS: usize = 128;

pub fn validate_room_id(room_id: &str) -> Result<(), RoomError> {
    let length = room_id.chars().count();
    if length == 0 || length > MAX_ROOM_ID_CHARS {
        return Err(RoomError::malformed(format!(
            "roomId must be between 1 and {MAX_ROOM_ID_CHARS} characters"
        )));
    }
    if room_id.chars().any(char::is_control) {
        return Err(RoomError::malformed("roomId must not contain control characters"));
    }
    Ok(())
}

/// Creates rooms on first join; rooms remove themselves once idle.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: RoomMap,
    limits: RoomLimits,
}

impl RoomRegistry {
    pub fn new(limits: RoomLimits) -> Self {
        Self { rooms: Arc::new(Mutex::new(HashMap::new())), limits }
    }

    pub fn limits(&self) -> &RoomLimits {
        &self.limits
    }

    /// Joins `room_id`, creating the room if it does not exist.
    ///
    /// The join is queued while the registry lock is held, so an idle room
    /// cannot retire between lookup and join.
    pub async fn join(
        &self,
        room_id: &str,
        participant: Participant,
    ) -> Result<RoomHandle, RoomError> {
        validate_room_id(room_id)?;

        let (handle, receiver) = {
            let mut rooms = self.rooms.lock().await;
            let handle = match rooms.get(room_id) {
                Some(handle) => handle.clone(),
                None => {
                    let handle =
                        actor::spawn_room(room_id, self.limits.clone(), Arc::clone(&self.rooms));
                    rooms.insert(room_id.to_string(), handle.clone());
                    metrics::adjust_active_rooms(1);
                    info!(room_id = %room_id, "room created");
                    handle
                }
            };
            let receiver = handle.submit_join(participant)?;
            (handle, receiver)
        };

        actor::await_reply(receiver).await?;
        Ok(handle)
    }

    pub async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    /// Current roster, or `None` when no session is live for the room.
    pub async fn participants(&self, room_id: &str) -> Option<Vec<ParticipantInfo>> {
        let handle = self.get(room_id).await?;
        handle.participants().await
    }

    pub async fn active_rooms(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coderoom_common::protocol::ws::ServerEvent;
    use uuid::Uuid;

    use super::*;
    use crate::ws::mailbox::{Mailbox, Outbound};

    struct Client {
        caller: Caller,
        mailbox: Arc<Mailbox>,
    }

    impl Client {
        fn new(user_id: &str) -> Self {
            Self {
                caller: Caller { user_id: user_id.to_string(), connection_id: Uuid::new_v4() },
                mailbox: Arc::new(Mailbox::new(64)),
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

        async fn next_event(&self) -> ServerEvent {
            match self.mailbox.recv().await {
                Some(Outbound::Event(event)) => event,
                other => panic!("expected an event, got {other:?}"),
            }
        }

        async fn skip_resync(&self) {
            for _ in 0..4 {
                self.next_event().await;
            }
        }
    }

    fn registry(grace_ms: u64) -> RoomRegistry {
        RoomRegistry::new(RoomLimits {
            grace_period: Duration::from_millis(grace_ms),
            ..RoomLimits::default()
        })
    }

    #[test]
    fn room_ids_are_validated() {
        assert!(validate_room_id("interview-42").is_ok());
        assert!(validate_room_id(&"x".repeat(MAX_ROOM_ID_CHARS)).is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id(&"x".repeat(MAX_ROOM_ID_CHARS + 1)).is_err());
        assert!(validate_room_id("bad\nid").is_err());
    }

    #[tokio::test]
    async fn first_join_creates_the_room_and_streams_resync() {
        let registry = registry(1_000);
        let a = Client::new("a");

        let handle = registry.join("r1", a.participant()).await.expect("join should succeed");

        assert_eq!(handle.room_id(), "r1");
        assert_eq!(registry.active_rooms().await, 1);
        assert!(matches!(a.next_event().await, ServerEvent::RoomParticipants { .. }));
        assert!(matches!(a.next_event().await, ServerEvent::CodeSync { revision: 0, .. }));
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let registry = registry(1_000);
        let a = Client::new("a");
        let b = Client::new("b");
        let r1 = registry.join("r1", a.participant()).await.unwrap();
        registry.join("r2", b.participant()).await.unwrap();
        a.skip_resync().await;
        b.skip_resync().await;

        r1.apply_code_edit(a.caller.clone(), "fn main() {}".into(), "rust".into()).await.unwrap();

        assert!(b.mailbox.try_recv().is_none());
        assert_eq!(registry.participants("r2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn operations_after_leaving_are_rejected() {
        let registry = registry(1_000);
        let a = Client::new("a");
        let handle = registry.join("r1", a.participant()).await.unwrap();

        handle.leave(a.caller.clone(), LeaveReason::Explicit).await.unwrap();
        let err = handle
            .append_chat(a.caller.clone(), "still here?".into())
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::NotAParticipant);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_is_destroyed_after_grace_period() {
        let registry = registry(30_000);
        let a = Client::new("a");
        let handle = registry.join("r1", a.participant()).await.unwrap();
        handle.leave(a.caller.clone(), LeaveReason::Disconnected).await.unwrap();

        tokio::time::sleep(Duration::from_millis(29_000)).await;
        assert_eq!(registry.active_rooms().await, 1);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(registry.active_rooms().await, 0);
        assert!(registry.participants("r1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_period_keeps_state() {
        let registry = registry(30_000);
        let a = Client::new("a");
        let handle = registry.join("r1", a.participant()).await.unwrap();
        handle.apply_code_edit(a.caller.clone(), "print(1)".into(), "python".into()).await.unwrap();
        handle.leave(a.caller.clone(), LeaveReason::Disconnected).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        let again = Client::new("a");
        registry.join("r1", again.participant()).await.unwrap();
        again.next_event().await;
        match again.next_event().await {
            ServerEvent::CodeSync { code, revision, .. } => {
                assert_eq!(code, "print(1)");
                assert_eq!(revision, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(60_000)).await;
        assert_eq!(registry.active_rooms().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_command_at_expiry_does_not_extend_grace() {
        let registry = registry(30_000);
        let a = Client::new("a");
        let handle = registry.join("r1", a.participant()).await.unwrap();
        handle.leave(a.caller.clone(), LeaveReason::Disconnected).await.unwrap();

        // The room reaches its deadline while the registry is locked, so the
        // leave below is already queued when it checks for pending commands.
        let rooms = registry.rooms.lock().await;
        tokio::time::sleep(Duration::from_millis(31_000)).await;
        handle.leave_detached(a.caller.clone(), LeaveReason::Disconnected);
        drop(rooms);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.active_rooms().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn join_queued_at_expiry_keeps_the_room() {
        let registry = registry(30_000);
        let a = Client::new("a");
        let handle = registry.join("r1", a.participant()).await.unwrap();
        handle.apply_code_edit(a.caller.clone(), "kept".into(), "rust".into()).await.unwrap();
        handle.leave(a.caller.clone(), LeaveReason::Disconnected).await.unwrap();

        let rooms = registry.rooms.lock().await;
        tokio::time::sleep(Duration::from_millis(31_000)).await;
        let b = Client::new("b");
        let joined = handle.submit_join(b.participant()).unwrap();
        drop(rooms);
        actor::await_reply(joined).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60_000)).await;
        assert_eq!(registry.active_rooms().await, 1);
        b.next_event().await;
        match b.next_event().await {
            ServerEvent::CodeSync { code, .. } => assert_eq!(code, "kept"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_room_starts_fresh() {
        let registry = registry(1_000);
        let a = Client::new("a");
        let handle = registry.join("r1", a.participant()).await.unwrap();
        handle.apply_code_edit(a.caller.clone(), "old".into(), "rust".into()).await.unwrap();
        handle.leave(a.caller.clone(), LeaveReason::Explicit).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let b = Client::new("b");
        registry.join("r1", b.participant()).await.unwrap();
        b.next_event().await;
        assert!(matches!(
            b.next_event().await,
            ServerEvent::CodeSync { revision: 0, ref code, .. } if code.is_empty()
        ));
    }

    #[tokio::test]
    async fn crashed_room_disconnects_everyone_and_unregisters() {
        let registry = registry(1_000);
        let a = Client::new("a");
        let b = Client::new("b");
        let handle = registry.join("r1", a.participant()).await.unwrap();
        registry.join("r1", b.participant()).await.unwrap();
        a.skip_resync().await;
        a.next_event().await;
        b.skip_resync().await;

        handle.crash();
        let err = handle
            .apply_code_edit(a.caller.clone(), "x".into(), "rust".into())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomFailed(_) | RoomError::NotAParticipant));

        for client in [&a, &b] {
            match client.mailbox.recv().await {
                Some(Outbound::Terminate { event: ServerEvent::Error { code, .. } }) => {
                    assert_eq!(code, "ROOM_FAILED");
                }
                other => panic!("expected terminate, got {other:?}"),
            }
        }
        assert_eq!(registry.active_rooms().await, 0);
    }
}
