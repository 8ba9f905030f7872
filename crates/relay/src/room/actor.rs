// One task per live room.
//
// The actor owns the `RoomSession` and applies commands strictly in arrival
// order. An empty room lingers for the grace period and then removes itself
// from the registry, unless a command is already queued.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use coderoom_common::types::{ChatMessage, ParticipantInfo};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::session::{Caller, Ping, RoomSession};
use super::whiteboard::WhiteboardOp;
use crate::config::RoomLimits;
use crate::error::RoomError;
use crate::metrics;
use crate::presence::Participant;
use crate::signaling::{CallEventKind, SignalEnvelope};

pub(crate) type RoomMap = Arc<Mutex<HashMap<String, RoomHandle>>>;
type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Explicit,
    Disconnected,
    Timeout,
    Overflow,
}

impl LeaveReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
            Self::Overflow => "overflow",
        }
    }
}

#[derive(Debug)]
pub enum RoomCommand {
    Join { participant: Participant, reply: Reply<()> },
    Leave { caller: Caller, reason: LeaveReason, reply: Option<Reply<()>> },
    CodeEdit { caller: Caller, code: String, language: String, reply: Reply<u64> },
    Whiteboard { caller: Caller, op: WhiteboardOp, reply: Reply<()> },
    WhiteboardSync { caller: Caller, reply: Reply<()> },
    Chat { caller: Caller, body: String, reply: Reply<ChatMessage> },
    Ping { caller: Caller, ping: Ping },
    Signal { caller: Caller, target: String, envelope: SignalEnvelope, reply: Reply<()> },
    CallEvent { caller: Caller, kind: CallEventKind, reply: Reply<()> },
    Participants { reply: oneshot::Sender<Vec<ParticipantInfo>> },
    #[cfg(test)]
    Crash,
}

/// Cheap, cloneable address of a room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: Arc<str>,
    instance_id: Uuid,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    fn submit(&self, command: RoomCommand) -> Result<(), RoomError> {
        // A closed channel means the room is gone, so nobody is a participant.
        self.commands.send(command).map_err(|_| RoomError::NotAParticipant)
    }

    pub(crate) fn submit_join(
        &self,
        participant: Participant,
    ) -> Result<oneshot::Receiver<Result<(), RoomError>>, RoomError> {
        let (reply, receiver) = oneshot::channel();
        self.submit(RoomCommand::Join { participant, reply })?;
        Ok(receiver)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply, receiver) = oneshot::channel();
        self.submit(build(reply))?;
        await_reply(receiver).await
    }

    pub async fn leave(&self, caller: Caller, reason: LeaveReason) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Leave { caller, reason, reply: Some(reply) }).await
    }

    /// Queues a leave without waiting for the room to process it.
    pub fn leave_detached(&self, caller: Caller, reason: LeaveReason) {
        let _ = self.submit(RoomCommand::Leave { caller, reason, reply: None });
    }

    pub async fn apply_code_edit(
        &self,
        caller: Caller,
        code: String,
        language: String,
    ) -> Result<u64, RoomError> {
        self.request(|reply| RoomCommand::CodeEdit { caller, code, language, reply }).await
    }

    pub async fn apply_whiteboard_op(
        &self,
        caller: Caller,
        op: WhiteboardOp,
    ) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Whiteboard { caller, op, reply }).await
    }

    pub async fn whiteboard_sync(&self, caller: Caller) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::WhiteboardSync { caller, reply }).await
    }

    pub async fn append_chat(
        &self,
        caller: Caller,
        body: String,
    ) -> Result<ChatMessage, RoomError> {
        self.request(|reply| RoomCommand::Chat { caller, body, reply }).await
    }

    /// Fire and forget.
    pub fn ping(&self, caller: Caller, ping: Ping) {
        let _ = self.submit(RoomCommand::Ping { caller, ping });
    }

    pub async fn relay_signal(
        &self,
        caller: Caller,
        target: String,
        envelope: SignalEnvelope,
    ) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Signal { caller, target, envelope, reply }).await
    }

    pub async fn broadcast_call_event(
        &self,
        caller: Caller,
        kind: CallEventKind,
    ) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::CallEvent { caller, kind, reply }).await
    }

    /// `None` once the room has shut down.
    pub async fn participants(&self) -> Option<Vec<ParticipantInfo>> {
        let (reply, receiver) = oneshot::channel();
        self.submit(RoomCommand::Participants { reply }).ok()?;
        receiver.await.ok()
    }

    #[cfg(test)]
    pub(crate) fn crash(&self) {
        let _ = self.submit(RoomCommand::Crash);
    }
}

pub(crate) async fn await_reply<T>(
    receiver: oneshot::Receiver<Result<T, RoomError>>,
) -> Result<T, RoomError> {
    receiver.await.unwrap_or_else(|_| {
        Err(RoomError::RoomFailed("room stopped before answering".to_string()))
    })
}

/// Starts the actor for a new room. The caller inserts the handle into `rooms`.
pub(crate) fn spawn_room(room_id: &str, limits: RoomLimits, rooms: RoomMap) -> RoomHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = RoomHandle {
        room_id: Arc::from(room_id),
        instance_id: Uuid::new_v4(),
        commands: commands_tx,
    };

    let actor = RoomActor {
        grace_period: limits.grace_period,
        session: RoomSession::new(room_id, limits),
        commands: commands_rx,
        rooms,
        instance_id: handle.instance_id,
        idle_deadline: None,
    };
    tokio::spawn(actor.run());
    handle
}

struct RoomActor {
    session: RoomSession,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    rooms: RoomMap,
    instance_id: Uuid,
    grace_period: Duration,
    idle_deadline: Option<Instant>,
}

impl RoomActor {
    async fn run(mut self) {
        // A room is born idle; the creating join is already queued.
        self.refresh_idle();

        loop {
            let deadline = self.idle_deadline;
            let wake_at = deadline.unwrap_or_else(Instant::now);
            let command = tokio::select! {
                command = self.commands.recv() => command,
                _ = time::sleep_until(wake_at), if deadline.is_some() => {
                    match self.try_retire().await {
                        Some(command) => Some(command),
                        None => return,
                    }
                }
            };

            let Some(command) = command else {
                debug!(room_id = %self.session.room_id(), "room handles dropped; stopping");
                self.unregister().await;
                return;
            };

            if let Err(reason) = self.handle(command) {
                self.fail(&reason).await;
                return;
            }
        }
    }

    fn handle(&mut self, command: RoomCommand) -> Result<(), String> {
        panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(command)))
            .map_err(|payload| panic_reason(payload.as_ref()))?;
        self.refresh_idle();
        Ok(())
    }

    fn dispatch(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { participant, reply } => {
                let _ = reply.send(self.session.join(participant).map(|_| ()));
            }
            RoomCommand::Leave { caller, reason, reply } => {
                let result = self.session.leave(&caller).map(|_| ());
                if result.is_err() {
                    debug!(
                        room_id = %self.session.room_id(),
                        user_id = %caller.user_id,
                        reason = reason.as_str(),
                        "leave for connection no longer in the roster"
                    );
                } else if reason != LeaveReason::Explicit {
                    info!(
                        room_id = %self.session.room_id(),
                        user_id = %caller.user_id,
                        reason = reason.as_str(),
                        "synthetic leave"
                    );
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            RoomCommand::CodeEdit { caller, code, language, reply } => {
                let _ = reply.send(self.session.apply_code_edit(&caller, code, language));
            }
            RoomCommand::Whiteboard { caller, op, reply } => {
                let _ = reply.send(self.session.apply_whiteboard_op(&caller, op));
            }
            RoomCommand::WhiteboardSync { caller, reply } => {
                let _ = reply.send(self.session.whiteboard_sync(&caller));
            }
            RoomCommand::Chat { caller, body, reply } => {
                let _ = reply.send(self.session.append_chat(&caller, &body));
            }
            RoomCommand::Ping { caller, ping } => {
                if let Err(error) = self.session.cursor_or_presence_ping(&caller, ping) {
                    debug!(
                        room_id = %self.session.room_id(),
                        user_id = %caller.user_id,
                        %error,
                        "ping dropped"
                    );
                }
            }
            RoomCommand::Signal { caller, target, envelope, reply } => {
                let _ = reply.send(self.session.relay_signal(&caller, &target, envelope));
            }
            RoomCommand::CallEvent { caller, kind, reply } => {
                let _ = reply.send(self.session.broadcast_call_event(&caller, kind));
            }
            RoomCommand::Participants { reply } => {
                let _ = reply.send(self.session.participants());
            }
            #[cfg(test)]
            RoomCommand::Crash => panic!("room state corrupted"),
        }
    }

    fn refresh_idle(&mut self) {
        if !self.session.is_empty() {
            self.idle_deadline = None;
        } else if self.idle_deadline.is_none() {
            self.idle_deadline = Some(Instant::now() + self.grace_period);
        }
    }

    /// Removes the room if nothing is queued. Holding the registry lock while
    /// checking means a join can never be sent to a room that is going away.
    ///
    /// A queued command is handed back with the expired deadline left in
    /// place; only a join that fills the roster clears it.
    async fn try_retire(&mut self) -> Option<RoomCommand> {
        let mut rooms = self.rooms.lock().await;
        if let Ok(command) = self.commands.try_recv() {
            return Some(command);
        }

        if remove_instance(&mut rooms, self.session.room_id(), self.instance_id) {
            info!(room_id = %self.session.room_id(), "empty room destroyed after grace period");
        }
        None
    }

    async fn fail(&mut self, reason: &str) {
        error!(
            room_id = %self.session.room_id(),
            reason,
            "room failed; disconnecting participants"
        );
        metrics::increment_room_failures();

        let disconnected =
            panic::catch_unwind(AssertUnwindSafe(|| self.session.fail(reason))).unwrap_or(0);
        info!(room_id = %self.session.room_id(), disconnected, "room torn down");

        self.commands.close();
        self.unregister().await;
    }

    async fn unregister(&mut self) {
        let mut rooms = self.rooms.lock().await;
        remove_instance(&mut rooms, self.session.room_id(), self.instance_id);
    }
}

fn remove_instance(
    rooms: &mut HashMap<String, RoomHandle>,
    room_id: &str,
    instance_id: Uuid,
) -> bool {
    let is_current = rooms.get(room_id).is_some_and(|handle| handle.instance_id == instance_id);
    if is_current {
        rooms.remove(room_id);
        metrics::adjust_active_rooms(-1);
    }
    is_current
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "internal room error".to_string()
    }
}
