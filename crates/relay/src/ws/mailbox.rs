// Per-connection outbound queue.
//
// Rooms push into a participant's mailbox without ever blocking; the
// connection's socket loop drains it. A full queue sheds the oldest
// ephemeral event first. When only deliverable events remain the mailbox
// overflows and closes, and the connection is torn down.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use coderoom_common::protocol::ws::ServerEvent;
use thiserror::Error;
use tokio::sync::Notify;

use crate::metrics;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// A newer connection of the same user took this connection's place in the room.
    Evicted { room_id: String },
    /// Final frame before the server closes the connection.
    Terminate { event: ServerEvent },
}

impl Outbound {
    fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Event(event) if event.is_ephemeral())
    }

    fn is_control(&self) -> bool {
        matches!(self, Self::Evicted { .. } | Self::Terminate { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after shedding an older ephemeral event, or the ephemeral
    /// event itself was shed.
    ShedEphemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("mailbox is closed")]
    Closed,
    #[error("outbound queue overflowed")]
    Overflowed,
}

#[derive(Debug, Default)]
struct MailboxState {
    queue: VecDeque<Outbound>,
    closed: bool,
    overflowed: bool,
}

#[derive(Debug)]
pub struct Mailbox {
    capacity: usize,
    state: Mutex<MailboxState>,
    notify: Notify,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(MailboxState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        // Queue state stays consistent even if a pusher panicked mid-call.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: Outbound) -> Result<PushOutcome, MailboxError> {
        let mut state = self.lock();
        if state.closed {
            return Err(MailboxError::Closed);
        }

        if item.is_control() {
            if matches!(item, Outbound::Terminate { .. }) {
                state.closed = true;
            }
            state.queue.push_back(item);
            drop(state);
            self.notify.notify_one();
            return Ok(PushOutcome::Queued);
        }

        if state.queue.len() < self.capacity {
            state.queue.push_back(item);
            drop(state);
            self.notify.notify_one();
            return Ok(PushOutcome::Queued);
        }

        if let Some(index) = state.queue.iter().position(Outbound::is_ephemeral) {
            state.queue.remove(index);
            state.queue.push_back(item);
            drop(state);
            metrics::increment_dropped_ephemeral();
            self.notify.notify_one();
            return Ok(PushOutcome::ShedEphemeral);
        }

        if item.is_ephemeral() {
            metrics::increment_dropped_ephemeral();
            return Ok(PushOutcome::ShedEphemeral);
        }

        state.closed = true;
        state.overflowed = true;
        state.queue.clear();
        drop(state);
        metrics::increment_mailbox_overflow();
        self.notify.notify_one();
        Err(MailboxError::Overflowed)
    }

    pub fn push_event(&self, event: ServerEvent) -> Result<PushOutcome, MailboxError> {
        self.push(Outbound::Event(event))
    }

    /// Next queued item; `None` once the mailbox is closed and drained.
    ///
    /// Cancel safe: nothing is dequeued unless the future completes.
    pub async fn recv(&self) -> Option<Outbound> {
        loop {
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Next queued item without waiting.
    pub fn try_recv(&self) -> Option<Outbound> {
        self.lock().queue.pop_front()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_overflowed(&self) -> bool {
        self.lock().overflowed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderoom_common::types::CursorPosition;

    fn cursor(x: f64) -> ServerEvent {
        ServerEvent::WhiteboardCursor {
            room_id: "r1".into(),
            user_id: "u1".into(),
            position: CursorPosition { x, y: 0.0 },
            username: "Ada".into(),
            color: None,
        }
    }

    fn cleared() -> ServerEvent {
        ServerEvent::WhiteboardCleared { room_id: "r1".into(), user_id: "u1".into() }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let mailbox = Mailbox::new(4);
        mailbox.push_event(cursor(1.0)).expect("push should succeed");
        mailbox.push_event(cleared()).expect("push should succeed");

        assert_eq!(mailbox.recv().await, Some(Outbound::Event(cursor(1.0))));
        assert_eq!(mailbox.recv().await, Some(Outbound::Event(cleared())));
    }

    #[tokio::test]
    async fn full_queue_sheds_oldest_ephemeral_for_deltas() {
        let mailbox = Mailbox::new(2);
        mailbox.push_event(cursor(1.0)).expect("push should succeed");
        mailbox.push_event(cursor(2.0)).expect("push should succeed");

        let outcome = mailbox.push_event(cleared()).expect("delta must not be rejected");
        assert_eq!(outcome, PushOutcome::ShedEphemeral);
        assert_eq!(mailbox.recv().await, Some(Outbound::Event(cursor(2.0))));
        assert_eq!(mailbox.recv().await, Some(Outbound::Event(cleared())));
    }

    #[tokio::test]
    async fn ephemeral_push_into_full_queue_of_deltas_is_shed() {
        let mailbox = Mailbox::new(1);
        mailbox.push_event(cleared()).expect("push should succeed");

        assert_eq!(mailbox.push_event(cursor(1.0)), Ok(PushOutcome::ShedEphemeral));
        assert_eq!(mailbox.len(), 1);
        assert!(!mailbox.is_closed());
    }

    #[tokio::test]
    async fn delta_overflow_closes_the_mailbox() {
        let mailbox = Mailbox::new(1);
        mailbox.push_event(cleared()).expect("push should succeed");

        assert_eq!(mailbox.push_event(cleared()), Err(MailboxError::Overflowed));
        assert!(mailbox.is_overflowed());
        assert_eq!(mailbox.recv().await, None);
        assert_eq!(mailbox.push_event(cursor(1.0)), Err(MailboxError::Closed));
    }

    #[tokio::test]
    async fn terminate_is_drained_before_close() {
        let mailbox = Mailbox::new(1);
        mailbox.push_event(cleared()).expect("push should succeed");
        mailbox
            .push(Outbound::Terminate { event: cleared() })
            .expect("control items bypass capacity");

        assert!(mailbox.is_closed());
        assert_eq!(mailbox.recv().await, Some(Outbound::Event(cleared())));
        assert_eq!(mailbox.recv().await, Some(Outbound::Terminate { event: cleared() }));
        assert_eq!(mailbox.recv().await, None);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_from_another_task() {
        let mailbox = std::sync::Arc::new(Mailbox::new(4));
        let producer = std::sync::Arc::clone(&mailbox);
        let handle = tokio::spawn(async move { producer.push_event(cleared()) });

        assert_eq!(mailbox.recv().await, Some(Outbound::Event(cleared())));
        handle.await.expect("producer should not panic").expect("push should succeed");
    }
}
