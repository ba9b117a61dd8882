//! Message queue engine — §4.3.
//!
//! No direct teacher precedent; follows the teacher's general style of small
//! free functions operating on a `PersistentStore` (e.g. `touch_sandbox` in
//! `runtime.rs`) rather than introducing a separate in-memory queue
//! structure, since eviction/resume must be a persistence concern (§9), not
//! an in-memory one.

use crate::error::{CoordinatorError, Result};
use crate::model::{Message, MessageStatus, now_ms};
use crate::store::PersistentStore;

pub struct MessageQueue<'a> {
    messages: &'a PersistentStore<Message>,
    session_id: String,
}

impl<'a> MessageQueue<'a> {
    pub fn new(messages: &'a PersistentStore<Message>, session_id: impl Into<String>) -> Self {
        Self { messages, session_id: session_id.into() }
    }

    fn for_session(&self) -> Result<Vec<Message>> {
        let sid = self.session_id.clone();
        self.messages.filter(move |m| m.session_id == sid)
    }

    /// Persist a new message and return its 1-based queue position.
    pub fn enqueue(&self, message: Message) -> Result<usize> {
        self.messages.insert(message.id.clone(), message)?;
        self.pending_or_processing_count()
    }

    /// Oldest `processing` message, if any. At most one exists (§4.3 invariant).
    pub fn peek_processing(&self) -> Result<Option<Message>> {
        let mut processing: Vec<Message> = self
            .for_session()?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Processing)
            .collect();
        processing.sort_by_key(|m| m.created_at);
        Ok(processing.into_iter().next())
    }

    pub fn pending_or_processing_count(&self) -> Result<usize> {
        Ok(self
            .for_session()?
            .into_iter()
            .filter(|m| matches!(m.status, MessageStatus::Pending | MessageStatus::Processing))
            .count())
    }

    /// Pick the oldest pending message and mark it processing. No-op (returns
    /// `None`) if another message is already processing — enforces ≤1 in flight.
    ///
    /// Callers pass `sandbox_usable`; when `false` this returns `None` without
    /// marking anything processing, per §4.3 — the caller is responsible for
    /// triggering a spawn and re-entering once the sandbox becomes ready.
    pub fn process_next(&self, sandbox_usable: bool) -> Result<Option<Message>> {
        if self.peek_processing()?.is_some() {
            return Ok(None);
        }
        if !sandbox_usable {
            return Ok(None);
        }

        let mut pending: Vec<Message> = self
            .for_session()?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .collect();
        pending.sort_by_key(|m| m.created_at);
        let Some(next) = pending.into_iter().next() else {
            return Ok(None);
        };

        self.mark_processing(&next.id)
    }

    pub fn mark_processing(&self, message_id: &str) -> Result<Option<Message>> {
        self.messages.update(message_id, |m| {
            if m.can_transition_to(MessageStatus::Processing) {
                m.status = MessageStatus::Processing;
                m.started_at = Some(now_ms());
            }
        })
    }

    /// Idempotent: completing an already-completed/failed message is a no-op.
    pub fn complete(&self, message_id: &str, success: bool) -> Result<Message> {
        let target = if success { MessageStatus::Completed } else { MessageStatus::Failed };
        self.messages
            .update(message_id, |m| {
                if m.can_transition_to(target) {
                    m.status = target;
                    m.completed_at = Some(now_ms());
                }
            })?
            .ok_or_else(|| CoordinatorError::NotFound(format!("no message {message_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageSource;
    use serial_test::serial;

    fn with_temp_state_dir<F: FnOnce()>(f: F) {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("COORDINATOR_STATE_DIR", dir.path());
        }
        f();
        unsafe {
            std::env::remove_var("COORDINATOR_STATE_DIR");
        }
    }

    fn msg(id: &str, session: &str, created_at: i64) -> Message {
        Message {
            id: id.into(),
            session_id: session.into(),
            author_id: "u1".into(),
            content: "hi".into(),
            source: MessageSource::Web,
            model: None,
            attachments: "[]".into(),
            callback_context: None,
            status: MessageStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    #[serial]
    fn process_next_picks_oldest_pending_and_is_fifo() {
        with_temp_state_dir(|| {
            let store: PersistentStore<Message> = PersistentStore::open("queue_fifo").unwrap();
            let queue = MessageQueue::new(&store, "s1");
            queue.enqueue(msg("p1", "s1", 100)).unwrap();
            queue.enqueue(msg("p2", "s1", 50)).unwrap();
            queue.enqueue(msg("p3", "s1", 200)).unwrap();

            let next = queue.process_next(true).unwrap().unwrap();
            assert_eq!(next.id, "p2");
            assert_eq!(next.status, MessageStatus::Processing);

            // a second call is a no-op while p2 is processing
            assert!(queue.process_next(true).unwrap().is_none());
        });
    }

    #[test]
    #[serial]
    fn process_next_without_usable_sandbox_does_not_mark_processing() {
        with_temp_state_dir(|| {
            let store: PersistentStore<Message> = PersistentStore::open("queue_no_sandbox").unwrap();
            let queue = MessageQueue::new(&store, "s1");
            queue.enqueue(msg("p1", "s1", 100)).unwrap();
            assert!(queue.process_next(false).unwrap().is_none());
            let reloaded = store.get("p1").unwrap().unwrap();
            assert_eq!(reloaded.status, MessageStatus::Pending);
        });
    }

    #[test]
    #[serial]
    fn complete_is_idempotent() {
        with_temp_state_dir(|| {
            let store: PersistentStore<Message> = PersistentStore::open("queue_complete").unwrap();
            let queue = MessageQueue::new(&store, "s1");
            queue.enqueue(msg("p1", "s1", 100)).unwrap();
            queue.mark_processing("p1").unwrap();

            let completed = queue.complete("p1", true).unwrap();
            assert_eq!(completed.status, MessageStatus::Completed);
            assert!(completed.completed_at.is_some());

            // idempotent: completing again doesn't change completed_at semantics or error
            let completed_again = queue.complete("p1", true).unwrap();
            assert_eq!(completed_again.status, MessageStatus::Completed);
        });
    }

    #[test]
    #[serial]
    fn queue_position_is_pending_plus_processing_count() {
        with_temp_state_dir(|| {
            let store: PersistentStore<Message> = PersistentStore::open("queue_position").unwrap();
            let queue = MessageQueue::new(&store, "s1");
            let pos1 = queue.enqueue(msg("p1", "s1", 100)).unwrap();
            assert_eq!(pos1, 1);
            let pos2 = queue.enqueue(msg("p2", "s1", 200)).unwrap();
            assert_eq!(pos2, 2);
        });
    }
}
