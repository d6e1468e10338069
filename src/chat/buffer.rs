//! Optimistic, per-conversation message log.
//!
//! A submitted message shows up immediately under a `temp-` id. Once the
//! backend accepted it the buffer waits for an authoritative snapshot with
//! more assistant messages than before, then swaps the whole sequence for
//! that snapshot. Nothing is ever merged.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{assistant_count, ChatMessage, Role, TEMP_ID_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Sending { pending_id: String },
    /// Waiting for a snapshot with more than `baseline` assistant messages.
    Reconciling { baseline: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("a message is already being sent")]
    Busy,
}

#[derive(Debug, Clone)]
pub struct MessageBuffer {
    messages: Vec<ChatMessage>,
    state: BufferState,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self { messages: Vec::new(), state: BufferState::Idle }
    }
}

impl MessageBuffer {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages, state: BufferState::Idle }
    }

    pub fn visible(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn state(&self) -> &BufferState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == BufferState::Idle
    }

    /// Appends a pending user message. Blank text is a no-op; anything
    /// while a send is outstanding is refused.
    pub fn submit(&mut self, text: &str) -> Result<Option<ChatMessage>, SubmitError> {
        let content = text.trim();
        if content.is_empty() {
            return Ok(None);
        }
        if !self.is_idle() {
            return Err(SubmitError::Busy);
        }

        // never sort before what is already on screen
        let now = Utc::now();
        let timestamp = self.messages.last().map_or(now, |last| last.timestamp.max(now));
        let pending = ChatMessage {
            id: format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()),
            role: Role::User,
            content: content.to_string(),
            timestamp,
        };
        self.messages.push(pending.clone());
        self.state = BufferState::Sending { pending_id: pending.id.clone() };
        Ok(Some(pending))
    }

    /// Backend accepted the pending message. Returns the baseline the
    /// poller has to beat, or `None` if nothing was being sent.
    pub fn mark_sent(&mut self) -> Option<usize> {
        self.mark_sent_above(0)
    }

    /// Like [`mark_sent`](Self::mark_sent), with the baseline raised to at
    /// least `known_replies` assistant messages the backend already holds.
    pub fn mark_sent_above(&mut self, known_replies: usize) -> Option<usize> {
        if !matches!(self.state, BufferState::Sending { .. }) {
            return None;
        }
        let baseline = assistant_count(&self.messages).max(known_replies);
        self.state = BufferState::Reconciling { baseline };
        Some(baseline)
    }

    /// Rolls the pending message back out.
    pub fn mark_failed(&mut self) -> Option<ChatMessage> {
        let BufferState::Sending { pending_id } = std::mem::replace(&mut self.state, BufferState::Idle) else {
            return None;
        };
        let pos = self.messages.iter().position(|m| m.id == pending_id)?;
        Some(self.messages.remove(pos))
    }

    /// Offers an authoritative snapshot. Returns whether it was applied.
    pub fn offer_snapshot(&mut self, snapshot: Vec<ChatMessage>) -> bool {
        match self.state {
            BufferState::Sending { .. } => false,
            BufferState::Reconciling { baseline } if assistant_count(&snapshot) <= baseline => false,
            BufferState::Reconciling { .. } | BufferState::Idle => {
                self.messages = snapshot;
                self.state = BufferState::Idle;
                true
            }
        }
    }

    /// Gives up on a reply (timeout, cancel, poll failure).
    pub fn abandon(&mut self, snapshot: Option<Vec<ChatMessage>>) {
        if !matches!(self.state, BufferState::Reconciling { .. }) {
            return;
        }
        if let Some(snapshot) = snapshot {
            self.messages = snapshot;
        }
        self.state = BufferState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn msg(id: &str, role: Role, secs: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            role,
            content: format!("{id} body"),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn blank_submit_changes_nothing() {
        let mut buf = MessageBuffer::new(vec![msg("1", Role::User, 0)]);
        assert_eq!(buf.submit("   \n\t"), Ok(None));
        assert_eq!(buf.visible().len(), 1);
        assert!(buf.is_idle());
    }

    #[test]
    fn submit_inserts_pending_user_message() {
        let mut buf = MessageBuffer::default();
        let pending = buf.submit("  Hello ").unwrap().unwrap();
        assert!(pending.is_pending());
        assert_eq!(pending.role, Role::User);
        assert_eq!(pending.content, "Hello");
        assert_eq!(buf.visible(), &[pending.clone()]);
        assert_eq!(buf.state(), &BufferState::Sending { pending_id: pending.id });
    }

    #[test]
    fn pending_message_sorts_after_future_dated_history() {
        let ahead = ChatMessage { timestamp: Utc::now() + Duration::hours(1), ..msg("1", Role::Assistant, 0) };
        let mut buf = MessageBuffer::new(vec![ahead.clone()]);
        let pending = buf.submit("hi").unwrap().unwrap();
        assert!(pending.timestamp >= ahead.timestamp);
    }

    #[test]
    fn second_submit_is_refused_until_idle() {
        let mut buf = MessageBuffer::default();
        buf.submit("one").unwrap();
        assert_eq!(buf.submit("two"), Err(SubmitError::Busy));
        buf.mark_sent();
        assert_eq!(buf.submit("two"), Err(SubmitError::Busy));
        assert_eq!(buf.visible().iter().filter(|m| m.is_pending()).count(), 1);
    }

    #[test]
    fn failure_rolls_back_to_previous_sequence() {
        let history = vec![msg("1", Role::User, 0), msg("2", Role::Assistant, 1)];
        let mut buf = MessageBuffer::new(history.clone());
        buf.submit("oops").unwrap();
        let removed = buf.mark_failed().unwrap();
        assert_eq!(removed.content, "oops");
        assert_eq!(buf.visible(), history.as_slice());
        assert!(buf.is_idle());
        assert_eq!(buf.mark_failed(), None);
    }

    #[test]
    fn baseline_counts_assistant_messages_before_send() {
        let mut buf = MessageBuffer::new(vec![msg("1", Role::User, 0), msg("2", Role::Assistant, 1)]);
        assert_eq!(buf.mark_sent(), None);
        buf.submit("again").unwrap();
        assert_eq!(buf.mark_sent(), Some(1));
        assert_eq!(buf.state(), &BufferState::Reconciling { baseline: 1 });
    }

    #[test]
    fn reconciliation_waits_for_a_new_assistant_message() {
        let mut buf = MessageBuffer::default();
        buf.submit("Hello").unwrap();
        assert!(!buf.offer_snapshot(vec![msg("u", Role::User, 0)]));
        buf.mark_sent();

        let echo_only = vec![msg("u", Role::User, 0)];
        assert!(!buf.offer_snapshot(echo_only));
        assert!(buf.visible()[0].is_pending());

        let answered = vec![msg("u", Role::User, 0), msg("a", Role::Assistant, 1)];
        assert!(buf.offer_snapshot(answered.clone()));
        assert_eq!(buf.visible(), answered.as_slice());
        assert!(buf.visible().iter().all(|m| !m.is_pending()));
        assert!(buf.is_idle());
    }

    #[test]
    fn reapplying_the_same_snapshot_is_idempotent() {
        let snapshot = vec![msg("u", Role::User, 0), msg("a", Role::Assistant, 1)];
        let mut buf = MessageBuffer::default();
        buf.offer_snapshot(snapshot.clone());
        let first = buf.visible().to_vec();
        buf.offer_snapshot(snapshot);
        assert_eq!(buf.visible(), first.as_slice());
    }

    #[test]
    fn baseline_counts_replies_the_backend_already_has() {
        let mut buf = MessageBuffer::default();
        buf.submit("again").unwrap();
        assert_eq!(buf.mark_sent_above(2), Some(2));
        // a snapshot holding only the known replies is not the answer
        assert!(!buf.offer_snapshot(vec![msg("a1", Role::Assistant, 0), msg("a2", Role::Assistant, 1)]));
        assert!(!buf.is_idle());
    }

    #[test]
    fn abandon_returns_to_idle_keeping_or_replacing_messages() {
        let mut buf = MessageBuffer::default();
        buf.submit("x").unwrap();
        buf.abandon(None);
        assert!(!buf.is_idle(), "abandon only applies while reconciling");

        buf.mark_sent();
        buf.abandon(None);
        assert!(buf.is_idle());
        assert_eq!(buf.visible().len(), 1);

        buf.submit("y").unwrap();
        buf.mark_sent();
        let latest = vec![msg("u", Role::User, 0)];
        buf.abandon(Some(latest.clone()));
        assert_eq!(buf.visible(), latest.as_slice());
    }
}
