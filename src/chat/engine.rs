//! Drives one conversation: optimistic send, backend dispatch, reply polling
//! and reconciliation.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::buffer::{MessageBuffer, SubmitError};
use super::poller::{PollHandle, PollOutcome, ReplyPoller};
use super::ChatBackend;
use crate::actions::Actions;
use crate::error::GatewayError;
use crate::models::{assistant_count, ChatMessage, ConversationId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Busy(#[from] SubmitError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// A send the backend accepted, with its reply still outstanding.
///
/// Dropping it unsettled cancels the poll and returns the conversation to
/// idle, keeping the pending message on screen.
pub struct PendingReply {
    pending: ChatMessage,
    handle: Option<PollHandle>,
    buffer: Arc<Mutex<MessageBuffer>>,
    settled: bool,
}

impl PendingReply {
    pub fn message(&self) -> &ChatMessage {
        &self.pending
    }

    /// Stops waiting; the next `await_reply` reports `Cancelled`.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        drop(self.handle.take());
        if let Ok(mut buffer) = self.buffer.try_lock() {
            buffer.abandon(None);
            return;
        }
        let buffer = self.buffer.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { buffer.lock().await.abandon(None) });
        }
    }
}

pub enum SendReceipt {
    /// Blank input; nothing happened.
    Ignored,
    Awaiting(PendingReply),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Arrived,
    TimedOut,
    Cancelled,
}

pub struct ChatSession<B: ChatBackend> {
    conversation: ConversationId,
    backend: Arc<B>,
    poller: ReplyPoller<B>,
    buffer: Arc<Mutex<MessageBuffer>>,
}

impl<B: ChatBackend> ChatSession<B> {
    pub fn new(conversation: ConversationId, poller: ReplyPoller<B>, backend: Arc<B>) -> Self {
        Self { conversation, backend, poller, buffer: Arc::default() }
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// Replaces the visible history with the backend's, unless a send is
    /// in progress.
    pub async fn load(&self) -> Result<(), ChatError> {
        let snapshot = self.backend.fetch_messages(self.conversation).await?;
        let applied = self.buffer.lock().await.offer_snapshot(snapshot);
        debug!(conversation = self.conversation, applied, "history loaded");
        Ok(())
    }

    pub async fn visible(&self) -> Vec<ChatMessage> {
        self.buffer.lock().await.visible().to_vec()
    }

    pub async fn send(&self, text: &str) -> Result<SendReceipt, ChatError> {
        let Some(pending) = self.buffer.lock().await.submit(text)? else {
            return Ok(SendReceipt::Ignored);
        };

        // Replies the backend already holds, including any that landed after
        // an earlier wait gave up, must not count as the answer to this send.
        let known_replies = match self.backend.fetch_messages(self.conversation).await {
            Ok(history) => assistant_count(&history),
            Err(e) => {
                self.buffer.lock().await.mark_failed();
                warn!(conversation = self.conversation, error = %e, "history unreadable, send rolled back");
                return Err(e.into());
            }
        };

        if let Err(e) = self.backend.send_message(self.conversation, &pending.content).await {
            self.buffer.lock().await.mark_failed();
            warn!(conversation = self.conversation, error = %e, "send failed, rolled back");
            return Err(e.into());
        }

        let mut buffer = self.buffer.lock().await;
        let baseline = buffer.mark_sent_above(known_replies).unwrap_or(known_replies);
        let handle = self.poller.start_polling(self.conversation, baseline);
        drop(buffer);
        debug!(conversation = self.conversation, baseline, "awaiting reply");
        Ok(SendReceipt::Awaiting(PendingReply {
            pending,
            handle: Some(handle),
            buffer: self.buffer.clone(),
            settled: false,
        }))
    }

    /// Cancels the outstanding reply poll, if any, from outside the task
    /// awaiting it.
    pub fn stop_waiting(&self) -> bool {
        self.poller.stop_polling(self.conversation)
    }

    /// Waits for the poll behind `reply` and folds its outcome into the
    /// buffer. The buffer is idle again whatever happens.
    pub async fn await_reply(&self, mut reply: PendingReply) -> Result<ReplyStatus, ChatError> {
        let outcome = match reply.handle.take() {
            Some(handle) => handle.outcome().await,
            None => PollOutcome::Cancelled,
        };
        let mut buffer = self.buffer.lock().await;
        reply.settled = true;
        match outcome {
            PollOutcome::ReplyArrived(snapshot) => {
                buffer.offer_snapshot(snapshot);
                Ok(ReplyStatus::Arrived)
            }
            PollOutcome::TimedOut { last_snapshot } => {
                info!(conversation = self.conversation, "no reply before timeout");
                buffer.abandon(last_snapshot);
                Ok(ReplyStatus::TimedOut)
            }
            PollOutcome::Cancelled => {
                buffer.abandon(None);
                Ok(ReplyStatus::Cancelled)
            }
            PollOutcome::Failed(e) => {
                buffer.abandon(None);
                Err(e.into())
            }
        }
    }
}

/// Chat backend over the assistant endpoints, bound to one caller.
#[derive(Clone)]
pub struct AssistantChannel {
    actions: Actions,
}

impl AssistantChannel {
    pub fn new(actions: Actions) -> Self {
        Self { actions }
    }
}

#[async_trait]
impl ChatBackend for AssistantChannel {
    async fn send_message(&self, conversation: ConversationId, text: &str) -> Result<(), GatewayError> {
        self.actions.send_chat_message(conversation, text).await?.into_result()?;
        Ok(())
    }

    async fn fetch_messages(&self, conversation: ConversationId) -> Result<Vec<ChatMessage>, GatewayError> {
        let messages = self.actions.chat_messages(conversation).await.into_result()?;
        Ok(messages.unwrap_or_default())
    }
}
