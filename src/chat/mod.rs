pub mod buffer;
pub mod engine;
pub mod poller;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::models::{ChatMessage, ConversationId};

/// The two backend calls a conversation needs.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn send_message(&self, conversation: ConversationId, text: &str) -> Result<(), GatewayError>;

    async fn fetch_messages(&self, conversation: ConversationId) -> Result<Vec<ChatMessage>, GatewayError>;
}
