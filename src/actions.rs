//! Non-throwing wrappers around the [`BackendApi`] chat operations.
//!
//! Every action settles into an [`ActionResult`] so callers branch on
//! `success` instead of matching error kinds. The one exception is a
//! missing session token, which is returned as `Err(Unauthorized)` before
//! anything else happens.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::BackendApi;
use crate::error::GatewayError;
use crate::models::{ChatMessage, ConversationId};
use crate::session::SessionContext;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The typed failure behind `error`, kept for in-process callers.
    #[serde(skip)]
    cause: Option<GatewayError>,
}

impl<T> ActionResult<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, cause: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()), cause: None }
    }

    fn settle(result: Result<T, GatewayError>, fallback: &str) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                let message = e.to_string();
                let message = if message.is_empty() { fallback.to_string() } else { message };
                Self { cause: Some(e), ..Self::failed(message) }
            }
        }
    }

    /// Back to a `Result`, for callers that do want `?`.
    pub fn into_result(self) -> Result<Option<T>, GatewayError> {
        if self.success {
            return Ok(self.data);
        }
        Err(self
            .cause
            .unwrap_or_else(|| GatewayError::validation(self.error.unwrap_or_else(|| "Action failed".to_string()))))
    }
}

#[derive(Clone)]
pub struct Actions {
    api: BackendApi,
    session: SessionContext,
}

impl Actions {
    pub fn new(api: BackendApi, session: SessionContext) -> Self {
        Self { api, session }
    }

    fn authorized(&self) -> Result<&SessionContext, GatewayError> {
        self.session.require_token()?;
        Ok(&self.session)
    }

    pub async fn send_chat_message(&self, assistant_id: u64, message: &str) -> Result<ActionResult<Value>, GatewayError> {
        let s = self.authorized()?;
        let r = self.api.send_chat_message(s, assistant_id, message).await;
        Ok(ActionResult::settle(r, "Failed to send message"))
    }

    /// Reads never throw: a missing session is just another failed result.
    pub async fn chat_messages(&self, conversation: ConversationId) -> ActionResult<Vec<ChatMessage>> {
        let r = self.api.chat_messages(&self.session, conversation).await;
        ActionResult::settle(r, "Failed to fetch messages")
    }
}
