//! Typed operations against the backend.
//!
//! Reads declare the tags they subscribe to and how long a cached copy may
//! be served; writes report the [`Mutation`] they performed to the
//! invalidation coordinator once the backend confirmed them.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::CacheMode;
use crate::error::GatewayError;
use crate::gateway::{FormPart, Payload, RequestOptions, Transport};
use crate::invalidation::{InvalidationCoordinator, Mutation, ResourceTag};
use crate::models::{
    extract_token, normalize_dataset_ids, normalize_messages, resource_id, AssistantInput, AssistantPatch, ChatMessage,
    Credentials, DatasetInput, DatasetPatch, FileUpload, TextDocumentInput,
};
use crate::session::{AuthSession, SessionContext};

const LIST_TTL: Duration = Duration::from_secs(30);
const ITEM_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct BackendApi {
    transport: Arc<dyn Transport>,
    coordinator: InvalidationCoordinator,
}

impl BackendApi {
    pub fn new(transport: Arc<dyn Transport>, coordinator: InvalidationCoordinator) -> Self {
        Self { transport, coordinator }
    }

    async fn read(&self, ctx: &SessionContext, path: &str, cache: CacheMode, tags: Vec<ResourceTag>) -> Result<Value, GatewayError> {
        let token = ctx.require_token()?;
        self.transport
            .request(path, RequestOptions::get().token(Some(token)).cache(cache, tags))
            .await
    }

    async fn write(&self, ctx: &SessionContext, path: &str, opts: RequestOptions) -> Result<Value, GatewayError> {
        let token = ctx.require_token()?;
        self.transport.request(path, opts.token(Some(token))).await
    }

    fn json<T: Serialize>(body: &T) -> Result<Payload, GatewayError> {
        serde_json::to_value(body)
            .map(Payload::Json)
            .map_err(|e| GatewayError::validation(format!("unserializable body: {e}")))
    }

    // --- auth -------------------------------------------------------------

    /// `Ok(None)` when the backend accepted the credentials but sent no token.
    pub async fn sign_in(&self, creds: &Credentials) -> Result<Option<AuthSession>, GatewayError> {
        self.authenticate("/auth/sign-in", creds).await
    }

    pub async fn sign_up(&self, creds: &Credentials) -> Result<Option<AuthSession>, GatewayError> {
        self.authenticate("/auth/sign-up", creds).await
    }

    async fn authenticate(&self, path: &str, creds: &Credentials) -> Result<Option<AuthSession>, GatewayError> {
        if creds.email.trim().is_empty() || creds.password.is_empty() {
            return Err(GatewayError::validation("Email and password are required"));
        }
        let body = json!({ "email": creds.email, "password": creds.password });
        let resp = self
            .transport
            .request(path, RequestOptions::post(Payload::Json(body)).public())
            .await?;
        Ok(extract_token(resp.get("access_token")).map(|access_token| AuthSession {
            access_token,
            refresh_token: extract_token(resp.get("refresh_token")),
        }))
    }

    pub async fn current_user(&self, ctx: &SessionContext) -> Result<Value, GatewayError> {
        self.read(ctx, "/auth/me", CacheMode::NoStore, Vec::new()).await
    }

    // --- assistants -------------------------------------------------------

    pub async fn list_assistants(&self, ctx: &SessionContext) -> Result<Value, GatewayError> {
        self.read(ctx, "/assistant", CacheMode::Revalidate(LIST_TTL), vec![ResourceTag::Assistants]).await
    }

    pub async fn get_assistant(&self, ctx: &SessionContext, id: u64) -> Result<Value, GatewayError> {
        let tags = vec![ResourceTag::Assistants, ResourceTag::Assistant(id)];
        self.read(ctx, &format!("/assistant/{id}"), CacheMode::Revalidate(ITEM_TTL), tags).await
    }

    pub async fn create_assistant(&self, ctx: &SessionContext, input: &AssistantInput) -> Result<Value, GatewayError> {
        if input.name.trim().is_empty() || input.model.trim().is_empty() {
            return Err(GatewayError::validation("name and model are required"));
        }
        let created = self.write(ctx, "/assistant", RequestOptions::post(Self::json(input)?)).await?;
        self.coordinator.after_mutation(&Mutation::CreateAssistant { id: resource_id(&created) }).await;
        Ok(created)
    }

    pub async fn update_assistant(&self, ctx: &SessionContext, id: u64, patch: &AssistantPatch) -> Result<Value, GatewayError> {
        let updated = self.write(ctx, &format!("/assistant/{id}"), RequestOptions::put(Self::json(patch)?)).await?;
        self.coordinator.after_mutation(&Mutation::UpdateAssistant { id }).await;
        Ok(updated)
    }

    pub async fn delete_assistant(&self, ctx: &SessionContext, id: u64) -> Result<(), GatewayError> {
        self.write(ctx, &format!("/assistant/{id}"), RequestOptions::delete()).await?;
        self.coordinator.after_mutation(&Mutation::DeleteAssistant { id }).await;
        Ok(())
    }

    pub async fn assistant_dataset_ids(&self, ctx: &SessionContext, id: u64) -> Result<Vec<u64>, GatewayError> {
        let tags = vec![ResourceTag::Assistants, ResourceTag::Assistant(id)];
        let v = self
            .read(ctx, &format!("/assistant/get-datasets/{id}"), CacheMode::Revalidate(ITEM_TTL), tags)
            .await?;
        Ok(normalize_dataset_ids(&v))
    }

    pub async fn set_assistant_datasets(&self, ctx: &SessionContext, id: u64, dataset_ids: &[u64]) -> Result<(), GatewayError> {
        let body = Payload::Json(json!({ "dataset_ids": dataset_ids }));
        self.write(ctx, &format!("/assistant/{id}/datasets"), RequestOptions::put(body)).await?;
        self.coordinator.after_mutation(&Mutation::UpdateAssistantDatasets { id }).await;
        Ok(())
    }

    // --- chat ---------------------------------------------------------------

    pub async fn send_chat_message(&self, ctx: &SessionContext, assistant_id: u64, message: &str) -> Result<Value, GatewayError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(GatewayError::validation("message is required"));
        }
        let body = Payload::Json(json!({ "message": message }));
        let reply = self.write(ctx, &format!("/assistant/{assistant_id}/chat"), RequestOptions::post(body)).await?;
        self.coordinator.after_mutation(&Mutation::SendChatMessage { assistant_id }).await;
        Ok(reply)
    }

    /// Always fetched fresh: pollers rely on it to see replies land.
    pub async fn chat_messages(&self, ctx: &SessionContext, assistant_id: u64) -> Result<Vec<ChatMessage>, GatewayError> {
        let tags = vec![ResourceTag::ChatMessages, ResourceTag::Assistant(assistant_id)];
        let v = self
            .read(ctx, &format!("/assistant/{assistant_id}/chat-messages"), CacheMode::NoStore, tags)
            .await?;
        Ok(normalize_messages(&v))
    }

    // --- datasets -----------------------------------------------------------

    pub async fn list_datasets(&self, ctx: &SessionContext) -> Result<Value, GatewayError> {
        self.read(ctx, "/datasets/", CacheMode::Revalidate(LIST_TTL), vec![ResourceTag::Datasets]).await
    }

    pub async fn get_dataset(&self, ctx: &SessionContext, id: u64) -> Result<Value, GatewayError> {
        let tags = vec![ResourceTag::Datasets, ResourceTag::Dataset(id)];
        self.read(ctx, &format!("/datasets/{id}"), CacheMode::Revalidate(ITEM_TTL), tags).await
    }

    pub async fn create_dataset(&self, ctx: &SessionContext, input: &DatasetInput) -> Result<Value, GatewayError> {
        if input.title.trim().is_empty() {
            return Err(GatewayError::validation("title is required"));
        }
        let created = self.write(ctx, "/datasets/", RequestOptions::post(Self::json(input)?)).await?;
        self.coordinator.after_mutation(&Mutation::CreateDataset { id: resource_id(&created) }).await;
        Ok(created)
    }

    pub async fn update_dataset(&self, ctx: &SessionContext, id: u64, patch: &DatasetPatch) -> Result<Value, GatewayError> {
        let updated = self.write(ctx, &format!("/datasets/{id}"), RequestOptions::put(Self::json(patch)?)).await?;
        self.coordinator.after_mutation(&Mutation::UpdateDataset { id }).await;
        Ok(updated)
    }

    pub async fn delete_dataset(&self, ctx: &SessionContext, id: u64) -> Result<(), GatewayError> {
        self.write(ctx, &format!("/datasets/{id}"), RequestOptions::delete()).await?;
        self.coordinator.after_mutation(&Mutation::DeleteDataset { id }).await;
        Ok(())
    }

    // --- documents ----------------------------------------------------------

    pub async fn documents_by_dataset(&self, ctx: &SessionContext, dataset_id: u64) -> Result<Value, GatewayError> {
        let tags = vec![ResourceTag::Documents, ResourceTag::Dataset(dataset_id)];
        self.read(ctx, &format!("/document/by-dataset/{dataset_id}"), CacheMode::Revalidate(LIST_TTL), tags).await
    }

    pub async fn create_text_document(&self, ctx: &SessionContext, input: &TextDocumentInput) -> Result<Value, GatewayError> {
        if input.content.trim().is_empty() {
            return Err(GatewayError::validation("dataset_id and content are required"));
        }
        let created = self.write(ctx, "/document/text", RequestOptions::post(Self::json(input)?)).await?;
        self.coordinator.after_mutation(&Mutation::CreateDocument { dataset_id: input.dataset_id }).await;
        Ok(created)
    }

    pub async fn create_file_document(&self, ctx: &SessionContext, upload: FileUpload) -> Result<Value, GatewayError> {
        if upload.file_name.is_empty() {
            return Err(GatewayError::validation("dataset_id and file are required"));
        }
        let dataset_id = upload.dataset_id;
        let parts = vec![
            FormPart::Text { name: "dataset_id".into(), value: dataset_id.to_string() },
            FormPart::File {
                name: "file".into(),
                file_name: upload.file_name,
                content_type: upload.content_type,
                bytes: upload.bytes,
            },
        ];
        let created = self
            .write(ctx, "/document/file", RequestOptions::post(Payload::Multipart(parts)))
            .await?;
        self.coordinator.after_mutation(&Mutation::CreateDocument { dataset_id }).await;
        Ok(created)
    }

    pub async fn delete_document(&self, ctx: &SessionContext, id: &str, dataset_id: Option<u64>) -> Result<(), GatewayError> {
        if id.trim().is_empty() {
            return Err(GatewayError::validation("document id is required"));
        }
        self.write(ctx, &format!("/document/{id}"), RequestOptions::delete()).await?;
        self.coordinator.after_mutation(&Mutation::DeleteDocument { dataset_id }).await;
        Ok(())
    }
}
