//! Tag-based invalidation.
//!
//! Every read declares the [`ResourceTag`]s it depends on; every successful
//! mutation is described by a [`Mutation`] whose tag set is fixed by
//! [`Mutation::tags`]. The coordinator fans those tags out to its sinks
//! after the fact and never lets a sink failure leak into the mutation's
//! own result.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceTag {
    Assistants,
    Assistant(u64),
    ChatMessages,
    Datasets,
    Dataset(u64),
    Documents,
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assistants => f.write_str("assistants"),
            Self::Assistant(id) => write!(f, "assistant-{id}"),
            Self::ChatMessages => f.write_str("chat-messages"),
            Self::Datasets => f.write_str("datasets"),
            Self::Dataset(id) => write!(f, "dataset-{id}"),
            Self::Documents => f.write_str("documents"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// `None` when the backend did not echo the new id.
    CreateAssistant { id: Option<u64> },
    UpdateAssistant { id: u64 },
    DeleteAssistant { id: u64 },
    UpdateAssistantDatasets { id: u64 },
    SendChatMessage { assistant_id: u64 },
    CreateDataset { id: Option<u64> },
    UpdateDataset { id: u64 },
    DeleteDataset { id: u64 },
    CreateDocument { dataset_id: u64 },
    DeleteDocument { dataset_id: Option<u64> },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateAssistant { .. } => "create_assistant",
            Self::UpdateAssistant { .. } => "update_assistant",
            Self::DeleteAssistant { .. } => "delete_assistant",
            Self::UpdateAssistantDatasets { .. } => "update_assistant_datasets",
            Self::SendChatMessage { .. } => "send_chat_message",
            Self::CreateDataset { .. } => "create_dataset",
            Self::UpdateDataset { .. } => "update_dataset",
            Self::DeleteDataset { .. } => "delete_dataset",
            Self::CreateDocument { .. } => "create_document",
            Self::DeleteDocument { .. } => "delete_document",
        }
    }

    /// The complete set of read scopes this mutation makes stale.
    pub fn tags(&self) -> BTreeSet<ResourceTag> {
        use ResourceTag::*;
        let tags: Vec<ResourceTag> = match *self {
            Self::CreateAssistant { id } => [Some(Assistants), id.map(Assistant)].into_iter().flatten().collect(),
            Self::UpdateAssistant { id } | Self::DeleteAssistant { id } | Self::UpdateAssistantDatasets { id } => {
                vec![Assistants, Assistant(id)]
            }
            Self::SendChatMessage { assistant_id } => vec![ChatMessages, Assistant(assistant_id)],
            Self::CreateDataset { id } => [Some(Datasets), id.map(Dataset)].into_iter().flatten().collect(),
            Self::UpdateDataset { id } | Self::DeleteDataset { id } => vec![Datasets, Dataset(id)],
            Self::CreateDocument { dataset_id } => vec![Documents, Dataset(dataset_id)],
            Self::DeleteDocument { dataset_id } => [Some(Documents), dataset_id.map(Dataset)].into_iter().flatten().collect(),
        };
        tags.into_iter().collect()
    }

    /// Page routes whose rendered output depends on the mutated data.
    pub fn paths(&self) -> Vec<String> {
        match *self {
            Self::CreateAssistant { id } => {
                let mut paths = vec!["/chat-bots".to_string()];
                paths.extend(id.map(|id| format!("/chat-bots/{id}")));
                paths
            }
            Self::UpdateAssistant { id } | Self::DeleteAssistant { id } => {
                vec!["/chat-bots".to_string(), format!("/chat-bots/{id}")]
            }
            Self::UpdateAssistantDatasets { id } => vec![format!("/chat-bots/{id}")],
            Self::SendChatMessage { assistant_id } => vec![format!("/chat-bots/{assistant_id}")],
            Self::CreateDataset { id } => {
                let mut paths = vec!["/datasets".to_string()];
                paths.extend(id.map(|id| format!("/datasets/{id}")));
                paths
            }
            Self::UpdateDataset { id } | Self::DeleteDataset { id } => {
                vec!["/datasets".to_string(), format!("/datasets/{id}")]
            }
            Self::CreateDocument { dataset_id } => vec![format!("/datasets/{dataset_id}")],
            Self::DeleteDocument { dataset_id } => dataset_id.map(|id| format!("/datasets/{id}")).into_iter().collect(),
        }
    }
}

/// Something holding cached reads that can be told they went stale.
#[async_trait]
pub trait Invalidator: Send + Sync {
    async fn invalidate_tags(&self, tags: &BTreeSet<ResourceTag>) -> anyhow::Result<()>;

    async fn revalidate_path(&self, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InvalidationCoordinator {
    sinks: Vec<Arc<dyn Invalidator>>,
}

impl InvalidationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn Invalidator>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Best effort: failures are logged and swallowed.
    pub async fn after_mutation(&self, mutation: &Mutation) {
        let tags = mutation.tags();
        let paths = mutation.paths();
        debug!(
            mutation = mutation.name(),
            tags = ?tags.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ?paths,
            "invalidating"
        );
        metrics::counter!("cache_invalidations_total", "mutation" => mutation.name()).increment(1);

        for sink in &self.sinks {
            if let Err(e) = sink.invalidate_tags(&tags).await {
                warn!(mutation = mutation.name(), error = %e, "tag invalidation failed");
            }
            for path in &paths {
                if let Err(e) = sink.revalidate_path(path).await {
                    warn!(mutation = mutation.name(), path = %path, error = %e, "path revalidation failed");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Records every call it receives.
    #[derive(Default)]
    pub struct RecordingInvalidator {
        pub tags: Mutex<Vec<BTreeSet<ResourceTag>>>,
        pub paths: Mutex<Vec<String>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Invalidator for RecordingInvalidator {
        async fn invalidate_tags(&self, tags: &BTreeSet<ResourceTag>) -> anyhow::Result<()> {
            self.tags.lock().await.push(tags.clone());
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            Ok(())
        }

        async fn revalidate_path(&self, path: &str) -> anyhow::Result<()> {
            self.paths.lock().await.push(path.to_string());
            Ok(())
        }
    }
}
