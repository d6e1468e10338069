use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversations are keyed by the assistant they are held with.
pub type ConversationId = u64;

/// Prefix of ids minted locally for messages not yet confirmed by the backend.
pub const TEMP_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_pending(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

pub fn assistant_count(messages: &[ChatMessage]) -> usize {
    messages.iter().filter(|m| m.role == Role::Assistant).count()
}

/// Turns a backend chat history payload into an ordered message list.
///
/// Field fallbacks, in order:
/// - id: `id`, `message_id`, the raw `timestamp` as a string, current epoch millis
/// - role: `role` (`"user"` is user, anything else assistant), then
///   `message_type == "user"`, otherwise assistant
/// - content: `content`, `message`, `text`
/// - timestamp: `timestamp`, `created_at`, now
///
/// Messages without content are dropped. The sort is stable so equal
/// timestamps keep arrival order.
pub fn normalize_messages(payload: &Value) -> Vec<ChatMessage> {
    let Some(items) = payload.as_array() else { return Vec::new() };
    let now = Utc::now();
    let mut out: Vec<ChatMessage> = items.iter().filter_map(|raw| normalize_message(raw, now)).collect();
    out.sort_by_key(|m| m.timestamp);
    out
}

fn normalize_message(raw: &Value, now: DateTime<Utc>) -> Option<ChatMessage> {
    let content = first_text(raw, &["content", "message", "text"])?;
    if content.is_empty() {
        return None;
    }

    let id = first_text(raw, &["id", "message_id", "timestamp"])
        .unwrap_or_else(|| now.timestamp_millis().to_string());

    let role = match raw.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some(r) if !r.is_empty() => Role::Assistant,
        _ => match raw.get("message_type").and_then(Value::as_str) {
            Some("user") => Role::User,
            _ => Role::Assistant,
        },
    };

    let timestamp = ["timestamp", "created_at"]
        .iter()
        .filter_map(|k| raw.get(*k))
        .find_map(parse_timestamp)
        .unwrap_or(now);

    Some(ChatMessage { id, role, content, timestamp })
}

/// First non-empty string or number among `keys`, rendered as text.
fn first_text(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match raw.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // Values this large can only be millisecond epochs.
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

/// Dataset ids linked to an assistant. The backend answers either with a
/// bare array or with `{"current": [...]}`; entries may be numeric strings.
pub fn normalize_dataset_ids(payload: &Value) -> Vec<u64> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map.get("current").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]),
        _ => &[],
    };
    items
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect()
}

/// Token fields in auth responses are either a string or `{"token": "..."}`.
pub fn extract_token(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.get("token").and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string),
        _ => None,
    }
}

/// The `id` a backend returned for a freshly created resource.
pub fn resource_id(v: &Value) -> Option<u64> {
    match v.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantInput {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AssistantPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AssistantDatasetsInput {
    #[serde(rename = "datasetIds", default)]
    pub dataset_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetInput {
    pub title: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DatasetPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextDocumentInput {
    pub dataset_id: u64,
    pub content: String,
}

/// A file headed for `/document/file`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub dataset_id: u64,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}
