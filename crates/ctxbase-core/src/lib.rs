pub mod events;
pub mod paging;

use chrono::{DateTime, Utc};
use paging::{Keyed, SortKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("invalid part: {0}")]
    InvalidPart(String),
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
    Running,
    #[default]
    Pending,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Running => "running",
            TaskStatus::Pending => "pending",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "running" => Ok(TaskStatus::Running),
            "pending" => Ok(TaskStatus::Pending),
            other => Err(ContractError::UnknownVariant {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
    Function,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
            MessageRole::Function => "function",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            "function" => Ok(MessageRole::Function),
            other => Err(ContractError::UnknownVariant {
                kind: "message role",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PartKind {
    Text,
    Image,
    Audio,
    Video,
    File,
    ToolCall,
    ToolResult,
    Data,
}

impl PartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartKind::Text => "text",
            PartKind::Image => "image",
            PartKind::Audio => "audio",
            PartKind::Video => "video",
            PartKind::File => "file",
            PartKind::ToolCall => "tool-call",
            PartKind::ToolResult => "tool-result",
            PartKind::Data => "data",
        }
    }
}

impl fmt::Display for PartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartKind {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "text" => Ok(PartKind::Text),
            "image" => Ok(PartKind::Image),
            "audio" => Ok(PartKind::Audio),
            "video" => Ok(PartKind::Video),
            "file" => Ok(PartKind::File),
            "tool-call" => Ok(PartKind::ToolCall),
            "tool-result" => Ok(PartKind::ToolResult),
            "data" => Ok(PartKind::Data),
            other => Err(ContractError::UnknownVariant {
                kind: "part type",
                value: other.to_string(),
            }),
        }
    }
}

/// Stored file metadata referenced by a media part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub bucket: String,
    pub s3_key: String,
    pub etag: String,
    pub sha256: String,
    pub mime: String,
    pub size_b: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Part {
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<Asset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonObject>,
}

impl Part {
    pub fn new(kind: PartKind) -> Self {
        Self {
            kind,
            text: None,
            asset: None,
            filename: None,
            meta: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(PartKind::Text)
        }
    }

    pub fn with_meta(mut self, meta: JsonObject) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Checks the fields each part kind depends on.
    pub fn validate(&self) -> Result<(), ContractError> {
        match self.kind {
            PartKind::Text => {
                if self.text.as_deref().map_or(true, str::is_empty) {
                    return Err(ContractError::InvalidPart(
                        "text part requires non-empty text field".to_string(),
                    ));
                }
            }
            PartKind::ToolCall => {
                self.require_meta_keys(&["name", "arguments"])?;
            }
            PartKind::ToolResult => {
                self.require_meta_keys(&["tool_call_id"])?;
            }
            PartKind::Data => {
                self.require_meta_keys(&["data_type"])?;
            }
            PartKind::Image | PartKind::Audio | PartKind::Video | PartKind::File => {}
        }
        Ok(())
    }

    fn require_meta_keys(&self, keys: &[&str]) -> Result<(), ContractError> {
        let Some(meta) = self.meta.as_ref() else {
            return Err(ContractError::InvalidPart(format!(
                "{} part requires meta field",
                self.kind
            )));
        };
        for key in keys {
            if !meta.contains_key(*key) {
                return Err(ContractError::InvalidPart(format!(
                    "{} part requires '{key}' in meta",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Space {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(default)]
    pub configs: JsonObject,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Space {
    pub fn new(project_id: Uuid, configs: JsonObject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            configs,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(default)]
    pub space_id: Option<Uuid>,
    #[serde(default)]
    pub configs: JsonObject,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(project_id: Uuid, space_id: Option<Uuid>, configs: JsonObject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            space_id,
            configs,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub role: MessageRole,
    #[serde(default)]
    pub meta: JsonObject,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default, rename = "session_task_process_status")]
    pub process_status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: Uuid, role: MessageRole, parts: Vec<Part>, meta: JsonObject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            parent_id: None,
            role,
            meta,
            parts,
            task_id: None,
            process_status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub session_id: Uuid,
    pub order: i64,
    #[serde(default)]
    pub data: JsonObject,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub is_planning: bool,
    #[serde(default)]
    pub space_digested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(session_id: Uuid, order: i64, data: JsonObject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            order,
            data,
            status: TaskStatus::Pending,
            is_planning: false,
            space_digested: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disk {
    pub id: Uuid,
    pub project_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Disk {
    pub fn new(project_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearningStatus {
    pub space_digested_count: u64,
    pub not_space_digested_count: u64,
}

macro_rules! keyed_by_created_at {
    ($($record:ty),+ $(,)?) => {
        $(
            impl Keyed for $record {
                fn sort_key(&self) -> SortKey {
                    SortKey::new(self.created_at, self.id)
                }
            }
        )+
    };
}

keyed_by_created_at!(Space, Session, Message, Task, Disk);
