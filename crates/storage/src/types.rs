use std::fmt;

use super::ids::{MessageId, RoomId};

/// Storage-local message role, intentionally decoupled from wire-format roles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageRole {
    Human,
    Assistant,
    System,
    /// Role text written by something other than this crate. Loaded as-is so
    /// readers can decide how to treat it instead of failing the whole room.
    Other(String),
}

impl MessageRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Human => "human",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "human" => Self::Human,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub name: String,
    pub created_at_unix_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub role: MessageRole,
    pub content: String,
    /// Mirrors the role for human/system rows; names the producing model for assistant rows.
    pub model_tag: String,
    pub timestamp_unix_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub model_tag: String,
}

impl NewMessage {
    pub fn new(
        role: MessageRole,
        content: impl Into<String>,
        model_tag: impl Into<String>,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            model_tag: model_tag.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Human, content, MessageRole::Human.as_str())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content, MessageRole::System.as_str())
    }

    pub fn assistant(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content, model)
    }
}
