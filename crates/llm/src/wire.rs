use std::fmt;

use serde::{Deserialize, Serialize};

/// Role vocabulary understood by chat-completion APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

impl WireRole {
    pub const ALL: [WireRole; 3] = [WireRole::System, WireRole::User, WireRole::Assistant];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Exact, case-sensitive match against the wire vocabulary.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == raw)
    }
}

impl fmt::Display for WireRole {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Transient `{role, content}` message sent to the remote model. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: WireRole,
    pub content: String,
}

impl WireMessage {
    pub fn new(role: WireRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(WireRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(WireRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(WireRole::Assistant, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == WireRole::System
    }
}
