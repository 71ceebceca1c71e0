use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidArgumentSnafu, InvalidIdSnafu, StorageError, StorageResult};

/// Opaque room identifier, minted once at creation and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(pub Uuid);

impl RoomId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a caller-supplied id. Blank input is an invalid argument rather than a bad id.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return InvalidArgumentSnafu {
                stage: "parse-room-id",
                argument: "room_id",
                details: "room id cannot be empty".to_string(),
            }
            .fail();
        }

        let parsed = Uuid::parse_str(trimmed).context(InvalidIdSnafu {
            stage: "parse-room-id",
            id_type: "room-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight characters, used for short labels and file names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for RoomId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for RoomId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

/// Store-scoped message identifier assigned on insert; strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i64);

impl MessageId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}
