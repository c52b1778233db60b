use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{DecodeHistorySnafu, EncodeHistorySnafu, StorageResult, UnknownRoleSnafu};

/// Storage key holding the serialized transcript.
pub const HISTORY_KEY: &str = "chatHistory";

/// Speaker of one persisted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }

    fn parse(raw: &str) -> StorageResult<Self> {
        match raw {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            other => UnknownRoleSnafu {
                stage: "parse-turn-role",
                role: other.to_string(),
            }
            .fail(),
        }
    }
}

/// Immutable unit of persisted conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }
}

// Wire shape mirrors the provider's content format: `{ role, parts: [{ text }] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredTurn {
    role: String,
    parts: Vec<StoredPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredPart {
    text: String,
}

impl From<&Turn> for StoredTurn {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            parts: vec![StoredPart {
                text: turn.text.clone(),
            }],
        }
    }
}

impl TryFrom<StoredTurn> for Turn {
    type Error = super::error::StorageError;

    fn try_from(stored: StoredTurn) -> StorageResult<Self> {
        let role = Role::parse(&stored.role)?;
        let text = stored
            .parts
            .into_iter()
            .map(|part| part.text)
            .collect::<String>();
        Ok(Self { role, text })
    }
}

pub fn encode_turns(turns: &[Turn]) -> StorageResult<String> {
    let stored = turns.iter().map(StoredTurn::from).collect::<Vec<_>>();
    serde_json::to_string(&stored).context(EncodeHistorySnafu {
        stage: "encode-turns",
    })
}

pub fn decode_turns(payload: &str) -> StorageResult<Vec<Turn>> {
    let stored: Vec<StoredTurn> = serde_json::from_str(payload).context(DecodeHistorySnafu {
        stage: "decode-turns",
    })?;
    stored.into_iter().map(Turn::try_from).collect()
}
