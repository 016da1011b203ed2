use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds since the unix epoch, the timestamp format used on the wire.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A person taking part in retrospectives. Users are global, not bound to a
/// board, and may hold several connections at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_id: u32,
}

impl User {
    pub fn new(avatar_id: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            avatar_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub created_at: i64,
}

impl Board {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            created_at: now_unix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: Uuid,
    pub name: String,
    /// Display position, assigned by the store on create. Never reused.
    pub order: i64,
    pub board_id: Uuid,
    pub created_at: i64,
}

impl Column {
    pub fn new(name: impl Into<String>, board_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            order: 0,
            board_id,
            created_at: now_unix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub name: String,
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub votes: i64,
    pub created_at: i64,
}

impl Card {
    pub fn new(name: impl Into<String>, board_id: Uuid, column_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            board_id,
            column_id,
            votes: 0,
            created_at: now_unix(),
        }
    }
}

/// Presence record for one live connection to a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub board_id: Uuid,
    pub user: User,
    #[serde(rename = "created_at")]
    pub joined_at: i64,
}

impl Client {
    pub fn new(user: User, board_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_id,
            user,
            joined_at: now_unix(),
        }
    }
}
