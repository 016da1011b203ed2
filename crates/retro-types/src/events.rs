use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Card, Column};

/// Board-scoped entity families carried by store watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Clients,
    Columns,
    Cards,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::Columns => "columns",
            Self::Cards => "cards",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchOp {
    #[serde(rename = "put")]
    Put,
    #[serde(rename = "del")]
    Delete,
}

/// A single change to a board-scoped entity, keyed by
/// `{board_id}.{entity_type}.{entity_id}`.
///
/// Serialized as `{"type": "cards", "op": "put", "id": "...", "obj": {...}}`,
/// which is what browser clients apply to their local lists. Deletes carry no
/// `obj`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(skip)]
    pub board_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub op: WatchOp,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj: Option<serde_json::Value>,
}

impl WatchEvent {
    pub fn put(board_id: Uuid, kind: EntityKind, id: Uuid, obj: serde_json::Value) -> Self {
        Self {
            board_id,
            kind,
            op: WatchOp::Put,
            id,
            obj: Some(obj),
        }
    }

    pub fn delete(board_id: Uuid, kind: EntityKind, id: Uuid) -> Self {
        Self {
            board_id,
            kind,
            op: WatchOp::Delete,
            id,
            obj: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.board_id, self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerStatus {
    Stopped,
    Paused,
    Running,
    Done,
}

impl TimerStatus {
    /// Whether a newly joined participant needs to see the timer.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Timer state as broadcast in `timer.state` and returned by status replies.
/// `duration` and `elapsed` are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub board_id: Uuid,
    pub status: TimerStatus,
    pub display: String,
    pub duration: u64,
    pub elapsed: u64,
}

/// Full board snapshot carried by `board.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardStatus {
    pub id: Uuid,
    pub columns: Vec<Column>,
    pub cards: Vec<Card>,
}
