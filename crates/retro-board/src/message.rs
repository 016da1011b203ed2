//! The protocol envelope and the dispatch boundary.
//!
//! Every frame a browser sends, and everything the engine publishes, is an
//! [`Envelope`]: `{"type": ..., "data": ..., "user": ...}`. Inbound `data` is a
//! loose field bag; [`Command::decode`] turns it into a typed command exactly
//! once, so handlers never poke at raw JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use retro_types::models::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Me,
    BoardStatus,
    BoardNotification,
    ColumnNew,
    ColumnUpdate,
    ColumnDelete,
    CardNew,
    CardUpdate,
    CardDelete,
    CardVote,
    TimerCmd,
    TimerState,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Me => "me",
            Self::BoardStatus => "board.status",
            Self::BoardNotification => "board.notification",
            Self::ColumnNew => "column.new",
            Self::ColumnUpdate => "column.update",
            Self::ColumnDelete => "column.delete",
            Self::CardNew => "card.new",
            Self::CardUpdate => "card.update",
            Self::CardDelete => "card.delete",
            Self::CardVote => "card.vote",
            Self::TimerCmd => "timer.cmd",
            Self::TimerState => "timer.state",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "me" => Self::Me,
            "board.status" => Self::BoardStatus,
            "board.notification" => Self::BoardNotification,
            "column.new" => Self::ColumnNew,
            "column.update" => Self::ColumnUpdate,
            "column.delete" => Self::ColumnDelete,
            "card.new" => Self::CardNew,
            "card.update" => Self::CardUpdate,
            "card.delete" => Self::CardDelete,
            "card.vote" => Self::CardVote,
            "timer.cmd" => Self::TimerCmd,
            "timer.state" => Self::TimerState,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message data is not an object: {0}")]
    NotAnObject(String),

    #[error("no key `{0}` in message data")]
    MissingKey(String),

    #[error("key `{key}` is not {expected}: {value}")]
    WrongShape {
        key: String,
        expected: &'static str,
        value: String,
    },

    #[error("vote value of {0} is invalid")]
    InvalidVote(i64),

    #[error("unknown timer command `{0}`")]
    UnknownTimerCmd(String),

    #[error("message type `{0}` is not a command")]
    UnknownType(String),
}

/// Wire and internal unit of communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<Uuid>,
}

impl Envelope {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data,
            user: None,
            board_id: None,
        }
    }

    pub fn with_data<T: Serialize>(kind: MessageType, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(data)?))
    }

    /// `board.notification` with a human readable line, attributed to `user`.
    pub fn notification(text: impl Into<String>, user: User) -> Self {
        Self::new(MessageType::BoardNotification, Value::String(text.into())).with_user(user)
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_board(mut self, board_id: Uuid) -> Self {
        self.board_id = Some(board_id);
        self
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.kind)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn fields(&self) -> Result<&serde_json::Map<String, Value>, DecodeError> {
        self.data
            .as_object()
            .ok_or_else(|| DecodeError::NotAnObject(self.data.to_string()))
    }

    fn field(&self, key: &str) -> Result<&Value, DecodeError> {
        self.fields()?
            .get(key)
            .ok_or_else(|| DecodeError::MissingKey(key.to_string()))
    }

    /// Absent and `null` both read as "not given".
    fn optional_field(&self, key: &str) -> Result<Option<&Value>, DecodeError> {
        Ok(self.fields()?.get(key).filter(|v| !v.is_null()))
    }

    pub fn string_var(&self, key: &str) -> Result<String, DecodeError> {
        as_string(key, self.field(key)?)
    }

    pub fn int_var(&self, key: &str) -> Result<i64, DecodeError> {
        as_int(key, self.field(key)?)
    }

    pub fn id_var(&self, key: &str) -> Result<Uuid, DecodeError> {
        as_id(key, self.field(key)?)
    }

    pub fn opt_string_var(&self, key: &str) -> Result<Option<String>, DecodeError> {
        self.optional_field(key)?.map(|v| as_string(key, v)).transpose()
    }

    pub fn opt_id_var(&self, key: &str) -> Result<Option<Uuid>, DecodeError> {
        self.optional_field(key)?.map(|v| as_id(key, v)).transpose()
    }
}

fn wrong_shape(key: &str, expected: &'static str, value: &Value) -> DecodeError {
    DecodeError::WrongShape {
        key: key.to_string(),
        expected,
        value: value.to_string(),
    }
}

fn as_string(key: &str, value: &Value) -> Result<String, DecodeError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| wrong_shape(key, "a string", value))
}

fn as_int(key: &str, value: &Value) -> Result<i64, DecodeError> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    // browsers send every number as a double
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() <= i64::MAX as f64 => Ok(f as i64),
        _ => Err(wrong_shape(key, "an integer", value)),
    }
}

fn as_id(key: &str, value: &Value) -> Result<Uuid, DecodeError> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| wrong_shape(key, "a uuid", value))
}

/// A single vote on a card: exactly one step up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Up,
    Down,
}

impl Vote {
    pub fn delta(&self) -> i64 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }
}

impl TryFrom<i64> for Vote {
    type Error = DecodeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Up),
            -1 => Ok(Self::Down),
            other => Err(DecodeError::InvalidVote(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCmd {
    Start { value: Option<String> },
    Pause,
    Stop,
    Status,
}

impl TimerCmd {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Status => "status",
        }
    }

    /// Wire form, `{"cmd": ..., "value"?: ...}`.
    pub fn to_data(&self) -> Value {
        match self {
            Self::Start { value: Some(value) } => serde_json::json!({"cmd": "start", "value": value}),
            other => serde_json::json!({"cmd": other.name()}),
        }
    }
}

/// Inbound message, validated and typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Me,
    ColumnNew {
        name: String,
    },
    ColumnUpdate {
        id: Uuid,
        name: Option<String>,
    },
    ColumnDelete {
        id: Uuid,
    },
    CardNew {
        name: String,
        column_id: Uuid,
    },
    CardUpdate {
        id: Uuid,
        name: Option<String>,
        column_id: Option<Uuid>,
    },
    CardDelete {
        id: Uuid,
    },
    CardVote {
        id: Uuid,
        vote: Vote,
    },
    Timer(TimerCmd),
}

impl Command {
    pub fn decode(msg: &Envelope) -> Result<Self, DecodeError> {
        let Some(kind) = msg.message_type() else {
            return Err(DecodeError::UnknownType(msg.kind.clone()));
        };

        Ok(match kind {
            MessageType::Me => Self::Me,
            MessageType::ColumnNew => Self::ColumnNew {
                name: msg.string_var("name")?,
            },
            MessageType::ColumnUpdate => Self::ColumnUpdate {
                id: msg.id_var("id")?,
                name: msg.opt_string_var("name")?,
            },
            MessageType::ColumnDelete => Self::ColumnDelete {
                id: msg.id_var("id")?,
            },
            MessageType::CardNew => Self::CardNew {
                name: msg.string_var("name")?,
                column_id: msg.id_var("column_id")?,
            },
            MessageType::CardUpdate => Self::CardUpdate {
                id: msg.id_var("id")?,
                name: msg.opt_string_var("name")?,
                column_id: msg.opt_id_var("column_id")?,
            },
            MessageType::CardDelete => Self::CardDelete {
                id: msg.id_var("id")?,
            },
            MessageType::CardVote => Self::CardVote {
                id: msg.id_var("id")?,
                vote: Vote::try_from(msg.int_var("vote")?)?,
            },
            MessageType::TimerCmd => {
                let cmd = msg.string_var("cmd")?;
                Self::Timer(match cmd.as_str() {
                    "start" => TimerCmd::Start {
                        value: msg.opt_string_var("value")?,
                    },
                    "pause" => TimerCmd::Pause,
                    "stop" => TimerCmd::Stop,
                    "status" => TimerCmd::Status,
                    _ => return Err(DecodeError::UnknownTimerCmd(cmd)),
                })
            }
            MessageType::BoardStatus | MessageType::BoardNotification | MessageType::TimerState => {
                return Err(DecodeError::UnknownType(msg.kind.clone()));
            }
        })
    }
}

/// Several envelopes delivered as one frame: `{"type": "messages", "messages": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageList {
    #[serde(rename = "type")]
    pub kind: String,
    pub board_id: Uuid,
    pub messages: Vec<Envelope>,
}

impl MessageList {
    pub fn new(board_id: Uuid, messages: Vec<Envelope>) -> Self {
        Self {
            kind: "messages".to_string(),
            board_id,
            messages,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
