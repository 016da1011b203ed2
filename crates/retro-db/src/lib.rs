pub mod board_store;
pub mod migrations;
pub mod queries;
pub mod watch;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::Connection;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use retro_types::events::WatchEvent;

pub use board_store::{Cards, Clients, Columns};
pub use queries::{Boards, Users};
pub use watch::Watch;

/// Capacity of each board's change-notification channel.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} id={id} does not exist")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("{kind} id={id} already exists")]
    AlreadyExists { kind: &'static str, id: Uuid },

    #[error("database lock poisoned")]
    Poisoned,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding stored value: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Repository for users, boards and the board-scoped columns, cards and
/// client records, plus change notifications for the board-scoped ones.
pub struct Database {
    conn: Mutex<Connection>,
    /// One channel per watched board, dropped once its last watcher is gone.
    changes: Mutex<HashMap<Uuid, broadcast::Sender<WatchEvent>>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self::with_connection(conn)?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            changes: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    /// Fan a change out to the live watchers of its board. Nobody listening
    /// is fine.
    pub(crate) fn notify(&self, event: WatchEvent) {
        let mut changes = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        let board_id = event.board_id;
        if let Some(tx) = changes.get(&board_id) {
            if tx.send(event).is_err() {
                changes.remove(&board_id);
            }
        }
    }

    pub(crate) fn subscribe_changes(&self, board_id: Uuid) -> broadcast::Receiver<WatchEvent> {
        let mut changes = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        changes.retain(|_, tx| tx.receiver_count() > 0);
        changes
            .entry(board_id)
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of boards with a change channel open.
    pub fn watched_boards(&self) -> usize {
        let changes = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        changes.values().filter(|tx| tx.receiver_count() > 0).count()
    }

    pub fn users(&self) -> Users<'_> {
        Users::new(self)
    }

    pub fn boards(&self) -> Boards<'_> {
        Boards::new(self)
    }

    pub fn columns(&self, board_id: Uuid) -> Columns<'_> {
        Columns::new(self, board_id)
    }

    pub fn cards(&self, board_id: Uuid) -> Cards<'_> {
        Cards::new(self, board_id)
    }

    pub fn clients(&self, board_id: Uuid) -> Clients<'_> {
        Clients::new(self, board_id)
    }
}

/// Map a constraint violation on insert to a domain error; anything else
/// stays a sqlite error.
pub(crate) fn insert_error(
    err: rusqlite::Error,
    kind: &'static str,
    id: Uuid,
    board_id: Option<Uuid>,
) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            if let Some(board_id) = board_id {
                return StoreError::NotFound {
                    kind: "board",
                    id: board_id,
                };
            }
        }
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::AlreadyExists { kind, id };
        }
    }
    StoreError::Sqlite(err)
}

pub(crate) fn uuid_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
