use rusqlite::OptionalExtension;
use uuid::Uuid;

use retro_types::models::{Board, User};

use crate::{Database, Result, StoreError, insert_error, uuid_at};

// -- Users --

pub struct Users<'a> {
    db: &'a Database,
}

impl<'a> Users<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn list(&self) -> Result<Vec<User>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, avatar_id FROM users ORDER BY rowid")?;
            let rows = stmt.query_map([], user_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn create(&self, user: &User) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, avatar_id) VALUES (?1, ?2, ?3)",
                (user.id.to_string(), &user.name, user.avatar_id),
            )
            .map_err(|e| insert_error(e, "user", user.id, None))?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<User> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, avatar_id FROM users WHERE id = ?1",
                [id.to_string()],
                user_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { kind: "user", id })
        })
    }

    pub fn update(&self, user: &User) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET name = ?2, avatar_id = ?3 WHERE id = ?1",
                (user.id.to_string(), &user.name, user.avatar_id),
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "user", id: user.id });
            }
            Ok(())
        })
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM users WHERE id = ?1", [id.to_string()])?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "user", id });
            }
            Ok(())
        })
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        avatar_id: row.get(2)?,
    })
}

// -- Boards --

pub struct Boards<'a> {
    db: &'a Database,
}

impl<'a> Boards<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn list(&self) -> Result<Vec<Board>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, created_at FROM boards ORDER BY created_at, rowid")?;
            let rows = stmt.query_map([], board_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Fails with [`StoreError::AlreadyExists`] if the id is taken, which a
    /// racing creator should treat as success.
    pub fn create(&self, board: &Board) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO boards (id, created_at) VALUES (?1, ?2)",
                (board.id.to_string(), board.created_at),
            )
            .map_err(|e| insert_error(e, "board", board.id, None))?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Board> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, created_at FROM boards WHERE id = ?1",
                [id.to_string()],
                board_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { kind: "board", id })
        })
    }

    pub fn update(&self, board: &Board) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE boards SET created_at = ?2 WHERE id = ?1",
                (board.id.to_string(), board.created_at),
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "board", id: board.id });
            }
            Ok(())
        })
    }

    /// Removes the board together with its columns, cards and client records.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM boards WHERE id = ?1", [id.to_string()])?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "board", id });
            }
            Ok(())
        })
    }
}

fn board_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Board> {
    Ok(Board {
        id: uuid_at(row, 0)?,
        created_at: row.get(1)?,
    })
}
