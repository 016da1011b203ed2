use rusqlite::Connection;
use tracing::debug;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL DEFAULT '',
            avatar_id   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS boards (
            id          TEXT PRIMARY KEY,
            created_at  INTEGER NOT NULL
        );

        -- AUTOINCREMENT keeps `ord` strictly increasing and never reused,
        -- even after the newest column is deleted.
        CREATE TABLE IF NOT EXISTS board_columns (
            ord         INTEGER PRIMARY KEY AUTOINCREMENT,
            id          TEXT NOT NULL UNIQUE,
            board_id    TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
            name        TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_columns_board
            ON board_columns(board_id, ord);

        CREATE TABLE IF NOT EXISTS board_cards (
            id          TEXT PRIMARY KEY,
            board_id    TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
            column_id   TEXT NOT NULL,
            name        TEXT NOT NULL,
            votes       INTEGER NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cards_board
            ON board_cards(board_id, created_at);

        CREATE TABLE IF NOT EXISTS board_clients (
            id          TEXT PRIMARY KEY,
            board_id    TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            user_name   TEXT NOT NULL,
            avatar_id   INTEGER NOT NULL,
            joined_at   INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_clients_board
            ON board_clients(board_id);
        ",
    )?;

    debug!("Database migrations complete");
    Ok(())
}
