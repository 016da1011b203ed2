//! Board-scoped repositories. Every handle is bound to one board id, so a
//! lookup can never reach a column, card or client of another board. Each
//! successful write is announced to watchers.

use rusqlite::OptionalExtension;
use serde::Serialize;
use uuid::Uuid;

use retro_types::events::{EntityKind, WatchEvent};
use retro_types::models::{Card, Client, Column, User};

use crate::{Database, Result, StoreError, insert_error, uuid_at};

fn announce_put<T: Serialize>(
    db: &Database,
    board_id: Uuid,
    kind: EntityKind,
    id: Uuid,
    value: &T,
) -> Result<()> {
    let obj = serde_json::to_value(value)?;
    db.notify(WatchEvent::put(board_id, kind, id, obj));
    Ok(())
}

// -- Columns --

pub struct Columns<'a> {
    db: &'a Database,
    board_id: Uuid,
}

impl<'a> Columns<'a> {
    pub(crate) fn new(db: &'a Database, board_id: Uuid) -> Self {
        Self { db, board_id }
    }

    /// Columns in display order.
    pub fn list(&self) -> Result<Vec<Column>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, ord, board_id, created_at FROM board_columns
                 WHERE board_id = ?1 ORDER BY ord",
            )?;
            let rows = stmt.query_map([self.board_id.to_string()], column_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Inserts the column and returns it with its assigned `order`.
    pub fn create(&self, column: &Column) -> Result<Column> {
        let order = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO board_columns (id, board_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                (
                    column.id.to_string(),
                    self.board_id.to_string(),
                    &column.name,
                    column.created_at,
                ),
            )
            .map_err(|e| insert_error(e, "column", column.id, Some(self.board_id)))?;
            Ok(conn.last_insert_rowid())
        })?;

        let created = Column {
            order,
            board_id: self.board_id,
            ..column.clone()
        };
        announce_put(self.db, self.board_id, EntityKind::Columns, created.id, &created)?;
        Ok(created)
    }

    pub fn get(&self, id: Uuid) -> Result<Column> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, ord, board_id, created_at FROM board_columns
                 WHERE id = ?1 AND board_id = ?2",
                [id.to_string(), self.board_id.to_string()],
                column_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { kind: "column", id })
        })
    }

    /// Only the name is mutable; `order` stays where the store put it.
    pub fn update(&self, column: &Column) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE board_columns SET name = ?3 WHERE id = ?1 AND board_id = ?2",
                (column.id.to_string(), self.board_id.to_string(), &column.name),
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "column", id: column.id });
            }
            Ok(())
        })?;
        let stored = self.get(column.id)?;
        announce_put(self.db, self.board_id, EntityKind::Columns, stored.id, &stored)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM board_columns WHERE id = ?1 AND board_id = ?2",
                [id.to_string(), self.board_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "column", id });
            }
            Ok(())
        })?;
        self.db.notify(WatchEvent::delete(self.board_id, EntityKind::Columns, id));
        Ok(())
    }
}

fn column_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Column> {
    Ok(Column {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        order: row.get(2)?,
        board_id: uuid_at(row, 3)?,
        created_at: row.get(4)?,
    })
}

// -- Cards --

pub struct Cards<'a> {
    db: &'a Database,
    board_id: Uuid,
}

impl<'a> Cards<'a> {
    pub(crate) fn new(db: &'a Database, board_id: Uuid) -> Self {
        Self { db, board_id }
    }

    pub fn list(&self) -> Result<Vec<Card>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, board_id, column_id, votes, created_at FROM board_cards
                 WHERE board_id = ?1 ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map([self.board_id.to_string()], card_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn create(&self, card: &Card) -> Result<Card> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO board_cards (id, board_id, column_id, name, votes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    card.id.to_string(),
                    self.board_id.to_string(),
                    card.column_id.to_string(),
                    &card.name,
                    card.votes,
                    card.created_at,
                ),
            )
            .map_err(|e| insert_error(e, "card", card.id, Some(self.board_id)))?;
            Ok(())
        })?;

        let created = Card {
            board_id: self.board_id,
            ..card.clone()
        };
        announce_put(self.db, self.board_id, EntityKind::Cards, created.id, &created)?;
        Ok(created)
    }

    pub fn get(&self, id: Uuid) -> Result<Card> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, board_id, column_id, votes, created_at FROM board_cards
                 WHERE id = ?1 AND board_id = ?2",
                [id.to_string(), self.board_id.to_string()],
                card_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { kind: "card", id })
        })
    }

    pub fn update(&self, card: &Card) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE board_cards SET name = ?3, column_id = ?4, votes = ?5
                 WHERE id = ?1 AND board_id = ?2",
                (
                    card.id.to_string(),
                    self.board_id.to_string(),
                    &card.name,
                    card.column_id.to_string(),
                    card.votes,
                ),
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "card", id: card.id });
            }
            Ok(())
        })?;
        let stored = self.get(card.id)?;
        announce_put(self.db, self.board_id, EntityKind::Cards, stored.id, &stored)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM board_cards WHERE id = ?1 AND board_id = ?2",
                [id.to_string(), self.board_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "card", id });
            }
            Ok(())
        })?;
        self.db.notify(WatchEvent::delete(self.board_id, EntityKind::Cards, id));
        Ok(())
    }
}

fn card_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Card> {
    Ok(Card {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        board_id: uuid_at(row, 2)?,
        column_id: uuid_at(row, 3)?,
        votes: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// -- Clients --

pub struct Clients<'a> {
    db: &'a Database,
    board_id: Uuid,
}

impl<'a> Clients<'a> {
    pub(crate) fn new(db: &'a Database, board_id: Uuid) -> Self {
        Self { db, board_id }
    }

    pub fn list(&self) -> Result<Vec<Client>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, board_id, user_id, user_name, avatar_id, joined_at FROM board_clients
                 WHERE board_id = ?1 ORDER BY joined_at, rowid",
            )?;
            let rows = stmt.query_map([self.board_id.to_string()], client_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn create(&self, client: &Client) -> Result<Client> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO board_clients (id, board_id, user_id, user_name, avatar_id, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    client.id.to_string(),
                    self.board_id.to_string(),
                    client.user.id.to_string(),
                    &client.user.name,
                    client.user.avatar_id,
                    client.joined_at,
                ),
            )
            .map_err(|e| insert_error(e, "client", client.id, Some(self.board_id)))?;
            Ok(())
        })?;

        let created = Client {
            board_id: self.board_id,
            ..client.clone()
        };
        announce_put(self.db, self.board_id, EntityKind::Clients, created.id, &created)?;
        Ok(created)
    }

    pub fn get(&self, id: Uuid) -> Result<Client> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, board_id, user_id, user_name, avatar_id, joined_at FROM board_clients
                 WHERE id = ?1 AND board_id = ?2",
                [id.to_string(), self.board_id.to_string()],
                client_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { kind: "client", id })
        })
    }

    pub fn update(&self, client: &Client) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE board_clients SET user_name = ?3, avatar_id = ?4
                 WHERE id = ?1 AND board_id = ?2",
                (
                    client.id.to_string(),
                    self.board_id.to_string(),
                    &client.user.name,
                    client.user.avatar_id,
                ),
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "client", id: client.id });
            }
            Ok(())
        })?;
        let stored = self.get(client.id)?;
        announce_put(self.db, self.board_id, EntityKind::Clients, stored.id, &stored)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM board_clients WHERE id = ?1 AND board_id = ?2",
                [id.to_string(), self.board_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { kind: "client", id });
            }
            Ok(())
        })?;
        self.db.notify(WatchEvent::delete(self.board_id, EntityKind::Clients, id));
        Ok(())
    }
}

fn client_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: uuid_at(row, 0)?,
        board_id: uuid_at(row, 1)?,
        user: User {
            id: uuid_at(row, 2)?,
            name: row.get(3)?,
            avatar_id: row.get(4)?,
        },
        joined_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use retro_types::models::Board;

    fn db_with_board() -> (Database, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let board = Board::new(Uuid::new_v4());
        db.boards().create(&board).unwrap();
        (db, board.id)
    }

    #[test]
    fn column_order_increases_and_is_never_reused() {
        let (db, board_id) = db_with_board();
        let columns = db.columns(board_id);

        let a = columns.create(&Column::new("Good", board_id)).unwrap();
        let b = columns.create(&Column::new("Bad", board_id)).unwrap();
        assert!(b.order > a.order);

        columns.delete(b.id).unwrap();
        let c = columns.create(&Column::new("Questions", board_id)).unwrap();
        assert!(c.order > b.order);

        let names: Vec<_> = columns.list().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Good", "Questions"]);
    }

    #[test]
    fn column_lookup_is_scoped_to_board() {
        let (db, board_id) = db_with_board();
        let other = Board::new(Uuid::new_v4());
        db.boards().create(&other).unwrap();

        let col = db.columns(board_id).create(&Column::new("Good", board_id)).unwrap();
        assert!(db.columns(other.id).get(col.id).unwrap_err().is_not_found());
        assert!(db.columns(other.id).delete(col.id).unwrap_err().is_not_found());
    }

    #[test]
    fn column_on_missing_board_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let board_id = Uuid::new_v4();
        let err = db.columns(board_id).create(&Column::new("Good", board_id)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "board", .. }));
    }

    #[test]
    fn card_update_persists_votes_and_column() {
        let (db, board_id) = db_with_board();
        let good = db.columns(board_id).create(&Column::new("Good", board_id)).unwrap();
        let bad = db.columns(board_id).create(&Column::new("Bad", board_id)).unwrap();

        let mut card = db.cards(board_id).create(&Card::new("ship it", board_id, good.id)).unwrap();
        card.votes += 1;
        card.column_id = bad.id;
        db.cards(board_id).update(&card).unwrap();

        let stored = db.cards(board_id).get(card.id).unwrap();
        assert_eq!(stored.votes, 1);
        assert_eq!(stored.column_id, bad.id);
    }

    #[test]
    fn update_missing_card_is_not_found() {
        let (db, board_id) = db_with_board();
        let card = Card::new("ghost", board_id, Uuid::new_v4());
        assert!(db.cards(board_id).update(&card).unwrap_err().is_not_found());
    }

    #[test]
    fn clients_round_trip_user() {
        let (db, board_id) = db_with_board();
        let mut user = User::new(7);
        user.name = "Bob".into();

        let client = db.clients(board_id).create(&Client::new(user.clone(), board_id)).unwrap();
        let listed = db.clients(board_id).list().unwrap();
        assert_eq!(listed, vec![client.clone()]);
        assert_eq!(listed[0].user, user);

        db.clients(board_id).delete(client.id).unwrap();
        assert!(db.clients(board_id).list().unwrap().is_empty());
    }
}
