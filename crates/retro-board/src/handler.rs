use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use retro_db::{Database, StoreError};
use retro_types::models::{Card, Column};

use crate::message::{Command, Vote};

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} is not a board mutation")]
    NotAMutation(&'static str),
}

impl HandleError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

/// Applies column and card commands to the store. Each command is one
/// get-then-put against a single board; consistency relies on the board
/// actor being the only caller for that board.
#[derive(Clone)]
pub struct MessageHandler {
    db: Arc<Database>,
}

impl MessageHandler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn handle(&self, board_id: Uuid, cmd: Command) -> Result<(), HandleError> {
        match cmd {
            Command::ColumnNew { name } => self.create_column(board_id, name),
            Command::ColumnUpdate { id, name } => self.update_column(board_id, id, name),
            Command::ColumnDelete { id } => Ok(self.db.columns(board_id).delete(id)?),
            Command::CardNew { name, column_id } => self.create_card(board_id, name, column_id),
            Command::CardUpdate { id, name, column_id } => self.update_card(board_id, id, name, column_id),
            Command::CardDelete { id } => Ok(self.db.cards(board_id).delete(id)?),
            Command::CardVote { id, vote } => self.vote_card(board_id, id, vote),
            Command::Me => Err(HandleError::NotAMutation("me")),
            Command::Timer(_) => Err(HandleError::NotAMutation("timer.cmd")),
        }
    }

    fn create_column(&self, board_id: Uuid, name: String) -> Result<(), HandleError> {
        let col = self.db.columns(board_id).create(&Column::new(name, board_id))?;
        debug!(board = %board_id, column = %col.id, order = col.order, "column created");
        Ok(())
    }

    fn update_column(&self, board_id: Uuid, id: Uuid, name: Option<String>) -> Result<(), HandleError> {
        let columns = self.db.columns(board_id);
        let mut col = columns.get(id)?;

        match name {
            Some(name) if name != col.name => {
                col.name = name;
                columns.update(&col)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn create_card(&self, board_id: Uuid, name: String, column_id: Uuid) -> Result<(), HandleError> {
        // the column must exist on this board
        let col = self.db.columns(board_id).get(column_id)?;
        let card = self.db.cards(board_id).create(&Card::new(name, board_id, col.id))?;
        debug!(board = %board_id, card = %card.id, "card created");
        Ok(())
    }

    fn update_card(
        &self,
        board_id: Uuid,
        id: Uuid,
        name: Option<String>,
        column_id: Option<Uuid>,
    ) -> Result<(), HandleError> {
        let cards = self.db.cards(board_id);
        let mut card = cards.get(id)?;

        if let Some(name) = name {
            card.name = name;
        }
        if let Some(column_id) = column_id {
            if column_id != card.column_id {
                card.column_id = self.db.columns(board_id).get(column_id)?.id;
            }
        }
        Ok(cards.update(&card)?)
    }

    fn vote_card(&self, board_id: Uuid, id: Uuid, vote: Vote) -> Result<(), HandleError> {
        let cards = self.db.cards(board_id);
        let mut card = cards.get(id)?;
        card.votes += vote.delta();
        Ok(cards.update(&card)?)
    }
}
