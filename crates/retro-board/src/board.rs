use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use retro_db::Database;
use retro_types::events::BoardStatus;
use retro_types::models::User;

use crate::bus::{Bus, Subscription};
use crate::handler::{HandleError, MessageHandler};
use crate::manager::BoardManager;
use crate::message::{Command, Envelope, MessageType};
use crate::topics;

/// The one task allowed to change a board's columns and cards.
///
/// Messages are handled strictly in arrival order, one at a time, so a
/// handler's read-modify-write never races another handler for the same
/// board inside this process.
pub struct BoardActor {
    board_id: Uuid,
    instance: Uuid,
    manager: BoardManager,
    handler: MessageHandler,
    inbound: Subscription,
    status: Subscription,
}

impl BoardActor {
    /// Subscribes to the inbound and status topics immediately, so the board
    /// answers probes before its task is even scheduled.
    pub(crate) fn new(board_id: Uuid, instance: Uuid, manager: BoardManager) -> Self {
        let bus = manager.bus();
        let inbound = bus.subscribe(&topics::inbound(board_id));
        let status = bus.subscribe(&topics::status(board_id));
        Self {
            board_id,
            instance,
            handler: MessageHandler::new(manager.db().clone()),
            manager,
            inbound,
            status,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let board_id = self.board_id;
        info!(board = %board_id, "board actor running");

        if self.manager.config().timer_enabled && self.manager.get_or_create_timer(board_id).await {
            debug!(board = %board_id, "timer started by board actor");
        }

        loop {
            tokio::select! {
                // a stopped actor must not answer status requests
                biased;
                _ = cancel.cancelled() => break,
                probe = self.status.recv() => match probe {
                    Some(msg) => {
                        msg.respond(Bytes::new());
                    }
                    None => break,
                },
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.on_message(&msg.payload).await,
                    None => break,
                },
            }
        }

        cancel.cancel();
        let Self { manager, inbound, status, instance, .. } = self;
        drop(inbound);
        drop(status);
        // a newer actor for this board owns whatever timer is registered now
        if manager.unregister_board(board_id, instance).await {
            manager.stop_timer(board_id).await;
        }
        info!(board = %board_id, "board actor stopped");
    }

    async fn on_message(&self, raw: &[u8]) {
        let board_id = self.board_id;
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(board = %board_id, "Dropping undecodable message: {}", e);
                return;
            }
        };
        let cmd = match Command::decode(&envelope) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(board = %board_id, "Dropping {} message: {}", envelope.kind, e);
                return;
            }
        };

        match cmd {
            Command::Me => {
                debug!(board = %board_id, "ignoring me on the board topic");
            }
            Command::Timer(_) => {
                // sessions send these straight to the timer; relay stragglers
                self.bus().publish(&topics::timer_cmd(board_id), Bytes::copy_from_slice(raw));
            }
            cmd => self.mutate(cmd, envelope.user).await,
        }
    }

    async fn mutate(&self, cmd: Command, user: Option<User>) {
        let board_id = self.board_id;
        let handler = self.handler.clone();
        let db = self.manager.db().clone();
        let label = format!("{cmd:?}");

        let result = tokio::task::spawn_blocking(move || -> Result<BoardStatus, HandleError> {
            handler.handle(board_id, cmd)?;
            Ok(snapshot(&db, board_id)?)
        })
        .await;

        let status = match result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(board = %board_id, "Rejected {}: {}", label, e);
                return;
            }
            Err(e) => {
                warn!(board = %board_id, "Handler task failed: {}", e);
                return;
            }
        };

        let mut msg = match Envelope::with_data(MessageType::BoardStatus, &status) {
            Ok(msg) => msg.with_board(board_id),
            Err(e) => {
                warn!(board = %board_id, "Failed to encode board status: {}", e);
                return;
            }
        };
        msg.user = user;

        match msg.encode() {
            Ok(payload) => {
                let reached = self.bus().publish(&topics::broadcast(board_id), payload);
                debug!(board = %board_id, reached, "board.status published");
            }
            Err(e) => warn!(board = %board_id, "Failed to encode board status: {}", e),
        }
    }

    fn bus(&self) -> &Bus {
        self.manager.bus()
    }
}

/// Current columns and cards of a board.
pub fn snapshot(db: &Arc<Database>, board_id: Uuid) -> retro_db::Result<BoardStatus> {
    Ok(BoardStatus {
        id: board_id,
        columns: db.columns(board_id).list()?,
        cards: db.cards(board_id).list()?,
    })
}
