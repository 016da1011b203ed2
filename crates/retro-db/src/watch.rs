use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use retro_types::events::{EntityKind, WatchEvent, WatchOp};

use crate::{Database, Result};

/// Change feed for one board's clients, columns and cards.
///
/// A new watch first yields a `put` for every entity currently stored, then
/// live changes as they happen. Subscription happens before the replay is
/// read, so nothing written in between is lost; at worst an entity shows up
/// twice, and puts are idempotent for the consumer.
///
/// A watch that falls behind its board's channel resyncs: it replays the
/// current state again and emits a `del` for every entity it had announced
/// that no longer exists.
pub struct Watch {
    board_id: Uuid,
    db: Arc<Database>,
    replay: VecDeque<WatchEvent>,
    rx: broadcast::Receiver<WatchEvent>,
    known: HashSet<(EntityKind, Uuid)>,
}

impl Watch {
    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    /// Next change for this board. `None` once the database is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            if let Some(event) = self.replay.pop_front() {
                return Some(self.track(event));
            }

            match self.rx.recv().await {
                Ok(event) if event.board_id == self.board_id => return Some(self.track(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!(board = %self.board_id, "Watch lagged by {} changes, resyncing", n);
                    self.resync().await;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn track(&mut self, event: WatchEvent) -> WatchEvent {
        match event.op {
            WatchOp::Put => self.known.insert((event.kind, event.id)),
            WatchOp::Delete => self.known.remove(&(event.kind, event.id)),
        };
        event
    }

    async fn resync(&mut self) {
        let db = self.db.clone();
        let board_id = self.board_id;
        let current = match tokio::task::spawn_blocking(move || db.current_state(board_id)).await {
            Ok(Ok(current)) => current,
            Ok(Err(e)) => {
                warn!(board = %board_id, "Failed to resync watch: {}", e);
                return;
            }
            Err(e) => {
                warn!(board = %board_id, "Watch resync task failed: {}", e);
                return;
            }
        };

        let present: HashSet<_> = current.iter().map(|e| (e.kind, e.id)).collect();
        let mut gone: Vec<_> = self.known.difference(&present).copied().collect();
        gone.sort_by_key(|(kind, id)| (*kind as u8, *id));

        debug!(board = %board_id, "Resync replays {} entities, drops {}", current.len(), gone.len());
        self.replay.extend(current);
        self.replay
            .extend(gone.into_iter().map(|(kind, id)| WatchEvent::delete(board_id, kind, id)));
    }
}

impl Database {
    pub fn watch(self: &Arc<Self>, board_id: Uuid) -> Result<Watch> {
        let rx = self.subscribe_changes(board_id);
        let replay = self.current_state(board_id)?.into();

        Ok(Watch {
            board_id,
            db: self.clone(),
            replay,
            rx,
            known: HashSet::new(),
        })
    }

    /// A `put` for every client, column and card stored for `board_id`.
    fn current_state(&self, board_id: Uuid) -> Result<Vec<WatchEvent>> {
        let mut events = Vec::new();
        for client in self.clients(board_id).list()? {
            let obj = serde_json::to_value(&client)?;
            events.push(WatchEvent::put(board_id, EntityKind::Clients, client.id, obj));
        }
        for column in self.columns(board_id).list()? {
            let obj = serde_json::to_value(&column)?;
            events.push(WatchEvent::put(board_id, EntityKind::Columns, column.id, obj));
        }
        for card in self.cards(board_id).list()? {
            let obj = serde_json::to_value(&card)?;
            events.push(WatchEvent::put(board_id, EntityKind::Cards, card.id, obj));
        }
        Ok(events)
    }
}
