use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use retro_db::{Database, StoreError};
use retro_types::models::{Board, Column};

use crate::board::BoardActor;
use crate::bus::Bus;
use crate::timer::{self, TimerActor};
use crate::topics;

pub const DEFAULT_COLUMNS: [&str; 4] = ["Good", "Bad", "Questions", "Emoji"];

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("board manager is shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Columns created with every new board, in order.
    pub initial_columns: Vec<String>,
    pub timer_enabled: bool,
    pub timer_tick: Duration,
    /// How long to wait for a running actor to answer a status probe.
    pub probe_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            initial_columns: DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            timer_enabled: true,
            timer_tick: timer::TICK_PERIOD,
            probe_timeout: timer::STATUS_TIMEOUT,
        }
    }
}

/// A board actor running in this process.
#[derive(Debug, Clone)]
pub struct BoardHandle {
    pub board_id: Uuid,
    instance: Uuid,
    cancel: CancellationToken,
}

impl BoardHandle {
    /// Ask the actor to stop. Its timer goes with it.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// Result of [`BoardManager::get_or_create`]: either an actor of ours, or the
/// board record when some other process already serves it.
#[derive(Debug, Clone)]
pub enum BoardRef {
    Local(BoardHandle),
    Remote(Board),
}

impl BoardRef {
    pub fn board_id(&self) -> Uuid {
        match self {
            Self::Local(handle) => handle.board_id,
            Self::Remote(board) => board.id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

struct TimerEntry {
    instance: Uuid,
    cancel: CancellationToken,
}

impl TimerEntry {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// Starts board and timer actors on demand and keeps track of the ones
/// running in this process. The maps only prevent duplicates locally;
/// across processes the status probes decide.
#[derive(Clone)]
pub struct BoardManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    db: Arc<Database>,
    bus: Bus,
    config: ManagerConfig,
    cancel: CancellationToken,
    tasks: TaskTracker,
    boards: RwLock<HashMap<Uuid, BoardHandle>>,
    timers: RwLock<HashMap<Uuid, TimerEntry>>,
}

impl BoardManager {
    pub fn new(db: Arc<Database>, bus: Bus, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                db,
                bus,
                config,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                boards: RwLock::new(HashMap::new()),
                timers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn healthy(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Make sure somebody serves `board_id`, starting a local actor if a
    /// status probe finds nobody.
    pub async fn get_or_create(&self, board_id: Uuid) -> Result<BoardRef, BoardError> {
        if !self.healthy() {
            return Err(BoardError::ShutDown);
        }
        if let Some(handle) = self.local_board(board_id).await.filter(BoardHandle::is_running) {
            return Ok(BoardRef::Local(handle));
        }

        let board = self.ensure_board(board_id).await?;

        let probe = self
            .inner
            .bus
            .request(&topics::status(board_id), Bytes::new(), self.inner.config.probe_timeout)
            .await;
        if probe.is_ok() {
            debug!(board = %board_id, "board served elsewhere");
            return Ok(BoardRef::Remote(board));
        }

        let mut boards = self.inner.boards.write().await;
        // another session may have started it while we probed; a stopped
        // actor still registered is replaced
        if let Some(handle) = boards.get(&board_id).filter(|h| h.is_running()) {
            return Ok(BoardRef::Local(handle.clone()));
        }

        let handle = BoardHandle {
            board_id,
            instance: Uuid::new_v4(),
            cancel: self.inner.cancel.child_token(),
        };
        let actor = BoardActor::new(board_id, handle.instance, self.clone());
        boards.insert(board_id, handle.clone());
        drop(boards);

        self.inner.tasks.spawn(actor.run(handle.cancel.clone()));
        info!(board = %board_id, "board actor started");
        Ok(BoardRef::Local(handle))
    }

    /// Start a timer for `board_id` unless one already runs here or answers
    /// the status probe. Returns true when this call started one. Two
    /// processes racing through the probe may both start one.
    pub async fn get_or_create_timer(&self, board_id: Uuid) -> bool {
        if !self.inner.config.timer_enabled || !self.healthy() {
            return false;
        }
        if self.has_local_timer(board_id).await {
            return false;
        }
        if timer::query_status(&self.inner.bus, board_id, self.inner.config.probe_timeout)
            .await
            .is_some()
        {
            debug!(board = %board_id, "timer served elsewhere");
            return false;
        }

        let mut timers = self.inner.timers.write().await;
        if timers.get(&board_id).is_some_and(TimerEntry::is_running) {
            return false;
        }

        // bound to the board actor when there is one, so stopping it stops the timer
        let parent = match self.inner.boards.read().await.get(&board_id).filter(|h| h.is_running()) {
            Some(handle) => handle.cancel.clone(),
            None => self.inner.cancel.clone(),
        };
        let entry = TimerEntry {
            instance: Uuid::new_v4(),
            cancel: parent.child_token(),
        };
        let actor = TimerActor::new(board_id, self.inner.bus.clone(), self.inner.config.timer_tick);
        let cancel = entry.cancel.clone();
        let instance = entry.instance;
        timers.insert(board_id, entry);
        drop(timers);

        let manager = self.clone();
        self.inner.tasks.spawn(async move {
            actor.run(cancel).await;
            manager.unregister_timer(board_id, instance).await;
        });
        true
    }

    /// Cancel the local timer of `board_id`, if any.
    pub async fn stop_timer(&self, board_id: Uuid) {
        if let Some(entry) = self.inner.timers.read().await.get(&board_id) {
            entry.cancel.cancel();
        }
    }

    pub async fn local_board(&self, board_id: Uuid) -> Option<BoardHandle> {
        self.inner.boards.read().await.get(&board_id).cloned()
    }

    pub async fn has_local_timer(&self, board_id: Uuid) -> bool {
        self.inner.timers.read().await.get(&board_id).is_some_and(TimerEntry::is_running)
    }

    /// Drop a board actor's registration. A newer actor for the same board
    /// keeps its entry, and false is returned.
    pub(crate) async fn unregister_board(&self, board_id: Uuid, instance: Uuid) -> bool {
        let mut boards = self.inner.boards.write().await;
        if boards.get(&board_id).is_some_and(|h| h.instance == instance) {
            boards.remove(&board_id);
            debug!(board = %board_id, "board actor unregistered");
            return true;
        }
        false
    }

    async fn unregister_timer(&self, board_id: Uuid, instance: Uuid) {
        let mut timers = self.inner.timers.write().await;
        if timers.get(&board_id).is_some_and(|t| t.instance == instance) {
            timers.remove(&board_id);
        }
    }

    /// Stop every local actor and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Stopping board manager");
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Fetch the board record, creating it with the initial columns if it
    /// doesn't exist yet.
    async fn ensure_board(&self, board_id: Uuid) -> Result<Board, BoardError> {
        let db = self.inner.db.clone();
        let columns = self.inner.config.initial_columns.clone();

        let board = tokio::task::spawn_blocking(move || -> Result<Board, StoreError> {
            match db.boards().get(board_id) {
                Ok(board) => return Ok(board),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            let board = Board::new(board_id);
            match db.boards().create(&board) {
                Ok(()) => {}
                // lost the race to another creator, who also made the columns
                Err(StoreError::AlreadyExists { .. }) => return db.boards().get(board_id),
                Err(e) => return Err(e),
            }

            let store = db.columns(board_id);
            for name in columns {
                store.create(&Column::new(name, board_id))?;
            }
            info!(board = %board_id, "board created");
            Ok(board)
        })
        .await??;

        Ok(board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BoardManager {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = ManagerConfig {
            probe_timeout: Duration::from_millis(100),
            ..ManagerConfig::default()
        };
        BoardManager::new(db, Bus::new(), config)
    }

    #[tokio::test]
    async fn new_board_gets_initial_columns() {
        let m = manager();
        let board_id = Uuid::new_v4();
        let board = m.get_or_create(board_id).await.unwrap();
        assert!(board.is_local());

        let names: Vec<_> = m.db().columns(board_id).list().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, DEFAULT_COLUMNS);

        // second call returns the same actor, no new columns
        let again = m.get_or_create(board_id).await.unwrap();
        match (board, again) {
            (BoardRef::Local(a), BoardRef::Local(b)) => assert_eq!(a.instance, b.instance),
            other => panic!("expected two local refs, got {other:?}"),
        }
        assert_eq!(m.db().columns(board_id).list().unwrap().len(), 4);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn existing_board_keeps_its_columns() {
        let m = manager();
        let board_id = Uuid::new_v4();
        m.db().boards().create(&Board::new(board_id)).unwrap();

        m.get_or_create(board_id).await.unwrap();
        assert!(m.db().columns(board_id).list().unwrap().is_empty());
        m.shutdown().await;
    }

    #[tokio::test]
    async fn sequential_timer_requests_start_one_timer() {
        let m = manager();
        let board_id = Uuid::new_v4();

        assert!(m.get_or_create_timer(board_id).await);
        assert!(!m.get_or_create_timer(board_id).await);
        assert_eq!(m.bus().subscriber_count(&topics::timer_cmd(board_id)), 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_timer_requests_start_one_timer() {
        let m = manager();
        let board_id = Uuid::new_v4();

        let (a, b) = tokio::join!(m.get_or_create_timer(board_id), m.get_or_create_timer(board_id));
        assert!(a ^ b, "exactly one call should start the timer, got {a} and {b}");
        assert_eq!(m.bus().subscriber_count(&topics::timer_cmd(board_id)), 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn timer_running_elsewhere_is_not_duplicated() {
        let bus = Bus::new();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let a = BoardManager::new(db.clone(), bus.clone(), ManagerConfig::default());
        let b = BoardManager::new(db, bus.clone(), ManagerConfig::default());
        let board_id = Uuid::new_v4();

        assert!(a.get_or_create_timer(board_id).await);
        assert!(!b.get_or_create_timer(board_id).await);
        assert!(!b.has_local_timer(board_id).await);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_timer_is_never_started() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = ManagerConfig {
            timer_enabled: false,
            ..ManagerConfig::default()
        };
        let m = BoardManager::new(db, Bus::new(), config);
        assert!(!m.get_or_create_timer(Uuid::new_v4()).await);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn stopping_board_stops_its_timer_and_unregisters() {
        let m = manager();
        let board_id = Uuid::new_v4();
        let BoardRef::Local(handle) = m.get_or_create(board_id).await.unwrap() else {
            panic!("expected a local board");
        };

        // the actor starts its timer on its own
        tokio::time::timeout(Duration::from_secs(2), async {
            while !m.has_local_timer(board_id).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.stop();
        tokio::time::timeout(Duration::from_secs(2), async {
            while m.local_board(board_id).await.is_some() || m.has_local_timer(board_id).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.is_running());
        m.shutdown().await;
    }

    #[tokio::test]
    async fn reopening_a_stopped_board_starts_a_new_actor() {
        let m = manager();
        let board_id = Uuid::new_v4();
        let BoardRef::Local(first) = m.get_or_create(board_id).await.unwrap() else {
            panic!("expected a local board");
        };

        // the old actor is still registered until its cleanup runs
        first.stop();
        let BoardRef::Local(second) = m.get_or_create(board_id).await.unwrap() else {
            panic!("expected a local board");
        };
        assert!(second.is_running());
        assert_ne!(second.instance, first.instance);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let current = m.local_board(board_id).await.expect("board still registered");
        assert_eq!(current.instance, second.instance);
        assert!(m.bus().subscriber_count(&topics::status(board_id)) >= 1);
        // the new actor owns a live timer, the old one's cleanup left it alone
        assert!(m.has_local_timer(board_id).await);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let m = manager();
        let board_id = Uuid::new_v4();
        m.get_or_create(board_id).await.unwrap();

        m.shutdown().await;
        assert!(!m.healthy());
        assert!(m.local_board(board_id).await.is_none());
        assert_eq!(m.bus().subscriber_count(&topics::status(board_id)), 0);
        assert_eq!(m.bus().topic_count(), 0);
        assert!(matches!(m.get_or_create(board_id).await, Err(BoardError::ShutDown)));
    }
}
