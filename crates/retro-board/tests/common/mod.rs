//! In-memory sockets wired to real sessions, managers and an in-process bus.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{sink, stream};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use retro_board::{BoardManager, Bus, ClientSession, Frame, ManagerConfig};
use retro_db::Database;
use retro_types::models::User;

const WAIT: Duration = Duration::from_secs(3);

pub fn config() -> ManagerConfig {
    ManagerConfig {
        initial_columns: vec!["Keep".to_string()],
        probe_timeout: Duration::from_millis(100),
        ..ManagerConfig::default()
    }
}

pub fn manager(config: ManagerConfig) -> BoardManager {
    let db = Arc::new(Database::open_in_memory().unwrap());
    BoardManager::new(db, Bus::new(), config)
}

pub fn user(name: &str) -> User {
    let mut user = User::new(1);
    user.name = name.to_string();
    user
}

/// Start the board and wait until its timer is up.
pub async fn board_with_timer(manager: &BoardManager) -> Uuid {
    let board_id = Uuid::new_v4();
    manager.get_or_create(board_id).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while !manager.has_local_timer(board_id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timer never started");
    board_id
}

pub struct TestSocket {
    pub client_id: Uuid,
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    task: JoinHandle<()>,
}

/// Run a session for `user` on `board_id` and wait until it is subscribed,
/// which is when the replay shows its own presence record.
pub async fn connect(manager: &BoardManager, user: User, board_id: Uuid) -> TestSocket {
    let session = ClientSession::start(manager.db().clone(), manager.bus().clone(), user, board_id)
        .await
        .unwrap()
        .with_heartbeat(Duration::from_secs(3600))
        .with_probe_timeout(Duration::from_millis(100));
    let client_id = session.client().id;

    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
    let reader = Box::pin(stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    }));

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer = Box::pin(sink::unfold(out_tx, |tx, frame: Frame| async move {
        tx.send(frame).map_err(|_| "socket closed")?;
        Ok::<_, &'static str>(tx)
    }));

    let task = tokio::spawn(session.run(reader, writer));
    let mut socket = TestSocket {
        client_id,
        tx: in_tx,
        rx: out_rx,
        task,
    };

    let id = client_id.to_string();
    socket
        .next_matching(|msg| msg["type"] == "clients" && msg["id"] == id.as_str())
        .await;
    socket
}

impl TestSocket {
    pub fn send(&self, msg: Value) {
        self.tx.send(Frame::Text(msg.to_string())).unwrap();
    }

    pub fn send_raw(&self, text: &str) {
        self.tx.send(Frame::Text(text.to_string())).unwrap();
    }

    pub fn send_type(&self, kind: &str, data: Value) {
        self.send(json!({"type": kind, "data": data}));
    }

    /// Next text frame as JSON, skipping pings.
    pub async fn next(&mut self) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.rx.recv().await {
                    Some(Frame::Text(text)) => return serde_json::from_str(&text).unwrap(),
                    Some(_) => continue,
                    None => panic!("socket closed"),
                }
            }
        })
        .await
        .expect("no message in time")
    }

    pub async fn next_matching(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        loop {
            let msg = self.next().await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        self.next_matching(|msg| msg["type"] == kind).await
    }

    /// Assert no frame of `kind` arrives within `window`.
    pub async fn assert_none_of_type(&mut self, kind: &str, window: Duration) {
        let result = tokio::time::timeout(window, async {
            loop {
                match self.rx.recv().await {
                    Some(Frame::Text(text)) => {
                        let msg: Value = serde_json::from_str(&text).unwrap();
                        if msg["type"] == kind {
                            return msg;
                        }
                    }
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        if let Ok(msg) = result {
            panic!("unexpected {kind}: {msg}");
        }
    }

    /// Hang up and wait for the session to finish cleaning up.
    pub async fn close(self) {
        let _ = self.tx.send(Frame::Close);
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("session did not stop")
            .unwrap();
    }
}
