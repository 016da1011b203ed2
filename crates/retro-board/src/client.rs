use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use retro_db::{Database, StoreError};
use retro_types::models::{Client, User};

use crate::bus::Bus;
use crate::message::{Envelope, MessageList, MessageType};
use crate::timer;
use crate::topics;

/// Server sends a Ping this often. Two missed Pongs in a row drop the
/// connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Transport-neutral socket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One participant's connection to one board.
pub struct ClientSession {
    client: Client,
    db: Arc<Database>,
    bus: Bus,
    heartbeat: Duration,
    probe_timeout: Duration,
}

impl ClientSession {
    /// Register the participant on the board. The record lives until
    /// [`ClientSession::run`] returns.
    pub async fn start(db: Arc<Database>, bus: Bus, user: User, board_id: Uuid) -> Result<Self, SessionError> {
        let client = Client::new(user, board_id);
        let store = db.clone();
        let record = client.clone();
        let client = tokio::task::spawn_blocking(move || store.clients(board_id).create(&record)).await??;

        Ok(Self {
            client,
            db,
            bus,
            heartbeat: HEARTBEAT_INTERVAL,
            probe_timeout: timer::STATUS_TIMEOUT,
        })
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Pump frames until either side gives up, then unsubscribe, close the
    /// writer and remove the participant record.
    pub async fn run<R, W, E>(self, mut reader: R, mut writer: W)
    where
        R: Stream<Item = Result<Frame, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
        W: Sink<Frame> + Unpin + Send + 'static,
    {
        let client_id = self.client.id;
        let board_id = self.client.board_id;
        let user = self.client.user.clone();
        info!(board = %board_id, client = %client_id, "{} joined", user.name);

        let mut broadcast = self.bus.subscribe(&topics::broadcast(board_id));
        let db = self.db.clone();
        let mut watch = match tokio::task::spawn_blocking(move || db.watch(board_id)).await {
            Ok(Ok(watch)) => watch,
            Ok(Err(e)) => {
                warn!(board = %board_id, "Failed to watch board: {}", e);
                let _ = writer.close().await;
                self.remove_record().await;
                return;
            }
            Err(e) => {
                warn!(board = %board_id, "Watch task failed: {}", e);
                let _ = writer.close().await;
                self.remove_record().await;
                return;
            }
        };

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

        let pong_received = Arc::new(AtomicBool::new(true));
        let pong_flag_send = pong_received.clone();
        let pong_flag_recv = pong_received;

        let cancel = CancellationToken::new();
        let send_cancel = cancel.clone();
        let recv_cancel = cancel.clone();

        let heartbeat_interval = self.heartbeat;
        let mut send_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await;
            let mut missed_heartbeats: u8 = 0;

            loop {
                let frame = tokio::select! {
                    _ = send_cancel.cancelled() => break,
                    msg = broadcast.recv() => match msg {
                        Some(msg) => match String::from_utf8(msg.payload.to_vec()) {
                            Ok(text) => Frame::Text(text),
                            Err(_) => Frame::Binary(msg.payload),
                        },
                        None => break,
                    },
                    change = watch.next() => match change {
                        Some(change) => match serde_json::to_string(&change) {
                            Ok(text) => Frame::Text(text),
                            Err(e) => {
                                warn!("Failed to encode {} change: {}", change.key(), e);
                                continue;
                            }
                        },
                        None => break,
                    },
                    reply = reply_rx.recv() => match reply {
                        Some(text) => Frame::Text(text),
                        None => break,
                    },
                    _ = heartbeat.tick() => {
                        if pong_flag_send.swap(false, Ordering::Acquire) {
                            missed_heartbeats = 0;
                        } else {
                            missed_heartbeats += 1;
                            if missed_heartbeats >= 2 {
                                warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                                break;
                            }
                        }
                        Frame::Ping(Bytes::new())
                    }
                };

                if writer.send(frame).await.is_err() {
                    break;
                }
            }

            // unsubscribe before the socket goes away
            drop(broadcast);
            drop(watch);
            let _ = writer.close().await;
        });

        let reader_ctx = Reader {
            client: self.client.clone(),
            bus: self.bus.clone(),
            replies: reply_tx,
            probe_timeout: self.probe_timeout,
        };
        let mut recv_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = recv_cancel.cancelled() => break,
                    frame = reader.next() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                match frame {
                    Ok(Frame::Text(text)) => reader_ctx.on_frame(text.as_bytes()).await,
                    Ok(Frame::Binary(data)) => reader_ctx.on_frame(&data).await,
                    Ok(Frame::Pong(_)) => {
                        pong_flag_recv.store(true, Ordering::Release);
                    }
                    Ok(Frame::Ping(_)) => {}
                    Ok(Frame::Close) => break,
                    Err(e) => {
                        debug!("Read failed: {}", e);
                        break;
                    }
                }
            }
        });

        // whichever side finishes first takes the other down
        tokio::select! {
            _ = &mut send_task => {
                cancel.cancel();
                recv_task.abort();
            }
            _ = &mut recv_task => {
                cancel.cancel();
                let _ = send_task.await;
            }
        }

        self.remove_record().await;
        info!(board = %board_id, client = %client_id, "{} left", user.name);
    }

    async fn remove_record(&self) {
        let db = self.db.clone();
        let board_id = self.client.board_id;
        let client_id = self.client.id;
        match tokio::task::spawn_blocking(move || db.clients(board_id).delete(client_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(board = %board_id, client = %client_id, "Failed to remove client: {}", e),
            Err(e) => warn!(board = %board_id, client = %client_id, "Client removal task failed: {}", e),
        }
    }
}

/// Reader half: decodes frames and routes them.
struct Reader {
    client: Client,
    bus: Bus,
    replies: mpsc::UnboundedSender<String>,
    probe_timeout: Duration,
}

impl Reader {
    async fn on_frame(&self, raw: &[u8]) {
        let board_id = self.client.board_id;
        let mut envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let text = String::from_utf8_lossy(raw);
                let cut = text.char_indices().nth(200).map_or(text.len(), |(i, _)| i);
                warn!(
                    "{} ({}) bad message: {} -- raw: {}",
                    self.client.user.name,
                    self.client.id,
                    e,
                    &text[..cut]
                );
                return;
            }
        };
        envelope.user = Some(self.client.user.clone());
        envelope.board_id = Some(board_id);

        match envelope.message_type() {
            Some(MessageType::Me) => self.reply_me(envelope).await,
            Some(MessageType::TimerCmd) => self.forward(&topics::timer_cmd(board_id), &envelope),
            _ => self.forward(&topics::inbound(board_id), &envelope),
        }
    }

    fn forward(&self, topic: &str, envelope: &Envelope) {
        match envelope.encode() {
            Ok(payload) => {
                let reached = self.bus.publish(topic, payload);
                trace!(topic, reached, "forwarded {}", envelope.kind);
                if reached == 0 {
                    debug!(topic, "nobody listening for {}", envelope.kind);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", envelope.kind, e),
        }
    }

    /// Echo the identified envelope, plus the timer state when a timer is
    /// running or paused (a paused timer emits nothing on its own).
    async fn reply_me(&self, me: Envelope) {
        let board_id = self.client.board_id;
        let mut messages = vec![me];

        if let Some(state) = timer::query_status(&self.bus, board_id, self.probe_timeout).await {
            if state.status.is_active() {
                match Envelope::with_data(MessageType::TimerState, &state) {
                    Ok(msg) => messages.push(msg.with_board(board_id)),
                    Err(e) => warn!("Failed to encode timer state: {}", e),
                }
            }
        }

        match MessageList::new(board_id, messages).encode() {
            Ok(text) => {
                let _ = self.replies.send(text);
            }
            Err(e) => warn!("Failed to encode me reply: {}", e),
        }
    }
}
