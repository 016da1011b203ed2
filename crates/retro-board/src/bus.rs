use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::warn;

/// Per-topic buffer. A subscriber that falls further behind than this skips
/// ahead to the newest messages.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no reply on `{topic}` within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("no responders on `{topic}`")]
    NoResponders { topic: String },
}

/// A payload delivered to a topic subscriber. Messages sent with
/// [`Bus::request`] carry a reply path; [`BusMessage::respond`] answers the
/// requester directly without touching the topic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub payload: Bytes,
    reply: Option<mpsc::Sender<Bytes>>,
}

impl BusMessage {
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer a request. Returns false when there is nothing to answer or the
    /// requester already got a reply or gave up.
    pub fn respond(&self, payload: Bytes) -> bool {
        match &self.reply {
            Some(tx) => tx.try_send(payload).is_ok(),
            None => false,
        }
    }
}

/// Topic-based publish/subscribe with request/reply, shared by every board
/// actor, timer actor and client session in the process.
///
/// Publishing is fire-and-forget: a topic without subscribers drops the
/// message. Dropping a [`Subscription`] unsubscribes, and the last one to go
/// removes its topic.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to a topic. Only messages published after this call are seen.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Subscription {
            topic: topic.to_string(),
            rx: tx.subscribe(),
            bus: self.inner.clone(),
        }
    }

    /// Publish to every current subscriber of `topic`. Returns how many
    /// subscribers the message reached.
    pub fn publish(&self, topic: &str, payload: Bytes) -> usize {
        self.send(topic, BusMessage { payload, reply: None })
    }

    /// Publish and wait for the first reply. Further replies are discarded.
    pub async fn request(&self, topic: &str, payload: Bytes, timeout: Duration) -> Result<Bytes, BusError> {
        let (tx, mut rx) = mpsc::channel(1);
        let reached = self.send(
            topic,
            BusMessage {
                payload,
                reply: Some(tx),
            },
        );
        if reached == 0 {
            return Err(BusError::NoResponders {
                topic: topic.to_string(),
            });
        }

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            // every subscriber dropped the request unanswered
            Ok(None) => Err(BusError::NoResponders {
                topic: topic.to_string(),
            }),
            Err(_) => Err(BusError::Timeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).map_or(0, |tx| tx.receiver_count())
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn send(&self, topic: &str, message: BusMessage) -> usize {
        let topics = self.inner.topics.read().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        }
    }
}

/// Receiving end of one topic.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<BusMessage>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message on the topic. Skips over messages lost to lag; `None`
    /// only if the topic itself is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(RecvError::Lagged(n)) => {
                    warn!("Subscriber on {} lagged by {} messages", self.topic, n);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = self.bus.topics.write().unwrap_or_else(PoisonError::into_inner);
        // our own receiver is still counted here
        if topics.get(&self.topic).is_some_and(|tx| tx.receiver_count() <= 1) {
            topics.remove(&self.topic);
        }
    }
}
