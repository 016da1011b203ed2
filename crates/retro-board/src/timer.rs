//! Per-board countdown timer.
//!
//! [`Timer`] is the pure state machine; [`TimerActor`] owns one, ticks it,
//! listens for commands on the board's timer topic and broadcasts every
//! change. At most one actor should run per board across all processes:
//! whoever needs a timer first asks for its `status` with
//! [`query_status`] and only starts one when nobody answers in time.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use retro_types::events::{TimerState, TimerStatus};

use crate::bus::{Bus, BusMessage, Subscription};
use crate::message::{Command, Envelope, MessageType, TimerCmd};
use crate::topics;

/// Period between countdown steps. Each tick is one second of countdown.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// How long discovery waits for a running timer to answer `status`.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("start needs a duration value")]
    MissingDuration,

    #[error("invalid duration `{0}`")]
    InvalidDuration(String),
}

/// Parse a duration such as `90s`, `5m`, `1m30s`, `1.5h` or `500ms`.
pub fn parse_duration(raw: &str) -> Result<Duration, TimerError> {
    let invalid = || TimerError::InvalidDuration(raw.to_string());

    let mut rest = raw.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut seconds = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return Err(invalid()),
        };
        seconds += number * scale;
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// A state change caused by a command, used to word the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Resumed,
    Paused,
    Stopped,
}

impl Transition {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Resumed => "resumed",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timer {
    board_id: Uuid,
    status: TimerStatus,
    duration: u64,
    elapsed: u64,
    display: String,
}

impl Timer {
    pub fn new(board_id: Uuid) -> Self {
        let mut timer = Self {
            board_id,
            status: TimerStatus::Stopped,
            duration: 0,
            elapsed: 0,
            display: String::new(),
        };
        timer.update_display();
        timer
    }

    pub fn status(&self) -> TimerStatus {
        self.status
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn state(&self) -> TimerState {
        TimerState {
            board_id: self.board_id,
            status: self.status,
            display: self.display.clone(),
            duration: self.duration,
            elapsed: self.elapsed,
        }
    }

    /// Apply a command. `Ok(None)` means the command was accepted but has
    /// no effect in the current state; errors leave the state untouched.
    pub fn apply(&mut self, cmd: &TimerCmd) -> Result<Option<Transition>, TimerError> {
        let transition = match (cmd, self.status) {
            (TimerCmd::Start { value }, TimerStatus::Stopped | TimerStatus::Done) => {
                let raw = value.as_deref().ok_or(TimerError::MissingDuration)?;
                let duration = parse_duration(raw)?.as_secs();
                if duration == 0 {
                    return Err(TimerError::InvalidDuration(raw.to_string()));
                }
                self.duration = duration;
                self.elapsed = 0;
                self.status = TimerStatus::Running;
                Transition::Started
            }
            (TimerCmd::Start { .. }, TimerStatus::Paused) => {
                self.status = TimerStatus::Running;
                Transition::Resumed
            }
            (TimerCmd::Pause, TimerStatus::Running) => {
                self.status = TimerStatus::Paused;
                Transition::Paused
            }
            (TimerCmd::Stop, _) => {
                self.status = TimerStatus::Stopped;
                self.duration = 0;
                self.elapsed = 0;
                Transition::Stopped
            }
            _ => return Ok(None),
        };
        self.update_display();
        Ok(Some(transition))
    }

    /// Advance one second. Returns false (and changes nothing) unless running.
    pub fn tick(&mut self) -> bool {
        if self.status != TimerStatus::Running {
            return false;
        }
        self.elapsed += 1;
        if self.elapsed >= self.duration {
            self.status = TimerStatus::Done;
        }
        self.update_display();
        true
    }

    fn update_display(&mut self) {
        let remaining = self.duration.saturating_sub(self.elapsed);
        self.display = format!("{:02}:{:02}", remaining / 60, remaining % 60);
    }
}

/// Ask whichever timer actor serves `board_id` for its state. `None` when no
/// actor answers within `timeout`, which callers treat as "not running".
pub async fn query_status(bus: &Bus, board_id: Uuid, timeout: Duration) -> Option<TimerState> {
    let request = Envelope::new(MessageType::TimerCmd, TimerCmd::Status.to_data()).with_board(board_id);
    let payload = match request.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(board = %board_id, "Failed to encode timer status request: {}", e);
            return None;
        }
    };

    let reply = match bus.request(&topics::timer_cmd(board_id), payload, timeout).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(board = %board_id, "No timer answered: {}", e);
            return None;
        }
    };

    match Envelope::decode(&reply).and_then(|msg| Ok(serde_json::from_value(msg.data)?)) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(board = %board_id, "Bad timer status reply: {}", e);
            None
        }
    }
}

pub struct TimerActor {
    timer: Timer,
    bus: Bus,
    commands: Subscription,
    period: Duration,
}

impl TimerActor {
    /// Subscribes to the command topic right away, so the actor answers
    /// discovery probes from the moment it exists, before it is spawned.
    pub fn new(board_id: Uuid, bus: Bus, period: Duration) -> Self {
        let commands = bus.subscribe(&topics::timer_cmd(board_id));
        Self {
            timer: Timer::new(board_id),
            bus,
            commands,
            period,
        }
    }

    pub fn board_id(&self) -> Uuid {
        self.timer.board_id
    }

    /// Run until `cancel` fires. Commands and ticks are handled one at a
    /// time, so a command never interleaves with a tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        let board_id = self.board_id();
        info!(board = %board_id, "timer started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.timer.tick() {
                        if self.timer.status() == TimerStatus::Done {
                            info!(board = %board_id, "timer done");
                        }
                        self.publish_state();
                    }
                }
                msg = self.commands.recv() => match msg {
                    Some(msg) => {
                        if let Some(Transition::Started | Transition::Resumed) = self.on_command(msg) {
                            // count a full period from the moment it (re)starts
                            ticker.reset();
                        }
                    }
                    None => break,
                },
            }
        }

        drop(self.commands);
        info!(board = %board_id, "timer destroyed");
    }

    fn on_command(&mut self, msg: BusMessage) -> Option<Transition> {
        let board_id = self.board_id();
        let envelope = match Envelope::decode(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(board = %board_id, "Dropping undecodable timer command: {}", e);
                return None;
            }
        };
        let cmd = match Command::decode(&envelope) {
            Ok(Command::Timer(cmd)) => cmd,
            Ok(other) => {
                warn!(board = %board_id, "Timer got a non-timer command: {:?}", other);
                return None;
            }
            Err(e) => {
                warn!(board = %board_id, "Dropping invalid timer command: {}", e);
                return None;
            }
        };

        if cmd == TimerCmd::Status {
            self.reply_status(&msg);
            return None;
        }

        match self.timer.apply(&cmd) {
            Ok(Some(transition)) => {
                info!(board = %board_id, "timer {}", transition.verb());
                self.publish_state();
                if let Some(user) = envelope.user {
                    let name = if user.name.is_empty() { "Someone" } else { user.name.as_str() };
                    let text = format!("{} {} the timer", name, transition.verb());
                    self.publish(Envelope::notification(text, user));
                }
                Some(transition)
            }
            Ok(None) => {
                debug!(board = %board_id, "timer {} ignored while {:?}", cmd.name(), self.timer.status());
                None
            }
            Err(e) => {
                warn!(board = %board_id, "timer {} failed: {}", cmd.name(), e);
                None
            }
        }
    }

    fn state_message(&self) -> Result<Envelope, serde_json::Error> {
        Envelope::with_data(MessageType::TimerState, &self.timer.state())
    }

    fn reply_status(&self, msg: &BusMessage) {
        if !msg.expects_reply() {
            return;
        }
        match self.state_message().and_then(|m| m.encode()) {
            Ok(payload) => {
                msg.respond(payload);
            }
            Err(e) => warn!(board = %self.board_id(), "Failed to encode timer status: {}", e),
        }
    }

    fn publish_state(&self) {
        match self.state_message() {
            Ok(msg) => self.publish(msg),
            Err(e) => warn!(board = %self.board_id(), "Failed to encode timer state: {}", e),
        }
    }

    fn publish(&self, msg: Envelope) {
        let board_id = self.board_id();
        match msg.encode() {
            Ok(payload) => {
                self.bus.publish(&topics::broadcast(board_id), payload);
            }
            Err(e) => warn!(board = %board_id, "Failed to encode {}: {}", msg.kind, e),
        }
    }
}

/// Spawn a timer actor whose lifetime is bound to `cancel`.
pub fn spawn(board_id: Uuid, bus: Bus, period: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let actor = TimerActor::new(board_id, bus, period);
    tokio::spawn(actor.run(cancel))
}
