//! Bus topic names for one board.

use uuid::Uuid;

/// Client messages for the board actor.
pub fn inbound(board_id: Uuid) -> String {
    format!("board.{board_id}.msg-in")
}

/// Everything every session of the board forwards to its socket.
pub fn broadcast(board_id: Uuid) -> String {
    format!("board.{board_id}.msg-all")
}

/// Liveness probe answered by the running board actor.
pub fn status(board_id: Uuid) -> String {
    format!("board.{board_id}.status")
}

/// Timer commands, including the `status` request used for discovery.
pub fn timer_cmd(board_id: Uuid) -> String {
    format!("board.{board_id}.timer-cmd")
}
