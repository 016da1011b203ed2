use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::Response,
};
use futures_util::{SinkExt, StreamExt, future};
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use retro_board::{BoardManager, ClientSession, Frame};
use retro_types::models::User;

/// Avatars are numbered 1 to 11.
const AVATARS_COUNT: u32 = 12;

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    /// Display name.
    #[serde(default)]
    pub u: String,
    /// Returning user's id, if the browser has one.
    pub user: Option<Uuid>,
}

/// `GET /b/{board}/ws`: identify the user, make sure the board and its
/// timer are being served, then hand the socket to a session.
pub async fn board_ws(
    State(manager): State<BoardManager>,
    Path(board_id): Path<Uuid>,
    Query(params): Query<JoinParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let user = resolve_user(&manager, params).await.map_err(|e| {
        warn!("Failed to resolve user: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    manager.get_or_create(board_id).await.map_err(|e| {
        warn!(board = %board_id, "Failed to open board: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if manager.get_or_create_timer(board_id).await {
        info!(board = %board_id, "new timer started");
    }

    Ok(ws.on_upgrade(move |socket| serve_socket(socket, manager, user, board_id)))
}

async fn serve_socket(socket: WebSocket, manager: BoardManager, user: User, board_id: Uuid) {
    let session = match ClientSession::start(manager.db().clone(), manager.bus().clone(), user, board_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(board = %board_id, "Failed to start session: {}", e);
            return;
        }
    };

    let (sink, stream) = socket.split();
    let reader = Box::pin(stream.map(|msg| msg.map(to_frame)));
    let writer = Box::pin(sink.with(|frame| future::ready(Ok::<_, axum::Error>(to_message(frame)))));
    session.run(reader, writer).await;
}

/// Find the user by id, or create one with a random avatar, and store the
/// requested display name.
async fn resolve_user(manager: &BoardManager, params: JoinParams) -> anyhow::Result<User> {
    let db = manager.db().clone();
    let avatar_id = rand::rng().random_range(1..AVATARS_COUNT);

    let user = tokio::task::spawn_blocking(move || -> retro_db::Result<User> {
        let existing = match params.user {
            Some(id) => match db.users().get(id) {
                Ok(user) => Some(user),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let mut user = match existing {
            Some(user) => user,
            None => {
                let user = User::new(avatar_id);
                db.users().create(&user)?;
                info!(user = %user.id, "new user created");
                user
            }
        };

        if user.name != params.u {
            user.name = params.u;
            db.users().update(&user)?;
        }
        Ok(user)
    })
    .await??;

    Ok(user)
}

fn to_frame(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text.as_str().to_string()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}
