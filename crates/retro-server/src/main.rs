mod config;
mod ws;

use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use retro_board::{BoardManager, Bus};
use retro_db::Database;
use retro_types::events::BoardStatus;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "retro=debug,retro_board=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = if config.db_path == ":memory:" {
        Database::open_in_memory()?
    } else {
        Database::open(Path::new(&config.db_path))?
    };

    let manager = BoardManager::new(Arc::new(db), Bus::new(), config.manager());
    let app = router(manager.clone());

    let addr = config.addr()?;
    info!("Retro server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("Retro server stopped");
    Ok(())
}

fn router(manager: BoardManager) -> Router {
    Router::new()
        .route("/", get(new_board))
        .route("/health", get(health))
        .route("/b/{board}", get(board_status))
        .route("/b/{board}/ws", get(ws::board_ws))
        .with_state(manager)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Every visit to the root starts a fresh board.
async fn new_board() -> Redirect {
    Redirect::to(&format!("/b/{}", Uuid::new_v4()))
}

/// `GET /b/{board}`: open the board if needed and return its snapshot.
async fn board_status(
    State(manager): State<BoardManager>,
    UrlPath(board_id): UrlPath<Uuid>,
) -> Result<Json<BoardStatus>, StatusCode> {
    manager.get_or_create(board_id).await.map_err(|e| {
        warn!(board = %board_id, "Failed to open board: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if manager.get_or_create_timer(board_id).await {
        info!(board = %board_id, "new timer started");
    }

    let db = manager.db().clone();
    let status = tokio::task::spawn_blocking(move || retro_board::board::snapshot(&db, board_id))
        .await
        .map_err(|e| {
            warn!(board = %board_id, "Snapshot task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            warn!(board = %board_id, "Failed to load board: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(status))
}

async fn health(State(manager): State<BoardManager>) -> impl IntoResponse {
    if manager.healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
