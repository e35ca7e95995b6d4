//! Axum router: the session REST API and the WebSocket attach endpoint.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use floeterm_core::events::SessionInfo;
use floeterm_core::{filter, CreateSessionOptions, SessionManager, TerminalError};

use crate::attach::AttachHub;
use crate::wire::{
    AttachBody, CreateSessionBody, HistoryChunk, HistoryQuery, InputBody, RenameBody, ResizeBody,
    WsQuery,
};

/// Shared app state: the session engine and the attach boundary.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub hub: Arc<AttachHub>,
}

/// Wire the attach hub in as the manager's event handler.
pub fn build_state(manager: Arc<SessionManager>) -> AppState {
    let hub = Arc::new(AttachHub::new());
    manager.set_event_handler(hub.clone());
    AppState { manager, hub }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", delete(delete_session))
        .route("/api/sessions/{id}/rename", post(rename_session))
        .route("/api/sessions/{id}/attach", post(attach_session))
        .route("/api/sessions/{id}/resize", post(resize_session))
        .route("/api/sessions/{id}/input", post(write_input))
        .route("/api/sessions/{id}/history", get(session_history))
        .route("/api/sessions/{id}/clear", post(clear_history))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until ctrl-c; all sessions are torn down on the way out.
pub async fn run_server(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let manager = state.manager.clone();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("floeterm listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    manager.close_all().await;
    Ok(())
}

type ApiError = (StatusCode, String);

fn error_response(err: TerminalError) -> ApiError {
    let status = match &err {
        TerminalError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        TerminalError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, message.to_string())
}

/// Resolve an optional (cols, rows) pair against the configured bounds.
fn checked_dims(
    manager: &SessionManager,
    cols: Option<u32>,
    rows: Option<u32>,
) -> Result<(u16, u16), ApiError> {
    let cols = cols.unwrap_or(80);
    let rows = rows.unwrap_or(24);
    if !manager.config().dims_valid(cols, rows) {
        return Err(bad_request(&format!("dimensions out of range: {cols}x{rows}")));
    }
    Ok((cols as u16, rows as u16))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.manager.list_sessions())
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SessionInfo>, ApiError> {
    let (cols, rows) = checked_dims(&state.manager, body.cols, body.rows)?;
    let info = state
        .manager
        .create_session(CreateSessionOptions {
            name: body.name,
            working_dir: body.working_dir,
            cols: Some(cols),
            rows: Some(rows),
        })
        .await
        .map_err(error_response)?;
    Ok(Json(info))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete_session(&id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<StatusCode, ApiError> {
    let Some(new_name) = body.new_name.filter(|n| !n.trim().is_empty()) else {
        return Err(bad_request("newName must not be empty"));
    };
    let session = state.manager.get(&id).map_err(error_response)?;
    session.rename(&new_name).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> Result<StatusCode, ApiError> {
    let Some(conn_id) = body.conn_id.filter(|c| !c.is_empty()) else {
        return Err(bad_request("connId is required"));
    };
    let (cols, rows) = checked_dims(&state.manager, body.cols, body.rows)?;
    // A dormant session springs to life on first attach.
    state
        .manager
        .activate_session(&id, cols, rows)
        .await
        .map_err(error_response)?;
    let session = state.manager.get(&id).map_err(error_response)?;
    session.add_connection(&conn_id, cols, rows);
    Ok(StatusCode::NO_CONTENT)
}

async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<StatusCode, ApiError> {
    if body.cols.is_none() || body.rows.is_none() {
        return Err(bad_request("cols and rows are required"));
    }
    let (cols, rows) = checked_dims(&state.manager, body.cols, body.rows)?;
    let session = state.manager.get(&id).map_err(error_response)?;
    match body.conn_id {
        Some(conn_id) => session
            .resize_for_connection(&conn_id, cols, rows)
            .map_err(error_response)?,
        None => session.resize(cols, rows).map_err(error_response)?,
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn write_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> Result<StatusCode, ApiError> {
    let Some(input) = body.input else {
        return Err(bad_request("input is required"));
    };
    if input.len() > state.manager.config().max_input_bytes {
        return Err(bad_request("input exceeds maximum length"));
    }
    let session = state.manager.get(&id).map_err(error_response)?;
    let source = body.conn_id;
    // PTY writes are blocking; keep them off the async workers.
    tokio::task::spawn_blocking(move || session.write(input.as_bytes(), source.as_deref()))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replay selection: auto-responses filtered out first, then the sequence
/// range applied.
fn select_history(
    chunks: Vec<floeterm_core::Chunk>,
    start_seq: Option<i64>,
    end_seq: Option<i64>,
) -> Vec<HistoryChunk> {
    let start = start_seq.unwrap_or(1);
    filter::filter_chunks(chunks)
        .into_iter()
        .filter(|c| c.sequence >= start)
        .take_while(|c| end_seq.is_none_or(|end| c.sequence <= end))
        .map(|c| HistoryChunk {
            sequence: c.sequence,
            data: BASE64.encode(&c.data),
            timestamp_ms: c.timestamp_ms,
        })
        .collect()
}

async fn session_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryChunk>>, ApiError> {
    let session = state.manager.get(&id).map_err(error_response)?;
    Ok(Json(select_history(
        session.history(),
        query.start_seq,
        query.end_seq,
    )))
}

async fn clear_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = state.manager.get(&id).map_err(error_response)?;
    session.clear_history();
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session_id) = query.session_id.filter(|s| !s.is_empty()) else {
        return bad_request("sessionId is required").into_response();
    };
    if state.manager.get(&session_id).is_err() {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    }
    let conn_id = query.conn_id.filter(|c| !c.is_empty());
    ws.on_upgrade(move |socket| handle_attach_socket(socket, state, session_id, conn_id))
}

async fn handle_attach_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    conn_id: Option<String>,
) {
    let (handle, mut events) = state.hub.subscribe(&session_id, conn_id);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let forward = async {
        while let Some(message) = events.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        // Queue closed: the session went away, or this consumer fell behind.
        if handle.kicked.load(Ordering::Relaxed) {
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "slow consumer".into(),
                })))
                .await;
        }
    };
    let drain = async {
        // Client frames are ignored; reading keeps close handshakes flowing.
        while let Some(Ok(_)) = ws_rx.next().await {}
    };
    tokio::select! {
        _ = forward => {}
        _ = drain => {}
    }

    if let Some(conn) = state.hub.unsubscribe(&session_id, &handle) {
        debug!(session = %session_id, conn = %conn, "last socket closed, detaching connection");
        if let Ok(session) = state.manager.get(&session_id) {
            session.remove_connection(&conn);
        }
    }
}
