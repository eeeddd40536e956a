//! WebSocket endpoints for bots and workers, plus the status API.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use botmesh_protocol::{
    Dialect, DEFAULT_PLATFORM, HEADER_CLIENT_ROLE, HEADER_PLATFORM, HEADER_PROTOCOL,
    HEADER_SELF_ID, HEADER_WORKER_ID,
};
use botmesh_state::{
    peer_key, BotPeer, BotRoute, DisconnectReason, LinkCommand, PeerKind, PeerLink, Registry,
    WorkerPeer, WorkerRoute,
};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::DispatchError;

#[derive(Clone)]
pub struct AppState {
    dispatcher: Dispatcher,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, config: ServerConfig) -> Self {
        Self {
            registry: dispatcher.registry().clone(),
            dispatcher,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_any))
        .route("/ws/bot", get(ws_bot))
        .route("/ws/worker", get(ws_worker))
        .route("/api/health", get(api_health))
        .route("/api/status", get(api_status))
        .with_state(state)
}

/// Serve until `shutdown` flips to true.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// ── Handshake ───────────────────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn dialect_of(headers: &HeaderMap) -> Dialect {
    header(headers, HEADER_PROTOCOL)
        .map(Dialect::from_header)
        .unwrap_or_default()
}

async fn at_capacity(app: &AppState) -> bool {
    app.registry.bot_count().await + app.registry.worker_count().await >= app.config.max_connections
}

fn reject(status: StatusCode, reason: &str) -> Response {
    (status, Json(json!({"ok": false, "error": reason}))).into_response()
}

async fn ws_any(ws: WebSocketUpgrade, State(app): State<AppState>, headers: HeaderMap) -> Response {
    let is_worker = header(&headers, HEADER_CLIENT_ROLE)
        .map(|role| role.eq_ignore_ascii_case("worker"))
        .unwrap_or(false);
    if is_worker {
        accept_worker(ws, app, &headers).await
    } else {
        accept_bot(ws, app, &headers).await
    }
}

async fn ws_bot(ws: WebSocketUpgrade, State(app): State<AppState>, headers: HeaderMap) -> Response {
    accept_bot(ws, app, &headers).await
}

async fn ws_worker(ws: WebSocketUpgrade, State(app): State<AppState>, headers: HeaderMap) -> Response {
    accept_worker(ws, app, &headers).await
}

async fn accept_bot(ws: WebSocketUpgrade, app: AppState, headers: &HeaderMap) -> Response {
    let Some(self_id) = header(headers, HEADER_SELF_ID).map(str::to_string) else {
        tracing::warn!("Rejected bot connection without X-Self-ID");
        return reject(StatusCode::BAD_REQUEST, "X-Self-ID header is required");
    };
    if at_capacity(&app).await {
        tracing::warn!(self_id = %self_id, "Rejected bot connection, gateway at capacity");
        return reject(StatusCode::SERVICE_UNAVAILABLE, "too many connections");
    }
    let platform = header(headers, HEADER_PLATFORM)
        .unwrap_or(DEFAULT_PLATFORM)
        .to_ascii_lowercase();
    let dialect = dialect_of(headers);

    ws.on_upgrade(move |socket| async move {
        let (link, rx) = PeerLink::channel(peer_key(PeerKind::Bot, &self_id), app.config.link_capacity);
        let connection_id = app
            .registry
            .register_bot(BotPeer::new(&self_id, &platform, dialect, link.clone()))
            .await;
        tracing::info!(self_id = %self_id, platform = %platform, dialect = dialect.as_str(), "Bot connected");
        let route = BotRoute {
            self_id,
            platform,
            dialect,
            link,
        };
        run_session(socket, app, SessionPeer::Bot(route), rx, connection_id).await;
    })
}

async fn accept_worker(ws: WebSocketUpgrade, app: AppState, headers: &HeaderMap) -> Response {
    if at_capacity(&app).await {
        tracing::warn!("Rejected worker connection, gateway at capacity");
        return reject(StatusCode::SERVICE_UNAVAILABLE, "too many connections");
    }
    let worker_id = match header(headers, HEADER_WORKER_ID) {
        Some(id) => id.to_string(),
        None => {
            let id = format!("worker-{}", Uuid::new_v4().simple());
            tracing::info!(worker = %id, "Worker connected without X-Worker-ID, assigned one");
            id
        }
    };
    let dialect = dialect_of(headers);

    ws.on_upgrade(move |socket| async move {
        let (link, rx) = PeerLink::channel(peer_key(PeerKind::Worker, &worker_id), app.config.link_capacity);
        let connection_id = app
            .registry
            .register_worker(WorkerPeer::new(&worker_id, dialect, link.clone()))
            .await;
        tracing::info!(worker = %worker_id, dialect = dialect.as_str(), "Worker connected");
        let route = WorkerRoute {
            worker_id,
            dialect,
            link,
        };
        run_session(socket, app, SessionPeer::Worker(route), rx, connection_id).await;
    })
}

// ── Sessions ────────────────────────────────────────────────────────────────

enum SessionPeer {
    Bot(BotRoute),
    Worker(WorkerRoute),
}

impl SessionPeer {
    fn kind(&self) -> PeerKind {
        match self {
            Self::Bot(_) => PeerKind::Bot,
            Self::Worker(_) => PeerKind::Worker,
        }
    }

    fn id(&self) -> &str {
        match self {
            Self::Bot(route) => &route.self_id,
            Self::Worker(route) => &route.worker_id,
        }
    }

    async fn handle(&self, dispatcher: &Dispatcher, text: &str) -> Result<(), DispatchError> {
        match self {
            Self::Bot(route) => dispatcher.handle_bot_frame(route, text).await,
            Self::Worker(route) => dispatcher.handle_worker_frame(route, text).await,
        }
    }
}

/// Read frames in arrival order until either side of the socket goes away.
async fn run_session(
    socket: WebSocket,
    app: AppState,
    peer: SessionPeer,
    rx: mpsc::Receiver<LinkCommand>,
    connection_id: Uuid,
) {
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, rx));

    let reason = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = peer.handle(&app.dispatcher, &text).await {
                        tracing::warn!(peer = %peer.id(), kind = %peer.kind(), error = %e, "Dropping frame");
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if let Err(e) = peer.handle(&app.dispatcher, text).await {
                            tracing::warn!(peer = %peer.id(), kind = %peer.kind(), error = %e, "Dropping frame");
                        }
                    }
                    Err(_) => tracing::warn!(peer = %peer.id(), "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    app.registry.touch_heartbeat(peer.kind(), peer.id()).await;
                }
                Some(Ok(Message::Close(_))) | None => break DisconnectReason::ClientClosed,
                Some(Err(e)) => {
                    tracing::debug!(peer = %peer.id(), error = %e, "Socket read failed");
                    break DisconnectReason::SocketError;
                }
            },
            _ = &mut writer => break DisconnectReason::SocketError,
        }
    };
    writer.abort();

    if let Some(secs) = app
        .registry
        .remove_connection(peer.kind(), peer.id(), connection_id, reason, Utc::now())
        .await
    {
        tracing::info!(
            peer = %peer.id(),
            kind = %peer.kind(),
            reason = %reason,
            duration_secs = secs,
            "Peer disconnected"
        );
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<LinkCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            LinkCommand::Frame(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            LinkCommand::Close(reason) => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

// ── Status API ──────────────────────────────────────────────────────────────

async fn api_health() -> Json<Value> {
    Json(json!({"ok": true, "service": "botmesh-gateway"}))
}

async fn api_status(State(app): State<AppState>) -> Json<Value> {
    let uptime = (Utc::now() - app.started_at).num_seconds();
    Json(json!({
        "ok": true,
        "started_at": app.started_at,
        "uptime_secs": uptime,
        "registry": app.registry.list().await,
        "stats": app.registry.stats().await,
        "traffic": app.registry.traffic().await,
        "pending_actions": app.registry.pending().len().await,
    }))
}
