//! HTTP API and realtime WebSocket endpoint.
//!
//! The browser client uses three things:
//! - `POST /send-message` to push a message through the linked session
//! - `GET /connection` to learn whether a device is linked (or get the QR)
//! - `GET /socket`, a WebSocket that receives link-state changes as they happen
//!
//! `POST /webhook/provider` is for the session gateway, not for browsers. When a
//! webhook secret is configured the gateway must send it in
//! [`WEBHOOK_SECRET_HEADER`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use wagate_provider::SendOptions;

use crate::db::MessageRecord;
use crate::error::AppError;
use crate::qr;
use crate::server::SharedState;

/// Header carrying the shared webhook secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-wagate-secret";

/// Build the axum router with REST, webhook and WebSocket endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/send-message", post(send_message))
        .route("/connection", get(connection))
        .route("/socket", get(ws_upgrade))
        .route("/webhook/provider", post(provider_webhook))
        .route("/health", get(health))
        .route("/api/v1/messages", get(recent_messages))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    use axum::http::{Method, header};
    use tower_http::cors::AllowOrigin;

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            origins.iter().filter_map(|o| o.parse().ok()),
        ))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// ── REST types ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    phone: String,
    message: String,
    /// Optional media URL; `message` becomes its caption.
    #[serde(default)]
    media: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponse {
    pub connected: bool,
    /// Empty when linked, otherwise the QR as a `data:image/png;base64,` URL.
    pub media_url: String,
}

#[derive(Serialize)]
struct HealthResponse {
    provider: &'static str,
    connected: bool,
    clients: usize,
    messages: usize,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

// ── REST handlers ──────────────────────────────────────────────────────

async fn send_message(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<&'static str, AppError> {
    let options = SendOptions { media: req.media };
    state.send(&req.phone, &req.message, &options).await?;
    Ok("OK")
}

async fn connection(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<ConnectionResponse>, AppError> {
    if state.is_connected() {
        return Ok(Json(ConnectionResponse {
            connected: true,
            media_url: String::new(),
        }));
    }
    let media_url = qr::read_data_url(&state.config.qr_path).await?;
    Ok(Json(ConnectionResponse {
        connected: false,
        media_url,
    }))
}

async fn provider_webhook(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    if let Some(ref secret) = state.config.webhook_secret {
        let given = headers.get(WEBHOOK_SECRET_HEADER).and_then(|v| v.to_str().ok());
        if given != Some(secret.as_str()) {
            tracing::warn!("Rejected webhook with missing or wrong secret");
            return (StatusCode::UNAUTHORIZED, "bad webhook secret");
        }
    }
    if state.provider.ingest_webhook(&payload).await {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::NOT_FOUND, "provider takes no webhooks")
    }
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        provider: state.provider.name(),
        connected: state.is_connected(),
        clients: state.hub.clients(),
        messages: state.db.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn recent_messages(
    Query(params): Query<MessagesQuery>,
    State(state): State<Arc<SharedState>>,
) -> Json<Vec<MessageRecord>> {
    let limit = params.limit.unwrap_or(50).min(crate::db::MAX_HISTORY);
    Json(state.db.recent(limit))
}

// ── WebSocket handler ──────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, addr))
}

/// Forward hub frames to one client until either side goes away.
/// Client frames are read only to notice the close.
async fn handle_ws(mut socket: WebSocket, state: Arc<SharedState>, addr: SocketAddr) {
    let mut frames = state.hub.subscribe();
    let clients = state.hub.client_connected();
    tracing::info!(%addr, clients, "Realtime client connected");

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Ok(text) => {
                        if socket.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(%addr, "Realtime client skipped {n} frame(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                }
            }
        }
    }

    let clients = state.hub.client_disconnected();
    tracing::info!(%addr, clients, "Realtime client disconnected");
}
