//! HTTP/WS edge: the narrow surface this tier exposes.
//!
//! - `GET /healthz` — process liveness, always 200.
//! - `GET /readyz`  — 200 while the bus and cache answer, 503 otherwise.
//! - `GET /api/health` — aggregate component health.
//! - `GET|POST /api/patterns/scan` — scan queries (flat params or JSON).
//! - `GET /ws?user_id=…` — socket attach; offline queue drains on connect.
//!
//! Authentication and session handling live upstream of this service.

use crate::scan::{ScanError, ScanFilters};
use crate::service::{HealthStatus, RelayService};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub fn router(service: Arc<RelayService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/health", get(api_health))
        .route("/api/patterns/scan", get(scan_get).post(scan_post))
        .route("/ws", get(ws_attach))
        .with_state(service)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(service): State<Arc<RelayService>>) -> Response {
    let health = service.health().await;
    if health.status == HealthStatus::Error {
        (StatusCode::SERVICE_UNAVAILABLE, health.status.as_str()).into_response()
    } else {
        (StatusCode::OK, "ready").into_response()
    }
}

async fn api_health(State(service): State<Arc<RelayService>>) -> Response {
    Json(service.health().await).into_response()
}

fn scan_error_response(err: ScanError) -> Response {
    match err {
        ScanError::Contract(msg) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": msg})),
        )
            .into_response(),
        ScanError::Cache(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn scan_get(
    State(service): State<Arc<RelayService>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let filters =
        match ScanFilters::from_query_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str()))) {
            Ok(f) => f,
            Err(e) => return scan_error_response(e),
        };
    match service.scan.scan(&filters).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => scan_error_response(e),
    }
}

async fn scan_post(
    State(service): State<Arc<RelayService>>,
    Json(filters): Json<ScanFilters>,
) -> Response {
    match service.scan.scan(&filters).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => scan_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Socket attach
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct WsParams {
    user_id: String,
}

async fn ws_attach(
    ws: WebSocketUpgrade,
    State(service): State<Arc<RelayService>>,
    Query(params): Query<WsParams>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, service, params.user_id))
}

/// Drive one connection: registry messages flow out, the offline queue
/// drains on connect, and the connection unregisters on any close.
async fn serve_socket(socket: WebSocket, service: Arc<RelayService>, user_id: String) {
    let (conn_id, mut outbound) = service.connect_user(&user_id).await;
    info!(user_id = %user_id, %conn_id, "socket attached");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                let Ok(json) = serde_json::to_string(&message) else { continue };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    // Write failure on this connection only.
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        debug!(user_id = %user_id, %conn_id, error = %e, "socket read error");
                        break;
                    }
                    // Clients only listen on this socket; inbound text is
                    // ignored, pings are answered by the ws layer.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    service.disconnect_user(conn_id).await;
    info!(user_id = %user_id, %conn_id, "socket detached");
}

/// Serve the edge on an already-bound listener until the shutdown future
/// resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    service: Arc<RelayService>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "edge listening");
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
        .inspect_err(|e| warn!(error = %e, "edge server error"))
}
