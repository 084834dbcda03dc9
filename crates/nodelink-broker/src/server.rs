//! `BrokerServer`: axum HTTP + WebSocket front end for the broker.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use nodelink_core::constants::WS_NODE_PATH;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::Broker;
use crate::health::{self, HealthResponse};
use crate::session::SessionInfo;
use crate::ws;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The broker behind every route.
    pub broker: Arc<Broker>,
    /// When the server started.
    pub start_time: Instant,
}

/// HTTP front end wrapping one broker.
pub struct BrokerServer {
    broker: Arc<Broker>,
    start_time: Instant,
}

impl BrokerServer {
    /// Wrap `broker`.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            start_time: Instant::now(),
        }
    }

    /// The wrapped broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: Arc::clone(&self.broker),
            start_time: self.start_time,
        };

        Router::new()
            .route(WS_NODE_PATH, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/api/node/sessions", get(sessions_handler))
            .route("/api/node/sessions/{id}", get(session_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve on `listener` until `cancel` fires, then close every session.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = WS_NODE_PATH, "broker listening");
        }
        let shutdown = cancel.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        self.broker.shutdown().await;
        info!("broker stopped");
        Ok(())
    }
}

/// GET /api/ws/node
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, headers: HeaderMap) -> Response {
    let remote_addr = ws::remote_addr_from(&headers);
    let broker = state.broker;
    ws.max_message_size(broker.config().max_message_size)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = ws::split(socket);
            let session = broker.accept(Box::new(sink), remote_addr);
            broker.run_inbound(session, Box::new(stream)).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.broker.session_count(),
        state.broker.ready_count(),
    ))
}

/// GET /api/node/sessions
async fn sessions_handler(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.broker.session_infos())
}

/// GET /api/node/sessions/{id}, by ephemeral or consistent id.
async fn session_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.broker.session(&id) {
        Some(session) => Json(session.info()).into_response(),
        None => (StatusCode::NOT_FOUND, format!("no session {id}")).into_response(),
    }
}
