//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::util::time::{started_at, uptime_secs};
use crate::ws::handler::ws_handler;

/// Upper bound for plain HTTP requests; upgraded sockets are detached from it
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    Router::new()
        .route("/health", get(health_handler))
        .route("/rooms/:room_id", get(room_handler))
        .route("/ws", get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors)
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

/// CORS for a comma-separated origin list, `*` meaning any origin
fn cors_layer(client_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed_origins: Vec<header::HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed_origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    started_at: Option<String>,
    active_rooms: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        started_at: started_at(),
        active_rooms: state.rooms.active_rooms(),
        active_players: state.rooms.active_players(),
    })
}

// ============================================================================
// Room lookup
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomResponse {
    room_id: Uuid,
    players: usize,
    capacity: usize,
    tick_rate: u32,
    broadcast_rate: u32,
}

async fn room_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, AppError> {
    let room_id = Uuid::parse_str(&room_id)
        .map_err(|_| AppError::BadRequest(format!("Invalid room id: {room_id}")))?;

    let room = state
        .rooms
        .registry()
        .get(&room_id)
        .ok_or_else(|| AppError::NotFound(format!("Room {room_id}")))?;

    Ok(Json(RoomResponse {
        room_id: room.id,
        players: room.occupancy(),
        capacity: room.capacity(),
        tick_rate: state.config.room.tick_rate,
        broadcast_rate: state.config.room.broadcast_rate,
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        };

        let body = serde_json::json!({
            "error": self.to_string()
        });

        (status, Json(body)).into_response()
    }
}
