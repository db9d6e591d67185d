//! HTTP API for the local client.

use crate::collaborators::{Host, MemoryHost};
use crate::error::Error;
use crate::events::{PeerView, StatusReport};
use crate::mesh::MeshNode;
use crate::ws::ws_events_handler;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use waymesh_peers::PeerKey;
use waymesh_protocols::{
    Destination, Error as ProtocolError, GateDecision, PoseExtras, TicketStatus, XrHeadState,
};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub mesh: Arc<MeshNode>,
    /// Destination offer set by the client, applied teleports recorded.
    pub host: Arc<MemoryHost>,
}

/// Build the API router.
pub fn build_router(state: ApiState) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health (at root and under /api/v1 for compatibility)
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Mesh
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/peers", get(list_peers))
        .route("/api/v1/alias", post(set_alias))
        .route("/api/v1/pose", post(send_pose))
        // Teleport
        .route("/api/v1/teleport/:key", post(request_teleport))
        .route("/api/v1/teleport/:key/respond", post(respond_teleport))
        .route("/api/v1/destination", get(get_destination).put(put_destination))
        // WebSocket for real-time node events
        .route("/api/v1/ws/events", get(ws_events_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_key(raw: &str) -> Result<PeerKey, StatusCode> {
    PeerKey::from_hex(raw).map_err(|_| StatusCode::BAD_REQUEST)
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::Protocol(ProtocolError::TicketPending(_)) => StatusCode::CONFLICT,
        Error::Protocol(ProtocolError::UnknownTicket(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// --- Health endpoints ---

async fn health() -> &'static str {
    "OK"
}

// --- Mesh endpoints ---

async fn get_status(State(state): State<ApiState>) -> Json<StatusReport> {
    Json(state.mesh.status().await)
}

async fn list_peers(State(state): State<ApiState>) -> Json<Vec<PeerView>> {
    Json(state.mesh.peers().await)
}

#[derive(Debug, Deserialize)]
struct AliasRequest {
    alias: Option<String>,
}

async fn set_alias(State(state): State<ApiState>, Json(req): Json<AliasRequest>) -> StatusCode {
    state.mesh.set_alias(req.alias).await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoseRequest {
    position: [f64; 3],
    orientation: [f64; 4],
    #[serde(default)]
    ground: Option<f64>,
    #[serde(default)]
    jump: bool,
    #[serde(default)]
    crouch: bool,
    #[serde(default)]
    xr: Option<XrHeadState>,
    #[serde(default)]
    lat_lon: Option<(f64, f64)>,
}

#[derive(Debug, Serialize)]
struct PoseResponse {
    sent: bool,
    decision: &'static str,
}

async fn send_pose(
    State(state): State<ApiState>,
    Json(req): Json<PoseRequest>,
) -> Json<PoseResponse> {
    let extras = PoseExtras {
        xr: req.xr,
        lat_lon: req.lat_lon,
    };
    let decision = state
        .mesh
        .send_pose_if_changed(
            req.position,
            req.orientation,
            req.ground,
            req.jump,
            req.crouch,
            extras,
        )
        .await;
    let decision = match decision {
        GateDecision::Send => "sent",
        GateDecision::RateLimited => "rate_limited",
        GateDecision::Unchanged => "unchanged",
    };
    Json(PoseResponse {
        sent: decision == "sent",
        decision,
    })
}

// --- Teleport endpoints ---

#[derive(Debug, Serialize)]
struct TicketResponse {
    status: TicketStatus,
}

async fn request_teleport(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<Json<TicketResponse>, StatusCode> {
    let key = parse_key(&key)?;
    match state.mesh.request_teleport(key).await {
        Ok(status) => Ok(Json(TicketResponse { status })),
        Err(e) => {
            warn!("Teleport request to {} refused: {}", key.short(), e);
            Err(error_status(&e))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    accept: bool,
}

async fn respond_teleport(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<TicketResponse>, StatusCode> {
    let key = parse_key(&key)?;
    state
        .mesh
        .respond_teleport(key, req.accept)
        .await
        .map(|status| Json(TicketResponse { status }))
        .map_err(|e| error_status(&e))
}

#[derive(Debug, Serialize)]
struct DestinationResponse {
    offer: Option<Destination>,
    applied: Option<Destination>,
}

async fn get_destination(State(state): State<ApiState>) -> Json<DestinationResponse> {
    Json(DestinationResponse {
        offer: state.host.destination_offer(),
        applied: state.host.applied().last().copied(),
    })
}

async fn put_destination(
    State(state): State<ApiState>,
    Json(offer): Json<Option<Destination>>,
) -> StatusCode {
    state.host.set_offer(offer);
    StatusCode::NO_CONTENT
}
