//! WebSocket Streaming for Real-time Node Events
//!
//! Clients connected to `/api/v1/ws/events` receive:
//!
//! - An initial snapshot (status + peer table)
//! - Every [`NodeEvent`] as it happens: peers joining, remote poses, alias
//!   changes, teleport requests and resolutions, status changes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │   Client    │ ←─────────────────→ │ Waymesh API  │
//! │  (browser)  │                     │              │
//! └─────────────┘                     │  ┌────────┐  │
//!                                     │  │MeshNode│──┼──→ Other Nodes
//!                                     │  └────────┘  │
//!                                     └──────────────┘
//! ```

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::api::ApiState;
use crate::events::{PeerView, StatusReport};

/// Sent once on connect.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Hello<'a> {
    Snapshot {
        status: &'a StatusReport,
        peers: &'a [PeerView],
    },
}

/// WebSocket handler for node events
pub async fn ws_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_events_socket(socket, state))
}

/// Handle a WebSocket connection for node events
async fn handle_events_socket(mut socket: WebSocket, state: ApiState) {
    info!("WebSocket client connected for node events");

    // Subscribe before the snapshot so nothing falls in between.
    let mut events = state.mesh.subscribe();

    let status = state.mesh.status().await;
    let peers = state.mesh.peers().await;
    let snapshot = Hello::Snapshot {
        status: &status,
        peers: &peers,
    };
    if let Err(e) = send_json(&mut socket, &snapshot).await {
        warn!("Failed to send initial snapshot: {}", e);
        return;
    }

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from client: {}", text);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = socket.send(Message::Pong(data)).await {
                            warn!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Forward node events
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = send_json(&mut socket, &event).await {
                            warn!("Failed to send event: {}", e);
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Send a value as a JSON text frame
async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).map_err(axum::Error::new)?;
    socket.send(Message::Text(json)).await
}
