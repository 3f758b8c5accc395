//! Presence endpoints: the real-time WebSocket and the online list.
//!
//! The WebSocket only accepts the ws-scoped token, read from its cookie by
//! the guard before the upgrade happens.

use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::guarded;
use crate::auth::{Auth, Requirement};
use crate::db::Database;
use crate::jwt::TokenKind;
use crate::presence::{ClientMessage, OnlineStatus, PresenceService, ServerMessage, UserStatus};
use crate::session::SessionManager;

/// Keepalive interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outgoing messages buffered per connection.
const OUTGOING_BUFFER: usize = 32;

#[derive(Clone)]
pub struct PresenceState {
    pub db: Database,
    pub presence: PresenceService,
}

/// Routes mounted at the API root: `/ws` and `/presence/online`.
pub fn router(state: PresenceState, sessions: &Arc<SessionManager>) -> Router {
    let controller = Requirement::authenticated();

    Router::new()
        .route(
            "/ws",
            guarded(
                get(ws_handler),
                sessions,
                Requirement::default().token(TokenKind::Ws).over(&controller),
            ),
        )
        .route(
            "/presence/online",
            guarded(get(online), sessions, controller.clone()),
        )
        .with_state(state)
}

#[derive(Serialize)]
struct OnlineResponse {
    users: Vec<UserStatus>,
}

async fn online(State(state): State<PresenceState>, Auth(auth): Auth) -> Json<OnlineResponse> {
    let users = state.presence.visible_online(auth.identity.id).await;
    Json(OnlineResponse { users })
}

#[derive(Deserialize)]
struct WsQuery {
    status: Option<String>,
}

async fn ws_handler(
    State(state): State<PresenceState>,
    Auth(auth): Auth,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "Expected WebSocket upgrade").into_response();
        }
    };

    let user_id = auth.identity.id;
    let initial = match query.status.as_deref().and_then(OnlineStatus::parse) {
        Some(status) => status,
        None => preferred_status(&state.db, user_id).await,
    };

    let presence = state.presence.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, presence, user_id, initial))
}

/// The persisted preference, `available` when unknown.
async fn preferred_status(db: &Database, user_id: i64) -> OnlineStatus {
    match db.users().get_by_id(user_id).await {
        Ok(Some(user)) => user.online_status,
        Ok(None) => OnlineStatus::Available,
        Err(e) => {
            warn!(user_id, error = %e, "Failed to load preferred status");
            OnlineStatus::Available
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    presence: PresenceService,
    user_id: i64,
    initial: OnlineStatus,
) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending messages
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTGOING_BUFFER);

    // Forward messages to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg)
                && sender.send(Message::Text(json.into())).await.is_err()
            {
                break;
            }
        }
    });

    let connection = presence.connect(user_id, initial, tx.clone()).await;

    let tx_ping = tx.clone();
    let mut ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            if tx_ping.send(ServerMessage::Ping).await.is_err() {
                break;
            }
        }
    });

    let recv_presence = presence.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::SetStatus { status }) => {
                        recv_presence.change_status(connection, status).await;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(ServerMessage::Error {
                                message: "Invalid message".to_string(),
                            })
                            .await;
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for any task to complete (connection closed)
    tokio::select! {
        _ = &mut send_task => {},
        _ = &mut recv_task => {},
        _ = &mut ping_task => {},
    }

    send_task.abort();
    recv_task.abort();
    ping_task.abort();

    presence.disconnect(connection);
    debug!(user_id, "WebSocket disconnected");
}
