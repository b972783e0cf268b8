use crate::auth::RequireAccess;
use crate::handlers::{ApiError, AppState};
use axum::{
    Router,
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use whiteboard_sync::{InboundMessage, OutboundFrame, RoomError, validate_room_id};

/// Query parameters for the connect endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    /// Client-chosen session id; a reconnect with the same id replaces the old connection
    pub session_id: Option<String>,
    /// Identity verified upstream, recorded with the connection
    pub user_id: Option<String>,
}

pub fn ws_routes(state: AppState) -> Router {
    Router::new()
        .route("/connect/{room_id}", get(connect_handler))
        .with_state(state)
}

/// GET /connect/{room_id}?sessionId=... - Upgrade to the room's sync channel
async fn connect_handler(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path(room_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = validate_room_id(&room_id) {
        return ApiError::from(e).into_response();
    }
    let Some(session_id) = query.session_id.filter(|id| !id.trim().is_empty()) else {
        return ApiError::from(RoomError::InvalidPayload(
            "sessionId query parameter is required".to_string(),
        ))
        .into_response();
    };

    let max_message_size = state.max_payload_bytes;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id, session_id, query.user_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    room_id: String,
    session_id: String,
    user_id: Option<String>,
) {
    let (sink, mut outbound) = mpsc::unbounded_channel();

    let (handle, connection) = match state
        .registry
        .connect(&room_id, &session_id, user_id, sink)
        .await
    {
        Ok(connected) => connected,
        Err(e) => {
            warn!(room_id = %room_id, session_id = %session_id, error = %e, "WebSocket connection rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    info!(room_id = %room_id, session_id = %session_id, "WebSocket connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // The room dropped our sink: a reconnect took over this session id.
                    debug!(session_id = %session_id, "Connection superseded");
                    break;
                };
                let msg = match frame {
                    OutboundFrame::Text(text) => Message::Text(text.into()),
                    OutboundFrame::Binary(bytes) => Message::Binary(bytes.into()),
                };
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                let message = match msg {
                    Some(Ok(Message::Text(text))) => InboundMessage::Text(text.to_string()),
                    Some(Ok(Message::Binary(bytes))) => InboundMessage::Binary(bytes.to_vec()),
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, error = %e, "WebSocket error");
                        break;
                    }
                };
                if handle.inbound(&session_id, message).await.is_err() {
                    break;
                }
            }
        }
    }

    // A no-op if a reconnect already replaced this registration.
    let _ = handle.disconnect(&session_id, connection).await;
    state.registry.maybe_remove_room(&room_id).await;
    info!(room_id = %room_id, session_id = %session_id, "WebSocket disconnected");
}
