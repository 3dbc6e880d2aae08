//! WebSocket upgrade handler and session routing

use std::collections::HashSet;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{Recipients, RoomEvent};
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// WebSocket upgrade handler; every connection gets a fresh transport
/// session id
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let session_id = Uuid::new_v4();
    info!(session_id = %session_id, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, session_id: Uuid, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();

    // Writer task drains the per-session outbox; per-room forwarders feed it
    let (outbox_tx, outbox_rx) = mpsc::channel::<ServerMsg>(64);
    let writer = tokio::spawn(write_outbox(ws_sink, outbox_rx));

    let rate_limiter = PlayerRateLimiter::new();
    let mut subscribed_rooms: HashSet<Uuid> = HashSet::new();

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(session_id = %session_id, "Rate limited event message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => {
                        route_msg(session_id, msg, &state, &outbox_tx, &mut subscribed_rooms).await;
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Failed to parse client message");
                        let _ = outbox_tx
                            .send(ServerMsg::Error {
                                code: "bad_message".to_string(),
                                message: "Unrecognized event payload".to_string(),
                            })
                            .await;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(session_id = %session_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(session_id = %session_id, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Single release path: normal close, explicit end and abrupt drop all
    // land here
    if let Some(room_id) = state.rooms.room_for_session(&session_id) {
        if let Some(handle) = state.rooms.get(&room_id) {
            let _ = handle
                .event_tx
                .send(RoomEvent::Disconnected { session_id })
                .await;
        }
    }

    writer.abort();
    info!(session_id = %session_id, "WebSocket connection closed");
}

/// Forward one parsed message into the owning room, creating the room and
/// subscription on a first join
async fn route_msg(
    session_id: Uuid,
    msg: ClientMsg,
    state: &AppState,
    outbox_tx: &mpsc::Sender<ServerMsg>,
    subscribed_rooms: &mut HashSet<Uuid>,
) {
    let handle = match state.rooms.room_for_session(&session_id) {
        Some(room_id) => state.rooms.get(&room_id),
        None if matches!(msg, ClientMsg::Join { .. }) => {
            let handle = state.rooms.find_or_create(&state.ledger);
            state.rooms.bind_session(session_id, handle.id);
            Some(handle)
        }
        None => {
            // Stale client reference, expected during disconnect races
            debug!(session_id = %session_id, "Event for a session not in any room, dropping");
            None
        }
    };

    let Some(handle) = handle else { return };

    // Subscribe before the join event lands so the initial sync is not missed
    if subscribed_rooms.insert(handle.id) {
        tokio::spawn(forward_room_messages(
            session_id,
            handle.outbound_tx.subscribe(),
            outbox_tx.clone(),
        ));
    }

    let event = RoomEvent::Message {
        session_id,
        msg,
        received_at: unix_millis(),
    };
    if handle.event_tx.send(event).await.is_err() {
        debug!(session_id = %session_id, room_id = %handle.id, "Room event channel closed");
    }
}

/// Deliver a room's outbound stream to one session, honoring addressing
async fn forward_room_messages(
    session_id: Uuid,
    mut room_rx: broadcast::Receiver<(Recipients, ServerMsg)>,
    outbox: mpsc::Sender<ServerMsg>,
) {
    loop {
        match room_rx.recv().await {
            Ok((to, msg)) => {
                if !to.includes(session_id) {
                    continue;
                }
                if outbox.send(msg).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(
                    session_id = %session_id,
                    lagged_count = n,
                    "Client lagged, skipping {} room messages", n
                );
                // Continue - don't disconnect for lag
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Writer task: outbox -> WebSocket
async fn write_outbox(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbox_rx: mpsc::Receiver<ServerMsg>,
) {
    while let Some(msg) = outbox_rx.recv().await {
        if send_msg(&mut sink, &msg).await.is_err() {
            break;
        }
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
