//! WebSocket accept path and per-connection pump loop.
//!
//! Room selection rides on the request path: `/ws/{room_id}`, with `/ws`
//! (or an invalid id) falling back to [`DEFAULT_ROOM_ID`]. On accept, a
//! joiner whose room already holds state receives the full snapshot frame
//! before anything else, then a `room-info` carrying its assigned client
//! id.
//!
//! All per-connection failures - malformed payloads, transport errors,
//! failed sends - are isolated to that connection. Nothing here can crash
//! the relay or touch another room's state.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use slate_core::{Control, Delta, NOOP_THRESHOLD};

use crate::room::{ConnectionHandle, Liveness, Outbound, Room, RoomRegistry};
use crate::AppState;

/// Room used when the request names none, or names an invalid one.
pub const DEFAULT_ROOM_ID: &str = "default-room";

/// Longest accepted room id.
const MAX_ROOM_ID_LEN: usize = 128;

/// Room ids are opaque but must be sane: non-empty, bounded, and limited to
/// characters that cannot smuggle path or framing surprises.
fn resolve_room_id(requested: Option<&str>) -> String {
    match requested {
        Some(id)
            if !id.is_empty()
                && id.len() <= MAX_ROOM_ID_LEN
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            id.to_string()
        }
        _ => DEFAULT_ROOM_ID.to_string(),
    }
}

/// `GET /ws` - join the default room.
pub async fn ws_default_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry, None))
}

/// `GET /ws/{room_id}` - join a named room.
pub async fn ws_room_handler(
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry, Some(room_id)))
}

/// Drive one client connection from accept to close.
pub async fn handle_socket(socket: WebSocket, registry: RoomRegistry, requested: Option<String>) {
    let room_id = resolve_room_id(requested.as_deref());
    let client_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let liveness = Arc::new(Liveness::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(client_id.clone(), tx, Arc::clone(&liveness));
    let room = registry.join(&room_id, handle);

    tracing::info!(room = %room_id, client = %client_id, "client joined");

    // Seed the joiner with the room's current state before anything else.
    // Fresh rooms snapshot below the no-op threshold and send nothing.
    let snapshot = room.snapshot_frame();
    if snapshot.len() > NOOP_THRESHOLD
        && sender.send(Message::Binary(snapshot.into())).await.is_err()
    {
        registry.leave(&room, &client_id);
        return;
    }

    let welcome = Control::RoomInfo {
        room_id: room.id.clone(),
        client_count: room.client_count(),
        client_id: Some(client_id.clone()),
    };
    if sender
        .send(Message::Text(welcome.to_json().into()))
        .await
        .is_err()
    {
        registry.leave(&room, &client_id);
        return;
    }

    // Existing peers learn about the membership change.
    let info = Control::RoomInfo {
        room_id: room.id.clone(),
        client_count: room.client_count(),
        client_id: None,
    };
    room.broadcast_from(Some(&client_id), &Message::Text(info.to_json().into()));

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        liveness.touch();
                        match Control::parse(&text) {
                            Some(Control::Ping) => {
                                let pong = Control::Pong {
                                    timestamp: slate_core::timestamp_now(),
                                };
                                if sender
                                    .send(Message::Text(pong.to_json().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Some(other) => {
                                tracing::debug!(client = %client_id, ?other, "ignoring client control message");
                            }
                            None => {
                                tracing::debug!(client = %client_id, "dropping unparseable text frame");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        liveness.touch();
                        handle_delta_frame(&room, &client_id, &bytes);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        liveness.refresh();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The socket layer answers pings; just record activity.
                        liveness.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(client = %client_id, "socket error: {e}");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(message)) => {
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Terminate) => {
                        tracing::info!(room = %room.id, client = %client_id, "terminated by liveness sweep");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    registry.leave(&room, &client_id);
    tracing::info!(room = %room.id, client = %client_id, "client left");
}

/// Validate, merge, and fan out one candidate delta frame.
///
/// Undersized and malformed frames are expected wire noise: dropped
/// silently, never broadcast, never surfaced as errors.
fn handle_delta_frame(room: &Arc<Room>, sender_id: &str, bytes: &[u8]) {
    if bytes.len() <= NOOP_THRESHOLD {
        tracing::debug!(room = %room.id, len = bytes.len(), "dropping no-op frame");
        return;
    }
    let delta = match Delta::decode(bytes) {
        Ok(delta) => delta,
        Err(e) => {
            tracing::debug!(room = %room.id, client = %sender_id, "dropping malformed frame: {e}");
            return;
        }
    };

    room.apply(&delta);
    let sent = room.broadcast_from(Some(sender_id), &Message::Binary(bytes.to_vec().into()));
    tracing::trace!(room = %room.id, client = %sender_id, peers = sent, "delta rebroadcast");
}
