//! Realtime gateway: WebSocket connection lifecycle and message routing
//!
//! Per-connection flow: upgrade, resolve room, then snapshot plus register
//! under the room's ordering lock, active loop, unregister. Inbound actions
//! are validated, persisted, then fanned out through the
//! [`ConnectionRegistry`]; validation and persistence failures go back to
//! the originating connection only.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use stagelink_common::db::Room;
use stagelink_common::proto::{ClientMessage, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;

/// Room key carried in the connection URL (`/ws?room=<key>`)
#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub room: String,
}

/// Handler for `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, params.room))
}

/// Resolve a room key to a room row. Numeric keys are id lookups, anything
/// else is a name lookup. Unknown keys follow the configured join policy.
async fn resolve_room(state: &AppState, room_key: &str) -> Result<Room, String> {
    let found = if let Ok(id) = room_key.parse::<i64>() {
        state.store.find_room_by_id(id).await
    } else {
        state.store.find_room_by_name(room_key).await
    };

    match found {
        Ok(Some(room)) => Ok(room),
        // Find-or-create rather than a bare insert: two connections racing on
        // the same new key must converge on one row
        Ok(None) if state.config.auto_create_rooms => state
            .store
            .find_or_create_room(room_key)
            .await
            .map(|(room, _)| room)
            .map_err(|e| {
                warn!("failed to auto-create room {:?}: {}", room_key, e);
                "failed to create room".to_string()
            }),
        Ok(None) => Err("room not found".to_string()),
        Err(e) => {
            warn!("room lookup failed for {:?}: {}", room_key, e);
            Err("room lookup failed".to_string())
        }
    }
}

/// Drives one WebSocket connection from join to close
async fn handle_connection(socket: WebSocket, state: Arc<AppState>, room_key: String) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();

    // Joining: a key that does not resolve is a terminal error
    let room = match resolve_room(&state, &room_key).await {
        Ok(room) => room,
        Err(message) => {
            info!(%conn_id, room_key = %room_key, "join rejected: {}", message);
            let reply = ServerMessage::Error { message }.to_json();
            let _ = sink.send(Message::Text(reply)).await;
            let _ = sink.close().await;
            return;
        }
    };

    // Snapshot read and registration happen under the room's ordering lock,
    // the same lock every mutation holds across persist + broadcast. A
    // mutation either commits before we read (it is in the snapshot, its
    // broadcast misses the unregistered channel) or after we release (it is
    // absent from the snapshot and arrives on the stream).
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let snapshot = {
        let lock = state.room_locks.for_room(room.id);
        let _guard = lock.lock().await;
        let result = send_snapshot(&state, &room, &tx).await;
        if result.is_ok() {
            state.registry.register(room.id, conn_id, tx.clone());
        }
        result
    };

    if let Err(e) = snapshot {
        warn!(%conn_id, room_id = room.id, "snapshot failed: {}", e);
        let reply = ServerMessage::Error {
            message: "failed to load room state".to_string(),
        };
        let _ = sink.send(Message::Text(reply.to_json())).await;
        let _ = sink.close().await;
        return;
    }
    info!(%conn_id, room_id = room.id, room_name = %room.name, "connection joined");

    // Writer task drains the outbound channel; broadcasts and direct replies
    // share it, so ordering per connection is the channel's ordering
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Active: interleave inbound frames with the heartbeat timer
    let mut ping = tokio::time::interval(Duration::from_secs(state.config.ping_interval_secs));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately
    let pong_timeout = Duration::from_secs(state.config.pong_timeout_secs);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    handle_text(&state, room.id, &tx, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // ping/pong frames count as liveness, nothing more
                    last_seen = Instant::now();
                }
                Some(Err(e)) => {
                    debug!(%conn_id, "transport error: {}", e);
                    break;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > pong_timeout {
                    info!(%conn_id, room_id = room.id, "closing stale connection");
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        }
    }

    // Closed: no further messages sent or accepted
    state.registry.unregister(conn_id);
    writer.abort();
    info!(%conn_id, room_id = room.id, "connection closed");
}

/// Send the join confirmation and the two snapshot messages, exactly once,
/// in order: joined, initialRequests (active rows only), initialInstruments.
async fn send_snapshot(
    state: &AppState,
    room: &Room,
    tx: &mpsc::UnboundedSender<Message>,
) -> stagelink_common::Result<()> {
    let requests = state.store.list_active_requests(room.id).await?;
    let instruments = state.store.list_custom_instruments(room.id).await?;

    let messages = [
        ServerMessage::Joined {
            room_id: room.id,
            room_name: room.name.clone(),
        },
        ServerMessage::InitialRequests(requests),
        ServerMessage::InitialInstruments(instruments),
    ];
    for message in messages {
        if tx.send(Message::Text(message.to_json())).is_err() {
            break; // connection already gone; close path does the cleanup
        }
    }
    Ok(())
}

/// Parse and dispatch one inbound text frame. Malformed payloads are logged
/// and ignored; handler failures become an error reply to this connection.
async fn handle_text(
    state: &AppState,
    room_id: i64,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(room_id, "ignoring malformed payload: {}", e);
            return;
        }
    };

    if let Err(message) = dispatch(state, room_id, msg).await {
        let reply = ServerMessage::Error { message };
        let _ = tx.send(Message::Text(reply.to_json()));
    }
}

/// Validate, persist, broadcast, per message kind. Persist and broadcast run
/// under the room's ordering lock so a concurrent join cannot observe the
/// row without its broadcast or the broadcast without its row.
async fn dispatch(state: &AppState, room_id: i64, msg: ClientMessage) -> Result<(), String> {
    let lock = state.room_locks.for_room(room_id);
    let _guard = lock.lock().await;

    match msg {
        ClientMessage::Request {
            musician,
            instrument,
            target_instrument,
            action,
        } => {
            if target_instrument.trim().is_empty() {
                return Err("target instrument must not be empty".to_string());
            }
            let row = state
                .store
                .insert_request(room_id, &musician, &instrument, &target_instrument, action)
                .await
                .map_err(|e| persistence_error("insert request", e))?;
            state.registry.broadcast(room_id, &ServerMessage::NewRequest(row));
        }

        ClientMessage::CompleteRequest { request_id } => {
            // Scoped to the caller's room: an id from another room reads as
            // not found, not as a cross-room completion
            let row = state
                .store
                .complete_request_in_room(request_id, room_id)
                .await
                .map_err(|e| persistence_error("complete request", e))?
                .ok_or_else(|| format!("request {} not found", request_id))?;
            state
                .registry
                .broadcast(room_id, &ServerMessage::RequestCompleted(row));
        }

        ClientMessage::ClearAllRequests => {
            let cleared = state
                .store
                .complete_all_requests(room_id)
                .await
                .map_err(|e| persistence_error("clear requests", e))?;
            debug!(room_id, cleared, "cleared room queue");
            // One room-wide event, not one per cleared row
            state
                .registry
                .broadcast(room_id, &ServerMessage::AllRequestsCompleted { room_id });
        }

        ClientMessage::CreateInstrument { name } => {
            let name = name.trim();
            if name.is_empty() {
                return Err("instrument name must not be empty".to_string());
            }
            let row = state
                .store
                .find_or_create_custom_instrument(room_id, name)
                .await
                .map_err(|e| persistence_error("create instrument", e))?;
            // Broadcast even when the row already existed, so the requester
            // still gets a usable confirmation
            state
                .registry
                .broadcast(room_id, &ServerMessage::NewInstrument(row));
        }
    }
    Ok(())
}

/// Log the underlying failure, hand the client a generic message
fn persistence_error(operation: &str, e: stagelink_common::Error) -> String {
    warn!("{} failed: {}", operation, e);
    format!("failed to {}", operation)
}
