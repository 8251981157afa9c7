//! Wire protocol between client sessions and the gateway
//!
//! One canonical tagged-union envelope, `{"type": ..., "data": ...}`, in both
//! directions. The join itself is not an in-band message: the room key rides
//! the connection URL (`/ws?room=<key>`), so a reconnect re-joins implicitly.

use crate::db::models::{CustomInstrument, Request, RequestAction};
use serde::{Deserialize, Serialize};

/// Messages a client sends while its connection is active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Submit a monitor-mix adjustment request
    #[serde(rename_all = "camelCase")]
    Request {
        musician: String,
        instrument: String,
        target_instrument: String,
        action: RequestAction,
    },
    /// Technician marks one request done
    #[serde(rename_all = "camelCase")]
    CompleteRequest { request_id: i64 },
    /// Technician clears the whole queue for the room
    ClearAllRequests,
    /// Musician defines a room-scoped instrument label
    CreateInstrument { name: String },
}

/// Messages the gateway sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Sent once after the room is resolved, before any snapshot data
    #[serde(rename_all = "camelCase")]
    Joined { room_id: i64, room_name: String },
    /// Snapshot: the room's active requests at join time, exactly once
    InitialRequests(Vec<Request>),
    /// Snapshot: the room's custom instrument names, exactly once
    InitialInstruments(Vec<String>),
    /// Fan-out: a request was persisted (sender included in delivery)
    NewRequest(Request),
    /// Fan-out: one request was completed; carries the full row so clients
    /// can render the removal without local bookkeeping
    RequestCompleted(Request),
    /// Fan-out: every active request in the room was completed at once
    #[serde(rename_all = "camelCase")]
    AllRequestsCompleted { room_id: i64 },
    /// Fan-out: an instrument label exists (also sent when it already did,
    /// so the requester still gets a usable confirmation)
    NewInstrument(CustomInstrument),
    /// Sent to the originating connection only, never broadcast
    Error { message: String },
}

impl ServerMessage {
    /// Serialize for the wire. The envelope is plain data, so this cannot
    /// fail in practice; a broken message falls back to a generic error
    /// rather than poisoning the connection.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","data":{"message":"internal"}}"#.to_string())
    }
}
