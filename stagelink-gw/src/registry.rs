//! Connection registry: room id → set of live outbound channels
//!
//! Owned by [`AppState`](crate::AppState), never a module-level singleton, so
//! tests can instantiate independent registries. The interior mutex is only
//! held for map bookkeeping; senders are collected under the lock and used
//! after release, so a broadcast never blocks register/unregister for other
//! rooms and never spans an await point.

use axum::extract::ws::Message;
use stagelink_common::proto::ServerMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle for one live connection
pub type ConnId = Uuid;

/// Outbound channel drained by the connection's writer task
pub type Outbound = UnboundedSender<Message>;

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<i64, HashMap<ConnId, Outbound>>,
    /// Reverse pointer: which room each connection currently belongs to
    membership: HashMap<ConnId, i64>,
}

/// Runtime index of live connections grouped by room
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room's set, creating the set if absent.
    /// Last join wins: any previous room membership is removed first.
    pub fn register(&self, room_id: i64, conn_id: ConnId, sender: Outbound) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(previous) = inner.membership.insert(conn_id, room_id) {
            if previous != room_id {
                remove_from_room(&mut inner.rooms, previous, conn_id);
            }
        }
        inner.rooms.entry(room_id).or_default().insert(conn_id, sender);
        debug!(room_id, %conn_id, "connection registered");
    }

    /// Remove a connection from whichever room set contains it.
    /// Deletes the room entry when its set becomes empty.
    pub fn unregister(&self, conn_id: ConnId) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(room_id) = inner.membership.remove(&conn_id) {
            remove_from_room(&mut inner.rooms, room_id, conn_id);
            debug!(room_id, %conn_id, "connection unregistered");
        }
    }

    /// Serialize `message` once and send it to every connection in the room,
    /// the sender of the triggering action included. A closed channel on one
    /// connection prunes that connection and never aborts delivery to the
    /// others. Returns how many recipients accepted the frame.
    pub fn broadcast(&self, room_id: i64, message: &ServerMessage) -> usize {
        let text = message.to_json();

        let members: Vec<(ConnId, Outbound)> = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            match inner.rooms.get(&room_id) {
                Some(set) => set.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn_id, tx) in members {
            if tx.send(Message::Text(text.clone())).is_ok() {
                delivered += 1;
            } else {
                dead.push(conn_id);
            }
        }

        for conn_id in dead {
            warn!(room_id, %conn_id, "dropping dead connection during broadcast");
            self.unregister(conn_id);
        }

        debug!(room_id, delivered, "broadcast delivered");
        delivered
    }

    /// Number of live connections in a room
    pub fn room_size(&self, room_id: i64) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.rooms.get(&room_id).map_or(0, |set| set.len())
    }

    /// Number of rooms with at least one live connection
    pub fn room_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").rooms.len()
    }

    /// Total live connections across all rooms
    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .membership
            .len()
    }
}

/// One async mutex per room, ordering joins against mutation broadcasts.
///
/// A join holds its room's lock across the snapshot read plus registration,
/// and every state-changing action holds it across persist plus broadcast.
/// Each connection then sees every mutation exactly once: in the snapshot if
/// it committed before the join, on the stream if it committed after. Locks
/// are per-room, so rooms never contend with each other, and the registry's
/// own mutex stays free of suspension points.
#[derive(Default)]
pub struct RoomLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for one room, created on first use
    pub fn for_room(&self, room_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("room locks poisoned");
        locks.entry(room_id).or_default().clone()
    }
}

fn remove_from_room(
    rooms: &mut HashMap<i64, HashMap<ConnId, Outbound>>,
    room_id: i64,
    conn_id: ConnId,
) {
    if let Some(set) = rooms.get_mut(&room_id) {
        set.remove(&conn_id);
        if set.is_empty() {
            rooms.remove(&room_id);
        }
    }
}
