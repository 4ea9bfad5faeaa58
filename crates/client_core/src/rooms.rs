use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{domain::RoomId, protocol::ClientRequest};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{connection::TransportHandle, error::RoomError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMembership {
    pub room_id: RoomId,
    pub joined_at: DateTime<Utc>,
}

struct RoomsInner {
    desired: BTreeMap<RoomId, RoomMembership>,
    /// Rooms the server has been told about on connection `announced_generation`.
    announced: BTreeSet<RoomId>,
    announced_generation: u64,
    flush_scheduled: bool,
}

/// Local membership is updated immediately; join/leave signals to the server
/// are coalesced and only the net difference is sent.
pub struct RoomMembershipTracker {
    transport: TransportHandle,
    debounce: Duration,
    inner: Mutex<RoomsInner>,
}

impl RoomMembershipTracker {
    pub fn new(transport: TransportHandle, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            debounce,
            inner: Mutex::new(RoomsInner {
                desired: BTreeMap::new(),
                announced: BTreeSet::new(),
                announced_generation: 0,
                flush_scheduled: false,
            }),
        })
    }

    /// Makes `room_id` the only joined room. Returns the rooms that were left.
    pub async fn join_room(self: &Arc<Self>, room_id: &RoomId) -> Result<Vec<RoomId>, RoomError> {
        if room_id.is_blank() {
            return Err(RoomError::EmptyRoomId);
        }

        let left = {
            let mut inner = self.inner.lock().await;
            let stale: Vec<RoomId> = inner
                .desired
                .keys()
                .filter(|joined| *joined != room_id)
                .cloned()
                .collect();
            for room in &stale {
                inner.desired.remove(room);
            }
            insert_membership(&mut inner, room_id);
            stale
        };

        if !left.is_empty() {
            info!(room_id = %room_id, left = left.len(), "rooms: switched room");
        }
        self.schedule_flush().await;
        Ok(left)
    }

    /// Joins every room in `rooms` and leaves the rest.
    pub async fn join_rooms(self: &Arc<Self>, rooms: &[RoomId]) -> Result<Vec<RoomId>, RoomError> {
        if rooms.iter().any(RoomId::is_blank) {
            return Err(RoomError::EmptyRoomId);
        }

        let left = {
            let mut inner = self.inner.lock().await;
            let stale: Vec<RoomId> = inner
                .desired
                .keys()
                .filter(|joined| !rooms.contains(joined))
                .cloned()
                .collect();
            for room in &stale {
                inner.desired.remove(room);
            }
            for room in rooms {
                insert_membership(&mut inner, room);
            }
            stale
        };

        self.schedule_flush().await;
        Ok(left)
    }

    /// Returns whether the room was joined.
    pub async fn leave_room(self: &Arc<Self>, room_id: &RoomId) -> bool {
        let removed = self.inner.lock().await.desired.remove(room_id).is_some();
        if removed {
            self.schedule_flush().await;
        }
        removed
    }

    pub async fn is_member(&self, room_id: &RoomId) -> bool {
        self.inner.lock().await.desired.contains_key(room_id)
    }

    pub async fn memberships(&self) -> Vec<RoomMembership> {
        self.inner.lock().await.desired.values().cloned().collect()
    }

    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        self.inner.lock().await.desired.keys().cloned().collect()
    }

    /// A new connection knows none of our rooms; replay them now.
    pub async fn on_connected(&self) {
        self.flush().await;
    }

    /// Drops every membership without telling the server (session teardown).
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.desired.clear();
        inner.announced.clear();
    }

    async fn schedule_flush(self: &Arc<Self>) {
        if self.debounce.is_zero() {
            self.flush().await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.flush_scheduled {
                return;
            }
            inner.flush_scheduled = true;
        }

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(tracker.debounce).await;
            tracker.inner.lock().await.flush_scheduled = false;
            tracker.flush().await;
        });
    }

    async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        let snapshot = self.transport.snapshot();
        if !self.transport.is_connected() {
            debug!("rooms: offline, membership signals queued");
            return;
        }
        if inner.announced_generation != snapshot.generation {
            inner.announced.clear();
            inner.announced_generation = snapshot.generation;
        }

        let to_leave: Vec<RoomId> = inner
            .announced
            .iter()
            .filter(|room| !inner.desired.contains_key(*room))
            .cloned()
            .collect();
        let to_join: Vec<RoomId> = inner
            .desired
            .keys()
            .filter(|room| !inner.announced.contains(*room))
            .cloned()
            .collect();

        for room in to_leave {
            if self
                .transport
                .emit(ClientRequest::LeaveRoom(room.clone()))
                .await
                .is_err()
            {
                return;
            }
            debug!(room_id = %room, "rooms: leave sent");
            inner.announced.remove(&room);
        }
        for room in to_join {
            if self
                .transport
                .emit(ClientRequest::JoinRoom(room.clone()))
                .await
                .is_err()
            {
                return;
            }
            debug!(room_id = %room, "rooms: join sent");
            inner.announced.insert(room);
        }
    }
}

fn insert_membership(inner: &mut RoomsInner, room_id: &RoomId) {
    inner
        .desired
        .entry(room_id.clone())
        .or_insert_with(|| RoomMembership {
            room_id: room_id.clone(),
            joined_at: Utc::now(),
        });
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
