//! Room registry and player placement

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RoomConfig;
use crate::net::SharedTransport;
use crate::util::SharedClock;
use crate::ws::protocol::{PlayerId, RoomId, ServerEnvelope};

use super::room::{JoinError, Room, RoomHandle};

/// Registry of all running rooms
pub struct RoomRegistry {
    rooms: DashMap<RoomId, RoomHandle>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    pub fn get(&self, id: &RoomId) -> Option<RoomHandle> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    pub fn insert(&self, handle: RoomHandle) {
        self.rooms.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &RoomId) -> Option<RoomHandle> {
        self.rooms.remove(id).map(|(_, h)| h)
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().occupancy()).sum()
    }

    /// Claim a slot in the first room with spare capacity
    ///
    /// The reservation happens under the registry shard lock, so it cannot
    /// interleave with [`retire`](Self::retire).
    pub fn reserve_available(&self) -> Option<RoomHandle> {
        for entry in self.rooms.iter() {
            let handle = entry.value();
            if !handle.is_closed() && handle.try_reserve() {
                return Some(handle.clone());
            }
        }
        None
    }

    /// Deregister an empty room; false if a join reserved a slot meanwhile
    pub fn retire(&self, id: &RoomId) -> bool {
        self.rooms
            .remove_if(id, |_, handle| handle.occupancy() == 0)
            .is_some()
            || !self.rooms.contains_key(id)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Places players into rooms and spawns rooms on demand
pub struct RoomManager {
    registry: Arc<RoomRegistry>,
    players: DashMap<PlayerId, RoomId>,
    config: RoomConfig,
    clock: SharedClock,
}

impl RoomManager {
    pub fn new(config: RoomConfig, clock: SharedClock) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            players: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Join the first room with capacity, spawning one if none has room
    pub fn join(
        &self,
        player_id: PlayerId,
        outbox: SharedTransport<ServerEnvelope>,
    ) -> Result<RoomHandle, JoinError> {
        // A room can close between reservation and send; retry once in a fresh room
        let mut last_err = JoinError::Closed;
        for _ in 0..2 {
            let handle = match self.registry.reserve_available() {
                Some(handle) => handle,
                None => self.spawn_room()?,
            };
            match handle.join_reserved(player_id, outbox.clone()) {
                Ok(()) => {
                    self.players.insert(player_id, handle.id);
                    return Ok(handle);
                }
                Err(e) => {
                    debug!(room_id = %handle.id, error = %e, "Join failed, retrying");
                    self.registry.remove(&handle.id);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Leave whichever room the player is in
    pub async fn leave(&self, player_id: PlayerId, reason: &str) {
        let Some((_, room_id)) = self.players.remove(&player_id) else {
            return;
        };
        if let Some(handle) = self.registry.get(&room_id) {
            handle.leave(player_id, reason).await;
        }
    }

    pub fn room_of(&self, player_id: &PlayerId) -> Option<RoomHandle> {
        let room_id = *self.players.get(player_id)?.value();
        self.registry.get(&room_id)
    }

    pub fn active_rooms(&self) -> usize {
        self.registry.active_rooms()
    }

    pub fn active_players(&self) -> usize {
        self.registry.total_players()
    }

    /// Spawn a room task with one slot already reserved
    fn spawn_room(&self) -> Result<RoomHandle, JoinError> {
        let id = Uuid::new_v4();
        let (room, handle) = Room::new(id, self.config.clone(), self.clock.clone(), rand::random());
        if !handle.try_reserve() {
            return Err(JoinError::Full);
        }
        let room = room.with_registry(self.registry.clone());
        self.registry.insert(handle.clone());

        let registry = self.registry.clone();
        tokio::spawn(async move {
            room.run().await;
            registry.remove(&id);
        });

        info!(room_id = %id, active_rooms = self.registry.active_rooms(), "Room created");
        Ok(handle)
    }
}
