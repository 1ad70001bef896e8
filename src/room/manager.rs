//! Room CRUD, admission, and the TTL-bounded deletion waiter (C5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Room;
use crate::error::ChatError;
use crate::ids::RoomID;

#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomID, Arc<Room>>>,
    ctx: CancellationToken,
}

impl RoomManager {
    pub fn new(ctx: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            ctx,
        })
    }

    /// Creates the room and spawns a background TTL deletion waiter.
    pub fn create_room(
        self: &Arc<Self>,
        room_id: RoomID,
        allowed: Vec<crate::ids::ClientID>,
        ttl: Duration,
    ) -> Result<Arc<Room>, ChatError> {
        let mut guard = self.rooms.write();
        if guard.contains_key(&room_id) {
            return Err(ChatError::RoomAlreadyExists(room_id.to_string()));
        }
        let room = Room::new(room_id.clone(), allowed, ttl, self.ctx.clone());
        guard.insert(room_id.clone(), room.clone());
        drop(guard);

        let manager = self.clone();
        let deletion_room_id = room_id;
        let room_ctx = room.ctx();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {
                    info!(room_id = %deletion_room_id, "room ttl elapsed, auto-deleting");
                    manager.delete_room(&deletion_room_id);
                }
                _ = room_ctx.cancelled() => {}
            }
        });

        Ok(room)
    }

    pub fn delete_room(&self, room_id: &RoomID) -> Option<()> {
        let room = self.rooms.write().remove(room_id)?;
        room.close();
        Some(())
    }

    pub fn get_room(&self, room_id: &RoomID) -> Result<Arc<Room>, ChatError> {
        self.rooms
            .read()
            .get(room_id)
            .cloned()
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))
    }

    pub fn room_exists(&self, room_id: &RoomID) -> bool {
        self.rooms.read().contains_key(room_id)
    }

    /// Validates the polling interval against `[1s, ttl/10]` before the
    /// caller (health manager) starts the periodic poller.
    pub fn validate_health_interval(&self, room_id: &RoomID, interval: Duration) -> Result<(), ChatError> {
        let room = self.get_room(room_id)?;
        let max = room.ttl() / 10;
        if interval < Duration::from_secs(1) || interval > max {
            return Err(ChatError::InvalidHealthInterval(format!(
                "interval {interval:?} must be within [1s, {max:?}]"
            )));
        }
        Ok(())
    }

    /// Validates `interval` then starts the room's periodic health-poll
    /// broadcaster, which calls `build_request` fresh on every tick.
    pub fn start_health_tracking(
        &self,
        room_id: &RoomID,
        interval: Duration,
        build_request: Arc<dyn Fn() -> Box<dyn crate::envelope::Message> + Send + Sync>,
    ) -> Result<(), ChatError> {
        self.validate_health_interval(room_id, interval)?;
        let room = self.get_room(room_id)?;
        room.start_health_tracking(interval, build_request);
        Ok(())
    }

    pub fn stop_health_tracking(&self, room_id: &RoomID) -> Result<(), ChatError> {
        let room = self.get_room(room_id)?;
        room.stop_health_tracking();
        Ok(())
    }
}
