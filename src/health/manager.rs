//! Health session bundling: aggregator + TTL deletion waiter + per-subscriber
//! snapshot streamers, keyed by room (C6). Ported from the `CreateHealth`/
//! `DeleteHealth`/`AddHealthSnapshotStreamer` family in
//! `pkg/middleware/chat/process/*health*.go`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Health, Snapshot, Stat};
use crate::error::ChatError;
use crate::ids::{ClientID, RoomID};
use crate::process::{BackgroundHandle, Process};
use crate::state::State;

struct HealthSession {
    health: Arc<Health>,
    streamers: Mutex<HashMap<ClientID, Arc<BackgroundHandle>>>,
}

#[derive(Default)]
pub struct HealthManager {
    sessions: RwLock<HashMap<RoomID, Arc<HealthSession>>>,
    ctx: CancellationToken,
}

impl HealthManager {
    pub fn new(ctx: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            ctx,
        })
    }

    /// Creates the health session and spawns its TTL deletion waiter.
    pub fn create_health(
        self: &Arc<Self>,
        room_id: RoomID,
        allowed: Vec<ClientID>,
        ttl: Duration,
    ) -> Result<Arc<Health>, ChatError> {
        let mut guard = self.sessions.write();
        if guard.contains_key(&room_id) {
            return Err(ChatError::RoomAlreadyExists(room_id.to_string()));
        }
        let health = Arc::new(Health::new(room_id.clone(), allowed, self.ctx.clone()));
        let session = Arc::new(HealthSession {
            health: health.clone(),
            streamers: Mutex::new(HashMap::new()),
        });
        guard.insert(room_id.clone(), session);
        drop(guard);

        let manager = self.clone();
        let deletion_room_id = room_id;
        // Health::new() derives a child token from `self.ctx`, not from a
        // room-specific token, so the waiter here only needs the session's
        // own cancellation and the TTL race (no external close signal other
        // than `delete_health`/`HealthManager` teardown).
        let health_ctx = health.ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {
                    info!(room_id = %deletion_room_id, "health session ttl elapsed, auto-deleting");
                    manager.delete_health(&deletion_room_id);
                }
                _ = health_ctx.cancelled() => {}
            }
        });

        Ok(health)
    }

    pub fn delete_health(&self, room_id: &RoomID) -> Option<()> {
        let session = self.sessions.write().remove(room_id)?;
        for (_, streamer) in session.streamers.lock().drain() {
            streamer.stop();
        }
        session.health.close();
        Some(())
    }

    pub fn get_health(&self, room_id: &RoomID) -> Result<Arc<Health>, ChatError> {
        self.sessions
            .read()
            .get(room_id)
            .map(|s| s.health.clone())
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))
    }

    pub fn add(&self, room_id: &RoomID, id: ClientID) -> Result<(), ChatError> {
        self.get_health(room_id)?.add(room_id, id)
    }

    pub fn remove(&self, room_id: &RoomID, id: &ClientID) -> Result<(), ChatError> {
        self.get_health(room_id)?.remove(room_id, id)
    }

    pub fn update(&self, room_id: &RoomID, id: &ClientID, stat: Stat) -> Result<(), ChatError> {
        self.get_health(room_id)?.update(room_id, id, stat)
    }

    pub fn get_health_snapshot(&self, room_id: &RoomID) -> Result<Snapshot, ChatError> {
        Ok(self.get_health(room_id)?.snapshot())
    }

    /// Registers `process` as the subscriber's snapshot streamer. An
    /// existing streamer for the same client is stopped and replaced
    /// (restart semantics), matching the Go original's re-register path.
    pub fn add_health_snapshot_streamer<P>(
        &self,
        room_id: &RoomID,
        state: Arc<State>,
        process: Arc<P>,
    ) -> Result<(), ChatError>
    where
        P: Process + 'static,
    {
        let client_id = state.get_client_id()?;
        let session = {
            self.sessions
                .read()
                .get(room_id)
                .cloned()
                .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?
        };
        if !session.health.is_participant(&client_id) {
            return Err(ChatError::ClientNotAParticipant);
        }

        let handle = BackgroundHandle::spawn(process, self.ctx.clone(), state);
        let mut guard = session.streamers.lock();
        if let Some(previous) = guard.insert(client_id, handle) {
            previous.stop();
        }
        Ok(())
    }

    pub fn remove_health_snapshot_streamer(
        &self,
        room_id: &RoomID,
        state: &Arc<State>,
    ) -> Result<(), ChatError> {
        let client_id = state.get_client_id()?;
        let session = self
            .sessions
            .read()
            .get(room_id)
            .cloned()
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;
        if let Some(handle) = session.streamers.lock().remove(&client_id) {
            handle.stop();
        }
        Ok(())
    }
}
