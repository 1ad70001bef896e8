//! Per-room health telemetry (C6): participant stats, deep-copy snapshots.
//! Ported from `pkg/middleware/chat/health/health.go`.

pub mod manager;

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::ids::{ClientID, RoomID};

pub use manager::HealthManager;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Up,
    Down,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Down
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuUsage {
    pub num_cores: u8,
    pub percent: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryUsage {
    pub total: f32,
    pub used: f32,
    pub used_ratio: f32,
    pub available: f32,
    pub available_ratio: f32,
}

/// A single participant's self-reported health, as returned in `health_response`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Stat {
    pub connection_status: ConnectionState,
    pub connection_uptime: i64,
    pub cpu_usage: CpuUsage,
    pub memory_usage: MemoryUsage,
    pub network_usage: f64,
    pub latency_ms: i64,
}

/// A deep-copyable view of a room's health state, handed out to snapshot
/// subscribers. Mutations to the live `Health` after a snapshot is taken do
/// not affect previously returned snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub room_id: RoomID,
    pub participants: HashMap<ClientID, Option<Stat>>,
}

impl Snapshot {
    pub fn marshal(&self) -> Result<Vec<u8>, ChatError> {
        serde_json::to_vec(self).map_err(|e| ChatError::other(e.to_string()))
    }
}

/// Per-room health aggregator: mirrors the room's allow-list, tracks one
/// `Stat` slot per participant (absent until the first `health_response`).
pub struct Health {
    room_id: RoomID,
    allowed: Vec<ClientID>,
    participants: RwLock<HashMap<ClientID, Option<Stat>>>,
    ctx: CancellationToken,
}

impl Health {
    pub fn new(room_id: RoomID, allowed: Vec<ClientID>, parent_ctx: CancellationToken) -> Self {
        Self {
            room_id,
            allowed,
            participants: RwLock::new(HashMap::new()),
            ctx: parent_ctx.child_token(),
        }
    }

    pub fn id(&self) -> &RoomID {
        &self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_cancelled()
    }

    fn is_allowed(&self, id: &ClientID) -> bool {
        if self.is_closed() {
            return false;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|a| a == id)
    }

    fn is_participant(&self, id: &ClientID) -> bool {
        if self.is_closed() {
            return false;
        }
        self.participants.read().contains_key(id)
    }

    pub fn add(&self, room_id: &RoomID, id: ClientID) -> Result<(), ChatError> {
        if *room_id != self.room_id {
            return Err(ChatError::WrongRoom);
        }
        if self.is_closed() {
            return Err(ChatError::ContextCancelled);
        }
        if !self.is_allowed(&id) {
            return Err(ChatError::ClientNotAllowed);
        }
        if self.is_participant(&id) {
            return Err(ChatError::ClientIsAlreadyParticipant);
        }
        self.participants.write().insert(id, None);
        Ok(())
    }

    pub fn remove(&self, room_id: &RoomID, id: &ClientID) -> Result<(), ChatError> {
        if *room_id != self.room_id {
            return Err(ChatError::WrongRoom);
        }
        if self.is_closed() {
            return Err(ChatError::ContextCancelled);
        }
        if !self.is_allowed(id) {
            return Err(ChatError::ClientNotAllowed);
        }
        if !self.is_participant(id) {
            return Err(ChatError::ClientNotAParticipant);
        }
        self.participants.write().remove(id);
        Ok(())
    }

    pub fn update(&self, room_id: &RoomID, id: &ClientID, stat: Stat) -> Result<(), ChatError> {
        if *room_id != self.room_id {
            return Err(ChatError::WrongRoom);
        }
        if self.is_closed() {
            return Err(ChatError::ContextCancelled);
        }
        if !self.is_allowed(id) {
            return Err(ChatError::ClientNotAllowed);
        }
        if !self.is_participant(id) {
            return Err(ChatError::ClientNotAParticipant);
        }
        self.participants.write().insert(id.clone(), Some(stat));
        Ok(())
    }

    /// Returns a deep copy; the caller's view is unaffected by later updates.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            room_id: self.room_id.clone(),
            participants: self.participants.read().clone(),
        }
    }

    pub fn close(&self) {
        self.ctx.cancel();
        self.participants.write().clear();
    }
}
