//! Room lifecycle with TTL, allow-list admission, and server-mediated
//! forwarding (C5). Ported from `pkg/middleware/chat/room/room.go`.

pub mod manager;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::envelope::Message;
use crate::error::ChatError;
use crate::ids::{ClientID, RoomID};
use crate::state::State;

pub use manager::RoomManager;

/// A named, TTL-bounded, allow-list-gated group of participants among which
/// the server forwards messages.
pub struct Room {
    room_id: RoomID,
    allowed: Vec<ClientID>,
    participants: parking_lot::RwLock<HashMap<ClientID, Arc<State>>>,
    ttl: Duration,
    ctx: CancellationToken,
    health_tracked: parking_lot::Mutex<bool>,
    health_ticker: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Room {
    pub fn new(room_id: RoomID, allowed: Vec<ClientID>, ttl: Duration, parent_ctx: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            room_id,
            allowed,
            participants: parking_lot::RwLock::new(HashMap::new()),
            ttl,
            ctx: parent_ctx.child_token(),
            health_tracked: parking_lot::Mutex::new(false),
            health_ticker: parking_lot::Mutex::new(None),
        })
    }

    pub fn id(&self) -> &RoomID {
        &self.room_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn ctx(&self) -> CancellationToken {
        self.ctx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_cancelled()
    }

    pub fn health_tracked(&self) -> bool {
        *self.health_tracked.lock()
    }

    pub fn set_health_tracked(&self, value: bool) {
        *self.health_tracked.lock() = value;
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

    pub fn add(&self, room_id: &RoomID, state: Arc<State>) -> Result<(), ChatError> {
        if *room_id != self.room_id {
            return Err(ChatError::WrongRoom);
        }
        let id = state.get_client_id()?;
        if self.is_closed() {
            return Err(ChatError::ContextCancelled);
        }
        if !self.is_allowed(&id) {
            return Err(ChatError::ClientNotAllowed);
        }
        if self.is_participant(&id) {
            return Err(ChatError::ClientIsAlreadyParticipant);
        }
        self.participants.write().insert(id, state);
        Ok(())
    }

    pub fn remove(&self, room_id: &RoomID, state: &Arc<State>) -> Result<(), ChatError> {
        if *room_id != self.room_id {
            return Err(ChatError::WrongRoom);
        }
        let id = state.get_client_id()?;
        if self.is_closed() {
            return Err(ChatError::ContextCancelled);
        }
        if !self.is_allowed(&id) {
            return Err(ChatError::ClientNotAllowed);
        }
        if !self.is_participant(&id) {
            return Err(ChatError::ClientNotAParticipant);
        }
        self.participants.write().remove(&id);
        Ok(())
    }

    /// Writes `msg` to every `to` participant. Requires sender and every
    /// receiver to be both allowed and a current participant; fails before
    /// writing anything if any member fails that check. Recipients are
    /// written sequentially in `to` order; there is no per-recipient
    /// atomicity if a later write fails.
    pub async fn write_room_message(
        &self,
        room_id: &RoomID,
        msg: Box<dyn Message>,
        from: &ClientID,
        to: &[ClientID],
    ) -> Result<(), ChatError> {
        if self.is_closed() {
            return Err(ChatError::ContextCancelled);
        }
        if *room_id != self.room_id {
            return Err(ChatError::WrongRoom);
        }
        if to.is_empty() {
            return Err(ChatError::other(
                "at least one receiver is needed to use write_room_message",
            ));
        }

        let mut members: Vec<&ClientID> = to.iter().collect();
        members.push(from);
        if members.iter().any(|id| !self.is_allowed(id)) {
            return Err(ChatError::ClientNotAllowed);
        }
        if members.iter().any(|id| !self.is_participant(id)) {
            return Err(ChatError::ClientNotAParticipant);
        }

        // `msg` is consumed by the first recipient's writer; marshal once and
        // rebuild an independent envelope per recipient from the same bytes.
        let bytes = msg.marshal()?;
        for recipient in to {
            let participant = {
                let guard = self.participants.read();
                guard.get(recipient).cloned()
            };
            let Some(participant) = participant else {
                return Err(ChatError::ClientNotAParticipant);
            };
            let copy = crate::envelope::RawEnvelope::from_bytes(bytes.clone())?;
            participant.write(Box::new(copy)).await?;
        }
        Ok(())
    }

    pub fn participants(&self) -> Vec<ClientID> {
        if self.is_closed() {
            return Vec::new();
        }
        self.participants.read().keys().cloned().collect()
    }

    /// Delivers `msg` to every current participant without the sender
    /// admission check `write_room_message` performs — used for
    /// server-originated broadcasts such as health-poll requests, where
    /// the server itself is not a room participant.
    pub async fn broadcast(&self, msg: Box<dyn Message>) -> Result<(), ChatError> {
        if self.is_closed() {
            return Err(ChatError::ContextCancelled);
        }
        let bytes = msg.marshal()?;
        let participants: Vec<Arc<State>> = self.participants.read().values().cloned().collect();
        for participant in participants {
            let copy = crate::envelope::RawEnvelope::from_bytes(bytes.clone())?;
            participant.write(Box::new(copy)).await?;
        }
        Ok(())
    }

    /// Starts (or restarts) the periodic health-poll broadcaster. `interval`
    /// must already be validated by the caller against `[1s, ttl/10]`.
    pub fn start_health_tracking(
        self: &Arc<Self>,
        interval: Duration,
        build_request: Arc<dyn Fn() -> Box<dyn Message> + Send + Sync>,
    ) {
        self.stop_health_tracking();

        let ticker_ctx = self.ctx.child_token();
        *self.health_ticker.lock() = Some(ticker_ctx.clone());
        self.set_health_tracked(true);

        let room = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if room.is_closed() {
                            break;
                        }
                        if let Err(err) = room.broadcast(build_request()).await {
                            tracing::warn!(room_id = %room.room_id, %err, "health poll broadcast failed");
                        }
                    }
                    _ = ticker_ctx.cancelled() => break,
                }
            }
        });
    }

    pub fn stop_health_tracking(&self) {
        if let Some(token) = self.health_ticker.lock().take() {
            token.cancel();
        }
        self.set_health_tracked(false);
    }

    pub fn close(&self) {
        self.stop_health_tracking();
        self.ctx.cancel();
        self.participants.write().clear();
    }
}
