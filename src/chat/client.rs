//! Client-side chat role: handles the server's `Ident` handshake push,
//! forwarded room traffic, and health polling. Ported from
//! `pkg/middleware/chat/client.go`.

use std::sync::Arc;

use async_trait::async_trait;

use super::messages::*;
use super::{ChatBase, ChatRole};
use crate::config::RuntimeConfig;
use crate::envelope::{BaseEnvelope, Header, Message};
use crate::error::ChatError;
use crate::health::Stat;
use crate::ids::ClientID;
use crate::state::State;

/// All client-inbound protocol ids (§4.9/§6).
pub const READ_PROTOCOLS: &[&str] = &[
    IDENT,
    FORWARDED_MESSAGE,
    REQUEST_HEALTH,
    SUCCESS_CREATE_ROOM,
    FAIL_CREATE_ROOM,
    SUCCESS_DELETE_ROOM,
    FAIL_DELETE_ROOM,
    SUCCESS_JOIN_ROOM,
    FAIL_JOIN_ROOM,
    SUCCESS_LEAVE_ROOM,
    FAIL_LEAVE_ROOM,
    FAIL_FORWARD_MESSAGE,
    SUCCESS_TRACK_HEALTH,
    FAIL_TRACK_HEALTH,
    SUCCESS_UNTRACK_HEALTH,
    FAIL_UNTRACK_HEALTH,
    SUCCESS_GET_HEALTH_SNAPSHOT,
    FAIL_GET_HEALTH_SNAPSHOT,
    UPDATE_HEALTH_SNAPSHOT,
    SUCCESS_STOP_STREAMING_HEALTH_SNAPSHOT,
    FAIL_STOP_STREAMING_HEALTH_SNAPSHOT,
];

fn downcast<T: 'static>(msg: &dyn Message) -> Result<&T, ChatError> {
    msg.as_any().downcast_ref::<T>().ok_or(ChatError::InvalidMessageData)
}

fn terminal_header(sender: ClientID) -> Header {
    Header::new(sender, ClientID::unknown())
}

/// Host-metrics collection (psutil-style CPU/memory sampling) is explicitly
/// out of scope; `ClientRole` takes an injectable provider instead so
/// `REQUEST_HEALTH` replies are testable without a real sampler.
pub type StatProvider = Arc<dyn Fn() -> Stat + Send + Sync>;

pub struct ClientRole {
    config: RuntimeConfig,
    stat_provider: StatProvider,
}

impl ClientRole {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_stat_provider(config, Arc::new(|| Stat::default()))
    }

    pub fn with_stat_provider(config: RuntimeConfig, stat_provider: StatProvider) -> Self {
        Self { config, stat_provider }
    }

    async fn handle_ident(&self, base: &ChatBase, state: &Arc<State>, msg: &Ident) -> Result<(), ChatError> {
        crate::ident::handle_ident(base, msg, state).await
    }

    async fn handle_forwarded_message(&self, _base: &ChatBase, _state: &Arc<State>, _msg: &ForwardedMessage) -> Result<(), ChatError> {
        // Application-layer delivery of the nested payload happens via the
        // decorator's `get_next` advance in `ChatReader::read`; nothing to
        // do here beyond having routed the envelope.
        Ok(())
    }

    async fn handle_request_health(&self, state: &Arc<State>, msg: &RequestHealth) -> Result<(), ChatError> {
        let sender = state.get_client_id()?;
        let stat = (self.stat_provider)();
        let response = HealthResponse {
            base: BaseEnvelope::terminal(HEALTH_RESPONSE.to_string(), terminal_header(sender)),
            room_id: msg.room_id.clone(),
            validity_secs: self.config.health_poll_min.as_secs().max(1),
            stat,
        };
        state.write(Box::new(response)).await
    }

    fn log_trailer(&self, protocol: &str, room_id: Option<&crate::ids::RoomID>, error: Option<&str>) {
        match error {
            Some(err) => tracing::warn!(protocol, ?room_id, err, "server reported failure"),
            None => tracing::debug!(protocol, ?room_id, "server acknowledged"),
        }
    }
}

#[async_trait]
impl ChatRole for ClientRole {
    async fn handle_read(&self, base: &ChatBase, msg: &dyn Message, state: &Arc<State>) -> Result<(), ChatError> {
        match msg.protocol().as_str() {
            IDENT => self.handle_ident(base, state, downcast(msg)?).await,
            FORWARDED_MESSAGE => self.handle_forwarded_message(base, state, downcast(msg)?).await,
            REQUEST_HEALTH => self.handle_request_health(state, downcast(msg)?).await,

            SUCCESS_CREATE_ROOM => {
                let m: &SuccessCreateRoom = downcast(msg)?;
                self.log_trailer(SUCCESS_CREATE_ROOM, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_CREATE_ROOM => {
                let m: &FailCreateRoom = downcast(msg)?;
                self.log_trailer(FAIL_CREATE_ROOM, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            SUCCESS_DELETE_ROOM => {
                let m: &SuccessDeleteRoom = downcast(msg)?;
                self.log_trailer(SUCCESS_DELETE_ROOM, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_DELETE_ROOM => {
                let m: &FailDeleteRoom = downcast(msg)?;
                self.log_trailer(FAIL_DELETE_ROOM, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            SUCCESS_JOIN_ROOM => {
                let m: &SuccessJoinRoom = downcast(msg)?;
                self.log_trailer(SUCCESS_JOIN_ROOM, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_JOIN_ROOM => {
                let m: &FailJoinRoom = downcast(msg)?;
                self.log_trailer(FAIL_JOIN_ROOM, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            SUCCESS_LEAVE_ROOM => {
                let m: &SuccessLeaveRoom = downcast(msg)?;
                self.log_trailer(SUCCESS_LEAVE_ROOM, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_LEAVE_ROOM => {
                let m: &FailLeaveRoom = downcast(msg)?;
                self.log_trailer(FAIL_LEAVE_ROOM, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            FAIL_FORWARD_MESSAGE => {
                let m: &FailForwardMessage = downcast(msg)?;
                self.log_trailer(FAIL_FORWARD_MESSAGE, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            SUCCESS_TRACK_HEALTH => {
                let m: &SuccessTrackHealth = downcast(msg)?;
                self.log_trailer(SUCCESS_TRACK_HEALTH, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_TRACK_HEALTH => {
                let m: &FailTrackHealth = downcast(msg)?;
                self.log_trailer(FAIL_TRACK_HEALTH, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            SUCCESS_UNTRACK_HEALTH => {
                let m: &SuccessUntrackHealth = downcast(msg)?;
                self.log_trailer(SUCCESS_UNTRACK_HEALTH, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_UNTRACK_HEALTH => {
                let m: &FailUntrackHealth = downcast(msg)?;
                self.log_trailer(FAIL_UNTRACK_HEALTH, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            SUCCESS_GET_HEALTH_SNAPSHOT => {
                let m: &SuccessGetHealthSnapshot = downcast(msg)?;
                self.log_trailer(SUCCESS_GET_HEALTH_SNAPSHOT, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_GET_HEALTH_SNAPSHOT => {
                let m: &FailGetHealthSnapshot = downcast(msg)?;
                self.log_trailer(FAIL_GET_HEALTH_SNAPSHOT, Some(&m.room_id), Some(&m.error));
                Ok(())
            }
            UPDATE_HEALTH_SNAPSHOT => {
                let m: &UpdateHealthSnapshot = downcast(msg)?;
                self.log_trailer(UPDATE_HEALTH_SNAPSHOT, Some(&m.snapshot.room_id), None);
                Ok(())
            }
            SUCCESS_STOP_STREAMING_HEALTH_SNAPSHOT => {
                let m: &SuccessStopStreamingHealthSnapshot = downcast(msg)?;
                self.log_trailer(SUCCESS_STOP_STREAMING_HEALTH_SNAPSHOT, Some(&m.room_id), None);
                Ok(())
            }
            FAIL_STOP_STREAMING_HEALTH_SNAPSHOT => {
                let m: &FailStopStreamingHealthSnapshot = downcast(msg)?;
                self.log_trailer(FAIL_STOP_STREAMING_HEALTH_SNAPSHOT, Some(&m.room_id), Some(&m.error));
                Ok(())
            }

            _ => Err(ChatError::InterfaceMismatch("ClientRole")),
        }
    }

    async fn init(&self, base: &ChatBase, state: &Arc<State>) -> Result<(), ChatError> {
        crate::ident::client_bootstrap(base, state, self.config.ident_poll_period, self.config.ident_timeout).await
    }
}
