//! Server-side chat role: handles every server-inbound room/health command
//! (§6) and drives ident assignment on connect. Ported from
//! `pkg/middleware/chat/server.go`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::messages::*;
use super::{ChatBase, ChatRole};
use crate::config::{now_millis, RuntimeConfig};
use crate::envelope::{BaseEnvelope, Header, Message, RawEnvelope};
use crate::error::ChatError;
use crate::health::HealthManager;
use crate::ids::{ClientID, RoomID};
use crate::process::Process;
use crate::state::State;

/// All server-inbound protocol ids (§4.9/§6), used to build a `ChatBase`
/// for the server side.
pub const READ_PROTOCOLS: &[&str] = &[
    IDENT_RESPONSE,
    CREATE_ROOM,
    DELETE_ROOM,
    JOIN_ROOM,
    LEAVE_ROOM,
    FORWARD_MESSAGE,
    HEALTH_RESPONSE,
    TRACK_HEALTH,
    UNTRACK_HEALTH,
    GET_HEALTH_SNAPSHOT,
    STOP_STREAMING_HEALTH_SNAPSHOT,
];

fn terminal_header() -> Header {
    Header::new(ClientID::unknown(), ClientID::unknown())
}

fn downcast<T: 'static>(msg: &dyn Message) -> Result<&T, ChatError> {
    msg.as_any().downcast_ref::<T>().ok_or(ChatError::InvalidMessageData)
}

/// Polls `room.broadcast` only once no nested struct needs repeating; kept
/// as a free function since every handler below needs the same
/// direct-to-requester reply shape.
async fn reply(state: &Arc<State>, msg: impl Message + 'static) -> Result<(), ChatError> {
    state.write(Box::new(msg)).await
}

pub struct ServerRole {
    config: RuntimeConfig,
}

impl ServerRole {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    async fn handle_create_room(&self, base: &ChatBase, state: &Arc<State>, msg: &CreateRoom) -> Result<(), ChatError> {
        let ttl = Duration::from_secs(msg.ttl_secs.max(1));
        match base.rooms.create_room(msg.room_id.clone(), msg.allowed.clone(), ttl) {
            Ok(_room) => {
                let _ = base.health.create_health(msg.room_id.clone(), msg.allowed.clone(), ttl);
                reply(
                    state,
                    SuccessCreateRoom {
                        base: BaseEnvelope::terminal(SUCCESS_CREATE_ROOM.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                    },
                )
                .await
            }
            Err(err) => {
                reply(
                    state,
                    FailCreateRoom {
                        base: BaseEnvelope::terminal(FAIL_CREATE_ROOM.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn handle_delete_room(&self, base: &ChatBase, state: &Arc<State>, msg: &DeleteRoom) -> Result<(), ChatError> {
        match base.rooms.delete_room(&msg.room_id) {
            Some(()) => {
                base.health.delete_health(&msg.room_id);
                reply(
                    state,
                    SuccessDeleteRoom {
                        base: BaseEnvelope::terminal(SUCCESS_DELETE_ROOM.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                    },
                )
                .await
            }
            None => {
                let err = ChatError::RoomNotFound(msg.room_id.to_string());
                reply(
                    state,
                    FailDeleteRoom {
                        base: BaseEnvelope::terminal(FAIL_DELETE_ROOM.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn handle_join_room(&self, base: &ChatBase, state: &Arc<State>, msg: &JoinRoom) -> Result<(), ChatError> {
        let client_id = state.get_client_id()?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(msg.join_deadline_secs.max(1));
        loop {
            let attempt = base
                .rooms
                .get_room(&msg.room_id)
                .and_then(|room| room.add(&msg.room_id, state.clone()).map(|_| room));
            match attempt {
                Ok(room) => {
                    let _ = base.health.add(&msg.room_id, client_id.clone());
                    let success = SuccessJoinRoom {
                        base: BaseEnvelope::terminal(SUCCESS_JOIN_ROOM.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        client_id: client_id.clone(),
                    };
                    return room.broadcast(Box::new(success)).await;
                }
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        reply(
                            state,
                            FailJoinRoom {
                                base: BaseEnvelope::terminal(FAIL_JOIN_ROOM.to_string(), terminal_header()),
                                room_id: msg.room_id.clone(),
                                client_id: client_id.clone(),
                                error: err.to_string(),
                            },
                        )
                        .await?;
                        return Err(err);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_leave_room(&self, base: &ChatBase, state: &Arc<State>, msg: &LeaveRoom) -> Result<(), ChatError> {
        let client_id = state.get_client_id()?;
        let room = base.rooms.get_room(&msg.room_id)?;
        match room.remove(&msg.room_id, state) {
            Ok(()) => {
                let _ = base.health.remove(&msg.room_id, &client_id);
                let success = SuccessLeaveRoom {
                    base: BaseEnvelope::terminal(SUCCESS_LEAVE_ROOM.to_string(), terminal_header()),
                    room_id: msg.room_id.clone(),
                    client_id: client_id.clone(),
                };
                let bytes = success.marshal()?;
                state.write(Box::new(RawEnvelope::from_bytes(bytes.clone())?)).await?;
                room.broadcast(Box::new(RawEnvelope::from_bytes(bytes)?)).await
            }
            Err(err) => {
                reply(
                    state,
                    FailLeaveRoom {
                        base: BaseEnvelope::terminal(FAIL_LEAVE_ROOM.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        client_id: client_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn handle_forward_message(&self, base: &ChatBase, state: &Arc<State>, msg: &ForwardMessage) -> Result<(), ChatError> {
        let sender = state.get_client_id()?;
        if msg.base.header.sender != sender {
            return Err(ChatError::ClientIDNotConsistent);
        }
        let room = base.rooms.get_room(&msg.room_id)?;
        let forwarded = ForwardedMessage {
            base: BaseEnvelope {
                protocol: FORWARDED_MESSAGE.to_string(),
                header: Header::new(sender.clone(), ClientID::unknown()),
                next_payload: msg.base.next_payload.clone(),
                next_protocol: msg.base.next_protocol.clone(),
            },
            room_id: msg.room_id.clone(),
        };
        match room.write_room_message(&msg.room_id, Box::new(forwarded), &sender, &msg.to).await {
            Ok(()) => Ok(()),
            Err(err) => {
                reply(
                    state,
                    FailForwardMessage {
                        base: BaseEnvelope::terminal(FAIL_FORWARD_MESSAGE.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn handle_health_response(&self, base: &ChatBase, state: &Arc<State>, msg: &HealthResponse) -> Result<(), ChatError> {
        let sender = state.get_client_id()?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(msg.validity_secs.max(1));
        loop {
            match base.health.update(&msg.room_id, &sender, msg.stat.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ChatError::ValidityExpired);
                    }
                    let _ = err;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_track_health(&self, base: &ChatBase, state: &Arc<State>, msg: &TrackHealth) -> Result<(), ChatError> {
        let interval = Duration::from_secs(msg.interval_secs.max(1));
        let conn_start = now_millis();
        let room_id = msg.room_id.clone();
        let build_request: Arc<dyn Fn() -> Box<dyn Message> + Send + Sync> = Arc::new(move || {
            Box::new(RequestHealth {
                base: BaseEnvelope::terminal(REQUEST_HEALTH.to_string(), terminal_header()),
                room_id: room_id.clone(),
                timestamp: now_millis(),
                connection_start_time: conn_start,
            }) as Box<dyn Message>
        });
        match base.rooms.start_health_tracking(&msg.room_id, interval, build_request) {
            Ok(()) => {
                reply(
                    state,
                    SuccessTrackHealth {
                        base: BaseEnvelope::terminal(SUCCESS_TRACK_HEALTH.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                    },
                )
                .await
            }
            Err(err) => {
                reply(
                    state,
                    FailTrackHealth {
                        base: BaseEnvelope::terminal(FAIL_TRACK_HEALTH.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn handle_untrack_health(&self, base: &ChatBase, state: &Arc<State>, msg: &UntrackHealth) -> Result<(), ChatError> {
        match base.rooms.stop_health_tracking(&msg.room_id) {
            Ok(()) => {
                reply(
                    state,
                    SuccessUntrackHealth {
                        base: BaseEnvelope::terminal(SUCCESS_UNTRACK_HEALTH.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                    },
                )
                .await
            }
            Err(err) => {
                reply(
                    state,
                    FailUntrackHealth {
                        base: BaseEnvelope::terminal(FAIL_UNTRACK_HEALTH.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn handle_get_health_snapshot(&self, base: &ChatBase, state: &Arc<State>, msg: &GetHealthSnapshot) -> Result<(), ChatError> {
        let streamer = Arc::new(SnapshotStreamer {
            room_id: msg.room_id.clone(),
            health: base.health.clone(),
            interval: Duration::from_secs(msg.interval_secs.max(1)),
        });
        match base.health.add_health_snapshot_streamer(&msg.room_id, state.clone(), streamer) {
            Ok(()) => {
                reply(
                    state,
                    SuccessGetHealthSnapshot {
                        base: BaseEnvelope::terminal(SUCCESS_GET_HEALTH_SNAPSHOT.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                    },
                )
                .await
            }
            Err(err) => {
                reply(
                    state,
                    FailGetHealthSnapshot {
                        base: BaseEnvelope::terminal(FAIL_GET_HEALTH_SNAPSHOT.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn handle_stop_streaming(
        &self,
        base: &ChatBase,
        state: &Arc<State>,
        msg: &StopStreamingHealthSnapshot,
    ) -> Result<(), ChatError> {
        match base.health.remove_health_snapshot_streamer(&msg.room_id, state) {
            Ok(()) => {
                reply(
                    state,
                    SuccessStopStreamingHealthSnapshot {
                        base: BaseEnvelope::terminal(SUCCESS_STOP_STREAMING_HEALTH_SNAPSHOT.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                    },
                )
                .await
            }
            Err(err) => {
                reply(
                    state,
                    FailStopStreamingHealthSnapshot {
                        base: BaseEnvelope::terminal(FAIL_STOP_STREAMING_HEALTH_SNAPSHOT.to_string(), terminal_header()),
                        room_id: msg.room_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ChatRole for ServerRole {
    async fn handle_read(&self, base: &ChatBase, msg: &dyn Message, state: &Arc<State>) -> Result<(), ChatError> {
        match msg.protocol().as_str() {
            IDENT_RESPONSE => Ok(()),
            CREATE_ROOM => self.handle_create_room(base, state, downcast(msg)?).await,
            DELETE_ROOM => self.handle_delete_room(base, state, downcast(msg)?).await,
            JOIN_ROOM => self.handle_join_room(base, state, downcast(msg)?).await,
            LEAVE_ROOM => self.handle_leave_room(base, state, downcast(msg)?).await,
            FORWARD_MESSAGE => self.handle_forward_message(base, state, downcast(msg)?).await,
            HEALTH_RESPONSE => self.handle_health_response(base, state, downcast(msg)?).await,
            TRACK_HEALTH => self.handle_track_health(base, state, downcast(msg)?).await,
            UNTRACK_HEALTH => self.handle_untrack_health(base, state, downcast(msg)?).await,
            GET_HEALTH_SNAPSHOT => self.handle_get_health_snapshot(base, state, downcast(msg)?).await,
            STOP_STREAMING_HEALTH_SNAPSHOT => self.handle_stop_streaming(base, state, downcast(msg)?).await,
            _ => Err(ChatError::InterfaceMismatch("ServerRole")),
        }
    }

    async fn init(&self, base: &ChatBase, state: &Arc<State>) -> Result<(), ChatError> {
        crate::ident::server_bootstrap(base, state, self.config.ident_poll_period, self.config.ident_timeout).await
    }
}

/// Background process behind `chat:get_health_snapshot`: ticks on `interval`
/// and pushes a fresh deep-copy snapshot to the subscriber.
struct SnapshotStreamer {
    room_id: RoomID,
    health: Arc<HealthManager>,
    interval: Duration,
}

#[async_trait]
impl Process for SnapshotStreamer {
    async fn process(&self, ctx: CancellationToken, state: &State) -> Result<(), ChatError> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.health.get_health_snapshot(&self.room_id)?;
                    let msg = UpdateHealthSnapshot {
                        base: BaseEnvelope::terminal(UPDATE_HEALTH_SNAPSHOT.to_string(), terminal_header()),
                        snapshot,
                    };
                    state.write(Box::new(msg)).await?;
                }
                _ = ctx.cancelled() => return Err(ChatError::ContextCancelled),
            }
        }
    }
}
