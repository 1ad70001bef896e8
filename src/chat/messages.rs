//! Wire messages for the room and health protocol families (C9), per the
//! protocol id registry in §6. Ported from the shape established by
//! `keyexchange::curve25519`'s per-message struct/factory pairs.
//!
//! Durations travel on the wire as plain seconds (`serde` has no built-in
//! `Duration` encoding); call sites convert with `Duration::from_secs`.

use serde::{Deserialize, Serialize};

use crate::envelope::{BaseEnvelope, Header, Message, MessageFactory, Protocol};
use crate::error::ChatError;
use crate::health::{Snapshot, Stat};
use crate::ids::{ClientID, RoomID};

macro_rules! message {
    ($name:ident, $factory:ident, $proto:expr, { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $name {
            pub base: BaseEnvelope,
            $(pub $field: $ty,)*
        }

        impl Message for $name {
            fn protocol(&self) -> &Protocol {
                &self.base.protocol
            }
            fn header(&self) -> &Header {
                &self.base.header
            }
            fn base(&self) -> &BaseEnvelope {
                &self.base
            }
            fn marshal(&self) -> Result<Vec<u8>, ChatError> {
                serde_json::to_vec(self).map_err(|e| ChatError::other(e.to_string()))
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        pub struct $factory;
        impl MessageFactory for $factory {
            fn create(&self) -> Box<dyn Message> {
                Box::new($name {
                    base: BaseEnvelope::terminal(
                        $proto.to_string(),
                        Header::new(ClientID::unknown(), ClientID::unknown()),
                    ),
                    $($field: Default::default()),*
                })
            }
            fn unmarshal(&self, payload: &[u8]) -> Result<Box<dyn Message>, ChatError> {
                let msg: $name =
                    serde_json::from_slice(payload).map_err(|_| ChatError::InvalidMessageData)?;
                Ok(Box::new(msg))
            }
        }
    };
}

pub const IDENT: &str = "room:ident";
pub const IDENT_RESPONSE: &str = "room:ident_response";
pub const CREATE_ROOM: &str = "room:create_room";
pub const SUCCESS_CREATE_ROOM: &str = "room:success_create_room";
pub const FAIL_CREATE_ROOM: &str = "room:fail_create_room";
pub const DELETE_ROOM: &str = "room:delete_room";
pub const SUCCESS_DELETE_ROOM: &str = "room:success_delete_room";
pub const FAIL_DELETE_ROOM: &str = "room:fail_delete_room";
pub const JOIN_ROOM: &str = "room:join_room";
pub const SUCCESS_JOIN_ROOM: &str = "room:success_join_room";
pub const FAIL_JOIN_ROOM: &str = "room:fail_join_room";
pub const LEAVE_ROOM: &str = "room:leave_room";
pub const SUCCESS_LEAVE_ROOM: &str = "room:success_leave_room";
pub const FAIL_LEAVE_ROOM: &str = "room:fail_leave_room";
pub const FORWARD_MESSAGE: &str = "room:forward_message";
pub const FORWARDED_MESSAGE: &str = "room:forwarded_message";
pub const FAIL_FORWARD_MESSAGE: &str = "room:fail_forward_message";
pub const REQUEST_HEALTH: &str = "room:request_health";
pub const HEALTH_RESPONSE: &str = "room:health_response";
pub const TRACK_HEALTH: &str = "chat:track_health";
pub const UNTRACK_HEALTH: &str = "chat:untrack_health";
pub const SUCCESS_TRACK_HEALTH: &str = "chat:success_track_health";
pub const FAIL_TRACK_HEALTH: &str = "chat:fail_track_health";
pub const SUCCESS_UNTRACK_HEALTH: &str = "chat:success_untrack_health";
pub const FAIL_UNTRACK_HEALTH: &str = "chat:fail_untrack_health";
pub const GET_HEALTH_SNAPSHOT: &str = "chat:get_health_snapshot";
pub const SUCCESS_GET_HEALTH_SNAPSHOT: &str = "chat:success_get_health_snapshot";
pub const FAIL_GET_HEALTH_SNAPSHOT: &str = "chat:fail_get_health_snapshot";
pub const UPDATE_HEALTH_SNAPSHOT: &str = "chat:update_health_snapshot";
pub const STOP_STREAMING_HEALTH_SNAPSHOT: &str = "chat:stop_streaming_health_snapshot";
pub const SUCCESS_STOP_STREAMING_HEALTH_SNAPSHOT: &str = "chat:success_stop_streaming_health_snapshot";
pub const FAIL_STOP_STREAMING_HEALTH_SNAPSHOT: &str = "chat:fail_stop_streaming_health_snapshot";

message!(Ident, IdentFactory, IDENT, {});
message!(IdentResponse, IdentResponseFactory, IDENT_RESPONSE, {});

message!(CreateRoom, CreateRoomFactory, CREATE_ROOM, {
    room_id: RoomID,
    allowed: Vec<ClientID>,
    ttl_secs: u64,
});
message!(SuccessCreateRoom, SuccessCreateRoomFactory, SUCCESS_CREATE_ROOM, {
    room_id: RoomID,
});
message!(FailCreateRoom, FailCreateRoomFactory, FAIL_CREATE_ROOM, {
    room_id: RoomID,
    error: String,
});

message!(DeleteRoom, DeleteRoomFactory, DELETE_ROOM, { room_id: RoomID });
message!(SuccessDeleteRoom, SuccessDeleteRoomFactory, SUCCESS_DELETE_ROOM, {
    room_id: RoomID,
});
message!(FailDeleteRoom, FailDeleteRoomFactory, FAIL_DELETE_ROOM, {
    room_id: RoomID,
    error: String,
});

message!(JoinRoom, JoinRoomFactory, JOIN_ROOM, {
    room_id: RoomID,
    join_deadline_secs: u64,
});
message!(SuccessJoinRoom, SuccessJoinRoomFactory, SUCCESS_JOIN_ROOM, {
    room_id: RoomID,
    client_id: ClientID,
});
message!(FailJoinRoom, FailJoinRoomFactory, FAIL_JOIN_ROOM, {
    room_id: RoomID,
    client_id: ClientID,
    error: String,
});

message!(LeaveRoom, LeaveRoomFactory, LEAVE_ROOM, { room_id: RoomID });
message!(SuccessLeaveRoom, SuccessLeaveRoomFactory, SUCCESS_LEAVE_ROOM, {
    room_id: RoomID,
    client_id: ClientID,
});
message!(FailLeaveRoom, FailLeaveRoomFactory, FAIL_LEAVE_ROOM, {
    room_id: RoomID,
    client_id: ClientID,
    error: String,
});

message!(ForwardMessage, ForwardMessageFactory, FORWARD_MESSAGE, {
    room_id: RoomID,
    to: Vec<ClientID>,
});
message!(ForwardedMessage, ForwardedMessageFactory, FORWARDED_MESSAGE, {
    room_id: RoomID,
});
message!(FailForwardMessage, FailForwardMessageFactory, FAIL_FORWARD_MESSAGE, {
    room_id: RoomID,
    error: String,
});

message!(RequestHealth, RequestHealthFactory, REQUEST_HEALTH, {
    room_id: RoomID,
    timestamp: i64,
    connection_start_time: i64,
});
message!(HealthResponse, HealthResponseFactory, HEALTH_RESPONSE, {
    room_id: RoomID,
    validity_secs: u64,
    stat: Stat,
});

message!(TrackHealth, TrackHealthFactory, TRACK_HEALTH, {
    room_id: RoomID,
    interval_secs: u64,
});
message!(UntrackHealth, UntrackHealthFactory, UNTRACK_HEALTH, { room_id: RoomID });
message!(SuccessTrackHealth, SuccessTrackHealthFactory, SUCCESS_TRACK_HEALTH, {
    room_id: RoomID,
});
message!(FailTrackHealth, FailTrackHealthFactory, FAIL_TRACK_HEALTH, {
    room_id: RoomID,
    error: String,
});
message!(SuccessUntrackHealth, SuccessUntrackHealthFactory, SUCCESS_UNTRACK_HEALTH, {
    room_id: RoomID,
});
message!(FailUntrackHealth, FailUntrackHealthFactory, FAIL_UNTRACK_HEALTH, {
    room_id: RoomID,
    error: String,
});

message!(GetHealthSnapshot, GetHealthSnapshotFactory, GET_HEALTH_SNAPSHOT, {
    room_id: RoomID,
    interval_secs: u64,
});
message!(SuccessGetHealthSnapshot, SuccessGetHealthSnapshotFactory, SUCCESS_GET_HEALTH_SNAPSHOT, {
    room_id: RoomID,
});
message!(FailGetHealthSnapshot, FailGetHealthSnapshotFactory, FAIL_GET_HEALTH_SNAPSHOT, {
    room_id: RoomID,
    error: String,
});
message!(UpdateHealthSnapshot, UpdateHealthSnapshotFactory, UPDATE_HEALTH_SNAPSHOT, {
    snapshot: Snapshot,
});

message!(
    StopStreamingHealthSnapshot,
    StopStreamingHealthSnapshotFactory,
    STOP_STREAMING_HEALTH_SNAPSHOT,
    { room_id: RoomID }
);
message!(
    SuccessStopStreamingHealthSnapshot,
    SuccessStopStreamingHealthSnapshotFactory,
    SUCCESS_STOP_STREAMING_HEALTH_SNAPSHOT,
    { room_id: RoomID }
);
message!(
    FailStopStreamingHealthSnapshot,
    FailStopStreamingHealthSnapshotFactory,
    FAIL_STOP_STREAMING_HEALTH_SNAPSHOT,
    { room_id: RoomID, error: String }
);

/// Registers every message factory this module defines under its protocol id.
pub fn register_all(registry: &crate::envelope::Registry) -> Result<(), ChatError> {
    use std::sync::Arc;
    registry.register(IDENT, Arc::new(IdentFactory))?;
    registry.register(IDENT_RESPONSE, Arc::new(IdentResponseFactory))?;
    registry.register(CREATE_ROOM, Arc::new(CreateRoomFactory))?;
    registry.register(SUCCESS_CREATE_ROOM, Arc::new(SuccessCreateRoomFactory))?;
    registry.register(FAIL_CREATE_ROOM, Arc::new(FailCreateRoomFactory))?;
    registry.register(DELETE_ROOM, Arc::new(DeleteRoomFactory))?;
    registry.register(SUCCESS_DELETE_ROOM, Arc::new(SuccessDeleteRoomFactory))?;
    registry.register(FAIL_DELETE_ROOM, Arc::new(FailDeleteRoomFactory))?;
    registry.register(JOIN_ROOM, Arc::new(JoinRoomFactory))?;
    registry.register(SUCCESS_JOIN_ROOM, Arc::new(SuccessJoinRoomFactory))?;
    registry.register(FAIL_JOIN_ROOM, Arc::new(FailJoinRoomFactory))?;
    registry.register(LEAVE_ROOM, Arc::new(LeaveRoomFactory))?;
    registry.register(SUCCESS_LEAVE_ROOM, Arc::new(SuccessLeaveRoomFactory))?;
    registry.register(FAIL_LEAVE_ROOM, Arc::new(FailLeaveRoomFactory))?;
    registry.register(FORWARD_MESSAGE, Arc::new(ForwardMessageFactory))?;
    registry.register(FORWARDED_MESSAGE, Arc::new(ForwardedMessageFactory))?;
    registry.register(FAIL_FORWARD_MESSAGE, Arc::new(FailForwardMessageFactory))?;
    registry.register(REQUEST_HEALTH, Arc::new(RequestHealthFactory))?;
    registry.register(HEALTH_RESPONSE, Arc::new(HealthResponseFactory))?;
    registry.register(TRACK_HEALTH, Arc::new(TrackHealthFactory))?;
    registry.register(UNTRACK_HEALTH, Arc::new(UntrackHealthFactory))?;
    registry.register(SUCCESS_TRACK_HEALTH, Arc::new(SuccessTrackHealthFactory))?;
    registry.register(FAIL_TRACK_HEALTH, Arc::new(FailTrackHealthFactory))?;
    registry.register(SUCCESS_UNTRACK_HEALTH, Arc::new(SuccessUntrackHealthFactory))?;
    registry.register(FAIL_UNTRACK_HEALTH, Arc::new(FailUntrackHealthFactory))?;
    registry.register(GET_HEALTH_SNAPSHOT, Arc::new(GetHealthSnapshotFactory))?;
    registry.register(SUCCESS_GET_HEALTH_SNAPSHOT, Arc::new(SuccessGetHealthSnapshotFactory))?;
    registry.register(FAIL_GET_HEALTH_SNAPSHOT, Arc::new(FailGetHealthSnapshotFactory))?;
    registry.register(UPDATE_HEALTH_SNAPSHOT, Arc::new(UpdateHealthSnapshotFactory))?;
    registry.register(STOP_STREAMING_HEALTH_SNAPSHOT, Arc::new(StopStreamingHealthSnapshotFactory))?;
    registry.register(
        SUCCESS_STOP_STREAMING_HEALTH_SNAPSHOT,
        Arc::new(SuccessStopStreamingHealthSnapshotFactory),
    )?;
    registry.register(
        FAIL_STOP_STREAMING_HEALTH_SNAPSHOT,
        Arc::new(FailStopStreamingHealthSnapshotFactory),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_all_is_idempotent_failing_on_reregister() {
        let registry = crate::envelope::Registry::new();
        register_all(&registry).unwrap();
        assert!(register_all(&registry).is_err());
    }

    #[test]
    fn create_room_round_trips() {
        let registry = crate::envelope::Registry::new();
        register_all(&registry).unwrap();
        let msg = CreateRoom {
            base: BaseEnvelope::terminal(
                CREATE_ROOM.to_string(),
                Header::new(ClientID::from("a"), ClientID::from("server")),
            ),
            room_id: RoomID::from("r1"),
            allowed: vec![ClientID::from("a"), ClientID::from("b")],
            ttl_secs: 60,
        };
        let bytes = msg.marshal().unwrap();
        let decoded = registry.unmarshal_raw(&bytes).unwrap();
        assert_eq!(decoded.protocol(), CREATE_ROOM);
    }
}
