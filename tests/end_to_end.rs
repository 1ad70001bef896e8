//! End-to-end coverage over a full `Chain` (key exchange + chat dispatch)
//! wired across an in-memory duplex, exercising the six session scenarios:
//! create/join/forward/leave, TTL auto-delete, admission denial, health
//! polling, a clean handshake, and a signature failure.
//!
//! The duplex is a pair of channel-backed `Connection`s, grounded the same
//! way the teacher's `PipeTransport` wires up its own handshake tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use alnp::chat::messages::*;
use alnp::chat::{ChatBase, ChatInterceptor};
use alnp::config::RuntimeConfig;
use alnp::envelope::{BaseEnvelope, Header, Message, Registry};
use alnp::error::ChatError;
use alnp::health::HealthManager;
use alnp::ids::{ClientID, RoomID};
use alnp::interceptor::{Chain, Interceptor};
use alnp::keyexchange::{Curve25519Options, EncryptInterceptor, EncryptorFactory, OptionsFactory};
use alnp::record::{AES256Encryptor, Encryptor};
use alnp::room::RoomManager;
use alnp::state::StateManager;
use alnp::{BoxConnection, BoxReader, BoxWriter, ClientRole, Connection, ServerRole};

struct PipeConnection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl fmt::Debug for PipeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeConnection").finish()
    }
}

impl PipeConnection {
    fn pair() -> (BoxConnection, BoxConnection) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a: BoxConnection = Arc::new(Self {
            tx: tx_a,
            rx: AsyncMutex::new(rx_b),
        });
        let b: BoxConnection = Arc::new(Self {
            tx: tx_b,
            rx: AsyncMutex::new(rx_a),
        });
        (a, b)
    }
}

#[async_trait]
impl Connection for PipeConnection {
    async fn write(&self, _ctx: CancellationToken, bytes: &[u8]) -> Result<(), ChatError> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| ChatError::other("pipe closed"))
    }

    async fn read(&self, _ctx: CancellationToken) -> Result<Vec<u8>, ChatError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ChatError::other("pipe closed"))
    }

    async fn close(&self) -> Result<(), ChatError> {
        Ok(())
    }
}

/// One side (server or client) of a bound session: a writer to send
/// commands through the full stack, a channel of everything the chain's
/// read loop has produced (including messages the role already handled —
/// their envelope still flows back out since `get_next` is `None` for
/// terminal commands), and the room/health managers backing this side.
struct Side {
    writer: BoxWriter,
    inbox: mpsc::UnboundedReceiver<Box<dyn Message>>,
    rooms: Arc<RoomManager>,
    health: Arc<HealthManager>,
}

impl Side {
    /// Drains the inbox until a message of the given protocol arrives.
    async fn expect(&mut self, protocol: &str) -> Box<dyn Message> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.inbox.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {protocol}"))
                .expect("inbox closed");
            if msg.protocol() == protocol {
                return msg;
            }
        }
    }
}

fn keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

fn skip_header() -> Header {
    Header::new(ClientID::unknown(), ClientID::unknown())
}

/// Binds one side of a full `EncryptInterceptor` + `ChatInterceptor` chain
/// over `conn` and drives its handshake/ident bootstrap to completion.
async fn bootstrap_side(
    conn: BoxConnection,
    is_server: bool,
    registry: Arc<Registry>,
    config: RuntimeConfig,
    signing_key: Option<SigningKey>,
    verification_key: Option<VerifyingKey>,
) -> Result<Side, ChatError> {
    let ctx = CancellationToken::new();
    let rooms = RoomManager::new(ctx.clone());
    let health = HealthManager::new(ctx.clone());
    let states = Arc::new(StateManager::new());

    let read_protocols: &'static [&'static str] = if is_server {
        alnp::chat::server::READ_PROTOCOLS
    } else {
        alnp::chat::client::READ_PROTOCOLS
    };
    let base = ChatBase::new(rooms.clone(), health.clone(), registry.clone(), states, ctx, read_protocols, &[]);

    let chat_interceptor: Arc<dyn Interceptor> = if is_server {
        Arc::new(ChatInterceptor::new(base, Arc::new(ServerRole::new(config.clone()))))
    } else {
        Arc::new(ChatInterceptor::new(base, Arc::new(ClientRole::new(config.clone()))))
    };

    // `EncryptInterceptor::bind_socket_connection` only ever calls this once
    // per connection; the `Mutex<Option<_>>` take-once pattern sidesteps
    // `SigningKey` not implementing `Clone`/`Copy` without widening the
    // `OptionsFactory` signature for every other caller.
    let signing_key = parking_lot::Mutex::new(signing_key);
    let verification_key = parking_lot::Mutex::new(verification_key);
    let options: OptionsFactory = Arc::new(move || Curve25519Options {
        signing_key: signing_key.lock().take(),
        verification_key: verification_key.lock().take(),
        require_signature: true,
    });
    let encryptor_factory: EncryptorFactory = Arc::new(|| Arc::new(AES256Encryptor::new()) as Arc<dyn Encryptor>);
    let encrypt_interceptor: Arc<dyn Interceptor> = Arc::new(EncryptInterceptor::with_config(
        registry.clone(),
        is_server,
        options,
        encryptor_factory,
        config.key_exchange_timeout,
        config.session_state_poll_period,
        config.nonce_replay_window,
    ));

    let chain = Chain::new(vec![encrypt_interceptor, chat_interceptor]);

    let raw_writer: BoxWriter = Arc::new(alnp::connection::RawWriter);
    let raw_reader: BoxReader = Arc::new(alnp::connection::RawReader {
        registry: registry.clone(),
    });

    let (writer, reader) = chain.bind_socket_connection(&conn, raw_writer, raw_reader).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let pump_conn = conn.clone();
    tokio::spawn(async move {
        loop {
            match reader.read(CancellationToken::new(), &pump_conn).await {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    chain.init(&conn).await?;

    Ok(Side { writer, inbox: rx, rooms, health })
}

/// Wires a server/client pair with a valid signature, handshaking and
/// running ident bootstrap to completion on both ends.
async fn connected_pair() -> (Side, Side) {
    let registry = Arc::new(Registry::new());
    alnp::register_all(&registry).unwrap();
    let (server_conn, client_conn) = PipeConnection::pair();
    let (signing_key, verifying_key) = keypair();
    let config = RuntimeConfig {
        ident_timeout: Duration::from_secs(5),
        key_exchange_timeout: Duration::from_secs(5),
        ident_poll_period: Duration::from_millis(10),
        session_state_poll_period: Duration::from_millis(10),
        ..RuntimeConfig::default()
    };

    let server_fut = bootstrap_side(
        server_conn,
        true,
        registry.clone(),
        config.clone(),
        Some(signing_key),
        None,
    );
    let client_fut = bootstrap_side(client_conn, false, registry, config, None, Some(verifying_key));

    let (server, client) = tokio::join!(server_fut, client_fut);
    (server.expect("server bootstrap"), client.expect("client bootstrap"))
}

async fn send(side: &Side, msg: impl Message + 'static) {
    side.writer
        .write(CancellationToken::new(), &dummy_conn(), Box::new(msg))
        .await
        .unwrap();
}

/// `Writer::write` takes a `&BoxConnection` only to hand to the raw
/// transport underneath; `PipeConnection` ignores the argument entirely
/// (it already knows its own channel pair), so tests can pass any handle.
fn dummy_conn() -> BoxConnection {
    struct Inert;
    #[async_trait]
    impl Connection for Inert {
        async fn write(&self, _ctx: CancellationToken, _b: &[u8]) -> Result<(), ChatError> {
            Ok(())
        }
        async fn read(&self, _ctx: CancellationToken) -> Result<Vec<u8>, ChatError> {
            Ok(Vec::new())
        }
        async fn close(&self) -> Result<(), ChatError> {
            Ok(())
        }
    }
    impl fmt::Debug for Inert {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Inert").finish()
        }
    }
    Arc::new(Inert)
}

/// Scenario: handshake + ident complete cleanly on both ends, and the
/// server learns the client's assigned id via the `Ident` push it sent.
#[tokio::test]
async fn handshake_and_ident_bootstrap_completes() {
    let (mut server, mut client) = connected_pair().await;
    let ident = client.expect(IDENT).await;
    assert_eq!(ident.protocol(), IDENT);
    let _ = server.expect(IDENT_RESPONSE).await;
}

/// Scenario: create a room, join it, forward a message, then leave — each
/// leg driven entirely through the wire (registry marshal/unmarshal and
/// the full encrypt+chat interceptor stack), not the bare `ChatRole`.
#[tokio::test]
async fn create_join_forward_leave_round_trip() {
    let (mut server, mut client) = connected_pair().await;
    let _ = client.expect(IDENT).await;
    let _ = server.expect(IDENT_RESPONSE).await;

    let room_id = RoomID::from("lobby");

    send(
        &client,
        CreateRoom {
            base: BaseEnvelope::terminal(CREATE_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
            allowed: vec![],
            ttl_secs: 60,
        },
    )
    .await;
    let created = client.expect(SUCCESS_CREATE_ROOM).await;
    let created: &SuccessCreateRoom = created.as_any().downcast_ref().unwrap();
    assert_eq!(created.room_id, room_id);
    assert!(server.rooms.room_exists(&room_id));

    send(
        &client,
        JoinRoom {
            base: BaseEnvelope::terminal(JOIN_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
            join_deadline_secs: 2,
        },
    )
    .await;
    let joined = client.expect(SUCCESS_JOIN_ROOM).await;
    let joined: &SuccessJoinRoom = joined.as_any().downcast_ref().unwrap();
    assert_eq!(joined.room_id, room_id);
    let room = server.rooms.get_room(&room_id).unwrap();
    assert_eq!(room.participants(), vec![joined.client_id.clone()]);

    send(
        &client,
        ForwardMessage {
            base: BaseEnvelope::terminal(
                FORWARD_MESSAGE.to_string(),
                Header::new(joined.client_id.clone(), ClientID::unknown()),
            ),
            room_id: room_id.clone(),
            to: vec![],
        },
    )
    .await;
    let forwarded = client.expect(FORWARDED_MESSAGE).await;
    let forwarded: &ForwardedMessage = forwarded.as_any().downcast_ref().unwrap();
    assert_eq!(forwarded.room_id, room_id);

    send(
        &client,
        LeaveRoom {
            base: BaseEnvelope::terminal(LEAVE_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
        },
    )
    .await;
    let left = client.expect(SUCCESS_LEAVE_ROOM).await;
    let left: &SuccessLeaveRoom = left.as_any().downcast_ref().unwrap();
    assert_eq!(left.room_id, room_id);
    assert!(room.participants().is_empty());
}

/// Scenario: a room created with a short TTL is auto-deleted by the manager
/// without any client action, observed end-to-end by a subsequent
/// `DeleteRoom` failing with `RoomNotFound`.
#[tokio::test(start_paused = true)]
async fn ttl_auto_deletes_room_end_to_end() {
    let (mut server, mut client) = connected_pair().await;
    let _ = client.expect(IDENT).await;
    let _ = server.expect(IDENT_RESPONSE).await;

    let room_id = RoomID::from("ephemeral");
    send(
        &client,
        CreateRoom {
            base: BaseEnvelope::terminal(CREATE_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
            allowed: vec![],
            ttl_secs: 1,
        },
    )
    .await;
    let _ = client.expect(SUCCESS_CREATE_ROOM).await;
    assert!(server.rooms.room_exists(&room_id));

    tokio::time::advance(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;
    assert!(!server.rooms.room_exists(&room_id));

    send(
        &client,
        DeleteRoom {
            base: BaseEnvelope::terminal(DELETE_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
        },
    )
    .await;
    let failed = client.expect(FAIL_DELETE_ROOM).await;
    assert_eq!(failed.protocol(), FAIL_DELETE_ROOM);
}

/// Scenario: a client outside a room's allow-list is denied entry.
#[tokio::test]
async fn admission_denied_for_unlisted_client() {
    let (mut server, mut client) = connected_pair().await;
    let _ = client.expect(IDENT).await;
    let _ = server.expect(IDENT_RESPONSE).await;

    let room_id = RoomID::from("private");
    send(
        &client,
        CreateRoom {
            base: BaseEnvelope::terminal(CREATE_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
            allowed: vec![ClientID::from("someone-else")],
            ttl_secs: 60,
        },
    )
    .await;
    let _ = client.expect(SUCCESS_CREATE_ROOM).await;

    send(
        &client,
        JoinRoom {
            base: BaseEnvelope::terminal(JOIN_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
            join_deadline_secs: 1,
        },
    )
    .await;
    let failed = client.expect(FAIL_JOIN_ROOM).await;
    let failed: &FailJoinRoom = failed.as_any().downcast_ref().unwrap();
    assert_eq!(failed.room_id, room_id);
    assert!(server.rooms.get_room(&room_id).unwrap().participants().is_empty());
}

/// Scenario: server-initiated health polling — `TrackHealth` starts the
/// ticker, the server pushes `RequestHealth`, the client replies with a
/// `HealthResponse`, and the aggregate is observable via a snapshot.
#[tokio::test(start_paused = true)]
async fn health_polling_round_trip() {
    let (mut server, mut client) = connected_pair().await;
    let _ = client.expect(IDENT).await;
    let _ = server.expect(IDENT_RESPONSE).await;

    let room_id = RoomID::from("monitored");
    send(
        &client,
        CreateRoom {
            base: BaseEnvelope::terminal(CREATE_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
            allowed: vec![],
            ttl_secs: 300,
        },
    )
    .await;
    let _ = client.expect(SUCCESS_CREATE_ROOM).await;

    send(
        &client,
        JoinRoom {
            base: BaseEnvelope::terminal(JOIN_ROOM.to_string(), skip_header()),
            room_id: room_id.clone(),
            join_deadline_secs: 1,
        },
    )
    .await;
    let joined = client.expect(SUCCESS_JOIN_ROOM).await;
    let joined: &SuccessJoinRoom = joined.as_any().downcast_ref().unwrap();
    let client_id = joined.client_id.clone();

    send(
        &client,
        TrackHealth {
            base: BaseEnvelope::terminal(TRACK_HEALTH.to_string(), skip_header()),
            room_id: room_id.clone(),
            interval_secs: 1,
        },
    )
    .await;
    let _ = client.expect(SUCCESS_TRACK_HEALTH).await;

    let request = client.expect(REQUEST_HEALTH).await;
    let request: &RequestHealth = request.as_any().downcast_ref().unwrap();
    assert_eq!(request.room_id, room_id);

    send(
        &client,
        HealthResponse {
            base: BaseEnvelope::terminal(HEALTH_RESPONSE.to_string(), skip_header()),
            room_id: room_id.clone(),
            validity_secs: 10,
            stat: alnp::health::Stat::default(),
        },
    )
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = server.health.get_health_snapshot(&room_id).unwrap();
    assert!(snapshot.participants.get(&client_id).unwrap().is_some());
}

/// Scenario: a client whose signature doesn't verify against the server's
/// key moves the handshake to `Error` instead of `Completed`; `chain.init`
/// on that side surfaces the failure rather than hanging.
#[tokio::test]
async fn mismatched_signing_key_fails_handshake() {
    let registry = Arc::new(Registry::new());
    alnp::register_all(&registry).unwrap();
    let (server_conn, client_conn) = PipeConnection::pair();

    let (real_signing_key, _) = keypair();
    let (_, wrong_verifying_key) = keypair();
    let config = RuntimeConfig {
        ident_timeout: Duration::from_secs(5),
        key_exchange_timeout: Duration::from_millis(500),
        ident_poll_period: Duration::from_millis(10),
        session_state_poll_period: Duration::from_millis(10),
        ..RuntimeConfig::default()
    };

    let server_fut = bootstrap_side(
        server_conn,
        true,
        registry.clone(),
        config.clone(),
        Some(real_signing_key),
        None,
    );
    let client_fut = bootstrap_side(
        client_conn,
        false,
        registry,
        config,
        None,
        Some(wrong_verifying_key),
    );

    let (server_result, client_result) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(3), server_fut),
        tokio::time::timeout(Duration::from_secs(3), client_fut),
    );

    // The client rejects the bad signature during `process_init` and its
    // own `chain.init` call never observes `Completed`; the server's side
    // times out waiting for a `Response` that never arrives. Both bootstraps
    // are expected to fail rather than silently produce a usable session.
    let client_failed = matches!(client_result, Err(_)) || matches!(client_result, Ok(Err(_)));
    let server_failed = matches!(server_result, Err(_)) || matches!(server_result, Ok(Err(_)));
    assert!(client_failed);
    assert!(server_failed);
}
