//! The default key-exchange protocol: Curve25519 (X25519) Diffie-Hellman
//! authenticated by an Ed25519 signature over the initiator's public key and
//! salt, followed by HKDF-SHA256 key derivation. Ported from
//! `pkg/middleware/encrypt/keyexchange/curve25519{protocol,messages}.go`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::envelope::{BaseEnvelope, Header, Message, MessageFactory, Protocol};
use crate::error::ChatError;
use crate::ids::ClientID;
use crate::state::State;

pub const INIT_PROTOCOL: &str = "curve25519.init";
pub const RESPONSE_PROTOCOL: &str = "curve25519.response";
pub const CONFIRM_PROTOCOL: &str = "curve25519.confirm";

/// `NotStarted -> Initial -> InProgress -> Completed | Error`. Transitions
/// are monotone; `Error` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Initial,
    InProgress,
    Completed,
    Error,
}

#[derive(Default)]
pub struct Curve25519Options {
    pub signing_key: Option<SigningKey>,
    pub verification_key: Option<VerifyingKey>,
    pub require_signature: bool,
}

struct Inner {
    priv_key: Option<StaticSecret>,
    pub_key: Option<[u8; 32]>,
    peer_pub_key: Option<[u8; 32]>,
    salt: [u8; 16],
    session_id: Uuid,
    enc_key: Option<[u8; 32]>,
    dec_key: Option<[u8; 32]>,
    state: SessionState,
}

/// Drives one side of a single handshake. `is_server` decides which half of
/// the transition table (§4.7) applies.
pub struct Curve25519Protocol {
    inner: Mutex<Inner>,
    options: Curve25519Options,
    is_server: bool,
}

impl Curve25519Protocol {
    pub fn new(is_server: bool, options: Curve25519Options) -> Self {
        Self {
            inner: Mutex::new(Inner {
                priv_key: None,
                pub_key: None,
                peer_pub_key: None,
                salt: [0u8; 16],
                session_id: Uuid::nil(),
                enc_key: None,
                dec_key: None,
                state: SessionState::NotStarted,
            }),
            options,
            is_server,
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// The session id negotiated during the handshake, used as AEAD
    /// associated data by the record layer once keys are installed.
    pub fn session_id(&self) -> Uuid {
        self.inner.lock().session_id
    }

    fn set_error(&self) {
        self.inner.lock().state = SessionState::Error;
    }

    pub fn is_complete(&self) -> bool {
        self.state() == SessionState::Completed
    }

    /// Returns `(encKey, decKey)`. Errors unless the handshake is `Completed`.
    pub fn get_keys(&self) -> Result<([u8; 32], [u8; 32]), ChatError> {
        let inner = self.inner.lock();
        if inner.state != SessionState::Completed {
            return Err(ChatError::ExchangeNotComplete);
        }
        Ok((inner.enc_key.unwrap(), inner.dec_key.unwrap()))
    }

    /// `NotStarted -> Initial`. The server generates salt/session id, signs
    /// `pubKey‖salt`, and transmits `Init`; the client only generates its
    /// keypair and waits.
    pub async fn init(&self, state: &State) -> Result<(), ChatError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut to_send: Option<Init> = None;
        {
            let mut inner = self.inner.lock();
            inner.pub_key = Some(public.to_bytes());

            if self.is_server && self.options.require_signature {
                let mut salt = [0u8; 16];
                let mut session_id_bytes = [0u8; 16];
                use rand_core::RngCore;
                OsRng.fill_bytes(&mut salt);
                OsRng.fill_bytes(&mut session_id_bytes);
                let session_id = Uuid::from_bytes(session_id_bytes);

                let signing_key = self
                    .options
                    .signing_key
                    .as_ref()
                    .ok_or(ChatError::InvalidKey)?;
                let mut signed = public.to_bytes().to_vec();
                signed.extend_from_slice(&salt);
                let signature = signing_key.sign(&signed);

                inner.salt = salt;
                inner.session_id = session_id;
                to_send = Some(Init {
                    base: BaseEnvelope::terminal(
                        INIT_PROTOCOL.to_string(),
                        Header::new(state.get_client_id().unwrap_or_else(|_| ClientID::unknown()), ClientID::unknown()),
                    ),
                    public_key: public.to_bytes(),
                    signature: signature.to_bytes().to_vec(),
                    session_id,
                    salt,
                });
            }
            inner.priv_key = Some(secret);
            inner.state = SessionState::Initial;
        }

        if let Some(msg) = to_send {
            if let Err(err) = state.write(Box::new(msg)).await {
                self.set_error();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Client side: `Initial -> InProgress` on receiving `Init`.
    pub async fn process_init(&self, msg: &Init, state: &State) -> Result<(), ChatError> {
        let result = self.process_init_inner(msg).await;
        if result.is_err() {
            self.set_error();
        }
        if let Ok(response) = &result {
            if let Err(err) = state.write(Box::new(response.clone())).await {
                self.set_error();
                return Err(err);
            }
        }
        result.map(|_| ())
    }

    async fn process_init_inner(&self, msg: &Init) -> Result<Response, ChatError> {
        let verification_key = self
            .options
            .verification_key
            .ok_or(ChatError::InvalidKey)?;
        let mut signed = msg.public_key.to_vec();
        signed.extend_from_slice(&msg.salt);
        let signature = Signature::from_bytes(
            msg.signature
                .as_slice()
                .try_into()
                .map_err(|_| ChatError::InvalidSignature)?,
        );
        verification_key
            .verify(&signed, &signature)
            .map_err(|_| ChatError::InvalidSignature)?;

        let (shared, our_pub) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Initial {
                return Err(ChatError::InvalidSessionState);
            }
            let priv_key = inner.priv_key.as_ref().ok_or(ChatError::InvalidKey)?;
            let peer_pub = PublicKey::from(msg.public_key);
            let shared = priv_key.diffie_hellman(&peer_pub);
            inner.peer_pub_key = Some(msg.public_key);
            inner.salt = msg.salt;
            inner.session_id = msg.session_id;
            let our_pub = inner.pub_key.ok_or(ChatError::InvalidKey)?;
            (shared, our_pub)
        };

        let (enc_key, dec_key) = derive(shared.as_bytes(), &msg.salt, b"")?;
        {
            let mut inner = self.inner.lock();
            inner.enc_key = Some(enc_key);
            inner.dec_key = Some(dec_key);
            inner.state = SessionState::InProgress;
        }

        Ok(Response {
            base: BaseEnvelope::terminal(
                RESPONSE_PROTOCOL.to_string(),
                Header::new(ClientID::unknown(), ClientID::unknown()),
            ),
            public_key: our_pub,
        })
    }

    /// Server side: `Initial -> InProgress` on receiving `Response`. Key
    /// roles are reversed relative to the client so both ends agree on who
    /// encrypts with which key.
    pub async fn process_response(&self, msg: &Response, state: &State) -> Result<(), ChatError> {
        let result = self.process_response_inner(msg).await;
        if result.is_err() {
            self.set_error();
        }
        if let Ok(done) = &result {
            if let Err(err) = state.write(Box::new(done.clone())).await {
                self.set_error();
                return Err(err);
            }
        }
        result.map(|_| ())
    }

    async fn process_response_inner(&self, msg: &Response) -> Result<Done, ChatError> {
        let (shared, salt) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Initial {
                return Err(ChatError::InvalidSessionState);
            }
            let priv_key = inner.priv_key.as_ref().ok_or(ChatError::InvalidKey)?;
            let peer_pub = PublicKey::from(msg.public_key);
            let shared = priv_key.diffie_hellman(&peer_pub);
            inner.peer_pub_key = Some(msg.public_key);
            (shared, inner.salt)
        };

        // Reversed role assignment relative to `process_init_inner`.
        let (dec_key, enc_key) = derive(shared.as_bytes(), &salt, b"")?;
        {
            let mut inner = self.inner.lock();
            inner.enc_key = Some(enc_key);
            inner.dec_key = Some(dec_key);
            inner.state = SessionState::InProgress;
        }

        Ok(Done {
            base: BaseEnvelope::terminal(
                CONFIRM_PROTOCOL.to_string(),
                Header::new(ClientID::unknown(), ClientID::unknown()),
            ),
            timestamp: crate::config::now_millis(),
            is_response: false,
        })
    }

    /// Client side: `InProgress -> Completed` on receiving `Done`.
    pub async fn process_done(&self, state: &State) -> Result<(), ChatError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::InProgress {
                self.set_error_locked(&mut inner);
                return Err(ChatError::InvalidSessionState);
            }
        }
        let response = Done {
            base: BaseEnvelope::terminal(
                CONFIRM_PROTOCOL.to_string(),
                Header::new(ClientID::unknown(), ClientID::unknown()),
            ),
            timestamp: crate::config::now_millis(),
            is_response: true,
        };
        if let Err(err) = state.write(Box::new(response)).await {
            self.set_error();
            return Err(err);
        }
        self.inner.lock().state = SessionState::Completed;
        Ok(())
    }

    /// Server side: `InProgress -> Completed` on receiving `DoneResponse`.
    pub fn process_done_response(&self) -> Result<(), ChatError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::InProgress {
            self.set_error_locked(&mut inner);
            return Err(ChatError::InvalidSessionState);
        }
        inner.state = SessionState::Completed;
        Ok(())
    }

    fn set_error_locked(&self, inner: &mut Inner) {
        inner.state = SessionState::Error;
    }
}

fn derive(shared: &[u8], salt: &[u8; 16], info: &[u8]) -> Result<([u8; 32], [u8; 32]), ChatError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut okm = [0u8; 64];
    hk.expand(info, &mut okm)
        .map_err(|_| ChatError::other("hkdf expand failed"))?;
    let mut key1 = [0u8; 32];
    let mut key2 = [0u8; 32];
    key1.copy_from_slice(&okm[0..32]);
    key2.copy_from_slice(&okm[32..64]);
    Ok((key1, key2))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Init {
    base: BaseEnvelope,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
    pub session_id: Uuid,
    pub salt: [u8; 16],
}

impl Message for Init {
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

pub struct InitFactory;
impl MessageFactory for InitFactory {
    fn create(&self) -> Box<dyn Message> {
        Box::new(Init {
            base: BaseEnvelope::terminal(INIT_PROTOCOL.to_string(), Header::new(ClientID::unknown(), ClientID::unknown())),
            public_key: [0u8; 32],
            signature: Vec::new(),
            session_id: Uuid::nil(),
            salt: [0u8; 16],
        })
    }
    fn unmarshal(&self, payload: &[u8]) -> Result<Box<dyn Message>, ChatError> {
        let msg: Init = serde_json::from_slice(payload).map_err(|_| ChatError::InvalidMessageData)?;
        Ok(Box::new(msg))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    base: BaseEnvelope,
    pub public_key: [u8; 32],
}

impl Message for Response {
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

pub struct ResponseFactory;
impl MessageFactory for ResponseFactory {
    fn create(&self) -> Box<dyn Message> {
        Box::new(Response {
            base: BaseEnvelope::terminal(RESPONSE_PROTOCOL.to_string(), Header::new(ClientID::unknown(), ClientID::unknown())),
            public_key: [0u8; 32],
        })
    }
    fn unmarshal(&self, payload: &[u8]) -> Result<Box<dyn Message>, ChatError> {
        let msg: Response = serde_json::from_slice(payload).map_err(|_| ChatError::InvalidMessageData)?;
        Ok(Box::new(msg))
    }
}

/// Carries both `Done` (`is_response = false`) and `DoneResponse`
/// (`is_response = true`) — the Go original modelled `DoneResponse` as
/// `Done` embedded in a wrapper struct with an identical wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Done {
    base: BaseEnvelope,
    pub timestamp: i64,
    pub is_response: bool,
}

impl Message for Done {
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

pub struct DoneFactory;
impl MessageFactory for DoneFactory {
    fn create(&self) -> Box<dyn Message> {
        Box::new(Done {
            base: BaseEnvelope::terminal(CONFIRM_PROTOCOL.to_string(), Header::new(ClientID::unknown(), ClientID::unknown())),
            timestamp: 0,
            is_response: false,
        })
    }
    fn unmarshal(&self, payload: &[u8]) -> Result<Box<dyn Message>, ChatError> {
        let msg: Done = serde_json::from_slice(payload).map_err(|_| ChatError::InvalidMessageData)?;
        Ok(Box::new(msg))
    }
}

/// Registers the three handshake message factories so `EncryptInterceptor`
/// can read them back off the wire before the record layer is ready.
pub fn register(registry: &crate::envelope::Registry) -> Result<(), ChatError> {
    registry.register(INIT_PROTOCOL, std::sync::Arc::new(InitFactory))?;
    registry.register(RESPONSE_PROTOCOL, std::sync::Arc::new(ResponseFactory))?;
    registry.register(CONFIRM_PROTOCOL, std::sync::Arc::new(DoneFactory))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RawWriter;
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct NullConnection;

    #[async_trait]
    impl crate::connection::Connection for NullConnection {
        async fn write(&self, _ctx: CancellationToken, _bytes: &[u8]) -> Result<(), ChatError> {
            Ok(())
        }
        async fn read(&self, _ctx: CancellationToken) -> Result<Vec<u8>, ChatError> {
            Ok(Vec::new())
        }
        async fn close(&self) -> Result<(), ChatError> {
            Ok(())
        }
    }

    fn fresh_state() -> std::sync::Arc<State> {
        let (state, _writer) = State::new(
            std::sync::Arc::new(NullConnection),
            std::sync::Arc::new(RawWriter),
            CancellationToken::new(),
        );
        state
    }

    #[tokio::test]
    async fn full_handshake_reaches_completed_on_both_sides() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verification_key = signing_key.verifying_key();

        let server = Curve25519Protocol::new(
            true,
            Curve25519Options {
                signing_key: Some(signing_key),
                verification_key: None,
                require_signature: true,
            },
        );
        let client = Curve25519Protocol::new(
            false,
            Curve25519Options {
                signing_key: None,
                verification_key: Some(verification_key),
                require_signature: true,
            },
        );

        server.init(&fresh_state()).await.unwrap();
        client.init(&fresh_state()).await.unwrap();

        let server_pub = server.inner.lock().pub_key.unwrap();
        let server_salt = server.inner.lock().salt;
        let server_session_id = server.inner.lock().session_id;
        let server_signing = server.options.signing_key.as_ref().unwrap();
        let mut signed = server_pub.to_vec();
        signed.extend_from_slice(&server_salt);
        let signature = server_signing.sign(&signed);

        let init_msg = Init {
            base: BaseEnvelope::terminal(INIT_PROTOCOL.into(), Header::new(ClientID::unknown(), ClientID::unknown())),
            public_key: server_pub,
            signature: signature.to_bytes().to_vec(),
            session_id: server_session_id,
            salt: server_salt,
        };

        client.process_init(&init_msg, &fresh_state()).await.unwrap();
        assert_eq!(client.state(), SessionState::InProgress);

        let client_pub = client.inner.lock().pub_key.unwrap();
        let response_msg = Response {
            base: BaseEnvelope::terminal(RESPONSE_PROTOCOL.into(), Header::new(ClientID::unknown(), ClientID::unknown())),
            public_key: client_pub,
        };
        server.process_response(&response_msg, &fresh_state()).await.unwrap();
        assert_eq!(server.state(), SessionState::InProgress);

        client.process_done(&fresh_state()).await.unwrap();
        assert_eq!(client.state(), SessionState::Completed);

        server.process_done_response().unwrap();
        assert_eq!(server.state(), SessionState::Completed);

        let (client_enc, client_dec) = client.get_keys().unwrap();
        let (server_enc, server_dec) = server.get_keys().unwrap();
        assert_eq!(client_enc, server_dec);
        assert_eq!(client_dec, server_enc);
    }

    #[tokio::test]
    async fn bad_signature_errors_and_sets_error_state() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let other_signing_key = SigningKey::generate(&mut OsRng);
        let wrong_verification_key = other_signing_key.verifying_key();

        let server = Curve25519Protocol::new(
            true,
            Curve25519Options {
                signing_key: Some(signing_key),
                verification_key: None,
                require_signature: true,
            },
        );
        let client = Curve25519Protocol::new(
            false,
            Curve25519Options {
                signing_key: None,
                verification_key: Some(wrong_verification_key),
                require_signature: true,
            },
        );

        server.init(&fresh_state()).await.unwrap();
        client.init(&fresh_state()).await.unwrap();

        let server_pub = server.inner.lock().pub_key.unwrap();
        let server_salt = server.inner.lock().salt;
        let server_session_id = server.inner.lock().session_id;
        let server_signing = server.options.signing_key.as_ref().unwrap();
        let mut signed = server_pub.to_vec();
        signed.extend_from_slice(&server_salt);
        let signature = server_signing.sign(&signed);

        let init_msg = Init {
            base: BaseEnvelope::terminal(INIT_PROTOCOL.into(), Header::new(ClientID::unknown(), ClientID::unknown())),
            public_key: server_pub,
            signature: signature.to_bytes().to_vec(),
            session_id: server_session_id,
            salt: server_salt,
        };

        let err = client.process_init(&init_msg, &fresh_state()).await;
        assert!(matches!(err, Err(ChatError::InvalidSignature)));
        assert_eq!(client.state(), SessionState::Error);
    }
}
