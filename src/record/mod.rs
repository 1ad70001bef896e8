//! AES-256-GCM record protection with nonce-replay defense (C8). Ported
//! from `pkg/middleware/encrypt/encryptor/{aes256,skipper,encryptor_messages}.go`.

pub mod nonce;

use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{BaseEnvelope, Header, Message, MessageFactory, Protocol, Registry};
use crate::error::ChatError;

pub use nonce::NonceValidator;

/// Wire protocol id for the outer sealed envelope. Distinct from the inner
/// message's own protocol id so `Registry::unmarshal_raw` can sniff and
/// dispatch encrypted frames to `EncryptedMessage` before anything attempts
/// to decode the ciphertext as the inner type.
pub const ENCRYPTED_PROTOCOL: &str = "record:encrypted_message";

/// Implemented by the record-protection layer so `SkipperEncryptor` can wrap
/// any concrete encryptor behind a predicate.
pub trait Encryptor: Send + Sync {
    fn set_keys(&self, enc_key: [u8; 32], dec_key: [u8; 32]) -> Result<(), ChatError>;
    fn set_session_id(&self, id: Uuid);
    fn ready(&self) -> bool;
    fn encrypt(&self, msg: &dyn Message) -> Result<EncryptedMessage, ChatError>;
    fn decrypt(&self, msg: EncryptedMessage) -> Result<Vec<u8>, ChatError>;
    /// Overrides the replay-window the encryptor's nonce validator uses.
    /// Called once per connection by `EncryptCore` with the configured
    /// `RuntimeConfig::nonce_replay_window`; encryptors that don't track
    /// nonces (e.g. a handshake-only stub) can leave the default no-op.
    fn install_nonce_window(&self, _window: Duration) {}
}

/// The envelope wrapping a sealed inner message. `base.protocol` is always
/// `ENCRYPTED_PROTOCOL`; `base.next_protocol` carries the inner message's
/// real protocol id as informational metadata, and the ciphertext lives in
/// `base.next_payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMessage {
    base: BaseEnvelope,
    pub nonce: [u8; 12],
    pub timestamp: i64,
    pub session_id: Uuid,
}

impl Message for EncryptedMessage {
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

struct EncryptedMessageFactory;

impl MessageFactory for EncryptedMessageFactory {
    fn create(&self) -> Box<dyn Message> {
        Box::new(EncryptedMessage {
            base: BaseEnvelope::terminal(
                ENCRYPTED_PROTOCOL.to_string(),
                Header::new(crate::ids::ClientID::unknown(), crate::ids::ClientID::unknown()),
            ),
            nonce: [0u8; 12],
            timestamp: 0,
            session_id: Uuid::nil(),
        })
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Box<dyn Message>, ChatError> {
        serde_json::from_slice::<EncryptedMessage>(data)
            .map(|msg| Box::new(msg) as Box<dyn Message>)
            .map_err(|_| ChatError::InvalidMessageData)
    }
}

/// Registers the sealed-envelope factory so `Registry::unmarshal_raw` can
/// recognise `ENCRYPTED_PROTOCOL` frames before `EncryptInterceptor` decrypts
/// and re-sniffs the plaintext for the real inner type.
pub fn register(registry: &Registry) -> Result<(), ChatError> {
    registry.register(ENCRYPTED_PROTOCOL, std::sync::Arc::new(EncryptedMessageFactory))
}

struct Keys {
    encryptor: Aes256Gcm,
    decryptor: Aes256Gcm,
}

/// AES-256-GCM encryptor/decryptor pair keyed by the key-exchange result,
/// with the session id bound as AEAD associated data so ciphertext from one
/// session cannot be replayed into another.
pub struct AES256Encryptor {
    keys: Mutex<Option<Keys>>,
    session_id: Mutex<Uuid>,
    nonce_validator: Mutex<NonceValidator>,
}

impl Default for AES256Encryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl AES256Encryptor {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(None),
            session_id: Mutex::new(Uuid::nil()),
            nonce_validator: Mutex::new(NonceValidator::with_default_window()),
        }
    }

    pub fn with_nonce_window(window: Duration) -> Self {
        Self {
            keys: Mutex::new(None),
            session_id: Mutex::new(Uuid::nil()),
            nonce_validator: Mutex::new(NonceValidator::new(window)),
        }
    }
}

impl Encryptor for AES256Encryptor {
    fn set_keys(&self, enc_key: [u8; 32], dec_key: [u8; 32]) -> Result<(), ChatError> {
        let encryptor = Aes256Gcm::new_from_slice(&enc_key).map_err(|_| ChatError::InvalidKey)?;
        let decryptor = Aes256Gcm::new_from_slice(&dec_key).map_err(|_| ChatError::InvalidKey)?;
        *self.keys.lock() = Some(Keys { encryptor, decryptor });
        Ok(())
    }

    fn set_session_id(&self, id: Uuid) {
        *self.session_id.lock() = id;
    }

    fn ready(&self) -> bool {
        self.keys.lock().is_some()
    }

    fn encrypt(&self, msg: &dyn Message) -> Result<EncryptedMessage, ChatError> {
        let guard = self.keys.lock();
        let keys = guard.as_ref().ok_or(ChatError::InvalidSessionState)?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let session_id = *self.session_id.lock();

        let data = msg.marshal()?;
        let sealed = keys
            .encryptor
            .encrypt(Nonce::from_slice(&nonce_bytes), aes_gcm::aead::Payload {
                msg: &data,
                aad: session_id.as_bytes(),
            })
            .map_err(|_| ChatError::other("encryption failed"))?;

        Ok(EncryptedMessage {
            base: BaseEnvelope {
                protocol: ENCRYPTED_PROTOCOL.to_string(),
                header: msg.header().clone(),
                next_payload: Some(sealed),
                next_protocol: msg.protocol().clone(),
            },
            nonce: nonce_bytes,
            timestamp: crate::config::now_millis(),
            session_id,
        })
    }

    fn decrypt(&self, msg: EncryptedMessage) -> Result<Vec<u8>, ChatError> {
        self.nonce_validator.lock().validate(msg.nonce, msg.session_id)?;

        let guard = self.keys.lock();
        let keys = guard.as_ref().ok_or(ChatError::InvalidSessionState)?;

        let sealed = msg.base.next_payload.as_deref().ok_or(ChatError::NoPayload)?;
        keys.decryptor
            .decrypt(Nonce::from_slice(&msg.nonce), aes_gcm::aead::Payload {
                msg: sealed,
                aad: msg.session_id.as_bytes(),
            })
            .map_err(|_| ChatError::other("decryption failed"))
    }

    fn install_nonce_window(&self, window: Duration) {
        *self.nonce_validator.lock() = NonceValidator::new(window);
    }
}

/// Wraps a real encryptor and lets protocols matching `skip` pass through
/// the record layer in plaintext — used for the handshake itself and any
/// control-plane frames declared exempt.
pub struct SkipperEncryptor {
    wrapped: Box<dyn Encryptor>,
    skip: Box<dyn Fn(&Protocol) -> bool + Send + Sync>,
}

impl SkipperEncryptor {
    pub fn new(wrapped: Box<dyn Encryptor>, skip: Box<dyn Fn(&Protocol) -> bool + Send + Sync>) -> Self {
        Self { wrapped, skip }
    }
}

impl Encryptor for SkipperEncryptor {
    fn set_keys(&self, enc_key: [u8; 32], dec_key: [u8; 32]) -> Result<(), ChatError> {
        self.wrapped.set_keys(enc_key, dec_key)
    }

    fn set_session_id(&self, id: Uuid) {
        self.wrapped.set_session_id(id);
    }

    fn ready(&self) -> bool {
        self.wrapped.ready()
    }

    fn encrypt(&self, msg: &dyn Message) -> Result<EncryptedMessage, ChatError> {
        if (self.skip)(msg.protocol()) {
            return Ok(EncryptedMessage {
                base: BaseEnvelope {
                    protocol: ENCRYPTED_PROTOCOL.to_string(),
                    header: msg.header().clone(),
                    next_payload: Some(msg.marshal()?),
                    next_protocol: msg.protocol().clone(),
                },
                nonce: [0u8; 12],
                timestamp: crate::config::now_millis(),
                session_id: Uuid::nil(),
            });
        }
        self.wrapped.encrypt(msg)
    }

    fn decrypt(&self, msg: EncryptedMessage) -> Result<Vec<u8>, ChatError> {
        if (self.skip)(&msg.base.next_protocol) {
            return msg.base.next_payload.ok_or(ChatError::NoPayload);
        }
        self.wrapped.decrypt(msg)
    }

    fn install_nonce_window(&self, window: Duration) {
        self.wrapped.install_nonce_window(window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        base: BaseEnvelope,
        nonce: u32,
    }

    impl Message for Ping {
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

    fn ping(n: u32) -> Ping {
        Ping {
            base: BaseEnvelope::terminal(
                "test:ping".into(),
                Header::new(crate::ids::ClientID::from("a"), crate::ids::ClientID::from("b")),
            ),
            nonce: n,
        }
    }

    #[test]
    fn round_trips_through_encrypt_decrypt() {
        let enc = AES256Encryptor::new();
        enc.set_keys([7u8; 32], [7u8; 32]).unwrap();
        enc.set_session_id(Uuid::nil());

        let sealed = enc.encrypt(&ping(42)).unwrap();
        let plaintext = enc.decrypt(sealed).unwrap();
        let decoded: Ping = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(decoded.nonce, 42);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let enc = AES256Encryptor::new();
        enc.set_keys([7u8; 32], [7u8; 32]).unwrap();
        enc.set_session_id(Uuid::nil());

        let mut sealed = enc.encrypt(&ping(42)).unwrap();
        let mut payload = sealed.base.next_payload.take().unwrap();
        payload[0] ^= 0xFF;
        sealed.base.next_payload = Some(payload);

        assert!(enc.decrypt(sealed).is_err());
    }

    #[test]
    fn skipper_passes_matching_protocols_through_unsealed() {
        let enc = AES256Encryptor::new();
        enc.set_keys([7u8; 32], [7u8; 32]).unwrap();
        let skipper = SkipperEncryptor::new(
            Box::new(enc),
            Box::new(|p: &Protocol| p == "test:ping"),
        );

        let sealed = skipper.encrypt(&ping(1)).unwrap();
        assert!(sealed.base.next_payload.is_some());
        let plaintext = skipper.decrypt(sealed).unwrap();
        let decoded: Ping = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(decoded.nonce, 1);
    }
}
