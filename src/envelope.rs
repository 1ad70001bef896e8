//! Message envelope & protocol registry (C1).
//!
//! Every message on the wire is a self-describing, optionally nested
//! envelope. `protocol` is serialized first so the registry can sniff it
//! without a full decode (`unmarshal_raw`). Ported from
//! `pkg/message/{message,registry}.go` in the reference implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::ids::ClientID;

/// Unique protocol identifier, e.g. `"room:create_room"`.
pub type Protocol = String;

/// Sentinel terminating the nested-envelope chain.
pub const NONE_PROTOCOL: &str = "none";

/// Wire version carried on every envelope.
pub const WIRE_VERSION: &str = "v1.0";

/// Common per-message metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub sender: ClientID,
    pub receiver: ClientID,
    pub version: String,
}

impl Header {
    pub fn new(sender: ClientID, receiver: ClientID) -> Self {
        Self {
            sender,
            receiver,
            version: WIRE_VERSION.to_string(),
        }
    }
}

/// The envelope fields shared by every message type. Concrete message
/// structs embed this (Rust has no struct embedding, so in practice each
/// concrete message holds a `BaseEnvelope` field and forwards to it —
/// see `chat::messages` for examples).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseEnvelope {
    pub protocol: Protocol,
    pub header: Header,
    #[serde(rename = "next", skip_serializing_if = "Option::is_none")]
    pub next_payload: Option<Vec<u8>>,
    pub next_protocol: Protocol,
}

impl BaseEnvelope {
    /// Builds a base envelope, optionally wrapping an inner message.
    ///
    /// `next_protocol = "none"` and `next_message = None` must agree; any
    /// other combination is rejected, matching `NewBaseMessage`'s
    /// consistency check in the reference implementation.
    pub fn new(
        protocol: Protocol,
        header: Header,
        next_protocol: Protocol,
        next_message: Option<&dyn Message>,
    ) -> Result<Self, ChatError> {
        match (next_protocol.as_str(), next_message) {
            (NONE_PROTOCOL, None) => Ok(Self {
                protocol,
                header,
                next_payload: None,
                next_protocol,
            }),
            (NONE_PROTOCOL, Some(_)) | (_, None) => Err(ChatError::InvalidMessageData),
            (_, Some(inner)) => {
                let payload = inner.marshal()?;
                Ok(Self {
                    protocol,
                    header,
                    next_payload: Some(payload),
                    next_protocol,
                })
            }
        }
    }

    pub fn terminal(protocol: Protocol, header: Header) -> Self {
        Self {
            protocol,
            header,
            next_payload: None,
            next_protocol: NONE_PROTOCOL.to_string(),
        }
    }

    pub fn get_next(&self, registry: &Registry) -> Result<Option<Box<dyn Message>>, ChatError> {
        if self.next_protocol == NONE_PROTOCOL {
            return Ok(None);
        }
        let payload = self.next_payload.as_deref().ok_or(ChatError::NoPayload)?;
        registry.unmarshal(&self.next_protocol, payload).map(Some)
    }
}

/// Implemented by every concrete wire message.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    fn protocol(&self) -> &Protocol;
    fn header(&self) -> &Header;
    fn base(&self) -> &BaseEnvelope;
    fn marshal(&self) -> Result<Vec<u8>, ChatError>;
    fn get_next(&self, registry: &Registry) -> Result<Option<Box<dyn Message>>, ChatError> {
        self.base().get_next(registry)
    }
    /// Lets protocol handlers recover the concrete message type without a
    /// second marshal/unmarshal round-trip.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Constructs an empty instance of a concrete message type, to be filled in
/// by `unmarshal`.
pub trait MessageFactory: Send + Sync {
    fn create(&self) -> Box<dyn Message>;
    fn unmarshal(&self, payload: &[u8]) -> Result<Box<dyn Message>, ChatError>;
}

/// Blanket factory for any `Message` that is also `Default + DeserializeOwned`-like.
/// Concrete modules typically implement `MessageFactory` by hand since each
/// message's `unmarshal` needs its own `serde_json::from_slice::<T>` call.
pub struct FnFactory<F> {
    f: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&[u8]) -> Result<Box<dyn Message>, ChatError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> MessageFactory for FnFactory<F>
where
    F: Fn(&[u8]) -> Result<Box<dyn Message>, ChatError> + Send + Sync,
{
    fn create(&self) -> Box<dyn Message> {
        // Factories built from `unmarshal` closures have no meaningful
        // zero-value; callers that need a bare `create()` should register a
        // dedicated factory instead.
        panic!("FnFactory does not support create(); use unmarshal")
    }

    fn unmarshal(&self, payload: &[u8]) -> Result<Box<dyn Message>, ChatError> {
        (self.f)(payload)
    }
}

#[derive(Debug, Deserialize)]
struct ProtocolSniff {
    protocol: Protocol,
}

/// A message reconstructed from already-serialized bytes, used when the
/// same wire frame must be relayed to several recipients (room broadcasts,
/// forwarding) without re-deriving a concrete Rust type for it.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    base: BaseEnvelope,
    raw: Vec<u8>,
}

impl RawEnvelope {
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, ChatError> {
        let base: BaseEnvelope =
            serde_json::from_slice(&raw).map_err(|_| ChatError::InvalidMessageData)?;
        Ok(Self { base, raw })
    }
}

impl Message for RawEnvelope {
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
        Ok(self.raw.clone())
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Thread-safe `Protocol -> MessageFactory` mapping.
///
/// `register` fails if the protocol is already registered. Lookup and
/// registration both tolerate concurrent callers (`parking_lot::RwLock`).
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<Protocol, Arc<dyn MessageFactory>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("protocols", &self.factories.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        protocol: impl Into<Protocol>,
        factory: Arc<dyn MessageFactory>,
    ) -> Result<(), ChatError> {
        let protocol = protocol.into();
        let mut guard = self.factories.write();
        if guard.contains_key(&protocol) {
            return Err(ChatError::other(format!(
                "protocol '{protocol}' already registered"
            )));
        }
        guard.insert(protocol, factory);
        Ok(())
    }

    pub fn check(&self, protocol: &str) -> bool {
        self.factories.read().contains_key(protocol)
    }

    pub fn unmarshal(&self, protocol: &str, payload: &[u8]) -> Result<Box<dyn Message>, ChatError> {
        let factory = {
            let guard = self.factories.read();
            guard.get(protocol).cloned()
        };
        match factory {
            Some(factory) => factory.unmarshal(payload),
            None => Err(ChatError::NoProtocolMatch),
        }
    }

    /// Sniffs `protocol` from a raw frame without fully decoding it, then
    /// defers to `unmarshal`.
    pub fn unmarshal_raw(&self, raw: &[u8]) -> Result<Box<dyn Message>, ChatError> {
        let sniff: ProtocolSniff =
            serde_json::from_slice(raw).map_err(|_| ChatError::InvalidMessageData)?;
        if sniff.protocol.is_empty() {
            return Err(ChatError::InvalidMessageData);
        }
        self.unmarshal(&sniff.protocol, raw)
    }
}
