//! Interceptor-chained messaging runtime: chat rooms, health telemetry, and
//! an authenticated key-exchange handshake layered over an abstract duplex
//! transport (v1.0).
//!
//! Every message on the wire is a self-describing, optionally nested
//! envelope (`envelope`), dispatched through an ordered pipeline of
//! `Interceptor`s (`interceptor::Chain`). Two interceptors ship with this
//! crate: `keyexchange::manager::EncryptInterceptor` negotiates a Curve25519
//! + Ed25519 handshake and seals everything behind it in AES-256-GCM
//! (`record`), and `chat::ChatInterceptor` dispatches room, health, and
//! ident traffic once the connection is plaintext. Compose the encrypt
//! interceptor first so chat dispatch never sees ciphertext.

pub mod chat;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod health;
pub mod ident;
pub mod ids;
pub mod interceptor;
pub mod keyexchange;
pub mod process;
pub mod record;
pub mod room;
pub mod state;

pub use chat::{ChatBase, ChatInterceptor, ChatRole, ClientRole, ServerRole};
pub use config::RuntimeConfig;
pub use connection::{BoxConnection, BoxReader, BoxWriter, Connection};
pub use envelope::{BaseEnvelope, Header, Message, Protocol, Registry};
pub use error::ChatError;
pub use health::HealthManager;
pub use ids::{ClientID, RoomID};
pub use interceptor::{BoxInterceptor, Chain, Interceptor};
pub use keyexchange::{
    Curve25519Options, Curve25519Protocol, EncryptInterceptor, KeyExchangeManager, SessionState,
};
pub use record::{AES256Encryptor, Encryptor, SkipperEncryptor};
pub use room::RoomManager;
pub use state::{State, StateManager};

/// Registers every wire message type this crate defines — chat commands and
/// trailers, the key-exchange handshake, and the sealed-record envelope —
/// against one `Registry`. Call once per process before accepting traffic.
pub fn register_all(registry: &Registry) -> Result<(), ChatError> {
    chat::messages::register_all(registry)?;
    keyexchange::curve25519::register(registry)?;
    record::register(registry)?;
    Ok(())
}
