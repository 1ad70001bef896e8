//! Authenticated Curve25519 + Ed25519 key-exchange handshake (C7). Ported
//! from `pkg/middleware/encrypt/keyexchange/*.go`.

pub mod curve25519;
pub mod manager;

pub use curve25519::{Curve25519Options, Curve25519Protocol, SessionState};
pub use manager::{EncryptInterceptor, EncryptorFactory, KeyExchangeManager, OptionsFactory};
