//! Stable error taxonomy shared by every layer (§7 of the specification).
//!
//! Each variant's *identity* is what callers match on; the attached text is
//! free to vary. `MultiError` collects independent failures from fan-out
//! operations (multi-recipient forwards, chain teardown) without picking a
//! single one to report.

use std::fmt;

use thiserror::Error;

/// The crate-wide error type. Narrower error enums (`EnvelopeError`,
/// `HandshakeError`, `RecordError`, `TransportError`) convert into this one
/// at the boundary where they cross into interceptor/process code, mirroring
/// the teacher SDK's `ClientError::From<HandshakeError>` conversions.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("context cancelled")]
    ContextCancelled,

    #[error("unsatisfied interface triggered: {0}")]
    InterfaceMismatch(&'static str),

    #[error("inappropriate interceptor for the message")]
    InvalidInterceptor,

    #[error("connection not registered: {0}")]
    ConnectionNotFound(String),

    #[error("connection already exists: {0}")]
    ConnectionExists(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("room already exists: {0}")]
    RoomAlreadyExists(String),

    #[error("client not allowed in room")]
    ClientNotAllowed,

    #[error("client is already a participant")]
    ClientIsAlreadyParticipant,

    #[error("client is not a participant")]
    ClientNotAParticipant,

    #[error("message addressed to the wrong room")]
    WrongRoom,

    #[error("unknown client id state")]
    UnknownClientIDState,

    #[error("client id is not consistent throughout the connection")]
    ClientIDNotConsistent,

    #[error("invalid message data")]
    InvalidMessageData,

    #[error("no protocol match")]
    NoProtocolMatch,

    #[error("no payload present")]
    NoPayload,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key")]
    InvalidKey,

    #[error("invalid session state")]
    InvalidSessionState,

    #[error("key exchange already in progress")]
    ExchangeInProgress,

    #[error("key exchange not complete")]
    ExchangeNotComplete,

    #[error("nonce reused within the replay window")]
    NonceReused,

    #[error("health tracking interval invalid: {0}")]
    InvalidHealthInterval(String),

    #[error("health response validity window expired")]
    ValidityExpired,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),

    #[error("{0} errors occurred:\n{1}")]
    Multi(usize, String),
}

impl ChatError {
    pub fn other(text: impl Into<String>) -> Self {
        ChatError::Other(text.into())
    }
}

/// Collects zero or more errors from an operation that must not stop at the
/// first failure (fan-out writes, chain teardown). Ported from
/// `internal/util.MultiError` in the reference implementation.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<ChatError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, err: ChatError) {
        self.errors.push(err);
    }

    pub fn add_all(&mut self, errs: impl IntoIterator<Item = ChatError>) {
        self.errors.extend(errs);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ChatError] {
        &self.errors
    }

    /// Returns `Ok(())` if empty, `Err(single error)` if exactly one error was
    /// collected, or `Err(ChatError::Multi)` otherwise.
    pub fn into_result(mut self) -> Result<(), ChatError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            n => {
                let body = self
                    .errors
                    .iter()
                    .map(|e| format!("  * {e}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                Err(ChatError::Multi(n, body))
            }
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no errors");
        }
        writeln!(f, "{} errors occurred:", self.errors.len())?;
        for e in &self.errors {
            writeln!(f, "  * {e}")?;
        }
        Ok(())
    }
}
