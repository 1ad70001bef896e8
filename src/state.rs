//! Per-connection state (C3) and the state manager that owns it.
//!
//! A `State` is the per-connection bookkeeping threaded through the
//! interceptor chain: the client's (write-once) identity, a handle back to
//! the bound writer, the connection's cancellation context, and a
//! middleware-keyed substate bag (key-exchange session id, chat config
//! snapshot). Resolves the cyclic-reference design note (§9) by holding
//! `Weak` handles into the owning chain rather than owning it back.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::connection::{BoxConnection, BoxWriter};
use crate::envelope::Message;
use crate::error::ChatError;
use crate::ids::ClientID;

/// Per-connection bookkeeping owned by the interceptor pipeline.
pub struct State {
    client_id: Mutex<Option<ClientID>>,
    connection: BoxConnection,
    writer: Weak<dyn WriterHandle>,
    ctx: CancellationToken,
    substate: RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

/// Narrow seam so `State::write` doesn't need to know about the full
/// `Writer` trait's `BoxConnection` argument shape; the chain installs a
/// thin adaptor when it binds the connection.
#[async_trait::async_trait]
pub trait WriterHandle: Send + Sync {
    async fn write(&self, ctx: CancellationToken, msg: Box<dyn Message>) -> Result<(), ChatError>;
}

struct BoundWriter {
    writer: BoxWriter,
    conn: BoxConnection,
}

#[async_trait::async_trait]
impl WriterHandle for BoundWriter {
    async fn write(&self, ctx: CancellationToken, msg: Box<dyn Message>) -> Result<(), ChatError> {
        self.writer.write(ctx, &self.conn, msg).await
    }
}

impl State {
    pub fn new(connection: BoxConnection, writer: BoxWriter, parent_ctx: CancellationToken) -> (Arc<Self>, Arc<dyn WriterHandle>) {
        let bound: Arc<dyn WriterHandle> = Arc::new(BoundWriter {
            writer,
            conn: connection.clone(),
        });
        let state = Arc::new(Self {
            client_id: Mutex::new(None),
            connection,
            writer: Arc::downgrade(&bound),
            ctx: parent_ctx.child_token(),
            substate: RwLock::new(HashMap::new()),
        });
        (state, bound)
    }

    pub fn ctx(&self) -> CancellationToken {
        self.ctx.clone()
    }

    pub fn connection(&self) -> &BoxConnection {
        &self.connection
    }

    pub fn get_client_id(&self) -> Result<ClientID, ChatError> {
        self.client_id
            .lock()
            .clone()
            .ok_or(ChatError::UnknownClientIDState)
    }

    /// Sets the client id exactly once; a second call fails with
    /// `ClientIDNotConsistent` even if the value is identical.
    pub fn set_client_id(&self, id: ClientID) -> Result<(), ChatError> {
        let mut guard = self.client_id.lock();
        if guard.is_some() {
            return Err(ChatError::ClientIDNotConsistent);
        }
        *guard = Some(id);
        Ok(())
    }

    pub async fn write(&self, msg: Box<dyn Message>) -> Result<(), ChatError> {
        let writer = self
            .writer
            .upgrade()
            .ok_or_else(|| ChatError::other("writer unbound from connection"))?;
        writer.write(self.ctx(), msg).await
    }

    pub fn put_substate<T: Any + Send + Sync>(&self, key: &'static str, value: T) {
        self.substate.write().insert(key, Box::new(value));
    }

    pub fn with_substate<T: Any + Send + Sync + Clone>(&self, key: &'static str) -> Option<T> {
        self.substate
            .read()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("client_id", &self.client_id.lock())
            .finish()
    }
}

/// Arena owner of every per-connection `State`, keyed by `ClientID`. Holds
/// the outer lock that callers must take before any per-room lock (§5's
/// lock-order rule).
#[derive(Default)]
pub struct StateManager {
    states: RwLock<HashMap<ClientID, Arc<State>>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: ClientID, state: Arc<State>) -> Result<(), ChatError> {
        let mut guard = self.states.write();
        if guard.contains_key(&id) {
            return Err(ChatError::ConnectionExists(id.to_string()));
        }
        guard.insert(id, state);
        Ok(())
    }

    pub fn get(&self, id: &ClientID) -> Result<Arc<State>, ChatError> {
        self.states
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ChatError::ConnectionNotFound(id.to_string()))
    }

    pub fn remove(&self, id: &ClientID) -> Option<Arc<State>> {
        self.states.write().remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RawWriter;
    use async_trait::async_trait;

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

    #[test]
    fn client_id_can_be_set_exactly_once() {
        let (state, _writer) = State::new(
            Arc::new(NullConnection),
            Arc::new(RawWriter),
            CancellationToken::new(),
        );
        assert!(matches!(state.get_client_id(), Err(ChatError::UnknownClientIDState)));
        state.set_client_id(ClientID::from("a")).unwrap();
        assert_eq!(state.get_client_id().unwrap().as_str(), "a");
        let err = state.set_client_id(ClientID::from("a"));
        assert!(matches!(err, Err(ChatError::ClientIDNotConsistent)));
    }

    #[test]
    fn manager_rejects_duplicate_insert() {
        let manager = StateManager::new();
        let (state, _writer) = State::new(
            Arc::new(NullConnection),
            Arc::new(RawWriter),
            CancellationToken::new(),
        );
        manager.insert(ClientID::from("a"), state.clone()).unwrap();
        let err = manager.insert(ClientID::from("a"), state);
        assert!(matches!(err, Err(ChatError::ConnectionExists(_))));
    }

    #[test]
    fn manager_lookup_missing_client_fails() {
        let manager = StateManager::new();
        let err = manager.get(&ClientID::from("ghost"));
        assert!(matches!(err, Err(ChatError::ConnectionNotFound(_))));
    }
}
