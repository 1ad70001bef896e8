//! Chat interceptor (C9): room and health command dispatch, shared between
//! the server and client roles. Ported from
//! `pkg/middleware/chat/chat.go`'s `ChatBase` plus its `Server`/`Client`
//! specializations.
//!
//! `ChatBase` owns the read/write protocol sets, the state manager's
//! per-connection arena, the room manager, and the health manager — see
//! §4.9. It deliberately does not own the key-exchange manager; that
//! handshake lives in its own interceptor (`keyexchange::manager::EncryptInterceptor`)
//! so record protection can be composed independently of chat routing.

pub mod client;
pub mod messages;
pub mod server;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::connection::{BoxConnection, BoxReader, BoxWriter, Reader};
use crate::envelope::{Message, Registry};
use crate::error::ChatError;
use crate::health::HealthManager;
use crate::interceptor::Interceptor;
use crate::room::RoomManager;
use crate::state::{State, StateManager};

pub use client::ClientRole;
pub use server::ServerRole;

/// Shared wiring for both chat roles. A `State` is registered here (keyed by
/// the connection's identity, not its not-yet-known `ClientID`) in
/// `bind_socket_connection` and looked back up by `init()` and the read
/// decorator — the chain's `Interceptor` methods are called on disjoint
/// `&self` invocations with no way to thread a value between them otherwise.
pub struct ChatBase {
    pub rooms: Arc<RoomManager>,
    pub health: Arc<HealthManager>,
    pub registry: Arc<Registry>,
    pub states: Arc<StateManager>,
    ctx: CancellationToken,
    pending: RwLock<HashMap<usize, Arc<State>>>,
    read_protocols: HashSet<&'static str>,
    write_protocols: HashSet<&'static str>,
}

impl ChatBase {
    pub fn new(
        rooms: Arc<RoomManager>,
        health: Arc<HealthManager>,
        registry: Arc<Registry>,
        states: Arc<StateManager>,
        ctx: CancellationToken,
        read_protocols: &[&'static str],
        write_protocols: &[&'static str],
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms,
            health,
            registry,
            states,
            ctx,
            pending: RwLock::new(HashMap::new()),
            read_protocols: read_protocols.iter().copied().collect(),
            write_protocols: write_protocols.iter().copied().collect(),
        })
    }

    fn conn_key(conn: &BoxConnection) -> usize {
        Arc::as_ptr(conn) as *const () as usize
    }

    pub fn bind(&self, conn: &BoxConnection, state: Arc<State>) {
        self.pending.write().insert(Self::conn_key(conn), state);
    }

    pub fn lookup(&self, conn: &BoxConnection) -> Option<Arc<State>> {
        self.pending.read().get(&Self::conn_key(conn)).cloned()
    }

    pub fn unbind(&self, conn: &BoxConnection) {
        self.pending.write().remove(&Self::conn_key(conn));
    }

    pub fn owns_read(&self, protocol: &str) -> bool {
        self.read_protocols.contains(protocol)
    }

    pub fn owns_write(&self, protocol: &str) -> bool {
        self.write_protocols.contains(protocol)
    }
}

/// Implemented once per side (`ServerRole`, `ClientRole`); everything the
/// two variants don't share lives behind this seam.
#[async_trait]
pub trait ChatRole: Send + Sync {
    async fn handle_read(
        &self,
        base: &ChatBase,
        msg: &dyn Message,
        state: &Arc<State>,
    ) -> Result<(), ChatError>;

    /// Runs the role's bootstrap (ident assignment / ident wait) once the
    /// connection is bound.
    async fn init(&self, base: &ChatBase, state: &Arc<State>) -> Result<(), ChatError>;
}

/// Decorates the read path: for any protocol this role owns, run
/// `handle_read` then advance past it to the nested message, matching the
/// general interceptor convention (§4.2) of consuming an owned envelope
/// layer before handing the rest of the chain whatever is nested inside.
struct ChatReader<R> {
    inner: BoxReader,
    base: Arc<ChatBase>,
    role: Arc<R>,
}

#[async_trait]
impl<R: ChatRole + 'static> Reader for ChatReader<R> {
    async fn read(
        &self,
        ctx: CancellationToken,
        conn: &BoxConnection,
    ) -> Result<Box<dyn Message>, ChatError> {
        let msg = self.inner.read(ctx, conn).await?;
        if !self.base.owns_read(msg.protocol()) {
            return Ok(msg);
        }
        let state = self
            .base
            .lookup(conn)
            .ok_or_else(|| ChatError::ConnectionNotFound("no state bound for connection".into()))?;
        if let Err(err) = self.role.handle_read(&self.base, msg.as_ref(), &state).await {
            tracing::warn!(protocol = %msg.protocol(), %err, "chat command failed");
        }
        match msg.get_next(&self.base.registry)? {
            Some(inner) => Ok(inner),
            None => Ok(msg),
        }
    }
}

/// Generic `Interceptor` built from a `ChatBase` and a `ChatRole`. Outbound
/// messages in this layer never need rewriting (no chat protocol requires
/// signing or routing on the write path), so the writer side is a pure
/// pass-through.
pub struct ChatInterceptor<R> {
    base: Arc<ChatBase>,
    role: Arc<R>,
}

impl<R: ChatRole + 'static> ChatInterceptor<R> {
    pub fn new(base: Arc<ChatBase>, role: Arc<R>) -> Self {
        Self { base, role }
    }
}

#[async_trait]
impl<R: ChatRole + 'static> Interceptor for ChatInterceptor<R> {
    async fn bind_socket_connection(
        &self,
        conn: &BoxConnection,
        writer: BoxWriter,
        reader: BoxReader,
    ) -> Result<(BoxWriter, BoxReader), ChatError> {
        let (state, _handle) = State::new(conn.clone(), writer.clone(), self.base.ctx.clone());
        self.base.bind(conn, state);
        Ok((writer, reader))
    }

    async fn init(&self, conn: &BoxConnection) -> Result<(), ChatError> {
        let state = self
            .base
            .lookup(conn)
            .ok_or_else(|| ChatError::ConnectionNotFound("no state bound for connection".into()))?;
        self.role.init(&self.base, &state).await
    }

    fn intercept_socket_writer(&self, writer: BoxWriter) -> BoxWriter {
        writer
    }

    fn intercept_socket_reader(&self, reader: BoxReader) -> BoxReader {
        Arc::new(ChatReader {
            inner: reader,
            base: self.base.clone(),
            role: self.role.clone(),
        })
    }

    async fn un_bind_socket_connection(&self, conn: &BoxConnection) {
        if let Some(state) = self.base.lookup(conn) {
            if let Ok(client_id) = state.get_client_id() {
                self.base.states.remove(&client_id);
            }
        }
        self.base.unbind(conn);
    }

    async fn close(&self) -> Result<(), ChatError> {
        Ok(())
    }
}
