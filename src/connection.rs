//! The abstract byte-duplex the core consumes (§6 "Transport contract").
//!
//! The real WebSocket accept loop, upgrade handling, and per-connection
//! reader/writer queues live outside this crate; this module only defines
//! the trait boundary and the `Writer`/`Reader` pipeline stages built on it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelope::Message;
use crate::error::ChatError;

/// A byte-level duplex channel. Implemented externally by the transport
/// adaptor (WebSocket, UDP, in-memory pipe for tests).
#[async_trait]
pub trait Connection: fmt::Debug + Send + Sync {
    async fn write(&self, ctx: CancellationToken, bytes: &[u8]) -> Result<(), ChatError>;
    async fn read(&self, ctx: CancellationToken) -> Result<Vec<u8>, ChatError>;
    async fn close(&self) -> Result<(), ChatError>;
}

pub type BoxConnection = Arc<dyn Connection>;

/// Writes one message through whatever interceptor decorators are layered
/// on top of the raw transport.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(
        &self,
        ctx: CancellationToken,
        conn: &BoxConnection,
        msg: Box<dyn Message>,
    ) -> Result<(), ChatError>;
}

/// Reads one message, running it through whatever interceptor decorators
/// are layered on top of the raw transport.
#[async_trait]
pub trait Reader: Send + Sync {
    async fn read(
        &self,
        ctx: CancellationToken,
        conn: &BoxConnection,
    ) -> Result<Box<dyn Message>, ChatError>;
}

pub type BoxWriter = Arc<dyn Writer>;
pub type BoxReader = Arc<dyn Reader>;

/// The bottom of every writer stack: serializes and flushes straight to the
/// transport, with no protocol-specific behavior.
pub struct RawWriter;

#[async_trait]
impl Writer for RawWriter {
    async fn write(
        &self,
        ctx: CancellationToken,
        conn: &BoxConnection,
        msg: Box<dyn Message>,
    ) -> Result<(), ChatError> {
        let bytes = msg.marshal()?;
        conn.write(ctx, &bytes).await
    }
}

/// The bottom of every reader stack: reads raw bytes and sniffs the
/// protocol via the registry.
pub struct RawReader {
    pub registry: Arc<crate::envelope::Registry>,
}

#[async_trait]
impl Reader for RawReader {
    async fn read(
        &self,
        ctx: CancellationToken,
        conn: &BoxConnection,
    ) -> Result<Box<dyn Message>, ChatError> {
        let bytes = conn.read(ctx).await?;
        self.registry.unmarshal_raw(&bytes)
    }
}
