//! Interceptor chain (C2): the ordered write/read pipeline every message
//! passes through. Ported from `pkg/interceptor/{interceptor,chain}.go`.

pub mod chain;

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{BoxConnection, BoxReader, BoxWriter};
use crate::error::ChatError;

pub use chain::Chain;

/// A middleware component that decorates the read/write paths of a
/// connection and owns a set of protocol ids.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Called once on accept; may register per-connection state. Returns the
    /// (possibly decorated) writer/reader the chain should use from here on.
    async fn bind_socket_connection(
        &self,
        conn: &BoxConnection,
        writer: BoxWriter,
        reader: BoxReader,
    ) -> Result<(BoxWriter, BoxReader), ChatError>;

    /// Called after bind; may perform blocking bootstrap (identity,
    /// key exchange). An error here aborts the connection.
    async fn init(&self, conn: &BoxConnection) -> Result<(), ChatError>;

    /// Returns a decorated writer that observes every outbound message.
    fn intercept_socket_writer(&self, writer: BoxWriter) -> BoxWriter;

    /// Returns a decorated reader that observes every inbound message.
    fn intercept_socket_reader(&self, reader: BoxReader) -> BoxReader;

    /// Tears down per-connection state.
    async fn un_bind_socket_connection(&self, conn: &BoxConnection);

    /// Teardown; component closer errors are the caller's to collect.
    async fn close(&self) -> Result<(), ChatError>;
}

/// An interceptor with no behavior; used as the empty chain element and in
/// tests that only need the trait satisfied.
pub struct NoOpInterceptor;

#[async_trait]
impl Interceptor for NoOpInterceptor {
    async fn bind_socket_connection(
        &self,
        _conn: &BoxConnection,
        writer: BoxWriter,
        reader: BoxReader,
    ) -> Result<(BoxWriter, BoxReader), ChatError> {
        Ok((writer, reader))
    }

    async fn init(&self, _conn: &BoxConnection) -> Result<(), ChatError> {
        Ok(())
    }

    fn intercept_socket_writer(&self, writer: BoxWriter) -> BoxWriter {
        writer
    }

    fn intercept_socket_reader(&self, reader: BoxReader) -> BoxReader {
        reader
    }

    async fn un_bind_socket_connection(&self, _conn: &BoxConnection) {}

    async fn close(&self) -> Result<(), ChatError> {
        Ok(())
    }
}

pub type BoxInterceptor = Arc<dyn Interceptor>;
