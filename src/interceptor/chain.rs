//! Ordered composition of interceptors. Ported from `pkg/interceptor/chain.go`.
//!
//! Write folds left (outermost interceptor decorates first, then each prior
//! one, ending at the raw transport); read folds symmetrically so innermost
//! processing happens first — matching layered framing such as
//! encrypted-then-chat.

use async_trait::async_trait;

use super::{BoxInterceptor, Interceptor};
use crate::connection::{BoxConnection, BoxReader, BoxWriter};
use crate::error::{ChatError, MultiError};

pub struct Chain {
    interceptors: Vec<BoxInterceptor>,
}

impl Chain {
    pub fn new(interceptors: Vec<BoxInterceptor>) -> Self {
        Self { interceptors }
    }
}

#[async_trait]
impl Interceptor for Chain {
    async fn bind_socket_connection(
        &self,
        conn: &BoxConnection,
        writer: BoxWriter,
        reader: BoxReader,
    ) -> Result<(BoxWriter, BoxReader), ChatError> {
        let mut w = writer;
        let mut r = reader;
        for interceptor in &self.interceptors {
            let wrapped_w = self.intercept_socket_writer(w.clone());
            let wrapped_r = self.intercept_socket_reader(r.clone());
            let (next_w, next_r) = interceptor
                .bind_socket_connection(conn, wrapped_w, wrapped_r)
                .await?;
            w = next_w;
            r = next_r;
        }
        Ok((w, r))
    }

    async fn init(&self, conn: &BoxConnection) -> Result<(), ChatError> {
        for interceptor in &self.interceptors {
            interceptor.init(conn).await?;
        }
        Ok(())
    }

    fn intercept_socket_writer(&self, writer: BoxWriter) -> BoxWriter {
        let mut w = writer;
        for interceptor in &self.interceptors {
            w = interceptor.intercept_socket_writer(w);
        }
        w
    }

    fn intercept_socket_reader(&self, reader: BoxReader) -> BoxReader {
        let mut r = reader;
        for interceptor in &self.interceptors {
            r = interceptor.intercept_socket_reader(r);
        }
        r
    }

    async fn un_bind_socket_connection(&self, conn: &BoxConnection) {
        for interceptor in &self.interceptors {
            interceptor.un_bind_socket_connection(conn).await;
        }
    }

    async fn close(&self) -> Result<(), ChatError> {
        let mut merr = MultiError::new();
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.close().await {
                merr.add(e);
            }
        }
        merr.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{RawReader, RawWriter};
    use crate::envelope::Registry;
    use std::sync::Arc;

    #[tokio::test]
    async fn empty_chain_passes_through() {
        let chain = Chain::new(vec![]);
        let registry = Arc::new(Registry::new());
        let writer: BoxWriter = Arc::new(RawWriter);
        let reader: BoxReader = Arc::new(RawReader { registry });
        let w2 = chain.intercept_socket_writer(writer);
        let r2 = chain.intercept_socket_reader(reader);
        // Folding zero interceptors returns the input unchanged (same vtable).
        assert!(Arc::strong_count(&w2) >= 1);
        let _ = r2;
    }

    #[tokio::test]
    async fn close_collects_multiple_errors() {
        struct Failing(&'static str);
        #[async_trait]
        impl Interceptor for Failing {
            async fn bind_socket_connection(
                &self,
                _c: &BoxConnection,
                w: BoxWriter,
                r: BoxReader,
            ) -> Result<(BoxWriter, BoxReader), ChatError> {
                Ok((w, r))
            }
            async fn init(&self, _c: &BoxConnection) -> Result<(), ChatError> {
                Ok(())
            }
            fn intercept_socket_writer(&self, w: BoxWriter) -> BoxWriter {
                w
            }
            fn intercept_socket_reader(&self, r: BoxReader) -> BoxReader {
                r
            }
            async fn un_bind_socket_connection(&self, _c: &BoxConnection) {}
            async fn close(&self) -> Result<(), ChatError> {
                Err(ChatError::other(self.0))
            }
        }

        let chain = Chain::new(vec![Arc::new(Failing("one")), Arc::new(Failing("two"))]);
        let err = chain.close().await.unwrap_err();
        assert!(matches!(err, ChatError::Multi(2, _)));
    }
}
