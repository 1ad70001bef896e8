//! Process primitives (C4): the uniform synchronous/background unit of work
//! every "verb" in the system is built from. Ported from
//! `pkg/interceptor/process.go`'s `CanProcess`/`CanProcessBackground` split.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::state::State;

/// A synchronous unit of work.
#[async_trait]
pub trait Process: Send + Sync {
    async fn process(&self, ctx: CancellationToken, state: &State) -> Result<(), ChatError>;
}

/// Spawns `process` on the current Tokio runtime and returns a handle with
/// `wait()`/`stop()`. The worker's terminal error is captured exactly once;
/// repeated `wait()` calls return the same result. `stop()` is idempotent.
pub struct BackgroundHandle {
    done: Arc<Notify>,
    result: Arc<Mutex<Option<Result<(), ChatError>>>>,
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BackgroundHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundHandle")
            .field("finished", &self.result.lock().is_some())
            .finish()
    }
}

impl BackgroundHandle {
    pub fn spawn<P>(process: Arc<P>, parent_ctx: CancellationToken, state: Arc<State>) -> Arc<Self>
    where
        P: Process + 'static,
    {
        let done = Arc::new(Notify::new());
        let result = Arc::new(Mutex::new(None));
        let cancel = parent_ctx.child_token();

        let done2 = done.clone();
        let result2 = result.clone();
        let cancel2 = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = tokio::select! {
                res = process.process(cancel2.clone(), &state) => res,
                _ = cancel2.cancelled() => Err(ChatError::ContextCancelled),
            };
            *result2.lock() = Some(outcome);
            done2.notify_waiters();
        });

        Arc::new(Self {
            done,
            result,
            cancel,
            join: Mutex::new(Some(join)),
        })
    }

    /// Blocks for terminal state and returns the captured error (or `Ok`).
    pub async fn wait(&self) -> Result<(), ChatError> {
        loop {
            if let Some(result) = self.result.lock().clone() {
                return result;
            }
            self.done.notified().await;
        }
    }

    /// Cancels the worker's context. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.result.lock().is_some()
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.lock().take() {
            join.abort();
        }
    }
}
