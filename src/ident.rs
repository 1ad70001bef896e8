//! Ident bootstrap (C10): the handshake that assigns and propagates the
//! per-connection `ClientID` before any room/health traffic is accepted.
//! Ported from `pkg/middleware/chat/ident.go`'s `IdentInit`/`IdentWaiter`.
//!
//! Server side: `server_bootstrap` assigns a fresh id, installs it on the
//! connection's `State`, registers the state in the shared `StateManager`,
//! writes `Ident` to the peer, then waits (trivially, since the id is
//! already set) for symmetry with the client path. Client side:
//! `client_bootstrap` just waits — the assignment happens when the `Ident`
//! read handler calls `set_client_id` and replies with `IdentResponse`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::chat::messages::{Ident, IdentResponse, IDENT, IDENT_RESPONSE};
use crate::envelope::{BaseEnvelope, Header, Message};
use crate::error::ChatError;
use crate::ids::ClientID;
use crate::process::Process;
use crate::state::State;

/// Busy-waits until `state`'s `ClientID` has been set, or `ctx`/the hard
/// deadline fires. Floor documented alongside the other polling primitives
/// in `config::RuntimeConfig`.
pub struct IdentWaiter {
    poll_period: Duration,
    timeout: Duration,
}

impl IdentWaiter {
    pub fn new(poll_period: Duration, timeout: Duration) -> Self {
        Self { poll_period, timeout }
    }
}

#[async_trait]
impl Process for IdentWaiter {
    async fn process(&self, ctx: tokio_util::sync::CancellationToken, state: &State) -> Result<(), ChatError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(self.poll_period);
        loop {
            if state.get_client_id().is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChatError::other("ident bootstrap timed out"));
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.cancelled() => return Err(ChatError::ContextCancelled),
            }
        }
    }
}

fn ident_message(sender: ClientID) -> Ident {
    Ident {
        base: BaseEnvelope::terminal(IDENT.to_string(), Header::new(sender, ClientID::unknown())),
    }
}

fn ident_response_message(sender: ClientID) -> IdentResponse {
    IdentResponse {
        base: BaseEnvelope::terminal(IDENT_RESPONSE.to_string(), Header::new(sender, ClientID::unknown())),
    }
}

/// Server-side bootstrap: assigns a fresh `ClientID`, publishes it to the
/// connection's `State` and the shared `StateManager`, writes `Ident`, then
/// waits for symmetry with the client path (the wait is immediate here
/// since the id is already set).
pub async fn server_bootstrap(
    base: &crate::chat::ChatBase,
    state: &Arc<State>,
    poll_period: Duration,
    timeout: Duration,
) -> Result<(), ChatError> {
    let client_id = ClientID::from(Uuid::new_v4().to_string());
    state.set_client_id(client_id.clone())?;
    base.states.insert(client_id.clone(), state.clone())?;
    state.write(Box::new(ident_message(client_id))).await?;
    IdentWaiter::new(poll_period, timeout)
        .process(state.ctx(), state)
        .await
}

/// Client-side bootstrap: waits for `Ident`'s read handler (below) to have
/// set the `ClientID`.
pub async fn client_bootstrap(
    _base: &crate::chat::ChatBase,
    state: &Arc<State>,
    poll_period: Duration,
    timeout: Duration,
) -> Result<(), ChatError> {
    IdentWaiter::new(poll_period, timeout)
        .process(state.ctx(), state)
        .await
}

/// Invoked by `ClientRole::handle_read` on an inbound `Ident`: adopts the
/// server-assigned id and acknowledges with `IdentResponse`.
pub async fn handle_ident(
    base: &crate::chat::ChatBase,
    msg: &Ident,
    state: &Arc<State>,
) -> Result<(), ChatError> {
    let assigned = msg.base.header.sender.clone();
    state.set_client_id(assigned.clone())?;
    base.states.insert(assigned.clone(), state.clone())?;
    state.write(Box::new(ident_response_message(assigned))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatBase;
    use crate::connection::RawWriter;
    use crate::health::HealthManager;
    use crate::room::RoomManager;
    use crate::state::StateManager;
    use tokio_util::sync::CancellationToken;

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

    fn test_base() -> Arc<ChatBase> {
        let ctx = CancellationToken::new();
        ChatBase::new(
            RoomManager::new(ctx.clone()),
            HealthManager::new(ctx.clone()),
            Arc::new(crate::envelope::Registry::new()),
            Arc::new(StateManager::new()),
            ctx,
            &[],
            &[],
        )
    }

    fn fresh_state() -> Arc<State> {
        let (state, _writer) = State::new(
            Arc::new(NullConnection),
            Arc::new(RawWriter),
            CancellationToken::new(),
        );
        state
    }

    #[tokio::test]
    async fn server_bootstrap_assigns_and_registers_id() {
        let base = test_base();
        let state = fresh_state();
        server_bootstrap(&base, &state, Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap();
        let id = state.get_client_id().unwrap();
        assert!(base.states.get(&id).is_ok());
    }

    #[tokio::test]
    async fn client_waiter_times_out_without_ident() {
        let base = test_base();
        let state = fresh_state();
        let err = client_bootstrap(&base, &state, Duration::from_millis(5), Duration::from_millis(20)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn handle_ident_sets_id_and_replies() {
        let base = test_base();
        let state = fresh_state();
        let incoming = ident_message(ClientID::from("assigned-1"));
        handle_ident(&base, &incoming, &state).await.unwrap();
        assert_eq!(state.get_client_id().unwrap().as_str(), "assigned-1");
    }
}
