//! Runtime tunables (§9 AMBIENT). An immutable, validated configuration
//! object constructed programmatically — no file/env loading, matching the
//! teacher's `Curve25519Options`/compiled-profile pattern of a plain struct
//! assembled by the embedding application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Hard timeout for the ident bootstrap (§4.10). Spec range: 5-10s.
    pub ident_timeout: Duration,
    /// Hard timeout for key-exchange completion (§4.7). Spec range: 5-10s.
    pub key_exchange_timeout: Duration,
    /// Minimum allowed health-poll interval.
    pub health_poll_min: Duration,
    /// Nonce-replay cache window (§4.8). Default 5 minutes.
    pub nonce_replay_window: Duration,
    /// Busy-wait floor for `IdentWaiter`. Kept as a configurable floor per
    /// the open question on polling semantics (§9) rather than switched to
    /// a condition variable.
    pub ident_poll_period: Duration,
    /// Busy-wait floor for `SessionStateTargetWaiter`.
    pub session_state_poll_period: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ident_timeout: Duration::from_secs(5),
            key_exchange_timeout: Duration::from_secs(10),
            health_poll_min: Duration::from_secs(1),
            nonce_replay_window: Duration::from_secs(5 * 60),
            ident_poll_period: Duration::from_millis(500),
            session_state_poll_period: Duration::from_millis(100),
        }
    }
}

impl RuntimeConfig {
    /// Rejects configurations with a zero or negative-equivalent timeout,
    /// matching the teacher's `CompiledStreamProfile::validate` shape.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.ident_timeout.is_zero() {
            return Err(ChatError::other("ident_timeout must be non-zero"));
        }
        if self.key_exchange_timeout.is_zero() {
            return Err(ChatError::other("key_exchange_timeout must be non-zero"));
        }
        if self.health_poll_min.is_zero() {
            return Err(ChatError::other("health_poll_min must be non-zero"));
        }
        if self.ident_poll_period.is_zero() || self.session_state_poll_period.is_zero() {
            return Err(ChatError::other("poll periods must be non-zero"));
        }
        Ok(())
    }
}

/// Current Unix time in milliseconds, used for message timestamps
/// (`Done`/`DoneResponse`/`EncryptedMessage`). Centralised here so callers
/// don't each reach for `SystemTime` directly.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
