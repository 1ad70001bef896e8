//! Bounded-time nonce-replay cache (C8). A replayed nonce within the
//! configured window is rejected; rejection is fatal to the message, not the
//! connection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::ChatError;

const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
pub struct NonceValidator {
    seen: Mutex<HashMap<([u8; 12], Uuid), Instant>>,
    window: Duration,
}

impl NonceValidator {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_WINDOW)
    }

    /// Rejects `nonce` if it was already observed for `session_id` within
    /// the configured window; otherwise records it.
    pub fn validate(&self, nonce: [u8; 12], session_id: Uuid) -> Result<(), ChatError> {
        let now = Instant::now();
        let mut guard = self.seen.lock();
        let key = (nonce, session_id);
        if let Some(seen_at) = guard.get(&key) {
            if now.duration_since(*seen_at) < self.window {
                return Err(ChatError::NonceReused);
            }
        }
        guard.insert(key, now);
        Ok(())
    }

    /// Evicts entries observed strictly before `before`.
    pub fn cleanup(&self, before: Instant) {
        self.seen.lock().retain(|_, seen_at| *seen_at >= before);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_is_accepted_replay_is_rejected() {
        let validator = NonceValidator::new(Duration::from_secs(60));
        let nonce = [1u8; 12];
        let session = Uuid::nil();
        validator.validate(nonce, session).unwrap();
        let err = validator.validate(nonce, session);
        assert!(matches!(err, Err(ChatError::NonceReused)));
    }

    #[test]
    fn distinct_sessions_do_not_collide() {
        let validator = NonceValidator::new(Duration::from_secs(60));
        let nonce = [1u8; 12];
        validator.validate(nonce, Uuid::nil()).unwrap();
        validator.validate(nonce, Uuid::from_u128(1)).unwrap();
    }

    #[test]
    fn cleanup_evicts_old_entries() {
        let validator = NonceValidator::new(Duration::from_secs(60));
        let nonce = [2u8; 12];
        let session = Uuid::nil();
        validator.validate(nonce, session).unwrap();
        validator.cleanup(Instant::now() + Duration::from_millis(1));
        // Entry evicted, so re-use is accepted again.
        validator.validate(nonce, session).unwrap();
    }
}
