//! Opaque identifier newtypes shared across the connection, room, and health layers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sentinel meaning "identity not yet established" for a freshly accepted connection.
pub const UNKNOWN_CLIENT: &str = "unknown-client";

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(value: impl Into<Arc<str>>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(Arc::from(value))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Arc::from(value.as_str()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self(Arc::from(""))
            }
        }
    };
}

opaque_id!(ClientID, "Opaque id identifying one connected client.");
opaque_id!(RoomID, "Opaque id identifying one chat room.");

impl ClientID {
    /// The reserved value held by a `State` before `Ident` completes.
    pub fn unknown() -> Self {
        Self::from(UNKNOWN_CLIENT)
    }

    pub fn is_unknown(&self) -> bool {
        self.as_str() == UNKNOWN_CLIENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_client_round_trips() {
        let id = ClientID::unknown();
        assert!(id.is_unknown());
        assert_eq!(id.as_str(), UNKNOWN_CLIENT);
    }

    #[test]
    fn ids_are_hashable_and_comparable() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ClientID::from("a"));
        set.insert(ClientID::from("a"));
        set.insert(ClientID::from("b"));
        assert_eq!(set.len(), 2);
    }
}
