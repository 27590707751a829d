//! Identifier newtypes.
//!
//! Sessions are identified by random UUIDs. Everything scoped to one session
//! (flow instances, action calls, timers) uses a monotonic counter, so the
//! numeric order of an [`InstanceId`] is also the start order of instances.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// The raw counter value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// A flow instance within one session. Lower ids started earlier.
    InstanceId,
    "fi-"
);
counter_id!(
    /// One action-bridge invocation.
    CallId,
    "call-"
);
counter_id!(
    /// A pending `wait_any` timeout.
    TimerId,
    "timer-"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn instance_ids_order_by_start() {
        assert!(InstanceId(1) < InstanceId(2));
        assert_eq!(InstanceId(7).to_string(), "fi-7");
        assert_eq!(CallId(3).to_string(), "call-3");
    }
}
