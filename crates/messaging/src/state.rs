//! Connection state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the client's broker connection.
///
/// State transitions:
/// ```text
/// Disconnected ──► Connecting ──► Connected
///      ▲  │            ▲  │            │
///      │  ▼            │  │            │
///      │ Reconnecting ─┘  │            │
///      └──────────────────┴────────────┘   (connection fault)
///
/// any ──► Closed   (explicit shutdown, terminal)
/// ```
///
/// `Reconnecting` is only entered by the supervisor after an established
/// connection was lost; it covers the backoff wait before each new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Reconnecting,
    Connecting,
    Connected,
    Closed,
}

impl ConnectionState {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting | Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            (Connecting, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,
            _ => false,
        }
    }

    /// Returns true only for `Closed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Disconnected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(Closed));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Closed));
        assert!(Disconnected.can_transition_to(Closed));
    }

    #[test]
    fn test_closed_is_terminal() {
        use ConnectionState::*;
        assert!(Closed.is_terminal());
        for next in [Disconnected, Reconnecting, Connecting, Connected, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_cannot_skip_connecting() {
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Connected));
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Connecting));
    }

    #[test]
    fn test_reconnecting_only_follows_a_drop() {
        use ConnectionState::*;
        assert!(!Connected.can_transition_to(Reconnecting));
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(!Reconnecting.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Disconnected));
        assert_eq!(Reconnecting.to_string(), "reconnecting");
    }
}
