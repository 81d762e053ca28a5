//! Push channel connection states.

/// State of the push channel.
///
/// ```text
/// Disconnected → Connecting → Connected
///                     ↑           │ drop
///                     │           ▼
///                     └──── Reconnecting → Connected
/// any state → Disconnected (logout)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No channel; the listener is stopped.
    #[default]
    Disconnected,
    /// First connection attempt of the session.
    Connecting,
    /// Channel open, events flowing.
    Connected,
    /// The channel dropped; reconnecting with backoff.
    Reconnecting,
}

impl ConnectionState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Returns true if events are flowing.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Connecting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Reconnecting)
                | (_, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
