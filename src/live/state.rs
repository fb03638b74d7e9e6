//! # Connection State Machine
//!
//! One authoritative `ConnectionState`, owned by the session driver. Every
//! change goes through `transition`, which handles every (state, event) pair.
//!
//! ## States:
//! 1. **Disconnected**: idle; `connect()` allowed
//! 2. **Connecting**: devices and remote session being set up
//! 3. **Connected**: remote session open, audio flowing both ways
//! 4. **Error**: last session failed; `connect()` allowed

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Things that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConnectRequested,
    /// The remote session reported open
    Opened,
    /// The remote session closed
    RemoteClosed,
    /// Setup or the running session failed
    Failed,
    DisconnectRequested,
}

impl ConnectionState {
    /// Status string for API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }

    /// `connect()` is a no-op unless this holds.
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Next state for `event`.
    pub fn transition(self, event: StateEvent) -> ConnectionState {
        use ConnectionState::*;
        use StateEvent::*;

        match (self, event) {
            (Disconnected | Error, ConnectRequested) => Connecting,
            (Connecting | Connected, ConnectRequested) => self,

            (Connecting, Opened) => Connected,
            // Opens from anything but an active setup are stale
            (Disconnected | Connected | Error, Opened) => self,

            (Connecting | Connected, RemoteClosed) => Disconnected,
            (Disconnected | Error, RemoteClosed) => self,

            (Connecting | Connected, Failed) => Error,
            (Error, Failed) => Error,
            // A failure after an explicit disconnect is a late callback
            (Disconnected, Failed) => Disconnected,

            (_, DisconnectRequested) => Disconnected,
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
    use ConnectionState::*;
    use StateEvent::*;

    #[test]
    fn test_happy_path() {
        let state = Disconnected.transition(ConnectRequested);
        assert_eq!(state, Connecting);
        let state = state.transition(Opened);
        assert_eq!(state, Connected);
        assert_eq!(state.transition(RemoteClosed), Disconnected);
    }

    #[test]
    fn test_connect_is_noop_while_busy() {
        assert_eq!(Connecting.transition(ConnectRequested), Connecting);
        assert_eq!(Connected.transition(ConnectRequested), Connected);
        assert!(!Connecting.can_connect());
        assert!(!Connected.can_connect());
        assert!(Error.can_connect());
        assert!(Disconnected.can_connect());
    }

    #[test]
    fn test_failures() {
        assert_eq!(Connecting.transition(Failed), Error);
        assert_eq!(Connected.transition(Failed), Error);
        assert_eq!(Disconnected.transition(Failed), Disconnected);
        assert_eq!(Error.transition(ConnectRequested), Connecting);
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        for state in [Disconnected, Connecting, Connected, Error] {
            assert_eq!(state.transition(DisconnectRequested), Disconnected);
        }
    }

    #[test]
    fn test_stale_open_is_ignored() {
        assert_eq!(Disconnected.transition(Opened), Disconnected);
        assert_eq!(Error.transition(Opened), Error);
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Connecting).unwrap(), "\"connecting\"");
        assert_eq!(Error.to_string(), "error");
    }
}
