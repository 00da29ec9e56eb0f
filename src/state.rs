//! Session, error and permission state enumerations
//!
//! These enums cross the command and event surfaces, so every variant has a
//! stable serde name. Raw ordinals never leave the crate; reordering a
//! variant must not change what a host application observes.

use serde::{Deserialize, Serialize};

/// Connection state as reported to host applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Engine binding not yet established; distinct from `Disconnected`
    Unbound,
    /// No tunnel and no attempt in progress
    Disconnected,
    /// Tunnel establishment in progress
    Connecting,
    /// Tunnel established
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Attempt or session failed; carries a non-`NoError` error state
    Error,
}

impl SessionState {
    /// Check whether a session attempt or tunnel is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Disconnecting
        )
    }

    /// Stable name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unbound => "unbound",
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error classification paired with [`SessionState`]
///
/// Mirrors the error set the charon daemon reports, plus `Timeout` for
/// bounded waits that expired inside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorState {
    NoError,
    AuthFailed,
    LookupFailed,
    UnreachableServer,
    GenericNetworkError,
    Aborted,
    Timeout,
}

impl ErrorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorState::NoError => "no_error",
            ErrorState::AuthFailed => "auth_failed",
            ErrorState::LookupFailed => "lookup_failed",
            ErrorState::UnreachableServer => "unreachable_server",
            ErrorState::GenericNetworkError => "generic_network_error",
            ErrorState::Aborted => "aborted",
            ErrorState::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the OS tunneling-consent prompt
///
/// Moves away from `Unknown` only when a prompt completes; a `Denied` value
/// changes again only through an explicit new grant request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Unknown,
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }
}

/// One atomic `(state, error)` pair as delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: SessionState,
    pub error: ErrorState,
}

impl StateSnapshot {
    pub fn new(state: SessionState, error: ErrorState) -> Self {
        Self { state, error }
    }

    /// The pair a controller starts from before engine binding completes.
    pub fn unbound() -> Self {
        Self::new(SessionState::Unbound, ErrorState::NoError)
    }
}

impl std::fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.state, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Connected.is_active());
        assert!(!SessionState::Unbound.is_active());
        assert!(!SessionState::Disconnected.is_active());
        assert!(!SessionState::Error.is_active());
    }

    #[test]
    fn test_wire_names_are_stable() {
        // Host applications match on these strings; they must never drift.
        let cases = [
            (SessionState::Unbound, "unbound"),
            (SessionState::Disconnected, "disconnected"),
            (SessionState::Connecting, "connecting"),
            (SessionState::Connected, "connected"),
            (SessionState::Disconnecting, "disconnecting"),
            (SessionState::Error, "error"),
        ];
        for (state, name) in cases {
            assert_eq!(state.as_str(), name);
        }
        assert_eq!(ErrorState::UnreachableServer.as_str(), "unreachable_server");
        assert_eq!(ErrorState::GenericNetworkError.as_str(), "generic_network_error");
    }

    #[test]
    fn test_snapshot_display() {
        let snap = StateSnapshot::new(SessionState::Error, ErrorState::AuthFailed);
        assert_eq!(snap.to_string(), "(error, auth_failed)");
    }
}
