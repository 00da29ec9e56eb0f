//! Error types and handling for the charon bridge

use thiserror::Error;

use crate::state::ErrorState;

/// Main error type for session-control operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Profile validation errors
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    /// A session is already being established or is established
    #[error("A session is already active")]
    AlreadyActive,

    /// A request of the same kind is already queued
    #[error("A request is already pending")]
    AlreadyPending,

    /// Faults reported by the native engine
    #[error("Engine fault: {0}")]
    Engine(ErrorState),

    /// Bounded wait exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Engine binding not established; transient, retry after binding
    #[error("Engine binding not established")]
    Unbound,

    /// Configuration errors (profile files, settings)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for session-control operations
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Stable machine-readable code for the command and FFI surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidProfile(_) => "invalid_profile",
            SessionError::AlreadyActive => "already_active",
            SessionError::AlreadyPending => "already_pending",
            SessionError::Engine(_) => "engine_fault",
            SessionError::Timeout(_) => "timeout",
            SessionError::Unbound => "unbound",
            SessionError::Config(_) => "config",
        }
    }

    /// The error-state value this fault maps to on the broadcast stream.
    pub fn error_state(&self) -> ErrorState {
        match self {
            SessionError::Engine(state) => *state,
            SessionError::Timeout(_) => ErrorState::Timeout,
            _ => ErrorState::GenericNetworkError,
        }
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::Config(format!("TOML parsing error: {err}"))
    }
}
