//! Request/response command surface
//!
//! One command per controller operation, as serde-tagged enums with stable
//! snake_case names on the wire. Hosts pair this with the event surface
//! ([`SessionController::subscribe`]) for the full integration: commands in,
//! state snapshots out.

use serde::{Deserialize, Serialize};

use crate::controller::{ConnectOptions, SessionController};
use crate::error::SessionError;
use crate::profile::ConnectionProfile;
use crate::state::{ErrorState, SessionState};

fn default_log_all() -> bool {
    true
}

/// Commands accepted by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Request tunneling permission from the platform
    RequestPermission,
    /// Query whether tunneling permission is granted
    IsPermissionGranted,
    /// Request a VPN connection
    ///
    /// The profile table sits after the scalar options so the TOML wire form
    /// serializes cleanly.
    Connect {
        #[serde(default)]
        reconnect: bool,
        #[serde(default = "default_log_all")]
        log_all: bool,
        profile: ConnectionProfile,
    },
    /// Tear the session down
    Disconnect,
    /// Read the current `(state, error)` pair
    CurrentState,
    /// Read the current engine error state
    CurrentError,
}

/// Replies produced by [`dispatch`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CommandReply {
    /// Permission query or request outcome
    Permission { granted: bool },
    /// Connect request outcome
    Connect { accepted: bool },
    /// Acknowledgement with no payload
    Ok,
    /// Current state pair
    State {
        state: SessionState,
        error: ErrorState,
    },
    /// Current engine error state
    EngineError { error: ErrorState },
    /// Command failure with a stable code
    Error { code: String, message: String },
}

impl CommandReply {
    fn error(e: SessionError) -> Self {
        CommandReply::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Execute one command against a controller.
pub async fn dispatch(controller: &SessionController, command: Command) -> CommandReply {
    match command {
        Command::RequestPermission => match controller.request_permission().await {
            Ok(granted) => CommandReply::Permission { granted },
            Err(e) => CommandReply::error(e),
        },
        Command::IsPermissionGranted => CommandReply::Permission {
            granted: controller.is_permission_granted(),
        },
        Command::Connect {
            profile,
            reconnect,
            log_all,
        } => {
            let options = ConnectOptions { reconnect, log_all };
            match controller.connect(&profile, options).await {
                Ok(accepted) => CommandReply::Connect { accepted },
                Err(e) => CommandReply::error(e),
            }
        }
        Command::Disconnect => match controller.disconnect().await {
            Ok(()) => CommandReply::Ok,
            Err(e) => CommandReply::error(e),
        },
        Command::CurrentState => {
            let snapshot = controller.current_state();
            CommandReply::State {
                state: snapshot.state,
                error: snapshot.error,
            }
        }
        Command::CurrentError => CommandReply::EngineError {
            error: controller.current_error(),
        },
    }
}
