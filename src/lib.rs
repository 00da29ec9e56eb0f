//! Charon Bridge - Session Control for the strongSwan IKEv2 Engine
//!
//! This is a **platform-integration library** that bridges a native IKEv2
//! VPN engine (the strongSwan charon daemon) into host applications through
//! two asynchronous channels: a request/response command surface and a
//! push stream of state changes.
//!
//! ## What This Library Provides
//! - Connection profile parsing and validation (TOML format)
//! - The connection-lifecycle state machine: permission acquisition, engine
//!   binding with queued-replay connects, connect/disconnect with bounded
//!   waits, and ordered state relay
//! - Replay-of-one state broadcasting to any number of subscribers
//! - A serde-tagged command surface with stable wire names
//! - C FFI bindings for integration with other languages
//!
//! ## What Your Application Must Implement
//! - The engine itself ([`engine::VpnEngine`]): IKEv2 negotiation, tunnel
//!   establishment and teardown live in the native daemon
//! - The platform consent UI ([`permission::PermissionPrompt`])
//!
//! ## Integration Shape
//! Construct a [`SessionController`] over your engine and prompt, drive it
//! with [`commands::dispatch`] or the controller methods directly, and feed
//! every subscriber from [`SessionController::subscribe`].

pub mod broadcast;
pub mod commands;
pub mod controller;
pub mod engine;
pub mod error;
pub mod permission;
pub mod profile;
pub mod state;

// Re-export core types for the library interface
pub use broadcast::{StateBroadcaster, Subscription};
pub use commands::{dispatch, Command, CommandReply};
pub use controller::{ConnectOptions, SessionController, TimeoutSettings};
pub use error::{Result, SessionError};
pub use permission::{AutoGrantPrompt, PermissionGate, PermissionPrompt};
pub use profile::{AuthMode, ConnectionProfile};
pub use state::{ErrorState, PermissionStatus, SessionState, StateSnapshot};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// C FFI Interface for cross-platform integration
pub mod ffi;
