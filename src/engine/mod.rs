//! Native engine collaborator interface
//!
//! The IKEv2 negotiation, tunnel establishment and daemon state machine live
//! in the native engine behind these traits. This crate only binds the
//! engine, forwards lifecycle requests and relays its notifications; it never
//! implements any of the tunneling itself.

pub mod mock;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::state::{ErrorState, SessionState};

/// One state-change notification pushed by the engine listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineNotification {
    pub state: SessionState,
    pub error: ErrorState,
}

impl EngineNotification {
    pub fn new(state: SessionState, error: ErrorState) -> Self {
        Self { state, error }
    }
}

/// Profile in the marshaled form the engine consumes
///
/// Field names match the engine's own configuration keys, with `vpn_type`
/// selecting between EAP and PKCS#12 connection types. Credentials are
/// populated for exactly one of the two modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineProfile {
    pub name: String,
    pub server: String,
    #[serde(rename = "MTU", skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub vpn_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "P12Password", skip_serializing_if = "Option::is_none")]
    pub p12_password: Option<String>,
}

/// The bindable engine service
///
/// Binding is asynchronous and yields the handle all further engine
/// operations go through. A controller binds at most once unless the binding
/// is explicitly torn down.
#[async_trait]
pub trait VpnEngine: Send + Sync {
    async fn bind(&self) -> Result<Arc<dyn EngineHandle>>;
}

/// Handle to a bound engine service
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Forward a connection request to the engine.
    ///
    /// Completion means the engine accepted the request; the tunnel outcome
    /// arrives through the registered listener.
    async fn connect(&self, profile: &EngineProfile, log_all: bool) -> Result<()>;

    /// Request tunnel teardown. The engine confirms through the listener.
    async fn disconnect(&self) -> Result<()>;

    /// Register the notification funnel. Notifications must be delivered in
    /// the order the engine emits them; a later registration replaces an
    /// earlier one.
    fn register_listener(&self, listener: mpsc::UnboundedSender<EngineNotification>);

    /// Drop the registered listener. Safe to call when none is registered.
    fn unregister_listener(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_profile_serialized_keys() {
        let profile = EngineProfile {
            name: "office".to_string(),
            server: "vpn.example.com".to_string(),
            mtu: Some(1400),
            port: Some(4500),
            vpn_type: "ikev2-eap".to_string(),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            p12_password: None,
        };

        let toml = toml::to_string(&profile).expect("Failed to serialize engine profile");
        assert!(toml.contains("Name = \"office\""));
        assert!(toml.contains("Server = \"vpn.example.com\""));
        assert!(toml.contains("MTU = 1400"));
        assert!(toml.contains("Port = 4500"));
        assert!(toml.contains("VpnType = \"ikev2-eap\""));
        assert!(toml.contains("Username = \"u\""));
        assert!(!toml.contains("P12Password"));
    }
}
