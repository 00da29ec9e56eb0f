//! Connection profiles for the IKEv2 engine
//!
//! A profile is the validated, immutable description of one VPN endpoint and
//! credential set. Profiles arrive as structured call arguments or as TOML
//! (for hosts that keep them on disk); either way they are validated before
//! the controller forwards them to the engine.

use crate::engine::EngineProfile;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Authentication modes supported by the IKEv2 engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AuthMode {
    /// EAP username/password authentication
    Password { username: String, password: String },
    /// PKCS#12 client certificate authentication
    Pkcs12 { passphrase: String },
}

impl AuthMode {
    /// Engine-facing connection type discriminator.
    pub fn vpn_type(&self) -> &'static str {
        match self {
            AuthMode::Password { .. } => "ikev2-eap",
            AuthMode::Pkcs12 { .. } => "ikev2-p12",
        }
    }
}

/// One VPN endpoint and credential set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Display name of the profile
    pub name: String,
    /// Server hostname or IP address
    pub server: String,
    /// MTU override for the tunnel device
    #[serde(default)]
    pub mtu: Option<u32>,
    /// Server port override
    #[serde(default)]
    pub port: Option<u16>,
    /// Authentication mode and credentials
    pub auth: AuthMode,
}

impl ConnectionProfile {
    /// Load a profile from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("Failed to read profile file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Serialize the profile to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SessionError::Config(format!("Failed to serialize profile: {e}")))
    }

    /// Validate the profile
    ///
    /// Fails with [`SessionError::InvalidProfile`] naming the first violated
    /// rule. The controller rejects unvalidated profiles before any state
    /// transition.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SessionError::InvalidProfile(
                "Profile name cannot be empty".to_string(),
            ));
        }

        if self.server.is_empty() {
            return Err(SessionError::InvalidProfile(
                "Server address cannot be empty".to_string(),
            ));
        }

        if self.mtu == Some(0) {
            return Err(SessionError::InvalidProfile(
                "MTU must be a positive integer".to_string(),
            ));
        }

        if self.port == Some(0) {
            return Err(SessionError::InvalidProfile(
                "Port must be between 1 and 65535".to_string(),
            ));
        }

        match &self.auth {
            AuthMode::Password { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(SessionError::InvalidProfile(
                        "Username and password are required for password authentication"
                            .to_string(),
                    ));
                }
            }
            AuthMode::Pkcs12 { passphrase } => {
                if passphrase.is_empty() {
                    return Err(SessionError::InvalidProfile(
                        "A PKCS#12 passphrase is required for certificate authentication"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Marshal the profile into the form the engine consumes.
    pub fn engine_profile(&self) -> EngineProfile {
        let (username, password, p12_password) = match &self.auth {
            AuthMode::Password { username, password } => {
                (Some(username.clone()), Some(password.clone()), None)
            }
            AuthMode::Pkcs12 { passphrase } => (None, None, Some(passphrase.clone())),
        };

        EngineProfile {
            name: self.name.clone(),
            server: self.server.clone(),
            mtu: self.mtu,
            port: self.port,
            vpn_type: self.auth.vpn_type().to_string(),
            username,
            password,
            p12_password,
        }
    }
}

impl FromStr for ConnectionProfile {
    type Err = SessionError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SessionError::Config(format!("Failed to parse profile TOML: {e}")))
    }
}
