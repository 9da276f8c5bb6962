//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::DirectoryError;

/// Environment variables consulted for an access token, in order
pub const ACCESS_TOKEN_ENV_VARS: &[&str] = &["ET_ACCESS_TOKEN", "GOOGLE_OAUTH_ACCESS_TOKEN"];

/// Identity under which ephemeral keys are registered (e.g. a service account email)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRef(pub String);

impl IdentityRef {
    /// Create a new identity reference
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A cloud instance that must be resolved to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Instance name
    pub name: String,
    /// Zone the instance lives in (falls back to the tunnel's zone)
    #[serde(default)]
    pub zone: Option<String>,
    /// Owning project (falls back to the tunnel's project)
    #[serde(default)]
    pub project: Option<String>,
}

impl InstanceRef {
    /// Create an instance reference with no scoping
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: None,
            project: None,
        }
    }

    /// Fill in zone and project from outer defaults where unset
    pub fn scoped(&self, zone: Option<&str>, project: Option<&str>) -> Self {
        Self {
            name: self.name.clone(),
            zone: self.zone.clone().or_else(|| zone.map(str::to_string)),
            project: self.project.clone().or_else(|| project.map(str::to_string)),
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.project, &self.zone) {
            (Some(project), Some(zone)) => write!(f, "{}/{}/{}", project, zone, self.name),
            (None, Some(zone)) => write!(f, "{}/{}", zone, self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// What the tunnel connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelTarget {
    /// A directly reachable host name or address
    Host(String),
    /// An instance whose address is looked up through a resolver
    Instance(InstanceRef),
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelTarget::Host(host) => write!(f, "{}", host),
            TunnelTarget::Instance(instance) => write!(f, "instance {}", instance),
        }
    }
}

/// Where the tunnel gets its credentials from
///
/// Directory and resolver calls are authorized either by an explicit access
/// token or by tokens minted from a service account key file. The SSH key
/// file is only handed to an external helper process.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSource {
    /// Explicit OAuth access token
    pub access_token: Option<String>,
    /// Google service account key (JSON) used to mint access tokens
    pub service_account_file: Option<PathBuf>,
    /// Private key file passed to the helper process
    pub key_file: Option<PathBuf>,
}

impl CredentialSource {
    /// Credentials backed by an explicit access token
    pub fn with_access_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Credentials backed by a service account key file
    pub fn with_service_account_file(path: impl Into<PathBuf>) -> Self {
        Self {
            service_account_file: Some(path.into()),
            ..Self::default()
        }
    }

    /// Credentials backed by a private key file
    pub fn with_key_file(path: impl Into<PathBuf>) -> Self {
        Self {
            key_file: Some(path.into()),
            ..Self::default()
        }
    }

    /// Resolve the access token, falling back to the environment
    pub fn access_token(&self) -> Result<String, DirectoryError> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }

        ACCESS_TOKEN_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .ok_or_else(|| {
                DirectoryError::Credentials(format!(
                    "no access token configured and none of {} is set",
                    ACCESS_TOKEN_ENV_VARS.join(", ")
                ))
            })
    }

    /// Service account key file, if any
    pub fn service_account_file(&self) -> Option<&Path> {
        self.service_account_file.as_deref()
    }

    /// Key file reference, if any
    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }
}

// Tokens must never end up in logs
impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSource")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("service_account_file", &self.service_account_file)
            .field("key_file", &self.key_file)
            .finish()
    }
}

/// A POSIX account the directory allows the identity to log in as
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PosixAccount {
    /// Login name
    pub username: String,
    /// Whether this is the identity's primary account
    pub primary: bool,
    /// Numeric user id, as reported by the directory
    pub uid: Option<String>,
}

/// A public key registered with the directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshPublicKey {
    /// OpenSSH formatted public key
    pub key: String,
    /// Directory-assigned fingerprint
    pub fingerprint: Option<String>,
    /// Expiration time in microseconds since the epoch
    pub expiration_time_usec: Option<String>,
}

/// Directory record for an identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginProfile {
    /// Resource name of the profile
    pub name: String,
    /// Accounts the identity may log in as
    pub posix_accounts: Vec<PosixAccount>,
    /// Registered keys indexed by fingerprint
    pub ssh_public_keys: HashMap<String, SshPublicKey>,
}

impl LoginProfile {
    /// Username of the first allowed account
    pub fn primary_username(&self) -> Option<&str> {
        self.posix_accounts
            .first()
            .map(|account| account.username.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Fingerprint under which `public_key` is registered, if it is
    pub fn find_fingerprint(&self, public_key: &str) -> Option<&str> {
        self.ssh_public_keys
            .iter()
            .find(|(_, registered)| same_public_key(&registered.key, public_key))
            .map(|(fingerprint, _)| fingerprint.as_str())
    }
}

/// Compare two OpenSSH public keys by type and body, ignoring comments
pub fn same_public_key(a: &str, b: &str) -> bool {
    let mut a = a.split_whitespace();
    let mut b = b.split_whitespace();
    match (a.next(), a.next(), b.next(), b.next()) {
        (Some(a_type), Some(a_body), Some(b_type), Some(b_body)) => {
            a_type == b_type && a_body == b_body
        }
        _ => false,
    }
}

/// Tunnel session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session created, nothing started yet
    Init,
    /// Backend is authenticating
    Authenticating,
    /// Backend is ready, local listener being bound
    Listening,
    /// Local port bound and forwarding
    Active,
    /// Teardown in progress
    Closing,
    /// Session ended after being active or aborted
    Closed,
    /// Session ended without ever becoming active
    Failed,
}

impl SessionState {
    /// Whether the session has finished
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Authenticating => "authenticating",
            SessionState::Listening => "listening",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
