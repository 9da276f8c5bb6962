//! Core error types for ephemeral-tunnel

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by a tunnel session.
///
/// Cloneable so a single outcome can be handed to every waiter on a
/// [`TunnelHandle`](../../et_tunnel/session/struct.TunnelHandle.html).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The ephemeral key was rejected or a directory call failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The authenticate phase did not finish in time
    #[error("Authentication timed out after {0:?}")]
    AuthenticationTimeout(Duration),

    /// The local listener could not be bound
    #[error("Failed to listen on local port {port}: {reason}")]
    Listen { port: u16, reason: String },

    /// A single forwarding channel failed to open
    #[error("Forward channel failed: {0}")]
    Channel(String),

    /// The transport or helper process ended unexpectedly
    #[error("Backend closed: {0}")]
    BackendClosed(String),

    /// The ephemeral key could not be removed from the directory
    #[error("Credential cleanup failed: {0}")]
    Cleanup(String),

    /// The session was closed before setup completed
    #[error("Tunnel closed before setup completed")]
    Aborted,

    /// The tunnel configuration cannot be used
    #[error("Invalid tunnel configuration: {0}")]
    Config(String),
}

impl TunnelError {
    /// Whether this error is a local port conflict
    pub fn is_listen(&self) -> bool {
        matches!(self, TunnelError::Listen { .. })
    }
}

impl From<DirectoryError> for TunnelError {
    fn from(err: DirectoryError) -> Self {
        TunnelError::Authentication(err.to_string())
    }
}

impl From<ResolveError> for TunnelError {
    fn from(err: ResolveError) -> Self {
        TunnelError::Authentication(err.to_string())
    }
}

impl From<ConfigError> for TunnelError {
    fn from(err: ConfigError) -> Self {
        TunnelError::Config(err.to_string())
    }
}

/// Errors returned by a directory service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The request never produced a response
    #[error("Directory request failed: {0}")]
    Request(String),

    /// The service answered with a non-success status
    #[error("Directory returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be understood
    #[error("Unexpected directory response: {0}")]
    InvalidResponse(String),

    /// No usable credentials were supplied
    #[error("No credentials available: {0}")]
    Credentials(String),
}

/// Errors returned by an address resolver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Instance lookup failed
    #[error("Instance lookup failed: {0}")]
    Lookup(String),

    /// The instance has no externally reachable address
    #[error("Instance {0} has no public address")]
    NoAddress(String),

    /// Project or zone could not be determined
    #[error("Missing instance scope: {0}")]
    MissingScope(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
