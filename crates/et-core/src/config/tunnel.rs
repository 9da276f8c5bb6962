//! Tunnel configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration;
use crate::error::ConfigError;
use crate::types::{CredentialSource, InstanceRef, TunnelTarget};

/// Everything a tunnel session needs to know before it starts.
///
/// Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Host or instance to tunnel to
    pub target: Option<TunnelTarget>,

    /// Port on the remote side to forward to
    pub remote_port: u16,

    /// Host the remote side connects to, as seen from the target
    pub remote_host: String,

    /// Fixed local port; `None` or 0 lets the OS pick one
    pub local_port: Option<u16>,

    /// SSH port on the target
    pub ssh_port: u16,

    /// Credentials for the directory service and helper process
    pub credentials: CredentialSource,

    /// Default project for instance lookups and key registration
    pub project: Option<String>,

    /// Default zone for instance lookups
    pub zone: Option<String>,

    /// Identity to register keys under; looked up from the credentials if unset
    pub account: Option<String>,

    /// Deadline for the whole authenticate phase
    #[serde(with = "duration")]
    pub auth_timeout: Duration,

    /// Upper bound on backend teardown and key cleanup during close
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,

    /// Remove the ephemeral key as soon as the transport is authenticated
    pub revoke_after_connect: bool,

    /// Transport strategy
    pub backend: BackendConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            target: None,
            remote_port: 0,
            remote_host: "localhost".to_string(),
            local_port: None,
            ssh_port: 22,
            credentials: CredentialSource::default(),
            project: None,
            zone: None,
            account: None,
            auth_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            revoke_after_connect: false,
            backend: BackendConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Configuration for `target`, forwarding to `remote_port`
    pub fn new(target: TunnelTarget, remote_port: u16) -> Self {
        Self {
            target: Some(target),
            remote_port,
            ..Self::default()
        }
    }

    /// Pin the local port
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Select the transport strategy
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Set the credential source
    pub fn with_credentials(mut self, credentials: CredentialSource) -> Self {
        self.credentials = credentials;
        self
    }

    /// The configured target, or an error if none was given
    pub fn target(&self) -> Result<&TunnelTarget, ConfigError> {
        self.target
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("target".to_string()))
    }

    /// Instance reference with the tunnel-wide zone/project applied
    pub fn scoped_instance(&self, instance: &InstanceRef) -> InstanceRef {
        instance.scoped(self.zone.as_deref(), self.project.as_deref())
    }

    /// Local port to request from the OS (0 means any)
    pub fn requested_local_port(&self) -> u16 {
        self.local_port.unwrap_or(0)
    }

    /// The local port the user fixed, if any; 0 counts as unset
    pub fn pinned_local_port(&self) -> Option<u16> {
        self.local_port.filter(|port| *port != 0)
    }

    /// Check the configuration for values a session cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let target = self.target()?;

        if self.remote_port == 0 {
            return Err(ConfigError::Invalid("remote_port must be non-zero".to_string()));
        }
        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::Invalid("remote_host must not be empty".to_string()));
        }
        if self.auth_timeout.is_zero() {
            return Err(ConfigError::Invalid("auth_timeout must be non-zero".to_string()));
        }

        if let BackendConfig::Process(process) = &self.backend {
            if process.helper == HelperKind::Gcloud && !matches!(target, TunnelTarget::Instance(_)) {
                return Err(ConfigError::Invalid(
                    "the gcloud helper needs an instance target".to_string(),
                ));
            }
            if process.ready_marker.trim().is_empty()
                || process.address_in_use_marker.trim().is_empty()
            {
                return Err(ConfigError::Invalid(
                    "helper output markers must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Which transport strategy a session uses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Speak SSH directly with a freshly registered key
    Protocol(ProtocolBackendConfig),
    /// Delegate to an external helper process
    Process(ProcessBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Protocol(ProtocolBackendConfig::default())
    }
}

impl BackendConfig {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Protocol(_) => "protocol",
            BackendConfig::Process(_) => "process",
        }
    }
}

/// Settings for the direct SSH backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolBackendConfig {
    /// TCP connect + handshake timeout
    #[serde(with = "duration")]
    pub connect_timeout: Duration,

    /// Expected host key fingerprint; any key is accepted when unset
    pub expected_host_key: Option<String>,
}

impl Default for ProtocolBackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            expected_host_key: None,
        }
    }
}

/// External helper flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperKind {
    /// OpenSSH client
    Ssh,
    /// `gcloud compute ssh`
    Gcloud,
}

impl HelperKind {
    /// Executable name used when no program is configured
    pub fn default_program(self) -> &'static str {
        match self {
            HelperKind::Ssh => "ssh",
            HelperKind::Gcloud => "gcloud",
        }
    }
}

/// Settings for the helper-process backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    /// Helper flavour
    pub helper: HelperKind,

    /// Executable to run instead of the flavour's default
    pub program: Option<PathBuf>,

    /// Login user for the ssh helper
    pub ssh_user: Option<String>,

    /// Extra arguments appended before the destination
    pub extra_args: Vec<String>,

    /// Respawns allowed after a local port conflict
    pub max_port_retries: u32,

    /// Time between closing stdin and killing the helper
    #[serde(with = "duration")]
    pub shutdown_grace: Duration,

    /// Output token that means the forward is up
    pub ready_marker: String,

    /// Output token that means the local port was taken
    pub address_in_use_marker: String,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            helper: HelperKind::Ssh,
            program: None,
            ssh_user: None,
            extra_args: vec![],
            max_port_retries: 5,
            shutdown_grace: Duration::from_secs(5),
            ready_marker: "Entering interactive session".to_string(),
            address_in_use_marker: "Address already in use".to_string(),
        }
    }
}
