//! SSH transport built on russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use tokio_util::sync::CancellationToken;

use et_core::config::ProtocolBackendConfig;
use et_core::TunnelError;

use super::{ConnectRequest, ForwardStream, Transport, TransportConnector};

/// Connects to the target's SSH server with the ephemeral key
#[derive(Debug, Clone)]
pub struct SshConnector {
    /// TCP connect + handshake timeout
    connect_timeout: Duration,
    /// Host key fingerprint to insist on, if any
    expected_host_key: Option<String>,
}

impl SshConnector {
    /// Create a connector from backend settings
    pub fn new(config: &ProtocolBackendConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            expected_host_key: config.expected_host_key.clone(),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(&ProtocolBackendConfig::default())
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn Transport>, TunnelError> {
        let ssh_config = Arc::new(Config::default());
        let handler = ClientHandler::new(self.expected_host_key.clone(), request.closed.clone());
        let address = format!("{}:{}", request.host, request.port);

        tracing::debug!("Connecting to {}", address);
        let mut session = tokio::time::timeout(
            self.connect_timeout,
            client::connect(ssh_config, (request.host.as_str(), request.port), handler),
        )
        .await
        .map_err(|_| TunnelError::Authentication(format!("Connection to {} timed out", address)))?
        .map_err(|e| {
            TunnelError::Authentication(format!("Failed to connect to {}: {}", address, e))
        })?;

        tracing::debug!("Authenticating as user '{}'", request.username);
        let authenticated = session
            .authenticate_publickey(request.username.as_str(), Arc::clone(&request.key))
            .await
            .map_err(|e| TunnelError::Authentication(format!("Authentication error: {}", e)))?;

        if !authenticated {
            return Err(TunnelError::Authentication(format!(
                "Ephemeral key rejected for user '{}' on {}",
                request.username, address
            )));
        }

        tracing::info!("SSH transport to {} authenticated", address);
        Ok(Arc::new(SshTransport { session }))
    }
}

/// An authenticated russh client session
struct SshTransport {
    session: Handle<ClientHandler>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ForwardStream, TunnelError> {
        let channel = self
            .session
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                TunnelError::Channel(format!("direct-tcpip to {}:{} refused: {}", host, port, e))
            })?;

        Ok(Box::pin(channel.into_stream()))
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        self.session
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
            .map_err(|e| TunnelError::BackendClosed(format!("SSH disconnect failed: {}", e)))
    }
}

/// SSH client handler for the tunnel transport
struct ClientHandler {
    /// Expected host key fingerprint
    expected_host_key: Option<String>,
    /// Cancelled when russh drops the handler, i.e. the connection ended
    closed: CancellationToken,
}

impl ClientHandler {
    fn new(expected_host_key: Option<String>, closed: CancellationToken) -> Self {
        Self {
            expected_host_key,
            closed,
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        tracing::debug!("SSH connection ended");
        self.closed.cancel();
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key
    ///
    /// The target's address comes from the resolver and the key is disposable,
    /// so any host key is accepted unless a fingerprint was configured.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: {}", fingerprint);

        match &self.expected_host_key {
            Some(expected) if *expected != fingerprint => {
                tracing::warn!(
                    "Host key mismatch: expected {}, got {}",
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}
