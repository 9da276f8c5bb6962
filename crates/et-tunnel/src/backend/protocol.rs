//! Direct SSH backend

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use et_core::config::TunnelConfig;
use et_core::traits::AddressResolver;
use et_core::{TunnelError, TunnelTarget};

use super::{resolve_address, scoped_target, Readiness, TransportBackend};
use crate::keys::EphemeralKeyManager;
use crate::transport::{ConnectRequest, ForwardStream, Transport, TransportConnector};

/// Backend that registers an ephemeral key and speaks SSH itself
pub struct ProtocolBackend {
    target: TunnelTarget,
    ssh_port: u16,
    resolver: Option<Arc<dyn AddressResolver>>,
    keys: Arc<EphemeralKeyManager>,
    connector: Arc<dyn TransportConnector>,
    revoke_after_connect: bool,
    /// Target address, resolved once per session
    host: OnceCell<String>,
    transport: OnceCell<Arc<dyn Transport>>,
    closed: CancellationToken,
}

impl ProtocolBackend {
    pub fn new(
        config: &TunnelConfig,
        keys: Arc<EphemeralKeyManager>,
        connector: Arc<dyn TransportConnector>,
        resolver: Option<Arc<dyn AddressResolver>>,
    ) -> Result<Self, TunnelError> {
        let target = scoped_target(config)?;
        if matches!(target, TunnelTarget::Instance(_)) && resolver.is_none() {
            return Err(TunnelError::Config(
                "instance targets need an address resolver".to_string(),
            ));
        }

        Ok(Self {
            target,
            ssh_port: config.ssh_port,
            resolver,
            keys,
            connector,
            revoke_after_connect: config.revoke_after_connect,
            host: OnceCell::new(),
            transport: OnceCell::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Key manager backing this backend
    pub fn keys(&self) -> &Arc<EphemeralKeyManager> {
        &self.keys
    }

    async fn host(&self) -> Result<&String, TunnelError> {
        self.host
            .get_or_try_init(|| resolve_address(&self.target, self.resolver.as_ref()))
            .await
    }
}

#[async_trait]
impl TransportBackend for ProtocolBackend {
    fn name(&self) -> &'static str {
        "protocol"
    }

    async fn authenticate(&self) -> Result<Readiness, TunnelError> {
        let profile = self.keys.register().await?;
        let username = profile
            .primary_username()
            .ok_or_else(|| {
                TunnelError::Authentication(format!(
                    "Login profile {} has no POSIX account",
                    profile.name
                ))
            })?
            .to_string();

        let host = self.host().await?.clone();
        let key = self.keys.generate_key().await?;
        let transport = self
            .connector
            .connect(ConnectRequest {
                host,
                port: self.ssh_port,
                username,
                key,
                closed: self.closed.clone(),
            })
            .await?;

        if self.transport.set(transport).is_err() {
            tracing::debug!("Transport already established, keeping the first one");
        }

        if self.revoke_after_connect {
            self.keys.deregister().await;
        }

        Ok(Readiness::Transport)
    }

    async fn open_forward_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardStream, TunnelError> {
        let transport = self
            .transport
            .get()
            .ok_or_else(|| TunnelError::Channel("Transport not established".to_string()))?;
        transport.open_direct_tcpip(remote_host, remote_port).await
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn shutdown(&self) -> Result<(), TunnelError> {
        match self.transport.get() {
            Some(transport) => transport.disconnect().await,
            None => Ok(()),
        }
    }
}
