//! Transport backends
//!
//! A backend establishes the authenticated path a session forwards over.
//! [`ProtocolBackend`] registers an ephemeral key and speaks SSH itself;
//! [`ProcessBackend`] runs an external helper that owns the local listener.

mod helper;
mod monitor;
mod process;
mod protocol;

pub use helper::{
    pick_ephemeral_port, HelperCommand, HelperProcess, OutputReader, ProcessLauncher,
    TokioLauncher,
};
pub use monitor::{HelperLine, HelperLineCodec, HelperMonitor, HelperState, Marker, Sentinels};
pub use process::ProcessBackend;
pub use protocol::ProtocolBackend;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use et_core::config::TunnelConfig;
use et_core::traits::AddressResolver;
use et_core::{TunnelError, TunnelTarget};

use crate::transport::ForwardStream;

/// Target with the tunnel-wide zone/project applied to instances
fn scoped_target(config: &TunnelConfig) -> Result<TunnelTarget, TunnelError> {
    Ok(match config.target()? {
        TunnelTarget::Host(host) => TunnelTarget::Host(host.clone()),
        TunnelTarget::Instance(instance) => {
            TunnelTarget::Instance(config.scoped_instance(instance))
        }
    })
}

/// Network address for `target`, asking `resolver` for instances
async fn resolve_address(
    target: &TunnelTarget,
    resolver: Option<&Arc<dyn AddressResolver>>,
) -> Result<String, TunnelError> {
    match target {
        TunnelTarget::Host(host) => Ok(host.clone()),
        TunnelTarget::Instance(instance) => {
            let resolver = resolver.ok_or_else(|| {
                TunnelError::Config(format!("No address resolver for instance {}", instance))
            })?;
            let address = resolver.resolve(instance).await?;
            tracing::debug!("Resolved {} to {}", instance, address);
            Ok(address)
        }
    }
}

/// What a backend produced once authentication succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The transport is up; the session binds its own listener
    Transport,
    /// The backend already listens locally on `local_port`
    Delegated { local_port: u16 },
}

/// Pluggable transport strategy
#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Establish the authenticated transport
    async fn authenticate(&self) -> Result<Readiness, TunnelError>;

    /// Open one forwarding channel for an accepted local connection
    async fn open_forward_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardStream, TunnelError>;

    /// Cancelled when the transport ends, whether or not it was asked to
    fn closed(&self) -> CancellationToken;

    /// Tear the transport down
    async fn shutdown(&self) -> Result<(), TunnelError>;
}
