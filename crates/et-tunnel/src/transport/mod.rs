//! Authenticated transports that carry forwarding channels
//!
//! A [`TransportConnector`] turns an address, a username and a key into a
//! live [`Transport`]. The default connector speaks SSH via russh; tests and
//! embedders can plug in their own.

mod ssh;

pub use ssh::SshConnector;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use et_core::TunnelError;

/// Duplex byte stream bound to one remote host:port
pub trait ForwardIo: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> ForwardIo for T {}

/// Boxed forwarding channel
pub type ForwardStream = Pin<Box<dyn ForwardIo>>;

/// Everything needed to open and authenticate a transport
pub struct ConnectRequest {
    /// Address of the target
    pub host: String,
    /// Port of the target's SSH service
    pub port: u16,
    /// Login name taken from the login profile
    pub username: String,
    /// Ephemeral key registered for this session
    pub key: Arc<KeyPair>,
    /// Cancelled by the transport when it goes away
    pub closed: CancellationToken,
}

/// Opens authenticated transports
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect and authenticate; rejection maps to `TunnelError::Authentication`
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn Transport>, TunnelError>;
}

/// A live, authenticated transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one forwarding channel to `host:port` as seen from the target
    async fn open_direct_tcpip(&self, host: &str, port: u16)
        -> Result<ForwardStream, TunnelError>;

    /// Close the transport
    async fn disconnect(&self) -> Result<(), TunnelError>;
}
