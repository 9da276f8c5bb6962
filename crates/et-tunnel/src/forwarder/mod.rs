//! Local listener and connection forwarding
//!
//! Binds one loopback listener and pipes every accepted connection through
//! its own forwarding channel on the session's backend. Connections are
//! tracked in a [`ConnectionRegistry`] so close can force them all shut.

mod meter;
mod registry;

pub use registry::{ConnectionEntry, ConnectionId, ConnectionRegistry};

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use et_core::TunnelError;

use crate::backend::TransportBackend;

use meter::Metered;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Snapshot of forwarding counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Connections accepted since listen
    pub accepted: u64,
    /// Connections currently open
    pub active: u64,
    /// Bytes sent from local clients to the remote side
    pub bytes_sent: u64,
    /// Bytes received from the remote side
    pub bytes_received: u64,
    /// Connections dropped because no channel could be opened
    pub failed_channels: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    failed_channels: AtomicU64,
}

/// Accepts local connections and forwards them over a backend
pub struct ConnectionForwarder {
    registry: Arc<ConnectionRegistry>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_port: OnceLock<u16>,
}

impl ConnectionForwarder {
    /// Create an idle forwarder
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
            local_port: OnceLock::new(),
        }
    }

    /// Bind `127.0.0.1:preferred_port` (0 for any) and start accepting.
    ///
    /// Every accepted connection is forwarded to `remote_host:remote_port`
    /// through `backend`. Returns the bound port.
    pub async fn listen(
        &self,
        preferred_port: u16,
        backend: Arc<dyn TransportBackend>,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16, TunnelError> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() || self.cancel.is_cancelled() {
            return Err(TunnelError::Listen {
                port: preferred_port,
                reason: "Forwarder already used".to_string(),
            });
        }

        let listener = TcpListener::bind(("127.0.0.1", preferred_port))
            .await
            .map_err(|e| bind_error(preferred_port, e))?;
        let port = listener
            .local_addr()
            .map_err(|e| TunnelError::Listen {
                port: preferred_port,
                reason: format!("Failed to get bound address: {}", e),
            })?
            .port();

        let forward = Arc::new(Forward {
            backend,
            remote_host: remote_host.to_string(),
            remote_port,
            registry: Arc::clone(&self.registry),
            counters: Arc::clone(&self.counters),
        });
        *accept_task = Some(tokio::spawn(accept_loop(
            listener,
            forward,
            self.cancel.clone(),
        )));
        let _ = self.local_port.set(port);

        tracing::info!(
            "Forwarding 127.0.0.1:{} -> {}:{}",
            port,
            remote_host,
            remote_port
        );
        Ok(port)
    }

    /// Bound port, once listening
    pub fn local_port(&self) -> Option<u16> {
        self.local_port.get().copied()
    }

    /// Stop accepting and force-close every open connection
    pub async fn close(&self) {
        self.cancel.cancel();

        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        let entries = self.registry.drain();
        if !entries.is_empty() {
            tracing::debug!("Force-closing {} connection(s)", entries.len());
        }
        for entry in entries {
            entry.terminate();
        }
    }

    /// Number of open connections
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Current counters
    pub fn stats(&self) -> ForwardStats {
        ForwardStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            active: self.registry.len() as u64,
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            failed_channels: self.counters.failed_channels.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionForwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_error(port: u16, e: std::io::Error) -> TunnelError {
    let reason = match e.kind() {
        ErrorKind::AddrInUse => "Address already in use".to_string(),
        ErrorKind::PermissionDenied => {
            "Permission denied; ports below 1024 need elevated privileges".to_string()
        }
        _ => e.to_string(),
    };
    TunnelError::Listen { port, reason }
}

/// Shared state of one listening forwarder
struct Forward {
    backend: Arc<dyn TransportBackend>,
    remote_host: String,
    remote_port: u16,
    registry: Arc<ConnectionRegistry>,
    counters: Arc<Counters>,
}

async fn accept_loop(listener: TcpListener, forward: Arc<Forward>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = listener.accept() => match result {
                Ok((socket, peer)) => forward.spawn_pipe(socket, peer, cancel.child_token()),
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    tracing::debug!("Listener closed");
}

/// Removes a connection from the registry when its task ends
struct Tracked {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl Forward {
    fn spawn_pipe(self: &Arc<Self>, socket: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        let id = self.registry.register(peer, cancel.clone());
        tracing::debug!("Accepted {} from {}", id, peer);

        let forward = Arc::clone(self);
        let task = tokio::spawn(async move { forward.pipe(id, socket, cancel).await });
        self.registry.attach(id, task.abort_handle());
    }

    async fn pipe(&self, id: ConnectionId, socket: TcpStream, cancel: CancellationToken) {
        let _tracked = Tracked {
            registry: Arc::clone(&self.registry),
            id,
        };

        let channel = tokio::select! {
            _ = cancel.cancelled() => return,
            channel = self.backend.open_forward_channel(&self.remote_host, self.remote_port) => channel,
        };
        let mut channel = match channel {
            Ok(channel) => channel,
            Err(e) => {
                self.counters.failed_channels.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}: {}", id, e);
                return;
            }
        };

        let mut socket = Metered::new(
            socket,
            Arc::clone(&self.counters.bytes_sent),
            Arc::clone(&self.counters.bytes_received),
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("{} force-closed", id);
            }
            result = tokio::io::copy_bidirectional(&mut socket, &mut channel) => match result {
                Ok((sent, received)) => {
                    tracing::debug!("{} closed ({} bytes out, {} bytes in)", id, sent, received);
                }
                Err(e) => {
                    tracing::debug!("{} ended: {}", id, e);
                }
            }
        }
    }
}
