//! Tunnel session lifecycle
//!
//! A session runs as one driver task:
//!
//! ```text
//! Init -> Authenticating -> Listening -> Active -> Closing -> Closed
//!                                                      \-> Failed
//! ```
//!
//! Teardown runs exactly once, in the driver, whatever triggered it: an
//! explicit close, the backend going away, or a setup error.

mod handle;

pub use handle::{CloseReason, TunnelCloser, TunnelHandle};

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use et_core::config::{BackendConfig, TunnelConfig};
use et_core::traits::{AddressResolver, DirectoryService};
use et_core::{SessionState, TunnelError};

use crate::backend::{
    ProcessBackend, ProcessLauncher, ProtocolBackend, Readiness, TokioLauncher, TransportBackend,
};
use crate::forwarder::ConnectionForwarder;
use crate::keys::{EphemeralKeyManager, KeyLocks};
use crate::transport::{SshConnector, TransportConnector};
use handle::SetupResult;

/// External services a session depends on.
///
/// Unset collaborators fall back to the defaults: [`SshConnector`],
/// [`TokioLauncher`] and the process-wide [`KeyLocks::shared`] table. The
/// protocol backend needs a directory; instance targets need a resolver.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub resolver: Option<Arc<dyn AddressResolver>>,
    pub directory: Option<Arc<dyn DirectoryService>>,
    pub connector: Option<Arc<dyn TransportConnector>>,
    pub launcher: Option<Arc<dyn ProcessLauncher>>,
    pub key_locks: Option<Arc<KeyLocks>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_key_locks(mut self, key_locks: Arc<KeyLocks>) -> Self {
        self.key_locks = Some(key_locks);
        self
    }
}

/// Entry point for tunnel sessions
pub struct TunnelSession;

impl TunnelSession {
    /// Start a session and return its handle immediately.
    ///
    /// Setup continues in the background; await
    /// [`TunnelHandle::local_port`] for the outcome. Must be called from
    /// within a tokio runtime.
    pub fn start(config: TunnelConfig, collaborators: Collaborators) -> TunnelHandle {
        let close = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Init);
        let (setup_tx, setup_rx) = watch::channel::<SetupResult>(None);
        let (closed_tx, closed_rx) = watch::channel(None);
        let forwarder = Arc::new(ConnectionForwarder::new());

        let handle = TunnelHandle::new(
            TunnelCloser::new(close.clone(), state_rx),
            setup_rx,
            closed_rx,
            Arc::clone(&forwarder),
        );

        let built = config
            .validate()
            .map_err(TunnelError::from)
            .and_then(|()| build_backend(&config, &collaborators));

        match built {
            Ok((backend, keys)) => {
                tracing::debug!(
                    "Starting {} tunnel to {}",
                    backend.name(),
                    config
                        .target
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
                let driver = Driver {
                    config,
                    backend,
                    keys,
                    forwarder,
                    close,
                    state: state_tx,
                    setup: setup_tx,
                    closed: closed_tx,
                };
                tokio::spawn(driver.run());
            }
            Err(err) => {
                tracing::warn!("Tunnel not started: {}", err);
                setup_tx.send_replace(Some(Err(err.clone())));
                closed_tx.send_replace(Some(CloseReason::Failed(err)));
                state_tx.send_replace(SessionState::Failed);
            }
        }

        handle
    }
}

/// Pick and construct the backend named by the configuration
fn build_backend(
    config: &TunnelConfig,
    collaborators: &Collaborators,
) -> Result<(Arc<dyn TransportBackend>, Option<Arc<EphemeralKeyManager>>), TunnelError> {
    match &config.backend {
        BackendConfig::Protocol(settings) => {
            let directory = collaborators.directory.clone().ok_or_else(|| {
                TunnelError::Config("the protocol backend needs a directory service".to_string())
            })?;
            let locks = collaborators
                .key_locks
                .clone()
                .unwrap_or_else(KeyLocks::shared);

            let mut keys = EphemeralKeyManager::new(directory, locks);
            if let Some(account) = &config.account {
                keys = keys.with_account(account.as_str());
            }
            let keys = Arc::new(keys);

            let connector: Arc<dyn TransportConnector> = match &collaborators.connector {
                Some(connector) => Arc::clone(connector),
                None => Arc::new(SshConnector::new(settings)),
            };
            let backend = ProtocolBackend::new(
                config,
                Arc::clone(&keys),
                connector,
                collaborators.resolver.clone(),
            )?;
            Ok((Arc::new(backend), Some(keys)))
        }
        BackendConfig::Process(settings) => {
            let launcher: Arc<dyn ProcessLauncher> = match &collaborators.launcher {
                Some(launcher) => Arc::clone(launcher),
                None => Arc::new(TokioLauncher),
            };
            let backend = ProcessBackend::new(
                config,
                settings.clone(),
                launcher,
                collaborators.resolver.clone(),
            )?;
            Ok((Arc::new(backend), None))
        }
    }
}

/// Owns a session from start to its terminal state
struct Driver {
    config: TunnelConfig,
    backend: Arc<dyn TransportBackend>,
    keys: Option<Arc<EphemeralKeyManager>>,
    forwarder: Arc<ConnectionForwarder>,
    close: CancellationToken,
    state: watch::Sender<SessionState>,
    setup: watch::Sender<SetupResult>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl Driver {
    async fn run(self) {
        match self.establish().await {
            Ok(port) => {
                self.set_state(SessionState::Active);
                tracing::info!("Tunnel active on 127.0.0.1:{}", port);
                self.setup.send_replace(Some(Ok(port)));

                let backend_closed = self.backend.closed();
                let reason = tokio::select! {
                    biased;
                    _ = self.close.cancelled() => CloseReason::Requested,
                    _ = backend_closed.cancelled() => CloseReason::BackendClosed(
                        TunnelError::BackendClosed(format!("{} transport ended", self.backend.name())),
                    ),
                };
                match &reason {
                    CloseReason::Requested => tracing::info!("Closing tunnel"),
                    other => tracing::warn!("Tunnel closing: {:?}", other),
                }

                self.teardown().await;
                self.closed.send_replace(Some(reason));
                self.set_state(SessionState::Closed);
            }
            Err(err) => {
                match &err {
                    TunnelError::Aborted => tracing::info!("Tunnel setup aborted"),
                    other => tracing::warn!("Tunnel setup failed: {}", other),
                }

                self.teardown().await;
                let terminal = if err == TunnelError::Aborted {
                    SessionState::Closed
                } else {
                    SessionState::Failed
                };
                self.setup.send_replace(Some(Err(err.clone())));
                self.closed.send_replace(Some(CloseReason::Failed(err)));
                self.set_state(terminal);
            }
        }
    }

    /// Authenticate, then make sure something listens locally
    async fn establish(&self) -> Result<u16, TunnelError> {
        self.set_state(SessionState::Authenticating);

        let auth_timeout = self.config.auth_timeout;
        let readiness = tokio::select! {
            biased;
            _ = self.close.cancelled() => return Err(TunnelError::Aborted),
            result = tokio::time::timeout(auth_timeout, self.backend.authenticate()) => {
                result.map_err(|_| TunnelError::AuthenticationTimeout(auth_timeout))??
            }
        };

        self.set_state(SessionState::Listening);
        let port = match readiness {
            Readiness::Transport => tokio::select! {
                biased;
                _ = self.close.cancelled() => return Err(TunnelError::Aborted),
                result = self.forwarder.listen(
                    self.config.requested_local_port(),
                    Arc::clone(&self.backend),
                    &self.config.remote_host,
                    self.config.remote_port,
                ) => result?,
            },
            Readiness::Delegated { local_port } => local_port,
        };

        if self.close.is_cancelled() {
            return Err(TunnelError::Aborted);
        }
        if self.backend.closed().is_cancelled() {
            return Err(TunnelError::BackendClosed(
                "Transport ended during setup".to_string(),
            ));
        }
        Ok(port)
    }

    /// Force-close connections, stop the backend, revoke the key
    async fn teardown(&self) {
        self.set_state(SessionState::Closing);
        let limit = self.config.shutdown_timeout;

        self.forwarder.close().await;

        match tokio::time::timeout(limit, self.backend.shutdown()).await {
            Ok(Ok(())) => tracing::debug!("{} backend shut down", self.backend.name()),
            Ok(Err(e)) => tracing::warn!("Backend shutdown failed: {}", e),
            Err(_) => tracing::warn!("Backend shutdown timed out after {:?}", limit),
        }

        if let Some(keys) = &self.keys {
            if tokio::time::timeout(limit, keys.deregister()).await.is_err() {
                tracing::warn!("Key revocation timed out after {:?}", limit);
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Session state {} -> {}", previous, state);
        }
    }
}
