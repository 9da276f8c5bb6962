//! Caller-facing session handle

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use et_core::{SessionState, TunnelError};

use crate::forwarder::{ConnectionForwarder, ForwardStats};

/// Why an established session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Requested,
    /// The transport or helper went away on its own
    BackendClosed(TunnelError),
    /// The session never became active
    Failed(TunnelError),
}

pub(crate) type SetupResult = Option<Result<u16, TunnelError>>;

/// Cloneable trigger for closing a session
#[derive(Debug, Clone)]
pub struct TunnelCloser {
    close: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl TunnelCloser {
    pub(crate) fn new(close: CancellationToken, state: watch::Receiver<SessionState>) -> Self {
        Self { close, state }
    }

    /// Request close without waiting for it
    pub fn trigger(&self) {
        self.close.cancel();
    }

    /// Request close and wait until the session has fully wound down.
    ///
    /// Calling this more than once, or after the session ended on its own,
    /// returns as soon as the session is in a terminal state.
    pub async fn close(&self) {
        self.close.cancel();
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Handle to a running tunnel session.
///
/// Returned immediately by [`TunnelSession::start`](super::TunnelSession::start);
/// `close` works before setup has finished. Dropping the handle closes the
/// session.
pub struct TunnelHandle {
    closer: TunnelCloser,
    setup: watch::Receiver<SetupResult>,
    close_reason: watch::Receiver<Option<CloseReason>>,
    forwarder: Arc<ConnectionForwarder>,
}

impl TunnelHandle {
    pub(crate) fn new(
        closer: TunnelCloser,
        setup: watch::Receiver<SetupResult>,
        close_reason: watch::Receiver<Option<CloseReason>>,
        forwarder: Arc<ConnectionForwarder>,
    ) -> Self {
        Self {
            closer,
            setup,
            close_reason,
            forwarder,
        }
    }

    /// Wait for setup and return the local port, or the error that stopped it
    pub async fn local_port(&self) -> Result<u16, TunnelError> {
        let mut setup = self.setup.clone();
        let result = setup
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TunnelError::Aborted)?
            .clone();
        result.unwrap_or(Err(TunnelError::Aborted))
    }

    /// Close the session and wait for teardown to finish
    pub async fn close(&self) {
        self.closer.close().await;
    }

    /// A cloneable close trigger
    pub fn closer(&self) -> TunnelCloser {
        self.closer.clone()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.closer.state()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.closer.state.clone()
    }

    /// Wait until the session ends and report why
    pub async fn closed(&self) -> CloseReason {
        let mut close_reason = self.close_reason.clone();
        let reason = match close_reason.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| {
            CloseReason::Failed(TunnelError::BackendClosed(
                "Session driver stopped".to_string(),
            ))
        })
    }

    /// Forwarding counters
    pub fn stats(&self) -> ForwardStats {
        self.forwarder.stats()
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.closer.trigger();
    }
}
