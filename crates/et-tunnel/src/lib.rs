//! et-tunnel: ephemeral-key TCP tunnels
//!
//! A [`TunnelSession`] registers a one-time key with a directory service,
//! authenticates a transport with it, binds a loopback listener and forwards
//! every accepted connection to a fixed remote port. On close, connections
//! are force-closed, the transport is torn down and the key is revoked.
//!
//! Two transport strategies are available: [`backend::ProtocolBackend`]
//! speaks SSH directly, [`backend::ProcessBackend`] delegates to an external
//! `ssh`/`gcloud` helper and watches its output.

pub mod backend;
pub mod forwarder;
pub mod keys;
pub mod session;
pub mod transport;

pub use backend::{Readiness, TransportBackend};
pub use forwarder::{ConnectionForwarder, ForwardStats};
pub use keys::{EphemeralKeyManager, KeyLocks};
pub use session::{CloseReason, Collaborators, TunnelCloser, TunnelHandle, TunnelSession};
