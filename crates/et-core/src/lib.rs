//! et-core: Core abstractions and configuration for ephemeral-tunnel
//!
//! This crate provides the shared types, error taxonomy, configuration
//! structures and collaborator traits used by the tunnel engine, the
//! cloud integrations and the CLI.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConfigError, DirectoryError, ResolveError, TunnelError};
pub use types::{
    CredentialSource, IdentityRef, InstanceRef, LoginProfile, PosixAccount, SessionState,
    SshPublicKey, TunnelTarget,
};
