//! Directory service trait

use async_trait::async_trait;

use crate::error::DirectoryError;
use crate::types::{IdentityRef, LoginProfile};

/// Identity/key registration service.
///
/// Implementations are not expected to be safe for concurrent writers on the
/// same identity; callers serialize `import_key`/`delete_key` per identity.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Identity the configured credentials act as
    async fn current_identity(&self) -> Result<IdentityRef, DirectoryError>;

    /// Register an OpenSSH public key for `identity` and return the refreshed profile
    async fn import_key(
        &self,
        identity: &IdentityRef,
        public_key: &str,
    ) -> Result<LoginProfile, DirectoryError>;

    /// Remove the key registered under `fingerprint`
    async fn delete_key(
        &self,
        identity: &IdentityRef,
        fingerprint: &str,
    ) -> Result<(), DirectoryError>;
}
