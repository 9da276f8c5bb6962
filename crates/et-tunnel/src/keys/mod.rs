//! Ephemeral key registration
//!
//! Each session generates one Ed25519 key pair, registers its public half with
//! the directory service for the session's identity and revokes it again on
//! teardown. Registration and revocation for one identity are serialized
//! across every session through [`KeyLocks`].

mod locks;

pub use locks::KeyLocks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use tokio::sync::{Mutex, OnceCell};

use et_core::traits::DirectoryService;
use et_core::{IdentityRef, LoginProfile, TunnelError};

/// Generates, registers and revokes a session's ephemeral key
pub struct EphemeralKeyManager {
    /// Directory the key is registered with
    directory: Arc<dyn DirectoryService>,
    /// Per-identity write locks
    locks: Arc<KeyLocks>,
    /// Identity override; looked up from the directory when unset
    account: Option<IdentityRef>,
    /// Lazily generated key pair
    key: OnceCell<Arc<KeyPair>>,
    /// Lazily resolved identity
    identity: OnceCell<IdentityRef>,
    /// Profile returned by the registration, if it happened
    profile: Mutex<Option<LoginProfile>>,
    /// Set once revocation has been attempted
    revoked: AtomicBool,
}

impl EphemeralKeyManager {
    /// Create a key manager registering with `directory`
    pub fn new(directory: Arc<dyn DirectoryService>, locks: Arc<KeyLocks>) -> Self {
        Self {
            directory,
            locks,
            account: None,
            key: OnceCell::new(),
            identity: OnceCell::new(),
            profile: Mutex::new(None),
            revoked: AtomicBool::new(false),
        }
    }

    /// Register under `account` instead of asking the directory who we are
    pub fn with_account(mut self, account: impl Into<IdentityRef>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// The session's key pair, generated on first use
    pub async fn generate_key(&self) -> Result<Arc<KeyPair>, TunnelError> {
        self.key
            .get_or_try_init(|| async {
                tracing::debug!("Generating ephemeral Ed25519 key");
                KeyPair::generate_ed25519().map(Arc::new).ok_or_else(|| {
                    TunnelError::Authentication("Failed to generate ephemeral key".to_string())
                })
            })
            .await
            .map(Arc::clone)
    }

    /// OpenSSH encoding of the public key (`ssh-ed25519 AAAA...`)
    pub async fn public_key(&self) -> Result<String, TunnelError> {
        let key = self.generate_key().await?;
        let public = key.clone_public_key().map_err(|e| {
            TunnelError::Authentication(format!("Failed to derive public key: {}", e))
        })?;
        Ok(format!("{} {}", public.name(), public.public_key_base64()))
    }

    /// Identity the key is registered under
    pub async fn identity(&self) -> Result<IdentityRef, TunnelError> {
        self.identity
            .get_or_try_init(|| async {
                match &self.account {
                    Some(account) => Ok(account.clone()),
                    None => self.directory.current_identity().await,
                }
            })
            .await
            .map(IdentityRef::clone)
            .map_err(TunnelError::from)
    }

    /// Register the public key and return the login profile.
    ///
    /// Only the first call talks to the directory; later calls return the
    /// stored profile.
    pub async fn register(&self) -> Result<LoginProfile, TunnelError> {
        let mut slot = self.profile.lock().await;
        if let Some(profile) = slot.as_ref() {
            return Ok(profile.clone());
        }

        let identity = self.identity().await?;
        let public_key = self.public_key().await?;

        let profile = {
            let _guard = self.locks.acquire(&identity).await;
            tracing::debug!("Registering ephemeral key for {}", identity);
            self.directory.import_key(&identity, &public_key).await?
        };

        tracing::info!(
            "Registered ephemeral key for {} ({} key(s) on profile)",
            identity,
            profile.ssh_public_keys.len()
        );
        *slot = Some(profile.clone());
        Ok(profile)
    }

    #[cfg(test)]
    pub(crate) async fn is_registered(&self) -> bool {
        self.profile.lock().await.is_some() && !self.revoked.load(Ordering::SeqCst)
    }

    /// Best-effort removal of the registered key.
    ///
    /// Runs at most once. A key that was never registered, or that the
    /// profile does not list, is left alone. Failures are logged and
    /// swallowed.
    pub async fn deregister(&self) {
        if self.revoked.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(profile) = self.profile.lock().await.clone() else {
            tracing::debug!("No ephemeral key registered, nothing to revoke");
            return;
        };

        match self.revoke(&profile).await {
            Ok(Some(fingerprint)) => {
                tracing::info!("Revoked ephemeral key {}", fingerprint);
            }
            Ok(None) => {
                tracing::debug!("Ephemeral key not listed on login profile, skipping revocation");
            }
            Err(e) => {
                tracing::warn!("{}", e);
            }
        }
    }

    async fn revoke(&self, profile: &LoginProfile) -> Result<Option<String>, TunnelError> {
        let public_key = self.public_key().await?;
        let Some(fingerprint) = profile.find_fingerprint(&public_key) else {
            return Ok(None);
        };

        let identity = self.identity().await?;
        let _guard = self.locks.acquire(&identity).await;
        self.directory
            .delete_key(&identity, fingerprint)
            .await
            .map_err(|e| TunnelError::Cleanup(format!("{} ({})", e, fingerprint)))?;

        Ok(Some(fingerprint.to_string()))
    }
}
