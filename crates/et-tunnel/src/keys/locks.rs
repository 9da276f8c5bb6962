//! Per-identity serialization of directory writes

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use et_core::IdentityRef;

/// Async locks keyed by identity.
///
/// The directory's key list for one identity must not be modified by two
/// callers at once. Distinct identities never contend.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<IdentityRef, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Create an independent lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock table shared by every session in the process
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<KeyLocks>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(KeyLocks::new())))
    }

    /// Wait for exclusive access to `identity`'s key list
    pub async fn acquire(&self, identity: &IdentityRef) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            &self
                .locks
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        lock.lock_owned().await
    }

    /// Number of identities seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if no identity has been locked yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_identity_is_exclusive() {
        let locks = KeyLocks::new();
        let identity = IdentityRef::new("svc@example.com");

        let guard = locks.acquire(&identity).await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&identity)).await;
        assert!(blocked.is_err());

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(&identity)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_identities_do_not_contend() {
        let locks = KeyLocks::new();
        let _a = locks.acquire(&IdentityRef::new("a@example.com")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(&IdentityRef::new("b@example.com")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_shared_is_process_wide() {
        assert!(Arc::ptr_eq(&KeyLocks::shared(), &KeyLocks::shared()));
    }
}
