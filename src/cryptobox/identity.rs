//! Local identity management.

use crate::crypto::IdentityKeyPair;
use crate::store::CryptoboxStore;
use crate::utils::Result;
use log::info;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Loads the local identity from a store, creating it on first use.
///
/// Concurrent callers on the same manager share a single load-or-create
/// attempt. Creation itself runs under the store's
/// [`identity_lock`](CryptoboxStore::identity_lock) and loads again before
/// generating, so managers on the same store never create two identities.
/// A failed attempt is not cached and the next call tries again.
pub struct IdentityManager<S: ?Sized> {
    store: Arc<S>,
    identity: OnceCell<IdentityKeyPair>,
}

impl<S: CryptoboxStore + ?Sized> IdentityManager<S> {
    /// Create a manager for `store`
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            identity: OnceCell::new(),
        }
    }

    /// The store this manager reads from
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Return the stored identity, generating and saving one if absent
    ///
    /// # Errors
    ///
    /// Propagates store failures from loading or saving the identity
    pub async fn get_or_create_identity(&self) -> Result<&IdentityKeyPair> {
        self.identity.get_or_try_init(|| self.load_or_create()).await
    }

    async fn load_or_create(&self) -> Result<IdentityKeyPair> {
        if let Some(identity) = self.store.load_identity().await? {
            info!("Loaded identity {}", identity.fingerprint());
            return Ok(identity);
        }

        let _guard = self.store.identity_lock().lock().await;
        if let Some(identity) = self.store.load_identity().await? {
            info!("Loaded identity {} created concurrently", identity.fingerprint());
            return Ok(identity);
        }

        let identity = IdentityKeyPair::generate();
        self.store.save_identity(&identity).await?;
        info!("Created new identity {}", identity.fingerprint());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_creates_identity_once() {
        let store = Arc::new(MemoryStore::new());
        let manager = IdentityManager::new(store.clone());

        let first = manager.get_or_create_identity().await.unwrap().clone();
        let second = manager.get_or_create_identity().await.unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let stored = store.load_identity().await.unwrap().unwrap();
        assert_eq!(stored.public_key(), first.public_key());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_managers_on_one_store_agree() {
        let store = Arc::new(MemoryStore::new());
        let first = IdentityManager::new(store.clone());
        let second = IdentityManager::new(store.clone());

        let (a, b) = tokio::join!(
            first.get_or_create_identity(),
            second.get_or_create_identity()
        );
        let stored = store.load_identity().await.unwrap().unwrap();
        assert_eq!(a.unwrap().public_key(), stored.public_key());
        assert_eq!(b.unwrap().public_key(), stored.public_key());
    }

    #[tokio::test]
    async fn test_loads_existing_identity() {
        let identity = IdentityKeyPair::generate();
        let store = Arc::new(MemoryStore::with_identity(&identity));
        let manager = IdentityManager::new(store);

        let loaded = manager.get_or_create_identity().await.unwrap();
        assert_eq!(loaded.public_key(), identity.public_key());
    }
}
