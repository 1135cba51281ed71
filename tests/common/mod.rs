//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use cryptobox::{CryptoboxStore, IdentityKeyPair, MemoryStore, PreKey, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;

/// Memory store with switchable failures and call counters
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_session_save: AtomicBool,
    pub failing_prekey_deletes: Mutex<HashSet<u16>>,
    pub identity_saves: AtomicUsize,
    pub prekey_deletes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deletes_of(&self, ids: &[u16]) {
        let mut failing = self.failing_prekey_deletes.lock().unwrap();
        failing.clear();
        failing.extend(ids.iter().copied());
    }
}

#[async_trait]
impl CryptoboxStore for FlakyStore {
    async fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;
        self.inner.load_identity().await
    }

    fn identity_lock(&self) -> &AsyncMutex<()> {
        self.inner.identity_lock()
    }

    async fn save_identity(&self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        self.identity_saves.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.inner.save_identity(identity).await
    }

    async fn load_session(
        &self,
        identity: &IdentityKeyPair,
        session_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load_session(identity, session_id).await
    }

    async fn save_session(&self, session_id: &str, session: &[u8]) -> Result<(), StoreError> {
        if self.fail_session_save.load(Ordering::SeqCst) {
            return Err(StoreError::backend("session write rejected"));
        }
        self.inner.save_session(session_id, session).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.inner.delete_session(session_id).await
    }

    async fn add_prekey(&self, prekey: &PreKey) -> Result<(), StoreError> {
        self.inner.add_prekey(prekey).await
    }

    async fn load_prekey(&self, prekey_id: u16) -> Result<Option<PreKey>, StoreError> {
        self.inner.load_prekey(prekey_id).await
    }

    async fn delete_prekey(&self, prekey_id: u16) -> Result<(), StoreError> {
        self.prekey_deletes.fetch_add(1, Ordering::SeqCst);
        if self.failing_prekey_deletes.lock().unwrap().contains(&prekey_id) {
            return Err(StoreError::backend(format!("cannot delete prekey {prekey_id}")));
        }
        self.inner.delete_prekey(prekey_id).await
    }
}
