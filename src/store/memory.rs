//! In-memory store.
//!
//! Everything is kept in serialized form, so each load hands out a fresh
//! object exactly as a persistent backend would. Data is lost when the store
//! is dropped.

use crate::crypto::{IdentityKeyPair, PreKey};
use crate::store::{corrupt, CryptoboxStore};
use crate::utils::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

/// Volatile [`CryptoboxStore`] for tests and ephemeral clients
#[derive(Default)]
pub struct MemoryStore {
    identity: RwLock<Option<Vec<u8>>>,
    sessions: RwLock<HashMap<String, Vec<u8>>>,
    prekeys: RwLock<HashMap<u16, Vec<u8>>>,
    identity_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds an identity
    pub fn with_identity(identity: &IdentityKeyPair) -> Self {
        Self {
            identity: RwLock::new(Some(identity.secret_key_bytes().to_vec())),
            ..Self::default()
        }
    }

    /// True if a prekey with this id is stored
    pub async fn has_prekey(&self, prekey_id: u16) -> bool {
        self.prekeys.read().await.contains_key(&prekey_id)
    }

    /// Ids of all stored prekeys, sorted
    pub async fn prekey_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.prekeys.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of all stored sessions, sorted
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl CryptoboxStore for MemoryStore {
    async fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.identity
            .read()
            .await
            .as_deref()
            .map(|bytes| IdentityKeyPair::from_secret_bytes(bytes).map_err(|e| corrupt("identity", e)))
            .transpose()
    }

    fn identity_lock(&self) -> &Mutex<()> {
        &self.identity_lock
    }

    async fn save_identity(&self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        *self.identity.write().await = Some(identity.secret_key_bytes().to_vec());
        Ok(())
    }

    async fn load_session(
        &self,
        _identity: &IdentityKeyPair,
        session_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn save_session(&self, session_id: &str, session: &[u8]) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), session.to_vec());
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn add_prekey(&self, prekey: &PreKey) -> Result<(), StoreError> {
        let bytes = prekey.serialise().map_err(|e| corrupt("prekey", e))?;
        self.prekeys.write().await.insert(prekey.key_id(), bytes);
        Ok(())
    }

    async fn load_prekey(&self, prekey_id: u16) -> Result<Option<PreKey>, StoreError> {
        self.prekeys
            .read()
            .await
            .get(&prekey_id)
            .map(|bytes| PreKey::deserialise(bytes).map_err(|e| corrupt("prekey", e)))
            .transpose()
    }

    async fn delete_prekey(&self, prekey_id: u16) -> Result<(), StoreError> {
        self.prekeys.write().await.remove(&prekey_id);
        Ok(())
    }
}
