//! Durable storage for identities, sessions and prekeys.
//!
//! [`CryptoboxStore`] is the contract the session repository relies on.
//! Implementations are expected to make each single-entity operation atomic;
//! nothing here requires atomicity across entities.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::crypto::{IdentityKeyPair, PreKey};
use crate::utils::StoreError;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Persistent key-value storage used by [`Cryptobox`](crate::Cryptobox)
#[async_trait]
pub trait CryptoboxStore: Send + Sync {
    /// Load the local identity, if one has been saved
    async fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StoreError>;

    /// Lock held while an identity is generated and saved.
    ///
    /// Every handle onto the same underlying storage must return the same
    /// lock, so that only one caller can create the identity.
    fn identity_lock(&self) -> &Mutex<()>;

    /// Persist the local identity
    async fn save_identity(&self, identity: &IdentityKeyPair) -> Result<(), StoreError>;

    /// Load serialized session state for `session_id`
    async fn load_session(
        &self,
        identity: &IdentityKeyPair,
        session_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Persist serialized session state under `session_id`
    async fn save_session(&self, session_id: &str, session: &[u8]) -> Result<(), StoreError>;

    /// Remove a session; removing an absent session succeeds
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Persist a prekey, replacing any prekey with the same id
    async fn add_prekey(&self, prekey: &PreKey) -> Result<(), StoreError>;

    /// Load a prekey by id
    async fn load_prekey(&self, prekey_id: u16) -> Result<Option<PreKey>, StoreError>;

    /// Remove a prekey; removing an absent prekey succeeds
    async fn delete_prekey(&self, prekey_id: u16) -> Result<(), StoreError>;
}

pub(crate) fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        what: what.to_string(),
        reason: err.to_string(),
    }
}
