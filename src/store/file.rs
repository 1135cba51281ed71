//! Filesystem store.
//!
//! Layout follows [`StorageConfig`]: one file for the identity, one file per
//! session under `sessions_dir` and one file per prekey under `prekeys_dir`.
//! Every write goes to a temporary sibling, is synced, and is then renamed
//! into place, so a reader never observes a half-written record and a crash
//! never loses an acknowledged one.
//!
//! Session files are named by the SHA-256 of the session id and carry the id
//! itself, so ids of any length map to a fixed-size file name.

use crate::crypto::{IdentityKeyPair, PreKey};
use crate::store::{corrupt, CryptoboxStore};
use crate::utils::{StorageConfig, StoreError};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const TEMP_SUFFIX: &str = ".tmp";

/// [`CryptoboxStore`] backed by plain files
///
/// Clones share one identity lock.
#[derive(Debug, Clone)]
pub struct FileStore {
    storage: StorageConfig,
    identity_lock: Arc<Mutex<()>>,
}

/// On-disk form of a session record
#[derive(Serialize, Deserialize)]
struct SessionFile {
    id: String,
    #[serde(with = "serde_bytes")]
    session: Vec<u8>,
}

impl FileStore {
    /// Create a store over an existing storage layout
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            identity_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create a store and make sure its directories exist
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if a directory cannot be created
    pub async fn open(storage: StorageConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&storage.sessions_dir).await?;
        fs::create_dir_all(&storage.prekeys_dir).await?;
        if let Some(parent) = storage.identity_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        debug!("Opened file store at {}", storage.data_dir.display());
        Ok(Self::new(storage))
    }

    /// The storage layout this store writes to
    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Ids of all prekeys on disk, sorted
    pub async fn prekey_ids(&self) -> Result<Vec<u16>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.storage.prekeys_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Ids of all sessions on disk, sorted
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupt` if a session file cannot be decoded
    pub async fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.storage.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let is_record = entry
                .file_name()
                .to_str()
                .map_or(false, |n| !n.ends_with(TEMP_SUFFIX));
            if !is_record {
                continue;
            }
            // Removed between listing and reading
            if let Some(bytes) = read_optional(&entry.path()).await? {
                ids.push(decode_session(&bytes)?.id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(session_id.as_bytes()));
        self.storage.sessions_dir.join(name)
    }

    fn prekey_path(&self, prekey_id: u16) -> PathBuf {
        self.storage.prekeys_dir.join(prekey_id.to_string())
    }
}

fn decode_session(bytes: &[u8]) -> Result<SessionFile, StoreError> {
    bincode::deserialize(bytes).map_err(|e| corrupt("session", e))
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TEMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    sync_parent(path).await
}

async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => sync_parent(path).await,
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Flush the directory entry of `path`, making a rename or unlink durable
async fn sync_parent(path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    // Directories cannot be opened for syncing on Windows
    if cfg!(unix) {
        fs::File::open(parent).await?.sync_all().await?;
    }
    Ok(())
}

#[async_trait]
impl CryptoboxStore for FileStore {
    async fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        read_optional(&self.storage.identity_file)
            .await?
            .map(|bytes| IdentityKeyPair::from_secret_bytes(&bytes).map_err(|e| corrupt("identity", e)))
            .transpose()
    }

    fn identity_lock(&self) -> &Mutex<()> {
        &self.identity_lock
    }

    async fn save_identity(&self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        write_atomic(&self.storage.identity_file, &identity.secret_key_bytes()).await
    }

    async fn load_session(
        &self,
        _identity: &IdentityKeyPair,
        session_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(bytes) = read_optional(&self.session_path(session_id)).await? else {
            return Ok(None);
        };
        let record = decode_session(&bytes)?;
        if record.id != session_id {
            return Err(corrupt(
                "session",
                format!("file for {session_id:?} holds {:?}", record.id),
            ));
        }
        Ok(Some(record.session))
    }

    async fn save_session(&self, session_id: &str, session: &[u8]) -> Result<(), StoreError> {
        let record = SessionFile {
            id: session_id.to_string(),
            session: session.to_vec(),
        };
        let bytes = bincode::serialize(&record).map_err(|e| corrupt("session", e))?;
        write_atomic(&self.session_path(session_id), &bytes).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        remove_if_present(&self.session_path(session_id)).await
    }

    async fn add_prekey(&self, prekey: &PreKey) -> Result<(), StoreError> {
        let bytes = prekey.serialise().map_err(|e| corrupt("prekey", e))?;
        write_atomic(&self.prekey_path(prekey.key_id()), &bytes).await
    }

    async fn load_prekey(&self, prekey_id: u16) -> Result<Option<PreKey>, StoreError> {
        read_optional(&self.prekey_path(prekey_id))
            .await?
            .map(|bytes| PreKey::deserialise(&bytes).map_err(|e| corrupt("prekey", e)))
            .transpose()
    }

    async fn delete_prekey(&self, prekey_id: u16) -> Result<(), StoreError> {
        remove_if_present(&self.prekey_path(prekey_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(StorageConfig::under(dir.path()))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_identity_persists_across_instances() {
        let (dir, store) = temp_store().await;
        assert!(store.load_identity().await.unwrap().is_none());

        let identity = IdentityKeyPair::generate();
        store.save_identity(&identity).await.unwrap();

        let reopened = FileStore::new(StorageConfig::under(dir.path()));
        let loaded = reopened.load_identity().await.unwrap().unwrap();
        assert_eq!(loaded.public_key(), identity.public_key());
    }

    #[tokio::test]
    async fn test_session_ids_are_not_paths() {
        let (_dir, store) = temp_store().await;
        let identity = IdentityKeyPair::generate();

        store.save_session("../alice/bob", b"one").await.unwrap();
        store.save_session("carol", b"two").await.unwrap();

        assert_eq!(
            store.load_session(&identity, "../alice/bob").await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(
            store.session_ids().await.unwrap(),
            vec!["../alice/bob".to_string(), "carol".to_string()]
        );

        store.delete_session("carol").await.unwrap();
        store.delete_session("carol").await.unwrap();
        assert!(store.load_session(&identity, "carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prekeys_on_disk() {
        let (_dir, store) = temp_store().await;
        store.add_prekey(&PreKey::new(2)).await.unwrap();
        store.add_prekey(&PreKey::last_resort()).await.unwrap();

        assert_eq!(store.prekey_ids().await.unwrap(), vec![2, u16::MAX]);
        assert!(store.load_prekey(2).await.unwrap().is_some());

        store.delete_prekey(2).await.unwrap();
        store.delete_prekey(2).await.unwrap();
        assert!(store.load_prekey(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_prekey_is_reported() {
        let (_dir, store) = temp_store().await;
        fs::write(store.prekey_path(9), b"garbage").await.unwrap();

        let err = store.load_prekey(9).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_long_session_ids_fit_in_a_file_name() {
        let (_dir, store) = temp_store().await;
        let identity = IdentityKeyPair::generate();
        let long_id = "x".repeat(300);

        store.save_session(&long_id, b"state").await.unwrap();
        assert_eq!(
            store.load_session(&identity, &long_id).await.unwrap(),
            Some(b"state".to_vec())
        );
        assert_eq!(store.session_ids().await.unwrap(), vec![long_id.clone()]);

        let name = store.session_path(&long_id);
        let name = name.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64);

        store.delete_session(&long_id).await.unwrap();
        assert!(store.session_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_file_for_other_id_is_corrupt() {
        let (_dir, store) = temp_store().await;
        let identity = IdentityKeyPair::generate();

        store.save_session("alice", b"state").await.unwrap();
        fs::copy(store.session_path("alice"), store.session_path("bob"))
            .await
            .unwrap();

        let err = store.load_session(&identity, "bob").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_writes_leave_no_temporary_files() {
        let (dir, store) = temp_store().await;
        store.save_identity(&IdentityKeyPair::generate()).await.unwrap();
        store.save_session("alice", b"one").await.unwrap();
        store.save_session("alice", b"two").await.unwrap();
        store.add_prekey(&PreKey::new(1)).await.unwrap();

        let storage = StorageConfig::under(dir.path());
        for dir in [&storage.sessions_dir, &storage.prekeys_dir] {
            let mut entries = fs::read_dir(dir).await.unwrap();
            while let Some(entry) = entries.next_entry().await.unwrap() {
                let name = entry.file_name();
                assert!(!name.to_string_lossy().ends_with(TEMP_SUFFIX));
            }
        }
        assert_eq!(
            store.load_session(&IdentityKeyPair::generate(), "alice").await.unwrap(),
            Some(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn test_sync_parent_accepts_bare_file_names() {
        let (dir, _store) = temp_store().await;
        sync_parent(Path::new("identity")).await.unwrap();
        sync_parent(&dir.path().join("identity")).await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_identity_lock() {
        let (_dir, store) = temp_store().await;
        let clone = store.clone();

        let _guard = store.identity_lock().lock().await;
        assert!(clone.identity_lock().try_lock().is_err());
    }
}
