//! Session repository.
//!
//! [`Cryptobox`] ties the local identity, a [`CryptoboxStore`] and the
//! session engine together. Sessions are handed out as
//! [`CryptoboxSession`] handles; prekeys consumed while establishing a
//! session are only deleted once that session has been saved.
//!
//! Callers must serialize create/load/save for any single session id. Work
//! on different session ids is independent.

pub mod identity;
pub mod prekey_view;
pub mod session;

pub use identity::IdentityManager;
pub use prekey_view::DeferredPreKeyView;
pub use session::CryptoboxSession;

use crate::crypto::{generate_prekeys, IdentityKeyPair, PreKey, PreKeyBundle, MAX_PREKEY_ID};
use crate::session::{Envelope, Session};
use crate::store::CryptoboxStore;
use crate::utils::Result;
use log::{debug, info};
use std::sync::Arc;

/// Session repository over a durable store
pub struct Cryptobox<S: ?Sized> {
    store: Arc<S>,
    identity: IdentityKeyPair,
}

impl<S: CryptoboxStore + ?Sized> Cryptobox<S> {
    /// Open a cryptobox, creating and persisting an identity if the store has none
    ///
    /// # Errors
    ///
    /// Propagates store failures from loading or saving the identity
    pub async fn open(store: Arc<S>) -> Result<Self> {
        let manager = IdentityManager::new(store);
        Self::from_identity_manager(&manager).await
    }

    /// Open a cryptobox through a shared identity manager
    pub async fn from_identity_manager(manager: &IdentityManager<S>) -> Result<Self> {
        let identity = manager.get_or_create_identity().await?.clone();
        Ok(Self {
            store: Arc::clone(manager.store()),
            identity,
        })
    }

    /// The local identity keypair
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Fingerprint of the local identity
    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Generate and store a prekey, returning its serialized bundle
    ///
    /// # Arguments
    ///
    /// * `prekey_id` - Id of the new prekey; an existing prekey with this id is replaced
    pub async fn new_prekey(&self, prekey_id: u16) -> Result<Vec<u8>> {
        self.publish(PreKey::new(prekey_id)).await
    }

    /// Generate and store `count` prekeys with consecutive ids from `start`.
    ///
    /// Ids wrap around and never include the last-resort id.
    pub async fn new_prekeys(&self, start: u16, count: u16) -> Result<Vec<Vec<u8>>> {
        let mut bundles = Vec::with_capacity(usize::from(count));
        for prekey in generate_prekeys(start, count) {
            bundles.push(self.publish(prekey).await?);
        }
        info!("Generated {} prekeys starting at {}", count, start);
        Ok(bundles)
    }

    /// Generate and store the last-resort prekey
    pub async fn new_last_resort_prekey(&self) -> Result<Vec<u8>> {
        self.new_prekey(MAX_PREKEY_ID).await
    }

    async fn publish(&self, prekey: PreKey) -> Result<Vec<u8>> {
        self.store.add_prekey(&prekey).await?;
        debug!("Stored prekey {}", prekey.key_id());
        PreKeyBundle::new(&self.identity, &prekey).serialise()
    }

    /// Start a session from a peer's serialized prekey bundle
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidBundle` for malformed or badly signed bundles
    pub async fn create_from_bundle(
        &self,
        session_id: &str,
        bundle: &[u8],
    ) -> Result<CryptoboxSession<S>> {
        let bundle = PreKeyBundle::deserialise(bundle)?;
        let view = DeferredPreKeyView::new(Arc::clone(&self.store));
        let session = Session::init_from_bundle(&self.identity, &bundle)?;
        debug!("Created session {} from prekey {}", session_id, bundle.prekey_id);
        Ok(CryptoboxSession::new(session_id.to_string(), view, session))
    }

    /// Accept a session from a peer's first message.
    ///
    /// The consumed prekey stays in the store until the returned handle is
    /// saved, so repeating this call with the same message succeeds until then.
    ///
    /// # Errors
    ///
    /// * `SessionError::InvalidEnvelope` for malformed input
    /// * `SessionError::PreKeyNotFound` if the referenced prekey is gone
    /// * decrypt errors from the session engine
    pub async fn create_from_message(
        &self,
        session_id: &str,
        envelope: &[u8],
    ) -> Result<(CryptoboxSession<S>, Vec<u8>)> {
        let envelope = Envelope::deserialise(envelope)?;
        let mut view = DeferredPreKeyView::new(Arc::clone(&self.store));
        let (session, plaintext) =
            Session::init_from_message(&self.identity, &mut view, &envelope).await?;
        debug!("Created session {} from prekey message", session_id);
        Ok((
            CryptoboxSession::new(session_id.to_string(), view, session),
            plaintext,
        ))
    }

    /// Load a saved session, `None` if there is no session with this id
    pub async fn load(&self, session_id: &str) -> Result<Option<CryptoboxSession<S>>> {
        let Some(bytes) = self.store.load_session(&self.identity, session_id).await? else {
            debug!("No session {}", session_id);
            return Ok(None);
        };
        let session = Session::deserialise(&self.identity, &bytes)?;
        let view = DeferredPreKeyView::new(Arc::clone(&self.store));
        Ok(Some(CryptoboxSession::new(
            session_id.to_string(),
            view,
            session,
        )))
    }

    /// Persist a session, then delete the prekeys it consumed.
    ///
    /// If writing the session fails, no prekey is deleted. If some deletions
    /// fail, the session is saved and the failed ids stay staged on the
    /// handle, so saving it again retries them.
    ///
    /// # Errors
    ///
    /// * store errors from writing the session
    /// * `StoreError::PreKeyCommit` if some prekey deletions failed
    pub async fn save(&self, handle: &mut CryptoboxSession<S>) -> Result<()> {
        let bytes = handle.session.serialise()?;
        self.store.save_session(handle.id(), &bytes).await?;
        handle.view.commit().await?;
        debug!("Saved session {}", handle.id());
        Ok(())
    }

    /// Remove a saved session. Prekeys are not touched.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.store.delete_session(session_id).await?;
        info!("Deleted session {}", session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn open() -> Cryptobox<MemoryStore> {
        Cryptobox::open(Arc::new(MemoryStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_reuses_stored_identity() {
        let store = Arc::new(MemoryStore::new());
        let first = Cryptobox::open(store.clone()).await.unwrap();
        let second = Cryptobox::open(store).await.unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn test_new_prekeys_skip_last_resort() {
        let cbox = open().await;
        let bundles = cbox.new_prekeys(MAX_PREKEY_ID - 1, 3).await.unwrap();
        assert_eq!(bundles.len(), 3);
        assert_eq!(cbox.store().prekey_ids().await, vec![0, 1, MAX_PREKEY_ID - 1]);

        let bundle = PreKeyBundle::deserialise(&bundles[0]).unwrap();
        assert_eq!(bundle.prekey_id, MAX_PREKEY_ID - 1);
        assert_eq!(bundle.identity_key, *cbox.identity().public_key());
    }

    #[tokio::test]
    async fn test_round_trip_and_staging() {
        let alice = open().await;
        let bob = open().await;
        let bundle = bob.new_prekey(1).await.unwrap();

        let mut alice_session = alice.create_from_bundle("bob", &bundle).await.unwrap();
        assert!(alice_session.staged_prekeys().is_empty());
        let hello = alice_session.encrypt(b"Hello Bob!").unwrap();

        let (mut bob_session, plaintext) = bob.create_from_message("alice", &hello).await.unwrap();
        assert_eq!(plaintext, b"Hello Bob!");
        assert_eq!(bob_session.staged_prekeys(), vec![1]);
        assert!(bob.store().has_prekey(1).await);

        bob.save(&mut bob_session).await.unwrap();
        assert!(!bob.store().has_prekey(1).await);
        assert!(bob_session.staged_prekeys().is_empty());

        let reply = bob_session.encrypt(b"Hello Alice!").unwrap();
        assert_eq!(alice_session.decrypt(&reply).unwrap(), b"Hello Alice!");
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let cbox = open().await;
        assert!(cbox.create_from_bundle("x", b"nope").await.is_err());
        assert!(cbox.create_from_message("x", b"nope").await.is_err());
    }
}
