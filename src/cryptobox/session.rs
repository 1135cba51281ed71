//! Session handles returned by the repository.

use crate::crypto::IdentityKey;
use crate::cryptobox::prekey_view::DeferredPreKeyView;
use crate::session::{Envelope, Session};
use crate::utils::Result;
use std::fmt;

/// A session together with the prekey consumption it is responsible for.
///
/// The handle owns its [`DeferredPreKeyView`]. Prekeys staged while creating
/// the session are only deleted when the handle is saved through
/// [`Cryptobox::save`](crate::Cryptobox::save). Dropping an unsaved handle
/// leaves every prekey in the store.
pub struct CryptoboxSession<S: ?Sized> {
    id: String,
    pub(crate) view: DeferredPreKeyView<S>,
    pub(crate) session: Session,
}

impl<S: ?Sized> CryptoboxSession<S> {
    pub(crate) fn new(id: String, view: DeferredPreKeyView<S>, session: Session) -> Self {
        Self { id, view, session }
    }

    /// The caller-chosen session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Encrypt a message for the peer
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.session.encrypt(plaintext)?.serialise()
    }

    /// Decrypt a serialized envelope from the peer
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let envelope = Envelope::deserialise(ciphertext)?;
        self.session.decrypt(&envelope)
    }

    /// Fingerprint of our identity
    pub fn fingerprint_local(&self) -> String {
        self.session.fingerprint_local()
    }

    /// Fingerprint of the peer's identity
    pub fn fingerprint_remote(&self) -> String {
        self.session.fingerprint_remote()
    }

    /// The peer's identity key
    pub fn remote_identity(&self) -> &IdentityKey {
        self.session.remote_identity()
    }
}

impl<S: crate::store::CryptoboxStore + ?Sized> CryptoboxSession<S> {
    /// Prekey ids this handle will delete when saved
    pub fn staged_prekeys(&self) -> Vec<u16> {
        self.view.staged().collect()
    }
}

impl<S: ?Sized> fmt::Debug for CryptoboxSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoboxSession")
            .field("id", &self.id)
            .field("session", &self.session)
            .finish()
    }
}
