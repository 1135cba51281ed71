//! Session objects: establishment, encryption and persistence format.
//!
//! A [`Session`] is created either from a peer's prekey bundle (initiator)
//! or from an incoming prekey message (responder). The responder side reads
//! prekeys through a [`PreKeyLookup`] and reports the prekey it consumed via
//! [`PreKeyLookup::stage_delete`]; whether that consumption becomes durable
//! is decided by the caller.

use crate::crypto::{IdentityKey, IdentityKeyPair, PreKey, PreKeyBundle};
use crate::session::message::{Envelope, Message, PreKeyMessage};
use crate::session::ratchet::{RatchetRecord, RatchetState};
use crate::session::x3dh;
use crate::utils::{CryptoboxError, Result, SessionError};
use async_trait::async_trait;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Current session record format version
const SESSION_VERSION: u8 = 1;

/// Prekey access needed while processing an incoming prekey message
#[async_trait]
pub trait PreKeyLookup: Send + Sync {
    /// Fetch a prekey by id, `None` if it is not available
    async fn lookup(&self, prekey_id: u16) -> Result<Option<PreKey>>;

    /// Report that a prekey has been used to establish a session
    async fn stage_delete(&mut self, prekey_id: u16) -> Result<()>;
}

/// An established session with one peer
#[derive(Clone)]
pub struct Session {
    local_identity: IdentityKey,
    remote_identity: IdentityKey,
    pending_prekey: Option<PendingPreKey>,
    state: RatchetState,
}

/// X3DH parameters repeated in every message until the peer replies
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PendingPreKey {
    prekey_id: u16,
    base_key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    version: u8,
    local_identity: IdentityKey,
    remote_identity: IdentityKey,
    pending_prekey: Option<PendingPreKey>,
    state: RatchetRecord,
}

impl Session {
    /// Start a session from a peer's prekey bundle
    pub fn init_from_bundle(identity: &IdentityKeyPair, bundle: &PreKeyBundle) -> Result<Self> {
        bundle.verify()?;

        let base_key = StaticSecret::random_from_rng(OsRng);
        let base_public = PublicKey::from(&base_key);
        let their_prekey = bundle.public_key();

        let shared_secret =
            x3dh::initiator_secret(identity, &base_key, &bundle.identity_key, &their_prekey)?;
        let state = RatchetState::new_initiator(shared_secret, &their_prekey)?;

        Ok(Self {
            local_identity: *identity.public_key(),
            remote_identity: bundle.identity_key,
            pending_prekey: Some(PendingPreKey {
                prekey_id: bundle.prekey_id,
                base_key: base_public.to_bytes(),
            }),
            state,
        })
    }

    /// Accept a session from an incoming prekey message.
    ///
    /// On success exactly one [`PreKeyLookup::stage_delete`] is issued for
    /// the prekey the message referenced.
    ///
    /// # Errors
    ///
    /// * `SessionError::InvalidEnvelope` if the envelope is not a prekey message
    /// * `SessionError::PreKeyNotFound` if the lookup has no such prekey
    /// * ratchet errors from decrypting the enclosed message
    pub async fn init_from_message<L>(
        identity: &IdentityKeyPair,
        prekeys: &mut L,
        envelope: &Envelope,
    ) -> Result<(Self, Vec<u8>)>
    where
        L: PreKeyLookup + ?Sized,
    {
        let Message::PreKey(prekey_message) = &envelope.message else {
            return Err(SessionError::InvalidEnvelope {
                reason: "expected a prekey message".to_string(),
            }
            .into());
        };
        let PreKeyMessage {
            prekey_id,
            base_key,
            identity_key,
            message,
        } = prekey_message;

        let prekey = prekeys
            .lookup(*prekey_id)
            .await?
            .ok_or(SessionError::PreKeyNotFound {
                prekey_id: *prekey_id,
            })?;

        let remote_identity =
            IdentityKey::from_bytes(identity_key.as_bytes()).map_err(|e| SessionError::InvalidEnvelope {
                reason: e.to_string(),
            })?;
        let shared_secret = x3dh::responder_secret(
            identity,
            &prekey,
            &remote_identity,
            &PublicKey::from(*base_key),
        )?;

        let mut state = RatchetState::new_recipient(shared_secret, prekey.secret().clone())?;
        let plaintext = state.decrypt(message)?;

        prekeys.stage_delete(*prekey_id).await?;

        let session = Self {
            local_identity: *identity.public_key(),
            remote_identity,
            pending_prekey: None,
            state,
        };
        Ok((session, plaintext))
    }

    /// Encrypt a message for the peer
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Envelope> {
        let message = self.state.encrypt(plaintext)?;

        let message = match self.pending_prekey {
            Some(pending) => Message::PreKey(PreKeyMessage {
                prekey_id: pending.prekey_id,
                base_key: pending.base_key,
                identity_key: self.local_identity,
                message,
            }),
            None => Message::Cipher(message),
        };

        Ok(Envelope::new(message))
    }

    /// Decrypt a message from the peer
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Vec<u8>> {
        if let Message::PreKey(prekey_message) = &envelope.message {
            if prekey_message.identity_key != self.remote_identity {
                return Err(SessionError::DecryptFailed {
                    reason: "prekey message from a different identity".to_string(),
                }
                .into());
            }
        }

        let plaintext = self.state.decrypt(envelope.cipher_message())?;
        self.pending_prekey = None;
        Ok(plaintext)
    }

    /// Our identity key
    pub fn local_identity(&self) -> &IdentityKey {
        &self.local_identity
    }

    /// The peer's identity key
    pub fn remote_identity(&self) -> &IdentityKey {
        &self.remote_identity
    }

    /// Fingerprint of our identity
    pub fn fingerprint_local(&self) -> String {
        self.local_identity.fingerprint()
    }

    /// Fingerprint of the peer's identity
    pub fn fingerprint_remote(&self) -> String {
        self.remote_identity.fingerprint()
    }

    /// Serialize the full session state for storage
    pub fn serialise(&self) -> Result<Vec<u8>> {
        let record = SessionRecord {
            version: SESSION_VERSION,
            local_identity: self.local_identity,
            remote_identity: self.remote_identity,
            pending_prekey: self.pending_prekey,
            state: RatchetRecord::from(&self.state),
        };
        bincode::serialize(&record).map_err(CryptoboxError::from)
    }

    /// Restore a session serialized by [`Session::serialise`]
    ///
    /// # Errors
    ///
    /// * `SessionError::InvalidSession` for malformed bytes
    /// * `SessionError::IdentityMismatch` if the session belongs to another identity
    pub fn deserialise(identity: &IdentityKeyPair, bytes: &[u8]) -> Result<Self> {
        let record: SessionRecord =
            bincode::deserialize(bytes).map_err(|e| SessionError::InvalidSession {
                reason: e.to_string(),
            })?;

        if record.version != SESSION_VERSION {
            return Err(SessionError::InvalidSession {
                reason: format!("unsupported version {}", record.version),
            }
            .into());
        }
        if record.local_identity != *identity.public_key() {
            return Err(SessionError::IdentityMismatch {
                expected: identity.fingerprint(),
            }
            .into());
        }

        Ok(Self {
            local_identity: record.local_identity,
            remote_identity: record.remote_identity,
            pending_prekey: record.pending_prekey,
            state: RatchetState::from(record.state),
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("local_identity", &self.local_identity)
            .field("remote_identity", &self.remote_identity)
            .field("pending_prekey", &self.pending_prekey.map(|p| p.prekey_id))
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    /// Plain in-memory lookup that records staged ids
    #[derive(Default)]
    struct RecordingLookup {
        prekeys: HashMap<u16, PreKey>,
        staged: BTreeSet<u16>,
    }

    #[async_trait]
    impl PreKeyLookup for RecordingLookup {
        async fn lookup(&self, prekey_id: u16) -> Result<Option<PreKey>> {
            Ok(self.prekeys.get(&prekey_id).cloned())
        }

        async fn stage_delete(&mut self, prekey_id: u16) -> Result<()> {
            self.staged.insert(prekey_id);
            Ok(())
        }
    }

    fn bob_with_prekey(id: u16) -> (IdentityKeyPair, RecordingLookup, PreKeyBundle) {
        let bob = IdentityKeyPair::generate();
        let prekey = PreKey::new(id);
        let bundle = PreKeyBundle::new(&bob, &prekey);
        let mut lookup = RecordingLookup::default();
        lookup.prekeys.insert(id, prekey);
        (bob, lookup, bundle)
    }

    #[tokio::test]
    async fn test_establish_and_reply() {
        let alice = IdentityKeyPair::generate();
        let (bob, mut lookup, bundle) = bob_with_prekey(1);

        let mut alice_session = Session::init_from_bundle(&alice, &bundle).unwrap();
        let hello = alice_session.encrypt(b"Hello Bob!").unwrap();
        assert!(hello.is_prekey_message());

        let (mut bob_session, plaintext) = Session::init_from_message(&bob, &mut lookup, &hello)
            .await
            .unwrap();
        assert_eq!(plaintext, b"Hello Bob!");
        assert_eq!(lookup.staged, BTreeSet::from([1]));

        let reply = bob_session.encrypt(b"Hello Alice!").unwrap();
        assert!(!reply.is_prekey_message());
        assert_eq!(alice_session.decrypt(&reply).unwrap(), b"Hello Alice!");

        let follow_up = alice_session.encrypt(b"ok").unwrap();
        assert!(!follow_up.is_prekey_message());
        assert_eq!(bob_session.decrypt(&follow_up).unwrap(), b"ok");

        assert_eq!(alice_session.fingerprint_local(), bob_session.fingerprint_remote());
        assert_eq!(alice_session.fingerprint_remote(), bob_session.fingerprint_local());
    }

    #[tokio::test]
    async fn test_missing_prekey() {
        let alice = IdentityKeyPair::generate();
        let (bob, _, bundle) = bob_with_prekey(5);
        let mut empty = RecordingLookup::default();

        let mut alice_session = Session::init_from_bundle(&alice, &bundle).unwrap();
        let hello = alice_session.encrypt(b"hi").unwrap();

        let err = Session::init_from_message(&bob, &mut empty, &hello)
            .await
            .unwrap_err();
        assert!(err.is_prekey_not_found());
        assert!(empty.staged.is_empty());
    }

    #[tokio::test]
    async fn test_cipher_message_cannot_start_session() {
        let alice = IdentityKeyPair::generate();
        let (bob, mut lookup, bundle) = bob_with_prekey(1);

        let mut alice_session = Session::init_from_bundle(&alice, &bundle).unwrap();
        let hello = alice_session.encrypt(b"hi").unwrap();
        let (mut bob_session, _) = Session::init_from_message(&bob, &mut lookup, &hello)
            .await
            .unwrap();
        let reply = bob_session.encrypt(b"reply").unwrap();

        let err = Session::init_from_message(&alice, &mut lookup, &reply)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CryptoboxError::Session(SessionError::InvalidEnvelope { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_record_bound_to_identity() {
        let alice = IdentityKeyPair::generate();
        let (_, _, bundle) = bob_with_prekey(1);

        let session = Session::init_from_bundle(&alice, &bundle).unwrap();
        let bytes = session.serialise().unwrap();

        let restored = Session::deserialise(&alice, &bytes).unwrap();
        assert_eq!(restored.remote_identity(), session.remote_identity());

        let stranger = IdentityKeyPair::generate();
        let err = Session::deserialise(&stranger, &bytes).unwrap_err();
        assert!(matches!(
            err,
            CryptoboxError::Session(SessionError::IdentityMismatch { .. })
        ));

        let err = Session::deserialise(&alice, b"junk").unwrap_err();
        assert!(matches!(
            err,
            CryptoboxError::Session(SessionError::InvalidSession { .. })
        ));
    }
}
