//! Prekey generation and prekey bundles.
//!
//! A prekey is an X25519 keypair published ahead of time so a peer can start
//! a session without an interactive handshake. One id, [`MAX_PREKEY_ID`], is
//! reserved for the last-resort prekey, which is never deleted and may be
//! reused by any number of sessions.

use crate::crypto::{IdentityKey, IdentityKeyPair};
use crate::utils::{CryptoboxError, Result, SessionError};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Reserved id of the last-resort prekey
pub const MAX_PREKEY_ID: u16 = u16::MAX;

/// Current prekey bundle format version
pub const BUNDLE_VERSION: u8 = 1;

/// An X25519 prekey with its identifier
#[derive(Clone)]
pub struct PreKey {
    key_id: u16,
    secret: StaticSecret,
    public: PublicKey,
}

#[derive(Serialize, Deserialize)]
struct PreKeyRecord {
    key_id: u16,
    secret: [u8; 32],
}

impl PreKey {
    /// Generate a fresh prekey with the given id
    pub fn new(key_id: u16) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            key_id,
            secret,
            public,
        }
    }

    /// Generate a fresh last-resort prekey
    pub fn last_resort() -> Self {
        Self::new(MAX_PREKEY_ID)
    }

    /// The prekey identifier
    pub fn key_id(&self) -> u16 {
        self.key_id
    }

    /// True for the reserved last-resort id
    pub fn is_last_resort(&self) -> bool {
        self.key_id == MAX_PREKEY_ID
    }

    /// The X25519 public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Serialize for storage, including the secret key
    pub fn serialise(&self) -> Result<Vec<u8>> {
        let record = PreKeyRecord {
            key_id: self.key_id,
            secret: self.secret.to_bytes(),
        };
        bincode::serialize(&record).map_err(CryptoboxError::from)
    }

    /// Restore a prekey serialized with [`PreKey::serialise`]
    pub fn deserialise(bytes: &[u8]) -> Result<Self> {
        let record: PreKeyRecord = bincode::deserialize(bytes)?;
        let secret = StaticSecret::from(record.secret);
        let public = PublicKey::from(&secret);
        Ok(Self {
            key_id: record.key_id,
            secret,
            public,
        })
    }
}

impl fmt::Debug for PreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKey")
            .field("key_id", &self.key_id)
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Generate `count` prekeys with consecutive ids starting at `start`.
///
/// Ids wrap around below [`MAX_PREKEY_ID`], so a batch never produces the
/// last-resort id.
pub fn generate_prekeys(start: u16, count: u16) -> Vec<PreKey> {
    (0..u32::from(count))
        .map(|offset| {
            let id = (u32::from(start) + offset) % u32::from(MAX_PREKEY_ID);
            // id < MAX_PREKEY_ID after the modulo, so the cast is lossless
            PreKey::new(id as u16)
        })
        .collect()
}

/// Public material a peer needs to start a session with us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Bundle format version
    pub version: u8,
    /// Id of the prekey this bundle advertises
    pub prekey_id: u16,
    /// X25519 public prekey
    pub public_key: [u8; 32],
    /// Identity of the bundle owner
    pub identity_key: IdentityKey,
    /// Identity signature over `public_key`
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl PreKeyBundle {
    /// Build and sign a bundle for one of our prekeys
    pub fn new(identity: &IdentityKeyPair, prekey: &PreKey) -> Self {
        let public_key = prekey.public_key().to_bytes();
        Self {
            version: BUNDLE_VERSION,
            prekey_id: prekey.key_id(),
            public_key,
            identity_key: *identity.public_key(),
            signature: identity.sign(&public_key).to_vec(),
        }
    }

    /// Check version, identity key and signature
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidBundle` describing the first failed check
    pub fn verify(&self) -> Result<()> {
        if self.version != BUNDLE_VERSION {
            return Err(invalid_bundle(format!(
                "unsupported version {}",
                self.version
            )));
        }

        IdentityKey::from_bytes(self.identity_key.as_bytes())
            .map_err(|e| invalid_bundle(e.to_string()))?;
        self.identity_key
            .verify(&self.public_key, &self.signature)
            .map_err(|e| invalid_bundle(e.to_string()))
    }

    /// The advertised prekey as an X25519 public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self.public_key)
    }

    /// Serialize for out-of-band distribution
    pub fn serialise(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(CryptoboxError::from)
    }

    /// Decode and verify a serialized bundle
    pub fn deserialise(bytes: &[u8]) -> Result<Self> {
        let bundle: Self = bincode::deserialize(bytes).map_err(|e| invalid_bundle(e.to_string()))?;
        bundle.verify()?;
        Ok(bundle)
    }
}

fn invalid_bundle(reason: String) -> CryptoboxError {
    SessionError::InvalidBundle { reason }.into()
}
