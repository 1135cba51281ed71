//! Long-term identity keys.
//!
//! An identity is an Ed25519 signing keypair. The same key material is used
//! for Diffie-Hellman agreement through the Ed25519 to X25519 birational map,
//! so a single public key both signs prekey bundles and takes part in the
//! triple-DH handshake.

use crate::utils::{CryptoError, Result};
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Public half of an identity keypair
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey([u8; PUBLIC_KEY_LENGTH]);

impl IdentityKey {
    /// Parse and validate an Ed25519 public key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the bytes are not a valid point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Invalid identity key length: expected {}, got {}",
                    PUBLIC_KEY_LENGTH,
                    bytes.len()
                ),
            })?;
        Self::verifying_key_of(&bytes)?;
        Ok(Self(bytes))
    }

    /// Raw public key bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Hex fingerprint shown to users for out-of-band verification
    pub fn fingerprint(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature made by the matching identity keypair
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature: [u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureVerification)?;

        Self::verifying_key_of(&self.0)?
            .verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoError::SignatureVerification.into())
    }

    /// The X25519 public key used for agreement
    pub fn agreement_key(&self) -> Result<PublicKey> {
        let point: MontgomeryPoint = Self::verifying_key_of(&self.0)?.to_montgomery();
        Ok(PublicKey::from(point.to_bytes()))
    }

    fn verifying_key_of(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(bytes).map_err(|_| {
            CryptoError::InvalidKey {
                reason: "Identity key is not a valid Ed25519 point".to_string(),
            }
            .into()
        })
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.fingerprint())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// Ed25519 key pair for the local identity
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    public_key: IdentityKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    ///
    /// # Example
    ///
    /// ```rust
    /// use cryptobox::crypto::IdentityKeyPair;
    ///
    /// let keypair = IdentityKeyPair::generate();
    /// assert_eq!(keypair.fingerprint().len(), 64);
    /// ```
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore an identity key pair from its secret key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the secret key has the wrong length
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let secret: [u8; SECRET_KEY_LENGTH] =
            secret_bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Invalid secret key length: expected {}, got {}",
                    SECRET_KEY_LENGTH,
                    secret_bytes.len()
                ),
            })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = IdentityKey(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            public_key,
        }
    }

    /// The public identity key
    pub fn public_key(&self) -> &IdentityKey {
        &self.public_key
    }

    /// Secret key bytes, for persistence only
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }

    /// Sign a message with this identity
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// The X25519 secret matching [`IdentityKey::agreement_key`]
    pub(crate) fn agreement_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}
