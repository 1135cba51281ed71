//! Triple Diffie-Hellman key agreement.
//!
//! The initiator combines its identity key and a fresh base key with the
//! responder's identity key and one prekey:
//!
//! ```text
//! DH1 = DH(IK_A, PK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, PK_B)
//! SK  = HKDF(DH1 || DH2 || DH3)
//! ```
//!
//! The responder mirrors the computation with its private halves.

use crate::crypto::{IdentityKey, IdentityKeyPair, PreKey};
use crate::utils::{CryptoError, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// Size of the derived shared secret
pub const SHARED_SECRET_SIZE: usize = 32;

/// X3DH protocol information string for HKDF
const X3DH_INFO: &[u8] = b"cryptobox-x3dh";

/// Shared secret on the initiating side
pub fn initiator_secret(
    identity: &IdentityKeyPair,
    base_key: &StaticSecret,
    their_identity: &IdentityKey,
    their_prekey: &PublicKey,
) -> Result<[u8; SHARED_SECRET_SIZE]> {
    let their_identity = their_identity.agreement_key()?;

    let dh1 = identity.agreement_secret().diffie_hellman(their_prekey);
    let dh2 = base_key.diffie_hellman(&their_identity);
    let dh3 = base_key.diffie_hellman(their_prekey);

    derive_shared_secret(&[dh1, dh2, dh3])
}

/// Shared secret on the responding side
pub fn responder_secret(
    identity: &IdentityKeyPair,
    prekey: &PreKey,
    their_identity: &IdentityKey,
    their_base_key: &PublicKey,
) -> Result<[u8; SHARED_SECRET_SIZE]> {
    let their_identity = their_identity.agreement_key()?;

    let dh1 = prekey.secret().diffie_hellman(&their_identity);
    let dh2 = identity.agreement_secret().diffie_hellman(their_base_key);
    let dh3 = prekey.secret().diffie_hellman(their_base_key);

    derive_shared_secret(&[dh1, dh2, dh3])
}

fn derive_shared_secret(dh_outputs: &[SharedSecret]) -> Result<[u8; SHARED_SECRET_SIZE]> {
    // A low-order public key forces a known output
    if !dh_outputs.iter().all(SharedSecret::was_contributory) {
        return Err(CryptoError::InvalidKey {
            reason: "Non-contributory key agreement".to_string(),
        }
        .into());
    }

    let input_key_material: Vec<u8> = dh_outputs
        .iter()
        .flat_map(|dh| dh.as_bytes().iter().copied())
        .collect();

    let hkdf = Hkdf::<Sha256>::new(None, &input_key_material);
    let mut shared_secret = [0u8; SHARED_SECRET_SIZE];
    hkdf.expand(X3DH_INFO, &mut shared_secret)
        .map_err(|_| CryptoError::KeyDerivation {
            reason: "HKDF expansion failed".to_string(),
        })?;

    Ok(shared_secret)
}
