//! Envelope and message wire types.

use crate::crypto::IdentityKey;
use crate::utils::{CryptoboxError, Result, SessionError};
use serde::{Deserialize, Serialize};

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// A Double Ratchet message: header plus authenticated ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherMessage {
    /// Sender's current ratchet public key
    pub ratchet_key: [u8; 32],
    /// Index of this message in the sending chain
    pub counter: u32,
    /// Length of the sender's previous sending chain
    pub prev_counter: u32,
    /// Nonce followed by the ChaCha20-Poly1305 ciphertext
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl CipherMessage {
    /// Header bytes bound to the ciphertext as associated data
    pub(crate) fn header_bytes(ratchet_key: &[u8; 32], counter: u32, prev_counter: u32) -> Vec<u8> {
        let mut header = Vec::with_capacity(40);
        header.extend_from_slice(ratchet_key);
        header.extend_from_slice(&counter.to_be_bytes());
        header.extend_from_slice(&prev_counter.to_be_bytes());
        header
    }
}

/// First messages of a session, carrying what the responder needs for X3DH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    /// Id of the responder prekey the initiator used
    pub prekey_id: u16,
    /// Initiator's base (ephemeral) public key
    pub base_key: [u8; 32],
    /// Initiator's identity key
    pub identity_key: IdentityKey,
    /// The enclosed ratchet message
    pub message: CipherMessage,
}

/// Message variants carried by an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Session-establishing message
    PreKey(PreKeyMessage),
    /// Regular ratchet message
    Cipher(CipherMessage),
}

/// Versioned container for a message on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version
    pub version: u8,
    /// The wrapped message
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with the current version
    pub fn new(message: Message) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message,
        }
    }

    /// The ratchet message inside, regardless of variant
    pub fn cipher_message(&self) -> &CipherMessage {
        match &self.message {
            Message::PreKey(prekey_message) => &prekey_message.message,
            Message::Cipher(message) => message,
        }
    }

    /// True for session-establishing envelopes
    pub fn is_prekey_message(&self) -> bool {
        matches!(self.message, Message::PreKey(_))
    }

    /// Serialize for transport
    pub fn serialise(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(CryptoboxError::from)
    }

    /// Decode a serialized envelope
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidEnvelope` for malformed input or an
    /// unsupported version
    pub fn deserialise(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = bincode::deserialize(bytes).map_err(|e| SessionError::InvalidEnvelope {
            reason: e.to_string(),
        })?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(SessionError::InvalidEnvelope {
                reason: format!("unsupported version {}", envelope.version),
            }
            .into());
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    fn sample_message() -> CipherMessage {
        CipherMessage {
            ratchet_key: [7u8; 32],
            counter: 3,
            prev_counter: 1,
            ciphertext: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_prekey_envelope_exposes_inner_message() {
        let identity = IdentityKeyPair::generate();
        let envelope = Envelope::new(Message::PreKey(PreKeyMessage {
            prekey_id: 9,
            base_key: [1u8; 32],
            identity_key: *identity.public_key(),
            message: sample_message(),
        }));

        let decoded = Envelope::deserialise(&envelope.serialise().unwrap()).unwrap();
        assert!(decoded.is_prekey_message());
        assert_eq!(decoded.cipher_message(), &sample_message());
    }

    #[test]
    fn test_unsupported_version() {
        let mut envelope = Envelope::new(Message::Cipher(sample_message()));
        envelope.version = 99;

        let err = Envelope::deserialise(&envelope.serialise().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            CryptoboxError::Session(SessionError::InvalidEnvelope { .. })
        ));
    }

    #[test]
    fn test_truncated_envelope() {
        let bytes = Envelope::new(Message::Cipher(sample_message()))
            .serialise()
            .unwrap();
        assert!(Envelope::deserialise(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_header_binds_counters() {
        let a = CipherMessage::header_bytes(&[0u8; 32], 1, 0);
        let b = CipherMessage::header_bytes(&[0u8; 32], 0, 1);
        assert_ne!(a, b);
        assert_eq!(a.len(), 40);
    }
}
