//! Double Ratchet state.
//!
//! Decryption works on a copy of the state and only replaces the original
//! once the ciphertext has authenticated, so a rejected message never moves
//! the ratchet.

use crate::session::message::CipherMessage;
use crate::utils::{CryptoError, Result, SessionError};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::VecDeque;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of symmetric keys
const KEY_SIZE: usize = 32;

/// Size of the ChaCha20-Poly1305 nonce prepended to ciphertexts
const NONCE_SIZE: usize = 12;

/// HKDF info for root key derivation
const ROOT_KEY_INFO: &[u8] = b"cryptobox-root";

/// HKDF info for chain key derivation
const CHAIN_KEY_INFO: &[u8] = b"cryptobox-chain";

/// Maximum number of message keys skipped in a single chain jump
pub const MAX_SKIP: u32 = 1000;

/// Number of superseded receiving chains kept for late messages
pub const MAX_PREVIOUS_CHAINS: usize = 5;

/// Total number of skipped message keys held, oldest evicted first
pub const MAX_SKIPPED_KEYS: usize = 2 * MAX_SKIP as usize;

type Key = [u8; KEY_SIZE];

#[derive(Clone)]
struct SendChain {
    chain_key: Key,
    index: u32,
}

#[derive(Clone)]
struct RecvChain {
    ratchet_key: [u8; 32],
    chain_key: Key,
    next_index: u32,
}

/// A receiving chain that has been superseded by a DH ratchet step
#[derive(Clone, Serialize, Deserialize)]
struct RetiredChain {
    ratchet_key: [u8; 32],
    next_index: u32,
}

/// Ratchet state shared by both sides of a session
#[derive(Clone)]
pub struct RatchetState {
    root_key: Key,
    sending: Option<SendChain>,
    receiving: Option<RecvChain>,
    retired: VecDeque<RetiredChain>,
    dh_secret: StaticSecret,
    dh_public: PublicKey,
    previous_sending_length: u32,
    skipped_message_keys: VecDeque<SkippedKey>,
}

/// Message key stored for a message that has not arrived yet
#[derive(Clone)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    counter: u32,
    message_key: Key,
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("root_key", &"[REDACTED]")
            .field("dh_public", &hex::encode(self.dh_public.as_bytes()))
            .field("sending_index", &self.sending.as_ref().map(|c| c.index))
            .field("receiving_index", &self.receiving.as_ref().map(|c| c.next_index))
            .field("retired_chains", &self.retired.len())
            .field("skipped_keys", &self.skipped_message_keys.len())
            .finish()
    }
}

impl RatchetState {
    /// Initialize as the initiator, who sends first
    ///
    /// # Arguments
    ///
    /// * `shared_secret` - Output of the X3DH agreement
    /// * `their_prekey` - The responder's prekey, used as their first ratchet key
    pub fn new_initiator(shared_secret: [u8; KEY_SIZE], their_prekey: &PublicKey) -> Result<Self> {
        let root_key = Self::kdf_root_key(&shared_secret)?;

        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let dh_public = PublicKey::from(&dh_secret);
        let (root_key, sending_chain_key) = Self::kdf_rk(&root_key, &dh_secret, their_prekey)?;

        Ok(Self {
            root_key,
            sending: Some(SendChain {
                chain_key: sending_chain_key,
                index: 0,
            }),
            receiving: None,
            retired: VecDeque::new(),
            dh_secret,
            dh_public,
            previous_sending_length: 0,
            skipped_message_keys: VecDeque::new(),
        })
    }

    /// Initialize as the responder, whose prekey is the first ratchet key
    pub fn new_recipient(shared_secret: [u8; KEY_SIZE], prekey_secret: StaticSecret) -> Result<Self> {
        let root_key = Self::kdf_root_key(&shared_secret)?;
        let dh_public = PublicKey::from(&prekey_secret);

        Ok(Self {
            root_key,
            sending: None,
            receiving: None,
            retired: VecDeque::new(),
            dh_secret: prekey_secret,
            dh_public,
            previous_sending_length: 0,
            skipped_message_keys: VecDeque::new(),
        })
    }

    /// Encrypt the next message on the sending chain
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<CipherMessage> {
        let chain = self.sending.as_mut().ok_or_else(|| SessionError::InvalidSession {
            reason: "No sending chain available".to_string(),
        })?;

        let (next_chain_key, message_key) = Self::kdf_ck(&chain.chain_key)?;
        let counter = chain.index;
        chain.chain_key = next_chain_key;
        chain.index += 1;

        let ratchet_key = self.dh_public.to_bytes();
        let header =
            CipherMessage::header_bytes(&ratchet_key, counter, self.previous_sending_length);

        Ok(CipherMessage {
            ratchet_key,
            counter,
            prev_counter: self.previous_sending_length,
            ciphertext: Self::seal(&message_key, &header, plaintext)?,
        })
    }

    /// Decrypt a message, advancing the ratchet only on success
    pub fn decrypt(&mut self, message: &CipherMessage) -> Result<Vec<u8>> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(message)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(&mut self, message: &CipherMessage) -> Result<Vec<u8>> {
        if let Some(position) = self.skipped_message_keys.iter().position(|skipped| {
            skipped.ratchet_key == message.ratchet_key && skipped.counter == message.counter
        }) {
            if let Some(skipped) = self.skipped_message_keys.remove(position) {
                return Self::open(&skipped.message_key, message);
            }
        }

        let current = self.receiving.as_ref().map(|chain| chain.ratchet_key);
        if current != Some(message.ratchet_key) {
            if let Some(retired) = self
                .retired
                .iter()
                .find(|chain| chain.ratchet_key == message.ratchet_key)
            {
                return Err(if message.counter < retired.next_index {
                    SessionError::DuplicateMessage
                } else {
                    SessionError::OutOfOrderMessage {
                        counter: message.counter,
                    }
                }
                .into());
            }

            self.skip_message_keys(message.prev_counter)?;
            self.dh_ratchet(&message.ratchet_key)?;
        }

        if let Some(chain) = &self.receiving {
            if message.counter < chain.next_index {
                return Err(SessionError::DuplicateMessage.into());
            }
        }
        self.skip_message_keys(message.counter)?;

        let chain = self
            .receiving
            .as_mut()
            .ok_or_else(|| SessionError::InvalidSession {
                reason: "No receiving chain available".to_string(),
            })?;
        let (next_chain_key, message_key) = Self::kdf_ck(&chain.chain_key)?;
        chain.chain_key = next_chain_key;
        chain.next_index += 1;

        Self::open(&message_key, message)
    }

    /// Perform a DH ratchet step on a new remote ratchet key
    fn dh_ratchet(&mut self, their_ratchet_key: &[u8; 32]) -> Result<()> {
        if let Some(old) = self.receiving.take() {
            self.retired.push_front(RetiredChain {
                ratchet_key: old.ratchet_key,
                next_index: old.next_index,
            });
            self.retired.truncate(MAX_PREVIOUS_CHAINS);

            let retired = &self.retired;
            self.skipped_message_keys.retain(|skipped| {
                retired
                    .iter()
                    .any(|chain| chain.ratchet_key == skipped.ratchet_key)
            });
        }

        self.previous_sending_length = self.sending.as_ref().map_or(0, |chain| chain.index);

        let their_public = PublicKey::from(*their_ratchet_key);
        let (root_key, receiving_chain_key) =
            Self::kdf_rk(&self.root_key, &self.dh_secret, &their_public)?;
        self.receiving = Some(RecvChain {
            ratchet_key: *their_ratchet_key,
            chain_key: receiving_chain_key,
            next_index: 0,
        });

        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let (root_key, sending_chain_key) = Self::kdf_rk(&root_key, &dh_secret, &their_public)?;
        self.root_key = root_key;
        self.sending = Some(SendChain {
            chain_key: sending_chain_key,
            index: 0,
        });
        self.dh_public = PublicKey::from(&dh_secret);
        self.dh_secret = dh_secret;

        Ok(())
    }

    /// Store message keys of the receiving chain up to (excluding) `until`
    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        let Some(chain) = self.receiving.as_mut() else {
            return Ok(());
        };

        if until <= chain.next_index {
            return Ok(());
        }
        if until - chain.next_index > MAX_SKIP {
            return Err(SessionError::OutOfOrderMessage { counter: until }.into());
        }

        while chain.next_index < until {
            let (next_chain_key, message_key) = Self::kdf_ck(&chain.chain_key)?;
            self.skipped_message_keys.push_back(SkippedKey {
                ratchet_key: chain.ratchet_key,
                counter: chain.next_index,
                message_key,
            });
            chain.chain_key = next_chain_key;
            chain.next_index += 1;
        }

        // Evicted messages are reported as duplicates once they arrive
        while self.skipped_message_keys.len() > MAX_SKIPPED_KEYS {
            self.skipped_message_keys.pop_front();
        }

        Ok(())
    }

    fn kdf_root_key(shared_secret: &[u8]) -> Result<Key> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
        let mut root_key = [0u8; KEY_SIZE];
        hkdf.expand(ROOT_KEY_INFO, &mut root_key)
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Root key derivation failed".to_string(),
            })?;
        Ok(root_key)
    }

    fn kdf_rk(root_key: &Key, dh_private: &StaticSecret, dh_public: &PublicKey) -> Result<(Key, Key)> {
        let dh_output = dh_private.diffie_hellman(dh_public);
        if !dh_output.was_contributory() {
            return Err(CryptoError::InvalidKey {
                reason: "Non-contributory ratchet key".to_string(),
            }
            .into());
        }
        let hkdf = Hkdf::<Sha256>::new(Some(&root_key[..]), dh_output.as_bytes());

        let mut output = [0u8; KEY_SIZE * 2];
        hkdf.expand(ROOT_KEY_INFO, &mut output)
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Root and chain key derivation failed".to_string(),
            })?;

        Ok(Self::split(&output))
    }

    fn kdf_ck(chain_key: &Key) -> Result<(Key, Key)> {
        let hkdf = Hkdf::<Sha256>::new(None, chain_key);

        let mut output = [0u8; KEY_SIZE * 2];
        hkdf.expand(CHAIN_KEY_INFO, &mut output)
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Chain key derivation failed".to_string(),
            })?;

        Ok(Self::split(&output))
    }

    fn split(output: &[u8; KEY_SIZE * 2]) -> (Key, Key) {
        let mut first = [0u8; KEY_SIZE];
        let mut second = [0u8; KEY_SIZE];
        first.copy_from_slice(&output[..KEY_SIZE]);
        second.copy_from_slice(&output[KEY_SIZE..]);
        (first, second)
    }

    fn seal(message_key: &Key, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(message_key.into());
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let mut ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::Encryption {
                reason: "Message encryption failed".to_string(),
            })?;

        let mut result = nonce.to_vec();
        result.append(&mut ciphertext);
        Ok(result)
    }

    fn open(message_key: &Key, message: &CipherMessage) -> Result<Vec<u8>> {
        if message.ciphertext.len() < NONCE_SIZE {
            return Err(SessionError::DecryptFailed {
                reason: "Ciphertext too short".to_string(),
            }
            .into());
        }

        let header =
            CipherMessage::header_bytes(&message.ratchet_key, message.counter, message.prev_counter);
        let cipher = ChaCha20Poly1305::new(message_key.into());
        let nonce = Nonce::from_slice(&message.ciphertext[..NONCE_SIZE]);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &message.ciphertext[NONCE_SIZE..],
                    aad: &header,
                },
            )
            .map_err(|_| {
                SessionError::DecryptFailed {
                    reason: "Message authentication failed".to_string(),
                }
                .into()
            })
    }
}

/// Serializable form of [`RatchetState`]
#[derive(Serialize, Deserialize)]
pub(crate) struct RatchetRecord {
    root_key: Key,
    sending: Option<(Key, u32)>,
    receiving: Option<([u8; 32], Key, u32)>,
    retired: Vec<RetiredChain>,
    dh_secret: [u8; 32],
    previous_sending_length: u32,
    skipped_message_keys: Vec<([u8; 32], u32, Key)>,
}

impl From<&RatchetState> for RatchetRecord {
    fn from(state: &RatchetState) -> Self {
        Self {
            root_key: state.root_key,
            sending: state.sending.as_ref().map(|c| (c.chain_key, c.index)),
            receiving: state
                .receiving
                .as_ref()
                .map(|c| (c.ratchet_key, c.chain_key, c.next_index)),
            retired: state.retired.iter().cloned().collect(),
            dh_secret: state.dh_secret.to_bytes(),
            previous_sending_length: state.previous_sending_length,
            skipped_message_keys: state
                .skipped_message_keys
                .iter()
                .map(|skipped| (skipped.ratchet_key, skipped.counter, skipped.message_key))
                .collect(),
        }
    }
}

impl From<RatchetRecord> for RatchetState {
    fn from(record: RatchetRecord) -> Self {
        let dh_secret = StaticSecret::from(record.dh_secret);
        let dh_public = PublicKey::from(&dh_secret);
        Self {
            root_key: record.root_key,
            sending: record
                .sending
                .map(|(chain_key, index)| SendChain { chain_key, index }),
            receiving: record
                .receiving
                .map(|(ratchet_key, chain_key, next_index)| RecvChain {
                    ratchet_key,
                    chain_key,
                    next_index,
                }),
            retired: record.retired.into_iter().collect(),
            dh_secret,
            dh_public,
            previous_sending_length: record.previous_sending_length,
            skipped_message_keys: record
                .skipped_message_keys
                .into_iter()
                .map(|(ratchet_key, counter, message_key)| SkippedKey {
                    ratchet_key,
                    counter,
                    message_key,
                })
                .collect(),
        }
    }
}
