//! Error types and handling for cryptobox.
//!
//! Every failure coming from a collaborator (the durable store or the
//! crypto engine) is surfaced with its original kind preserved. Nothing in
//! this crate retries or silently recovers.

use thiserror::Error;

/// Result type alias for the cryptobox library
pub type Result<T> = std::result::Result<T, CryptoboxError>;

/// Top-level error type for all cryptobox operations
#[derive(Error, Debug, Clone)]
pub enum CryptoboxError {
    /// Durable store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Session establishment and ratchet failures
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Cryptographic primitive failures
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization errors outside of the wire formats
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors reported by a [`CryptoboxStore`](crate::store::CryptoboxStore)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing medium rejected the operation
    #[error("Store backend failure: {reason}")]
    Backend { reason: String },

    /// Filesystem or device failure
    #[error("Store I/O failure: {reason}")]
    Io { reason: String },

    /// A persisted record could not be decoded
    #[error("Corrupt {what} record: {reason}")]
    Corrupt { what: String, reason: String },

    /// Some staged prekey deletions failed; the others were applied
    #[error("Failed to delete {} prekey(s): {}", failed.len(), format_failed(failed))]
    PreKeyCommit { failed: Vec<(u16, String)> },
}

fn format_failed(failed: &[(u16, String)]) -> String {
    failed
        .iter()
        .map(|(id, reason)| format!("{id} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl StoreError {
    /// Creates a backend error with the given reason
    pub fn backend<S: Into<String>>(reason: S) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Ids whose durable deletion failed, if this is a partial commit error
    pub fn failed_prekeys(&self) -> Vec<u16> {
        match self {
            Self::PreKeyCommit { failed } => failed.iter().map(|(id, _)| *id).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

/// Session establishment and ratchet errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Prekey bundle could not be decoded or failed validation
    #[error("Invalid prekey bundle: {reason}")]
    InvalidBundle { reason: String },

    /// Envelope could not be decoded or has the wrong shape
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// The referenced prekey is not available
    #[error("Prekey not found: {prekey_id}")]
    PreKeyNotFound { prekey_id: u16 },

    /// Message has already been decrypted
    #[error("Duplicate message")]
    DuplicateMessage,

    /// Message belongs to a chain or counter that can no longer be decrypted
    #[error("Out of order message: counter {counter}")]
    OutOfOrderMessage { counter: u32 },

    /// Ciphertext failed authentication
    #[error("Decryption failed: {reason}")]
    DecryptFailed { reason: String },

    /// Serialized session state is malformed
    #[error("Invalid session state: {reason}")]
    InvalidSession { reason: String },

    /// Serialized session belongs to another local identity
    #[error("Session does not belong to local identity {expected}")]
    IdentityMismatch { expected: String },
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl CryptoboxError {
    /// True if the referenced prekey was absent
    pub fn is_prekey_not_found(&self) -> bool {
        matches!(self, Self::Session(SessionError::PreKeyNotFound { .. }))
    }

    /// True if the message was already decrypted by this session
    pub fn is_duplicate_message(&self) -> bool {
        matches!(self, Self::Session(SessionError::DuplicateMessage))
    }

    /// Returns true if repeating the same call may succeed.
    ///
    /// Only store failures qualify; the caller decides whether to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Io { .. })
                | Self::Store(StoreError::Backend { .. })
                | Self::Store(StoreError::PreKeyCommit { .. })
                | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for CryptoboxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for CryptoboxError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
