//! # Cryptobox
//!
//! Identity, session and prekey lifecycle management for an end-to-end
//! encrypted channel built on X3DH key agreement and the Double Ratchet.
//!
//! ## Features
//!
//! - **Identity Management**: one Ed25519 identity per store, created on first use
//! - **Prekeys**: signed bundles, with a last-resort prekey that is never deleted
//! - **Deferred Deletion**: consumed prekeys are removed only after the session is saved
//! - **Pluggable Storage**: async [`CryptoboxStore`] trait with memory and file backends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cryptobox::{Cryptobox, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cryptobox::Result<()> {
//!     let alice = Cryptobox::open(Arc::new(MemoryStore::new())).await?;
//!     let bob = Cryptobox::open(Arc::new(MemoryStore::new())).await?;
//!
//!     let bundle = bob.new_prekey(1).await?;
//!     let mut to_bob = alice.create_from_bundle("bob", &bundle).await?;
//!     let hello = to_bob.encrypt(b"Hello Bob!")?;
//!     alice.save(&mut to_bob).await?;
//!
//!     let (mut from_alice, plaintext) = bob.create_from_message("alice", &hello).await?;
//!     assert_eq!(plaintext, b"Hello Bob!");
//!     bob.save(&mut from_alice).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: identity keys, prekeys and prekey bundles
//! - [`session`]: key agreement, Double Ratchet and the wire format
//! - [`store`]: the durable store contract and its implementations
//! - [`cryptobox`]: the session repository built on top of all of the above
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod cryptobox;
pub mod session;
pub mod store;
pub mod utils;

// Re-export commonly used types for convenience
pub use crate::cryptobox::{Cryptobox, CryptoboxSession, DeferredPreKeyView, IdentityManager};
pub use crypto::{IdentityKey, IdentityKeyPair, PreKey, PreKeyBundle, MAX_PREKEY_ID};
pub use store::{CryptoboxStore, FileStore, MemoryStore};
pub use utils::{
    CryptoboxConfig, CryptoboxError, CryptoError, Result, SessionError, StoreError,
};
