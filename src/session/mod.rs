//! The crypto engine: key agreement, Double Ratchet and session objects.

pub mod engine;
pub mod message;
pub mod ratchet;
pub mod x3dh;

pub use engine::*;
pub use message::*;
