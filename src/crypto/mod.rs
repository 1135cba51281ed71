//! Key material: identities, prekeys and prekey bundles.

pub mod identity;
pub mod prekeys;

pub use identity::*;
pub use prekeys::*;
