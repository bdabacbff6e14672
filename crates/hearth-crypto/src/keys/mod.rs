pub mod bundle;
pub mod identity;
pub mod manager;

pub use bundle::{KeyBundle, KeyGenerationResult, PublicOneTimePrekey};
pub use identity::{IdentityKeyPair, SigningKeyPair};
pub use manager::{KeyManager, KeyManagerConfig};
