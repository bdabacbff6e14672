pub mod error;
pub mod keychain;
pub mod keys;
pub mod sealing;
pub mod secret_store;
pub mod session;

pub use error::CryptoError;
pub use keychain::{Keychain, MemoryKeychain};
pub use keys::{KeyBundle, KeyGenerationResult, KeyManager, KeyManagerConfig};
pub use sealing::attachment::{AttachmentMetadata, EncryptedAttachment};
pub use sealing::cache::AttachmentCache;
pub use sealing::message::{
    EncryptionMetadata, EncryptionPayload, MessageBody, MessageType, OpenOutcome,
};
pub use secret_store::EncryptedFileKeychain;
pub use session::{RootKey, SessionKeyInfo, CURRENT_SCHEME_VERSION};
