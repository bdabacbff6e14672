use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("prekey error: {0}")]
    PreKeyError(String),

    #[error("key storage error: {0}")]
    StorageError(String),

    /// Sealing was attempted against a session without a resolved root key.
    #[error("session has no root key")]
    MissingRootKey,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("attachment ciphertext too small: {actual} bytes")]
    CiphertextTooSmall { actual: usize },

    #[error("attachment size mismatch: declared {declared}, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("attachment MAC mismatch")]
    MacMismatch,

    #[error("attachment download exceeds cap of {cap} bytes")]
    DownloadTooLarge { cap: u64 },

    #[error("attachment decryption failed")]
    AttachmentDecryption,
}

impl CryptoError {
    /// Sanitized tag for logs and UI-facing error codes.
    ///
    /// Only the variant name; the message text may carry key or payload
    /// fragments and must not leave the process.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::KeyGeneration(_) => "KeyGeneration",
            Self::VerificationError(_) => "VerificationError",
            Self::EncryptionError(_) => "EncryptionError",
            Self::DecryptionError(_) => "DecryptionError",
            Self::InvalidKey(_) => "InvalidKey",
            Self::PreKeyError(_) => "PreKeyError",
            Self::StorageError(_) => "StorageError",
            Self::MissingRootKey => "MissingRootKey",
            Self::MalformedPayload(_) => "MalformedPayload",
            Self::CiphertextTooSmall { .. } => "CiphertextTooSmall",
            Self::SizeMismatch { .. } => "SizeMismatch",
            Self::MacMismatch => "MacMismatch",
            Self::DownloadTooLarge { .. } => "DownloadTooLarge",
            Self::AttachmentDecryption => "AttachmentDecryption",
        }
    }

    /// Whether this error means the stored content failed an integrity check.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::DecryptionError(_)
                | Self::MalformedPayload(_)
                | Self::CiphertextTooSmall { .. }
                | Self::SizeMismatch { .. }
                | Self::MacMismatch
                | Self::DownloadTooLarge { .. }
                | Self::AttachmentDecryption
        )
    }
}
