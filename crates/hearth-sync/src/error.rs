use hearth_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("key directory error: {0}")]
    Directory(String),

    #[error("session store error: {0}")]
    SessionStore(String),

    #[error("blob store error: {0}")]
    BlobStore(String),

    /// A fetched bundle could not be decoded or its signature does not verify.
    #[error("invalid key bundle for {uid}: {reason}")]
    InvalidBundle { uid: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Sanitized tag, safe to log or surface as an error code.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Crypto(e) => e.tag(),
            Self::Directory(_) => "Directory",
            Self::SessionStore(_) => "SessionStore",
            Self::BlobStore(_) => "BlobStore",
            Self::InvalidBundle { .. } => "InvalidBundle",
            Self::Config(_) => "Config",
            Self::Task(_) => "Task",
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
