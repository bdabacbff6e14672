pub mod attachments;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod mapper;
pub mod memory;
pub mod session;

pub use attachments::{AttachmentService, BlobStore};
pub use client::{Collaborators, E2eeClient};
pub use config::E2eeConfig;
pub use directory::{BundleCache, DirectoryRecord, KeyDirectory, KeyDirectoryClient};
pub use error::SyncError;
pub use mapper::{DecryptedMessage, MessageStatus, RawMessageRecord, ReadReceiptUpdate};
pub use session::{SessionKeyResolver, SessionRecord, SessionRecordSource};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
