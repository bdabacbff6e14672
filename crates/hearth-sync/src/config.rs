use std::path::Path;

use hearth_crypto::sealing::attachment::DEFAULT_DOWNLOAD_CAP;
use hearth_crypto::sealing::cache::DEFAULT_CAPACITY;
use hearth_crypto::{KeyManagerConfig, CURRENT_SCHEME_VERSION};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Runtime tuning for the E2EE client. Every field has a default, so an
/// empty JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeConfig {
    /// Size the one-time prekey pool is refilled to.
    #[serde(default = "default_pool_size")]
    pub one_time_prekey_pool_size: usize,
    /// Refill is triggered when the pool drops below this.
    #[serde(default = "default_replenish_threshold")]
    pub replenish_threshold: usize,
    /// First prekey id on a fresh account.
    #[serde(default = "default_prekey_id_base")]
    pub prekey_id_base: u32,
    #[serde(default = "default_attachment_cache_capacity")]
    pub attachment_cache_capacity: usize,
    /// Download cap in bytes for attachments with no recorded size.
    #[serde(default = "default_attachment_download_cap")]
    pub attachment_download_cap: u64,
    #[serde(default = "default_directory_cache_capacity")]
    pub directory_cache_capacity: usize,
    /// Scheme version stamped on newly resolved sessions.
    #[serde(default = "default_scheme_version")]
    pub scheme_version: u32,
}

fn default_pool_size() -> usize {
    100
}

fn default_replenish_threshold() -> usize {
    20
}

fn default_prekey_id_base() -> u32 {
    1
}

fn default_attachment_cache_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_attachment_download_cap() -> u64 {
    DEFAULT_DOWNLOAD_CAP
}

fn default_directory_cache_capacity() -> usize {
    256
}

fn default_scheme_version() -> u32 {
    CURRENT_SCHEME_VERSION
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_pool_size: default_pool_size(),
            replenish_threshold: default_replenish_threshold(),
            prekey_id_base: default_prekey_id_base(),
            attachment_cache_capacity: default_attachment_cache_capacity(),
            attachment_download_cap: default_attachment_download_cap(),
            directory_cache_capacity: default_directory_cache_capacity(),
            scheme_version: default_scheme_version(),
        }
    }
}

impl E2eeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.replenish_threshold > self.one_time_prekey_pool_size {
            return Err(SyncError::Config(format!(
                "replenishThreshold ({}) exceeds oneTimePrekeyPoolSize ({})",
                self.replenish_threshold, self.one_time_prekey_pool_size
            )));
        }
        if self.attachment_cache_capacity == 0 || self.directory_cache_capacity == 0 {
            return Err(SyncError::Config("cache capacities must be non-zero".into()));
        }
        if self.scheme_version == 0 {
            return Err(SyncError::Config("schemeVersion must be at least 1".into()));
        }
        Ok(())
    }

    pub fn key_manager_config(&self) -> KeyManagerConfig {
        KeyManagerConfig {
            one_time_prekey_pool_size: self.one_time_prekey_pool_size,
            min_one_time_prekeys: self.replenish_threshold,
            prekey_id_base: self.prekey_id_base,
        }
    }
}
