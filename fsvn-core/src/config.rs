//! Repository configuration
//!
//! Stored as pretty JSON in `<repo>/fsvn.json`. Missing tuning fields take
//! their defaults so older configuration files keep loading; the repository
//! `uuid` is required.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::checksum::ChecksumKind;
use crate::error::{FsError, Result};

pub const CONFIG_FILE: &str = "fsvn.json";

/// Current on-disk format
pub const FORMAT: u32 = 1;

/// Storage backend of an on-disk repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Filesystem,
    Sqlite,
}

/// When a file revision is stored as a delta instead of a full text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaPolicy {
    /// Longest chain of deltas a reader may have to walk
    pub max_chain_length: u32,
    /// Largest delta, as a percentage of the full text, still worth storing
    pub max_delta_percent: u32,
}

impl Default for DeltaPolicy {
    fn default() -> Self {
        Self {
            max_chain_length: 16,
            max_delta_percent: 75,
        }
    }
}

impl DeltaPolicy {
    /// Store every revision as a full text
    pub fn fulltext_only() -> Self {
        Self {
            max_chain_length: 0,
            max_delta_percent: 0,
        }
    }

    /// Whether a delta of `delta_len` bytes, ending a chain of `chain_len`
    /// links, should replace a full text of `full_len` bytes
    pub fn prefers_delta(&self, delta_len: usize, full_len: usize, chain_len: u32) -> bool {
        chain_len <= self.max_chain_length
            && (delta_len as u128) * 100 <= (full_len as u128) * self.max_delta_percent as u128
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_format")]
    pub format: u32,
    /// Repository identity
    pub uuid: String,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub checksum: ChecksumKind,
    /// Revisions per revprops pack
    #[serde(default = "default_revprops_pack_size")]
    pub revprops_pack_size: u64,
    #[serde(default)]
    pub delta: DeltaPolicy,
    /// zstd level for stored records, 0 stores them raw
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    #[serde(default = "default_path_cache_capacity")]
    pub path_cache_capacity: usize,
}

fn default_format() -> u32 {
    FORMAT
}

fn default_revprops_pack_size() -> u64 {
    16
}

fn default_compression_level() -> i32 {
    3
}

fn default_path_cache_capacity() -> usize {
    4096
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            format: FORMAT,
            uuid: uuid::Uuid::new_v4().to_string(),
            backend: BackendKind::default(),
            checksum: ChecksumKind::default(),
            revprops_pack_size: default_revprops_pack_size(),
            delta: DeltaPolicy::default(),
            compression_level: default_compression_level(),
            path_cache_capacity: default_path_cache_capacity(),
        }
    }
}

impl RepositoryConfig {
    /// Load from repository directory, or return defaults if not present
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: RepositoryConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to repository directory
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.format != FORMAT {
            return Err(FsError::fs_corrupt(format!(
                "unsupported repository format {}",
                self.format
            )));
        }
        if self.uuid.trim().is_empty() {
            return Err(FsError::fs_corrupt("repository uuid is empty"));
        }
        if self.revprops_pack_size == 0 {
            return Err(FsError::fs_corrupt("revprops_pack_size must be positive"));
        }
        Ok(())
    }
}
