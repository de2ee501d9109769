//! Content checksums
//!
//! The repository is configured with one hash algorithm; every file text and
//! every delta window carries a checksum computed with it. Checksums are
//! compared as opaque values and only ever rendered as hex.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{FsError, Result};

/// Hash algorithm used for content checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    Sha1,
    #[default]
    Sha256,
}

impl ChecksumKind {
    /// Single-byte tag used by the svndiff checksum trailer
    pub fn tag(self) -> u8 {
        match self {
            ChecksumKind::Sha1 => 1,
            ChecksumKind::Sha256 => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(ChecksumKind::Sha1),
            2 => Ok(ChecksumKind::Sha256),
            other => Err(FsError::corrupt_delta(format!(
                "unknown checksum kind {}",
                other
            ))),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            ChecksumKind::Sha1 => 20,
            ChecksumKind::Sha256 => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChecksumKind::Sha1 => "sha1",
            ChecksumKind::Sha256 => "sha256",
        }
    }
}

/// A computed digest together with the algorithm that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub kind: ChecksumKind,
    pub digest: Vec<u8>,
}

impl Checksum {
    pub fn compute(kind: ChecksumKind, data: &[u8]) -> Self {
        let mut hasher = Checksummer::new(kind);
        hasher.update(data);
        hasher.finish()
    }

    /// Build a checksum from raw digest bytes, validating their length
    pub fn from_digest(kind: ChecksumKind, digest: Vec<u8>) -> Result<Self> {
        if digest.len() != kind.digest_len() {
            return Err(FsError::corrupt_delta(format!(
                "{} digest has {} bytes",
                kind.name(),
                digest.len()
            )));
        }
        Ok(Self { kind, digest })
    }

    pub fn from_hex(kind: ChecksumKind, hex_str: &str) -> Result<Self> {
        let digest = hex::decode(hex_str)
            .map_err(|e| FsError::Serialization(format!("bad checksum '{}': {}", hex_str, e)))?;
        Self::from_digest(kind, digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hasher for streamed content
pub enum Checksummer {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Checksummer {
    pub fn new(kind: ChecksumKind) -> Self {
        match kind {
            ChecksumKind::Sha1 => Checksummer::Sha1(Sha1::new()),
            ChecksumKind::Sha256 => Checksummer::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksummer::Sha1(h) => h.update(data),
            Checksummer::Sha256(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Checksum {
        match self {
            Checksummer::Sha1(h) => Checksum {
                kind: ChecksumKind::Sha1,
                digest: h.finalize().to_vec(),
            },
            Checksummer::Sha256(h) => Checksum {
                kind: ChecksumKind::Sha256,
                digest: h.finalize().to_vec(),
            },
        }
    }
}
