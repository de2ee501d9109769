//! Node-revision store
//!
//! Persists immutable node records and file representations on top of a
//! [`Backend`]. Every stored object is wrapped in a one-byte envelope telling
//! whether the payload is raw or zstd-compressed.
//!
//! File content is stored either as a full text or as a delta window against
//! the text of the file's predecessor. Reading a delta walks back to the
//! nearest full text and applies each window forward.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::Backend;
use crate::checksum::{Checksum, ChecksumKind};
use crate::config::DeltaPolicy;
use crate::delta::{self, DeltaWindow};
use crate::error::{FsError, NotFoundKind, Result};
use crate::node::{NodeRevId, NodeRevision, Revision, TextRep};
use crate::object::ObjectId;

const ENVELOPE_RAW: u8 = 0;
const ENVELOPE_ZSTD: u8 = 1;

/// Stored form of a file text
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Representation {
    Full {
        data: Vec<u8>,
    },
    Delta {
        base: ObjectId,
        /// Revision that created the base text
        base_revision: Revision,
        /// svndiff-encoded window
        window: Vec<u8>,
    },
}

/// The text a new file revision may be stored against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBase {
    pub text: TextRep,
    pub revision: Revision,
}

pub struct NodeStore {
    backend: Arc<dyn Backend>,
    checksum: ChecksumKind,
    policy: DeltaPolicy,
    compression_level: i32,
}

impl NodeStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        checksum: ChecksumKind,
        policy: DeltaPolicy,
        compression_level: i32,
    ) -> Self {
        Self {
            backend,
            checksum,
            policy,
            compression_level,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        self.checksum
    }

    fn seal(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.compression_level == 0 {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.push(ENVELOPE_RAW);
            out.extend_from_slice(&payload);
            return Ok(out);
        }
        let compressed = zstd::encode_all(&payload[..], self.compression_level)?;
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(ENVELOPE_ZSTD);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn unseal(id: &ObjectId, data: &[u8]) -> Result<Vec<u8>> {
        match data.split_first() {
            Some((&ENVELOPE_RAW, payload)) => Ok(payload.to_vec()),
            Some((&ENVELOPE_ZSTD, payload)) => zstd::decode_all(payload).map_err(|e| {
                FsError::fs_corrupt(format!("object {} fails to decompress: {}", id.short(), e))
            }),
            Some((tag, _)) => Err(FsError::fs_corrupt(format!(
                "object {} has unknown envelope {}",
                id.short(),
                tag
            ))),
            None => Err(FsError::fs_corrupt(format!("object {} is empty", id.short()))),
        }
    }

    // ==================== Node records ====================

    /// Persist an immutable node record
    pub fn write_node(&self, node: &NodeRevision) -> Result<NodeRevId> {
        let sealed = self.seal(node.to_bytes()?)?;
        Ok(NodeRevId(self.backend.write(&sealed)?))
    }

    /// Read a node record; `NotFound` if the id is unknown
    pub fn read_node(&self, id: &NodeRevId) -> Result<NodeRevision> {
        let raw = self.backend.read(&id.object())?;
        NodeRevision::from_bytes(&Self::unseal(&id.object(), &raw)?)
    }

    // ==================== File texts ====================

    /// Store `data` as the content of a new file revision.
    ///
    /// With a base, identical content reuses the base representation and
    /// otherwise a delta is stored when the policy prefers it.
    pub fn write_text(&self, data: &[u8], base: Option<&TextBase>) -> Result<TextRep> {
        let checksum = Checksum::compute(self.checksum, data);

        if let Some(base) = base {
            if base.text.checksum == checksum && base.text.size == data.len() as u64 {
                return Ok(base.text.clone());
            }
            let chain_len = base.text.chain_len + 1;
            if chain_len <= self.policy.max_chain_length {
                let source = self.read_text(&base.text, base.revision)?;
                let window = delta::encode(self.checksum, &source, data);
                if !window.is_replacement() {
                    let encoded = window.to_bytes();
                    if self.policy.prefers_delta(encoded.len(), data.len(), chain_len) {
                        tracing::debug!(
                            "storing delta of {} bytes for {} byte text (chain {})",
                            encoded.len(),
                            data.len(),
                            chain_len
                        );
                        let rep = self.write_rep(&Representation::Delta {
                            base: base.text.rep,
                            base_revision: base.revision,
                            window: encoded,
                        })?;
                        return Ok(TextRep {
                            rep,
                            size: data.len() as u64,
                            checksum,
                            chain_len,
                        });
                    }
                }
            }
        }

        tracing::debug!("storing full text of {} bytes", data.len());
        let rep = self.write_rep(&Representation::Full {
            data: data.to_vec(),
        })?;
        Ok(TextRep {
            rep,
            size: data.len() as u64,
            checksum,
            chain_len: 0,
        })
    }

    fn write_rep(&self, rep: &Representation) -> Result<ObjectId> {
        let sealed = self.seal(bincode::serialize(rep)?)?;
        self.backend.write(&sealed)
    }

    fn read_rep(&self, id: &ObjectId, revision: Revision) -> Result<Representation> {
        let chain_error = |reason: String| FsError::CorruptChain { revision, reason };
        let raw = self.backend.read(id).map_err(|e| match e {
            FsError::NotFound(NotFoundKind::Object(_)) => {
                chain_error(format!("representation {} is missing", id.short()))
            }
            other => other,
        })?;
        let payload = Self::unseal(id, &raw).map_err(|e| chain_error(e.to_string()))?;
        bincode::deserialize(&payload).map_err(|e| {
            chain_error(format!("undecodable representation {}: {}", id.short(), e))
        })
    }

    /// Reconstruct the text of a file created in `revision`.
    ///
    /// Any failing link of the delta chain surfaces as `CorruptChain` naming
    /// the revision whose link failed.
    pub fn read_text(&self, text: &TextRep, revision: Revision) -> Result<Vec<u8>> {
        let mut links: Vec<(Revision, DeltaWindow)> = Vec::new();
        let (mut rep_id, mut rep_rev) = (text.rep, revision);

        let mut data = loop {
            if links.len() > text.chain_len as usize {
                return Err(FsError::CorruptChain {
                    revision: rep_rev,
                    reason: format!(
                        "delta chain is longer than the recorded {} links",
                        text.chain_len
                    ),
                });
            }
            match self.read_rep(&rep_id, rep_rev)? {
                Representation::Full { data } => break data,
                Representation::Delta {
                    base,
                    base_revision,
                    window,
                } => {
                    let window =
                        DeltaWindow::from_bytes(&window).map_err(|e| FsError::CorruptChain {
                            revision: rep_rev,
                            reason: e.to_string(),
                        })?;
                    links.push((rep_rev, window));
                    rep_id = base;
                    rep_rev = base_revision;
                }
            }
        };

        for (link_rev, window) in links.iter().rev() {
            data = delta::apply(window, &data).map_err(|e| FsError::CorruptChain {
                revision: *link_rev,
                reason: e.to_string(),
            })?;
        }

        if data.len() as u64 != text.size {
            return Err(FsError::CorruptChain {
                revision,
                reason: format!("text has {} bytes, expected {}", data.len(), text.size),
            });
        }
        let actual = Checksum::compute(text.checksum.kind, &data);
        if actual != text.checksum {
            return Err(FsError::CorruptChain {
                revision,
                reason: format!("checksum mismatch: expected {}, actual {}", text.checksum, actual),
            });
        }
        Ok(data)
    }
}
