//! Node-revision model
//!
//! A revision is a tree of immutable [`NodeRevision`] records. Directories
//! name their children by [`NodeRevId`]; a directory that did not touch a
//! child keeps the child's id, so unchanged subtrees are shared between
//! revisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::checksum::Checksum;
use crate::error::{FsError, Result};
use crate::keys::NodeId;
use crate::object::ObjectId;
use crate::properties::PropertySet;

/// Revision number
pub type Revision = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::File => write!(f, "file"),
            NodeKind::Dir => write!(f, "dir"),
        }
    }
}

/// Revision-scoped identity of a stored node record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRevId(pub ObjectId);

impl NodeRevId {
    pub fn object(&self) -> ObjectId {
        self.0
    }
}

impl std::fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub id: NodeRevId,
}

/// Pointer to a file's stored content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRep {
    /// Stored representation (full text or delta)
    pub rep: ObjectId,
    /// Length of the reconstructed text
    pub size: u64,
    pub checksum: Checksum,
    /// Number of delta links between this rep and its full text
    pub chain_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFrom {
    pub revision: Revision,
    pub path: String,
}

/// An immutable node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRevision {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub created_rev: Revision,
    pub created_path: String,
    pub predecessor: Option<NodeRevId>,
    pub predecessor_count: u64,
    pub copy_from: Option<CopyFrom>,
    pub props: PropertySet,
    /// Children, directories only
    pub entries: BTreeMap<String, DirEntry>,
    /// Content, files only
    pub text: Option<TextRep>,
}

impl NodeRevision {
    pub fn new_dir(node_id: NodeId, created_rev: Revision, created_path: &str) -> Self {
        Self::new(node_id, NodeKind::Dir, created_rev, created_path)
    }

    pub fn new_file(node_id: NodeId, created_rev: Revision, created_path: &str) -> Self {
        Self::new(node_id, NodeKind::File, created_rev, created_path)
    }

    fn new(node_id: NodeId, kind: NodeKind, created_rev: Revision, created_path: &str) -> Self {
        Self {
            node_id,
            kind,
            created_rev,
            created_path: created_path.to_string(),
            predecessor: None,
            predecessor_count: 0,
            copy_from: None,
            props: PropertySet::new(),
            entries: BTreeMap::new(),
            text: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| FsError::fs_corrupt(format!("undecodable node record: {}", e)))
    }
}

/// What happened to a path in a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Add,
    Modify,
    Delete,
    Replace,
}

impl ChangeAction {
    pub fn as_char(self) -> char {
        match self {
            ChangeAction::Add => 'A',
            ChangeAction::Modify => 'M',
            ChangeAction::Delete => 'D',
            ChangeAction::Replace => 'R',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub action: ChangeAction,
    pub kind: NodeKind,
    pub copy_from: Option<CopyFrom>,
    pub text_mod: bool,
    pub props_mod: bool,
}

/// What a backend publishes for each revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub root: NodeRevId,
    pub changes: Vec<ChangedPath>,
}

impl RevisionRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(revision: Revision, data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| {
            FsError::fs_corrupt(format!("undecodable record for r{}: {}", revision, e))
        })
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub revision: Revision,
    pub date: DateTime<Utc>,
    pub author: Option<String>,
}
