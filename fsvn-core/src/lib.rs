//! FSvn Core Library
//!
//! Versioned storage engine for a Subversion-style repository:
//! - Delta codec (svndiff windows) for file content
//! - Immutable node-revision store with delta chains
//! - Copy-on-write transactions and the commit editor protocol
//! - Revision properties with pack files and a manifest
//! - Path index over published revisions
//! - Filesystem, SQLite and in-memory storage backends

pub mod backend;
pub mod checksum;
pub mod config;
pub mod delta;
pub mod disk_backend;
pub mod editor;
pub mod error;
pub mod hooks;
pub mod keys;
pub mod node;
pub mod object;
pub mod paths;
pub mod properties;
pub mod repository;
pub mod revprops;
pub mod sqlite_backend;
pub mod store;
pub mod txn;

pub use backend::{Backend, MemoryBackend};
pub use checksum::{Checksum, ChecksumKind};
pub use config::{BackendKind, DeltaPolicy, RepositoryConfig};
pub use delta::DeltaWindow;
pub use disk_backend::FsBackend;
pub use editor::{CommitEditor, EditorState, TextSink};
pub use error::{FsError, NotFoundKind, Result};
pub use hooks::HookManager;
pub use keys::NodeId;
pub use node::{
    ChangeAction, ChangedPath, CommitInfo, CopyFrom, DirEntry, NodeKind, NodeRevId, NodeRevision,
    Revision, TextRep,
};
pub use object::ObjectId;
pub use properties::{PropertySet, svn_props};
pub use repository::{LogEntry, Repository, VerifyFailure, VerifyReport};
pub use revprops::RevpropsManifest;
pub use sqlite_backend::SqliteBackend;
pub use store::NodeStore;
pub use txn::{TxnId, TxnState};
