//! Error types for the FSvn storage engine
//!
//! Corruption-class errors (`CorruptDelta`, `CorruptChain`, `FsCorrupt`) are
//! never recovered from; `NotFound` is an ordinary answer for read paths.

use crate::checksum::Checksum;
use crate::node::Revision;
use crate::object::ObjectId;

/// Result type for storage engine operations
pub type Result<T> = std::result::Result<T, FsError>;

/// What a `NotFound` error failed to find
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundKind {
    /// No such revision has been published
    Revision(Revision),
    /// The path does not exist in the given revision
    Path { revision: Revision, path: String },
    /// The path does not exist in the transaction's staged tree
    TxnPath { txn: String, path: String },
    /// Unknown stored object (node record or representation)
    Object(ObjectId),
    /// Unknown or already finished transaction
    Transaction(String),
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundKind::Revision(rev) => write!(f, "No such revision {}", rev),
            NotFoundKind::Path { revision, path } => {
                write!(f, "Path '{}' not found in revision {}", path, revision)
            }
            NotFoundKind::TxnPath { txn, path } => {
                write!(f, "Path '{}' not found in transaction '{}'", path, txn)
            }
            NotFoundKind::Object(id) => write!(f, "Object {} not found", id),
            NotFoundKind::Transaction(name) => write!(f, "No such transaction '{}'", name),
        }
    }
}

/// Errors that can occur in the storage engine
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Corrupt delta: {reason}")]
    CorruptDelta { reason: String },

    #[error("Corrupt delta chain in r{revision}: {reason}")]
    CorruptChain { revision: Revision, reason: String },

    #[error("{0}")]
    NotFound(NotFoundKind),

    #[error("Filesystem is corrupt: {reason}")]
    FsCorrupt { reason: String },

    #[error("Commit protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: String,
        expected: Checksum,
        actual: Checksum,
    },

    #[error("Path '{path}' already exists")]
    AlreadyExists { path: String },

    #[error("Path '{path}' is not a directory")]
    NotADirectory { path: String },

    #[error("Path '{path}' is not a file")]
    NotAFile { path: String },

    #[error("Invalid path '{path}'")]
    InvalidPath { path: String },

    #[error("Conflict at '{path}': changed since the transaction's base revision")]
    Conflict { path: String },

    #[error("Hook '{hook}' rejected the operation: {message}")]
    HookFailed { hook: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl FsError {
    pub(crate) fn corrupt_delta(reason: impl Into<String>) -> Self {
        FsError::CorruptDelta {
            reason: reason.into(),
        }
    }

    pub(crate) fn fs_corrupt(reason: impl Into<String>) -> Self {
        FsError::FsCorrupt {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        FsError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// True for errors that indicate damaged repository data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FsError::CorruptDelta { .. } | FsError::CorruptChain { .. } | FsError::FsCorrupt { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// Whether this error ends the transaction it was raised in.
    ///
    /// Lookups that merely miss (`NotFound`, `AlreadyExists`, kind mismatches)
    /// leave the transaction open so the caller can carry on.
    pub fn aborts_transaction(&self) -> bool {
        self.is_corruption()
            || matches!(
                self,
                FsError::ProtocolViolation { .. }
                    | FsError::ChecksumMismatch { .. }
                    | FsError::Conflict { .. }
                    | FsError::HookFailed { .. }
                    | FsError::Io(_)
                    | FsError::Database(_)
                    | FsError::Serialization(_)
            )
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        FsError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(FsError::corrupt_delta("bad").is_corruption());
        assert!(FsError::fs_corrupt("bad").is_corruption());
        assert!(
            FsError::CorruptChain {
                revision: 3,
                reason: "x".into()
            }
            .is_corruption()
        );

        let missing = FsError::NotFound(NotFoundKind::Revision(6));
        assert!(missing.is_not_found());
        assert!(!missing.aborts_transaction());
        assert!(FsError::protocol("nested").aborts_transaction());
        assert!(!FsError::AlreadyExists { path: "/a".into() }.aborts_transaction());
    }

    #[test]
    fn test_error_messages_name_the_culprit() {
        let err = FsError::CorruptChain {
            revision: 42,
            reason: "checksum mismatch".into(),
        };
        assert!(err.to_string().contains("r42"));

        let err = FsError::NotFound(NotFoundKind::Path {
            revision: 5,
            path: "/a/b.txt".into(),
        });
        assert_eq!(err.to_string(), "Path '/a/b.txt' not found in revision 5");
    }
}
