//! Commit editor
//!
//! Drives a transaction through the depth-first edit protocol remote layers
//! speak: `open_root`, nested `add_*`/`open_*`/`delete_entry`, content and
//! property changes, matching `close_*` calls and finally `close_edit` or
//! `abort_edit`. Calls out of order are protocol violations and abort the
//! transaction.

use std::io::{self, Write};

use crate::checksum::{Checksum, ChecksumKind, Checksummer};
use crate::delta::{self, DeltaWindow};
use crate::error::{FsError, Result};
use crate::node::{CommitInfo, NodeKind, Revision};
use crate::paths::{canonicalize, split_parent};
use crate::properties::PropertySet;
use crate::repository::Repository;
use crate::txn::TxnId;

/// Receives the new content of one file, as raw bytes through
/// [`Write`] or as svndiff windows against the file's current content.
/// Nothing is staged until [`TextSink::finish`].
pub struct TextSink<'a> {
    repo: &'a Repository,
    txn: TxnId,
    path: String,
    base: Option<Vec<u8>>,
    content: Vec<u8>,
    checksummer: Checksummer,
}

impl<'a> TextSink<'a> {
    pub(crate) fn new(repo: &'a Repository, txn: &str, path: String, kind: ChecksumKind) -> Self {
        Self {
            repo,
            txn: txn.to_string(),
            path,
            base: None,
            content: Vec::new(),
            checksummer: Checksummer::new(kind),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bytes received so far
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    fn push(&mut self, data: &[u8]) {
        self.checksummer.update(data);
        self.content.extend_from_slice(data);
    }

    fn abort(&self, e: FsError) -> FsError {
        self.repo.abort_with(&self.txn, &e);
        e
    }

    /// Apply one svndiff window and append what it produces
    pub fn apply_window(&mut self, window: &[u8]) -> Result<()> {
        let window = DeltaWindow::from_bytes(window).map_err(|e| self.abort(e))?;
        if self.base.is_none() {
            self.base = Some(self.repo.txn_text(&self.txn, &self.path)?);
        }
        let base = self.base.as_deref().unwrap_or_default();
        let produced = delta::apply(&window, base).map_err(|e| self.abort(e))?;
        self.push(&produced);
        Ok(())
    }

    /// Stage the received content and return its checksum
    pub fn finish(self) -> Result<Checksum> {
        let checksum = self.checksummer.finish();
        self.repo
            .stage_text(&self.txn, &self.path, self.content, checksum.clone())?;
        Ok(checksum)
    }
}

impl Write for TextSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    /// Waiting for `open_root`
    Idle,
    Open,
    /// After `close_edit`, `abort_edit` or an aborting error
    Closed,
}

#[derive(Debug)]
struct OpenEntry {
    path: String,
    kind: NodeKind,
}

pub struct CommitEditor<'a> {
    repo: &'a Repository,
    revprops: PropertySet,
    txn: Option<TxnId>,
    state: EditorState,
    stack: Vec<OpenEntry>,
}

impl<'a> CommitEditor<'a> {
    /// `revprops` (author, log, ...) are set on the transaction at `open_root`
    pub fn new(repo: &'a Repository, revprops: PropertySet) -> Self {
        Self {
            repo,
            revprops,
            txn: None,
            state: EditorState::Idle,
            stack: Vec::new(),
        }
    }

    pub fn state(&self) -> EditorState {
        self.state
    }

    pub fn txn_id(&self) -> Option<&str> {
        self.txn.as_deref()
    }

    /// Close the edit after an error that ends the transaction
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.aborts_transaction() {
                if let Some(txn) = &self.txn {
                    self.repo.abort_with(txn, e);
                }
                self.state = EditorState::Closed;
                self.stack.clear();
            }
        }
        result
    }

    fn violation<T>(&mut self, reason: String) -> Result<T> {
        self.guard(Err(FsError::protocol(reason)))
    }

    fn txn(&mut self, call: &str) -> Result<TxnId> {
        match (&self.state, &self.txn) {
            (EditorState::Open, Some(txn)) => Ok(txn.clone()),
            (state, _) => {
                let reason = format!("{} called while the edit is {:?}", call, state);
                // Nothing to abort before open_root or after the end
                Err(FsError::protocol(reason))
            }
        }
    }

    /// Check that `path` is a direct child of the innermost open directory
    fn child_of_top(&mut self, call: &str, path: &str) -> Result<(TxnId, String)> {
        let txn = self.txn(call)?;
        let canonical = canonicalize(path)?;
        let parent = split_parent(&canonical).map(|(p, _)| p);
        let nested = match (self.stack.last(), parent) {
            (Some(top), Some(parent)) => top.kind == NodeKind::Dir && top.path == parent,
            _ => false,
        };
        if !nested {
            let top = self
                .stack
                .last()
                .map_or_else(|| "nothing".to_string(), |t| t.path.clone());
            return self.violation(format!(
                "{} of '{}' while '{}' is the innermost open node",
                call, canonical, top
            ));
        }
        Ok((txn, canonical))
    }

    fn top(&mut self, call: &str, kind: NodeKind) -> Result<(TxnId, String)> {
        let txn = self.txn(call)?;
        let open = self
            .stack
            .last()
            .filter(|top| top.kind == kind)
            .map(|top| top.path.clone());
        match open {
            Some(path) => Ok((txn, path)),
            None => self.violation(format!("{} without an open {}", call, kind)),
        }
    }

    // ==================== Protocol ====================

    /// Begin the edit against `revision`
    pub fn open_root(&mut self, revision: Revision) -> Result<()> {
        if self.state != EditorState::Idle {
            return Err(FsError::protocol(format!(
                "open_root called while the edit is {:?}",
                self.state
            )));
        }
        let txn = self.repo.begin_txn(revision)?;
        for (name, value) in self.revprops.iter() {
            self.repo.set_txn_prop(&txn, name, Some(value.as_str()))?;
        }
        self.txn = Some(txn);
        self.state = EditorState::Open;
        self.stack.push(OpenEntry {
            path: "/".to_string(),
            kind: NodeKind::Dir,
        });
        Ok(())
    }

    pub fn add_dir(&mut self, path: &str, copy_from: Option<(Revision, &str)>) -> Result<()> {
        let (txn, path) = self.child_of_top("add_dir", path)?;
        let result = self.repo.add_dir(&txn, &path, copy_from);
        self.guard(result)?;
        self.stack.push(OpenEntry {
            path,
            kind: NodeKind::Dir,
        });
        Ok(())
    }

    pub fn open_dir(&mut self, path: &str) -> Result<()> {
        let (txn, path) = self.child_of_top("open_dir", path)?;
        let result = self.repo.open_dir(&txn, &path);
        self.guard(result)?;
        self.stack.push(OpenEntry {
            path,
            kind: NodeKind::Dir,
        });
        Ok(())
    }

    pub fn add_file(&mut self, path: &str, copy_from: Option<(Revision, &str)>) -> Result<()> {
        let (txn, path) = self.child_of_top("add_file", path)?;
        let result = self.repo.add_file(&txn, &path, copy_from);
        self.guard(result)?;
        self.stack.push(OpenEntry {
            path,
            kind: NodeKind::File,
        });
        Ok(())
    }

    pub fn open_file(&mut self, path: &str) -> Result<()> {
        let (txn, path) = self.child_of_top("open_file", path)?;
        let result = self.repo.open_file(&txn, &path);
        self.guard(result)?;
        self.stack.push(OpenEntry {
            path,
            kind: NodeKind::File,
        });
        Ok(())
    }

    pub fn delete_entry(&mut self, path: &str) -> Result<()> {
        let (txn, path) = self.child_of_top("delete_entry", path)?;
        let result = self.repo.delete_entry(&txn, &path);
        self.guard(result)
    }

    /// Content sink for the innermost open file
    pub fn apply_text(&mut self, base_checksum: Option<&Checksum>) -> Result<TextSink<'a>> {
        let (txn, path) = self.top("apply_text", NodeKind::File)?;
        let repo = self.repo;
        let result = repo.apply_text(&txn, &path, base_checksum);
        self.guard(result)
    }

    pub fn change_dir_property(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let (txn, path) = self.top("change_dir_property", NodeKind::Dir)?;
        let result = self.repo.set_node_prop(&txn, &path, name, value);
        self.guard(result)
    }

    pub fn change_file_property(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let (txn, path) = self.top("change_file_property", NodeKind::File)?;
        let result = self.repo.set_node_prop(&txn, &path, name, value);
        self.guard(result)
    }

    /// Close the innermost file; a given checksum must match its content
    pub fn close_file(&mut self, checksum: Option<&Checksum>) -> Result<()> {
        let (txn, path) = self.top("close_file", NodeKind::File)?;
        if let Some(expected) = checksum {
            let actual = self.repo.txn_text_checksum(&txn, &path);
            let actual = self.guard(actual)?;
            if &actual != expected {
                return self.guard(Err(FsError::ChecksumMismatch {
                    path,
                    expected: expected.clone(),
                    actual,
                }));
            }
        }
        self.stack.pop();
        Ok(())
    }

    pub fn close_dir(&mut self) -> Result<()> {
        self.top("close_dir", NodeKind::Dir)?;
        self.stack.pop();
        Ok(())
    }

    /// Commit the transaction. Every directory but the root must be closed.
    pub fn close_edit(&mut self) -> Result<CommitInfo> {
        let txn = self.txn("close_edit")?;
        if let Some(open) = self.stack.iter().find(|e| e.path != "/") {
            let path = open.path.clone();
            return self.violation(format!("close_edit while '{}' is still open", path));
        }
        self.state = EditorState::Closed;
        self.stack.clear();
        self.repo.commit_txn(&txn)
    }

    /// Discard the edit
    pub fn abort_edit(&mut self) -> Result<()> {
        let txn = self.txn("abort_edit")?;
        self.state = EditorState::Closed;
        self.stack.clear();
        self.repo.abort_txn(&txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::delta::DeltaOp;
    use crate::properties::svn_props;
    use crate::txn::TxnState;

    fn repo() -> Repository {
        Repository::in_memory(RepositoryConfig::default()).unwrap()
    }

    fn props() -> PropertySet {
        let mut props = PropertySet::new();
        props.set(svn_props::AUTHOR, "bob");
        props.set(svn_props::LOG, "editor test");
        props
    }

    fn is_violation<T>(result: Result<T>) -> bool {
        matches!(result, Err(FsError::ProtocolViolation { .. }))
    }

    #[test]
    fn test_full_edit() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        editor.add_dir("/trunk", None).unwrap();
        editor.change_dir_property("svn:ignore", Some("*.o")).unwrap();
        editor.add_file("/trunk/a.txt", None).unwrap();
        let mut sink = editor.apply_text(None).unwrap();
        sink.write_all(b"alpha").unwrap();
        let sum = sink.finish().unwrap();
        editor.close_file(Some(&sum)).unwrap();
        editor.close_dir().unwrap();
        editor.close_dir().unwrap();
        let info = editor.close_edit().unwrap();

        assert_eq!(info.revision, 1);
        assert_eq!(info.author.as_deref(), Some("bob"));
        assert_eq!(editor.state(), EditorState::Closed);
        assert_eq!(&repo.file_contents(1, "/trunk/a.txt").unwrap()[..], b"alpha");
        assert_eq!(
            repo.node_props(1, "/trunk").unwrap().get("svn:ignore").unwrap(),
            "*.o"
        );
    }

    #[test]
    fn test_calls_before_open_root() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        assert!(is_violation(editor.add_dir("/a", None)));
        assert!(is_violation(editor.close_edit()));
        assert!(is_violation(editor.abort_edit()));
        assert_eq!(editor.state(), EditorState::Idle);
    }

    #[test]
    fn test_bad_nesting_aborts() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        let txn = editor.txn_id().unwrap().to_string();
        editor.add_dir("/a", None).unwrap();
        // "/b" is not a child of the open "/a"
        assert!(is_violation(editor.add_file("/b", None)));
        assert_eq!(editor.state(), EditorState::Closed);
        assert!(repo.txn_state(&txn).unwrap_err().is_not_found());
        assert!(is_violation(editor.close_edit()));
        assert_eq!(repo.youngest().unwrap(), 0);
    }

    #[test]
    fn test_file_calls_need_open_file() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        assert!(is_violation(editor.apply_text(None)));
        assert_eq!(editor.state(), EditorState::Closed);
    }

    #[test]
    fn test_close_edit_with_open_dir() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        editor.add_dir("/a", None).unwrap();
        assert!(is_violation(editor.close_edit()));
        assert_eq!(repo.youngest().unwrap(), 0);
    }

    #[test]
    fn test_missing_path_keeps_edit_open() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        let txn = editor.txn_id().unwrap().to_string();
        assert!(editor.open_dir("/nope").unwrap_err().is_not_found());
        assert_eq!(editor.state(), EditorState::Open);
        assert_eq!(repo.txn_state(&txn).unwrap(), TxnState::Open);
        editor.abort_edit().unwrap();
        assert!(is_violation(editor.abort_edit()));
    }

    #[test]
    fn test_apply_window_against_base() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        editor.add_file("/f", None).unwrap();
        let mut sink = editor.apply_text(None).unwrap();
        sink.write_all(b"the quick brown fox").unwrap();
        sink.finish().unwrap();
        editor.close_file(None).unwrap();
        editor.close_edit().unwrap();

        let kind = repo.store().checksum_kind();
        let target = b"the quick brown fox jumps";
        let window = delta::encode(kind, b"the quick brown fox", target);

        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(1).unwrap();
        editor.open_file("/f").unwrap();
        let mut sink = editor.apply_text(Some(&repo.file_checksum(1, "/f").unwrap()))
            .unwrap();
        sink.apply_window(&window.to_bytes()).unwrap();
        let sum = sink.finish().unwrap();
        editor.close_file(Some(&sum)).unwrap();
        editor.close_edit().unwrap();
        assert_eq!(&repo.file_contents(2, "/f").unwrap()[..], target);
    }

    #[test]
    fn test_garbage_window_aborts() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        let txn = editor.txn_id().unwrap().to_string();
        editor.add_file("/f", None).unwrap();
        let mut sink = editor.apply_text(None).unwrap();
        assert!(matches!(
            sink.apply_window(b"not svndiff"),
            Err(FsError::CorruptDelta { .. })
        ));
        assert!(repo.txn_state(&txn).unwrap_err().is_not_found());
    }

    #[test]
    fn test_window_with_overflowing_lengths_aborts() {
        let repo = repo();
        let mut editor = CommitEditor::new(&repo, props());
        editor.open_root(0).unwrap();
        let txn = editor.txn_id().unwrap().to_string();
        editor.add_file("/f", None).unwrap();

        let mut window = DeltaWindow::replacement(repo.store().checksum_kind(), b"a");
        window.ops = vec![DeltaOp::NewData { len: 1 }, DeltaOp::NewData { len: u64::MAX }];
        let mut sink = editor.apply_text(None).unwrap();
        assert!(matches!(
            sink.apply_window(&window.to_bytes()),
            Err(FsError::CorruptDelta { .. })
        ));
        assert!(repo.txn_state(&txn).unwrap_err().is_not_found());
    }
}
