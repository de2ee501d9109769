//! Transactions
//!
//! A transaction stages a new tree on top of a base revision. Staged nodes
//! live in an arena owned by the transaction; everything not yet touched is
//! referenced by its stored [`NodeRevId`]. The first edit below a directory
//! clones it, and every ancestor up to the root, into the arena
//! (copy-on-write). Siblings keep pointing at the stored records, which is
//! what makes unchanged subtrees shared between revisions.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::checksum::Checksum;
use crate::error::{FsError, NotFoundKind, Result};
use crate::keys::{KeyAllocator, NodeId};
use crate::node::{
    ChangeAction, ChangedPath, CopyFrom, DirEntry, NodeKind, NodeRevId, NodeRevision, Revision,
    TextRep,
};
use crate::paths::{canonicalize, components, is_within, join, split_parent};
use crate::properties::PropertySet;
use crate::store::{NodeStore, TextBase};

/// Transaction name, `{base revision}-{sequence}`
pub type TxnId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Finalizing,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

/// Where a directory entry's node lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    /// Published record, still shared
    Stored(NodeRevId),
    /// Mutable node in the transaction arena
    Staged(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedEntry {
    pub kind: NodeKind,
    pub node: NodeRef,
}

/// A resolved copy source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub from: CopyFrom,
    pub node: NodeRevId,
}

#[derive(Debug, Clone)]
struct StagedText {
    data: Vec<u8>,
    checksum: Checksum,
}

#[derive(Debug, Clone)]
struct StagedNode {
    node_id: NodeId,
    kind: NodeKind,
    path: String,
    predecessor: Option<NodeRevId>,
    predecessor_count: u64,
    copy_from: Option<CopyFrom>,
    props: PropertySet,
    entries: BTreeMap<String, StagedEntry>,
    /// Stored content: inherited, or written by `prepare_texts`
    text: Option<TextRep>,
    /// What new content is stored against
    text_base: Option<TextBase>,
    staged_text: Option<StagedText>,
}

impl StagedNode {
    fn fresh(node_id: NodeId, kind: NodeKind, path: &str) -> Self {
        Self {
            node_id,
            kind,
            path: path.to_string(),
            predecessor: None,
            predecessor_count: 0,
            copy_from: None,
            props: PropertySet::new(),
            entries: BTreeMap::new(),
            text: None,
            text_base: None,
            staged_text: None,
        }
    }

    /// Mutable successor of a stored node
    fn successor_of(node: NodeRevision, id: NodeRevId, path: &str) -> Self {
        let text_base = node.text.clone().map(|text| TextBase {
            text,
            revision: node.created_rev,
        });
        Self {
            node_id: node.node_id,
            kind: node.kind,
            path: path.to_string(),
            predecessor: Some(id),
            predecessor_count: node.predecessor_count + 1,
            copy_from: None,
            props: node.props,
            entries: node
                .entries
                .into_iter()
                .map(|(name, e)| {
                    (
                        name,
                        StagedEntry {
                            kind: e.kind,
                            node: NodeRef::Stored(e.id),
                        },
                    )
                })
                .collect(),
            text: node.text,
            text_base,
            staged_text: None,
        }
    }
}

pub struct Transaction {
    id: TxnId,
    base_rev: Revision,
    base_root: NodeRevId,
    state: TxnState,
    created: DateTime<Utc>,
    props: PropertySet,
    root: Option<usize>,
    arena: Vec<StagedNode>,
    changes: BTreeMap<String, ChangedPath>,
}

impl Transaction {
    pub fn new(id: TxnId, base_rev: Revision, base_root: NodeRevId) -> Self {
        tracing::debug!("Began transaction {} on r{}", id, base_rev);
        Self {
            id,
            base_rev,
            base_root,
            state: TxnState::Open,
            created: Utc::now(),
            props: PropertySet::new(),
            root: None,
            arena: Vec::new(),
            changes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_revision(&self) -> Revision {
        self.base_rev
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn props(&self) -> &PropertySet {
        &self.props
    }

    pub fn set_txn_prop(&mut self, name: &str, value: Option<&str>) {
        self.props.apply(name, value);
    }

    /// Number of nodes cloned into the arena so far
    pub fn staged_count(&self) -> usize {
        self.arena.len()
    }

    /// Changed paths in path order
    pub fn changes(&self) -> Vec<ChangedPath> {
        self.changes.values().cloned().collect()
    }

    // ==================== State machine ====================

    pub fn ensure_open(&self) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(FsError::protocol(format!(
                "transaction '{}' is {:?}, not open",
                self.id, self.state
            )));
        }
        Ok(())
    }

    pub fn begin_finalize(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = TxnState::Finalizing;
        Ok(())
    }

    pub fn mark_committed(&mut self) -> Result<()> {
        if self.state != TxnState::Finalizing {
            return Err(FsError::protocol(format!(
                "transaction '{}' cannot commit from {:?}",
                self.id, self.state
            )));
        }
        self.state = TxnState::Committed;
        self.release();
        Ok(())
    }

    /// Discard everything staged. Aborting twice is a no-op; a committed
    /// transaction cannot be aborted.
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            TxnState::Aborted => Ok(()),
            TxnState::Committed => Err(FsError::protocol(format!(
                "transaction '{}' is already committed",
                self.id
            ))),
            TxnState::Open | TxnState::Finalizing => {
                self.state = TxnState::Aborted;
                self.release();
                Ok(())
            }
        }
    }

    fn release(&mut self) {
        self.arena = Vec::new();
        self.changes.clear();
        self.root = None;
    }

    // ==================== Lookup ====================

    fn root_ref(&self) -> NodeRef {
        self.root
            .map_or(NodeRef::Stored(self.base_root), NodeRef::Staged)
    }

    fn not_found(&self, path: &str) -> FsError {
        FsError::NotFound(NotFoundKind::TxnPath {
            txn: self.id.clone(),
            path: path.to_string(),
        })
    }

    fn child_of(&self, store: &NodeStore, parent: NodeRef, name: &str) -> Result<Option<StagedEntry>> {
        match parent {
            NodeRef::Staged(i) => Ok(self.arena[i].entries.get(name).copied()),
            NodeRef::Stored(id) => Ok(store.read_node(&id)?.entries.get(name).map(|e| {
                StagedEntry {
                    kind: e.kind,
                    node: NodeRef::Stored(e.id),
                }
            })),
        }
    }

    /// Find `path` in the staged tree without cloning anything
    pub fn lookup(&self, store: &NodeStore, path: &str) -> Result<Option<StagedEntry>> {
        let canonical = canonicalize(path)?;
        let mut current = StagedEntry {
            kind: NodeKind::Dir,
            node: self.root_ref(),
        };
        let mut walked = String::from("/");
        for part in components(&canonical) {
            if current.kind != NodeKind::Dir {
                return Err(FsError::NotADirectory { path: walked });
            }
            match self.child_of(store, current.node, part)? {
                Some(entry) => current = entry,
                None => return Ok(None),
            }
            walked = join(&walked, part);
        }
        Ok(Some(current))
    }

    /// Check that `path` exists with the given kind
    pub fn expect_kind(&self, store: &NodeStore, path: &str, kind: NodeKind) -> Result<()> {
        let entry = self
            .lookup(store, path)?
            .ok_or_else(|| self.not_found(path))?;
        match (kind, entry.kind) {
            (NodeKind::Dir, NodeKind::File) => Err(FsError::NotADirectory {
                path: path.to_string(),
            }),
            (NodeKind::File, NodeKind::Dir) => Err(FsError::NotAFile {
                path: path.to_string(),
            }),
            _ => Ok(()),
        }
    }

    // ==================== Copy-on-write ====================

    /// Clone the root into the arena if that has not happened yet
    pub fn stage_root(&mut self, store: &NodeStore) -> Result<usize> {
        if let Some(root) = self.root {
            return Ok(root);
        }
        let node = store.read_node(&self.base_root)?;
        self.arena
            .push(StagedNode::successor_of(node, self.base_root, "/"));
        let idx = self.arena.len() - 1;
        self.root = Some(idx);
        Ok(idx)
    }

    /// Make `path` and all its ancestors mutable, returning its arena slot
    fn stage(&mut self, store: &NodeStore, path: &str) -> Result<usize> {
        let mut idx = self.stage_root(store)?;
        let mut walked = String::from("/");
        for part in components(path) {
            if self.arena[idx].kind != NodeKind::Dir {
                return Err(FsError::NotADirectory { path: walked });
            }
            walked = join(&walked, part);
            let entry = self.arena[idx]
                .entries
                .get(part)
                .copied()
                .ok_or_else(|| self.not_found(&walked))?;
            idx = match entry.node {
                NodeRef::Staged(i) => i,
                NodeRef::Stored(id) => {
                    let node = store.read_node(&id)?;
                    self.arena
                        .push(StagedNode::successor_of(node, id, &walked));
                    let child = self.arena.len() - 1;
                    self.arena[idx].entries.insert(
                        part.to_string(),
                        StagedEntry {
                            kind: entry.kind,
                            node: NodeRef::Staged(child),
                        },
                    );
                    tracing::debug!("Copy-on-write {} in transaction {}", walked, self.id);
                    child
                }
            };
        }
        Ok(idx)
    }

    fn note_change(&mut self, path: &str, kind: NodeKind) -> &mut ChangedPath {
        self.changes
            .entry(path.to_string())
            .or_insert_with(|| ChangedPath {
                path: path.to_string(),
                action: ChangeAction::Modify,
                kind,
                copy_from: None,
                text_mod: false,
                props_mod: false,
            })
    }

    // ==================== Edits ====================

    /// Add a file or directory, optionally as a copy of a published node
    pub fn add(
        &mut self,
        store: &NodeStore,
        keys: &KeyAllocator,
        path: &str,
        kind: NodeKind,
        copy: Option<CopySource>,
    ) -> Result<()> {
        let canonical = canonicalize(path)?;
        let Some((parent, name)) = split_parent(&canonical) else {
            return Err(FsError::AlreadyExists { path: canonical });
        };
        // Every check runs before staging so a failed add clones nothing
        self.expect_kind(store, parent, NodeKind::Dir)?;
        if self.lookup(store, &canonical)?.is_some() {
            return Err(FsError::AlreadyExists { path: canonical });
        }

        let mut node = match &copy {
            Some(source) => {
                let stored = store.read_node(&source.node)?;
                if stored.kind != kind {
                    return Err(match kind {
                        NodeKind::File => FsError::NotAFile {
                            path: source.from.path.clone(),
                        },
                        NodeKind::Dir => FsError::NotADirectory {
                            path: source.from.path.clone(),
                        },
                    });
                }
                let mut node = StagedNode::successor_of(stored, source.node, &canonical);
                node.copy_from = Some(source.from.clone());
                node
            }
            None => StagedNode::fresh(keys.allocate(), kind, &canonical),
        };
        if copy.is_some() {
            node.node_id = keys.allocate();
        }

        let parent_idx = self.stage(store, parent)?;
        self.arena.push(node);
        let idx = self.arena.len() - 1;
        self.arena[parent_idx].entries.insert(
            name.to_string(),
            StagedEntry {
                kind,
                node: NodeRef::Staged(idx),
            },
        );

        let replaced = matches!(
            self.changes.get(&canonical),
            Some(c) if c.action == ChangeAction::Delete
        );
        self.changes.insert(
            canonical.clone(),
            ChangedPath {
                path: canonical,
                action: if replaced {
                    ChangeAction::Replace
                } else {
                    ChangeAction::Add
                },
                kind,
                copy_from: copy.map(|c| c.from),
                text_mod: false,
                props_mod: false,
            },
        );
        Ok(())
    }

    pub fn delete(&mut self, store: &NodeStore, path: &str) -> Result<()> {
        let canonical = canonicalize(path)?;
        let Some((parent, name)) = split_parent(&canonical) else {
            return Err(FsError::InvalidPath { path: canonical });
        };
        // Check first so a missing path does not clone its ancestors
        if self.lookup(store, &canonical)?.is_none() {
            return Err(self.not_found(&canonical));
        }
        let parent_idx = self.stage(store, parent)?;
        let removed = self.arena[parent_idx]
            .entries
            .remove(name)
            .ok_or_else(|| self.not_found(&canonical))?;

        let prior = self.changes.get(&canonical).map(|c| c.action);
        self.changes.retain(|p, _| !is_within(p, &canonical));
        if prior != Some(ChangeAction::Add) {
            self.changes.insert(
                canonical.clone(),
                ChangedPath {
                    path: canonical,
                    action: ChangeAction::Delete,
                    kind: removed.kind,
                    copy_from: None,
                    text_mod: false,
                    props_mod: false,
                },
            );
        }
        Ok(())
    }

    pub fn set_property(
        &mut self,
        store: &NodeStore,
        path: &str,
        name: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let canonical = canonicalize(path)?;
        if self.lookup(store, &canonical)?.is_none() {
            return Err(self.not_found(&canonical));
        }
        let idx = self.stage(store, &canonical)?;
        self.arena[idx].props.apply(name, value);
        let kind = self.arena[idx].kind;
        self.note_change(&canonical, kind).props_mod = true;
        Ok(())
    }

    /// Replace the content of a file
    pub fn stage_text(
        &mut self,
        store: &NodeStore,
        path: &str,
        data: Vec<u8>,
        checksum: Checksum,
    ) -> Result<()> {
        let canonical = canonicalize(path)?;
        self.expect_kind(store, &canonical, NodeKind::File)?;
        let idx = self.stage(store, &canonical)?;
        self.arena[idx].staged_text = Some(StagedText { data, checksum });
        self.note_change(&canonical, NodeKind::File).text_mod = true;
        Ok(())
    }

    /// Content the file currently has in this transaction
    pub fn current_text(&self, store: &NodeStore, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .lookup(store, path)?
            .ok_or_else(|| self.not_found(path))?;
        if entry.kind != NodeKind::File {
            return Err(FsError::NotAFile {
                path: path.to_string(),
            });
        }
        match entry.node {
            NodeRef::Staged(i) => {
                let node = &self.arena[i];
                if let Some(staged) = &node.staged_text {
                    return Ok(staged.data.clone());
                }
                match &node.text_base {
                    Some(base) => store.read_text(&base.text, base.revision),
                    None => Ok(Vec::new()),
                }
            }
            NodeRef::Stored(id) => {
                let node = store.read_node(&id)?;
                match &node.text {
                    Some(text) => store.read_text(text, node.created_rev),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Checksum of the file's current content in this transaction
    pub fn text_checksum(&self, store: &NodeStore, path: &str) -> Result<Checksum> {
        let entry = self
            .lookup(store, path)?
            .ok_or_else(|| self.not_found(path))?;
        if entry.kind != NodeKind::File {
            return Err(FsError::NotAFile {
                path: path.to_string(),
            });
        }
        let text = match entry.node {
            NodeRef::Staged(i) => {
                let node = &self.arena[i];
                if let Some(staged) = &node.staged_text {
                    return Ok(staged.checksum.clone());
                }
                node.text.clone()
            }
            NodeRef::Stored(id) => store.read_node(&id)?.text,
        };
        Ok(text.map_or_else(
            || Checksum::compute(store.checksum_kind(), b""),
            |t| t.checksum,
        ))
    }

    /// Properties of `path` as staged in this transaction
    pub fn node_props(&self, store: &NodeStore, path: &str) -> Result<PropertySet> {
        let entry = self
            .lookup(store, path)?
            .ok_or_else(|| self.not_found(path))?;
        match entry.node {
            NodeRef::Staged(i) => Ok(self.arena[i].props.clone()),
            NodeRef::Stored(id) => Ok(store.read_node(&id)?.props),
        }
    }

    // ==================== Finalize ====================

    fn reachable(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(idx) = stack.pop() {
            out.push(idx);
            for entry in self.arena[idx].entries.values() {
                if let NodeRef::Staged(child) = entry.node {
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Store the content of every staged file. Runs before the commit lock.
    pub fn prepare_texts(&mut self, store: &NodeStore) -> Result<()> {
        for idx in self.reachable() {
            let node = &mut self.arena[idx];
            if node.kind != NodeKind::File {
                continue;
            }
            if let Some(staged) = node.staged_text.take() {
                node.text = Some(store.write_text(&staged.data, node.text_base.as_ref())?);
            } else if node.text.is_none() {
                node.text = Some(store.write_text(b"", None)?);
            }
        }
        Ok(())
    }

    /// Bring an out-of-date transaction up to `head_root`.
    ///
    /// Entries changed only in head are taken from head; directories changed
    /// on both sides are merged recursively; anything else changed on both
    /// sides is a conflict.
    pub fn merge_onto(&mut self, store: &NodeStore, head_root: NodeRevId) -> Result<()> {
        let root = self.stage_root(store)?;
        let base_root = self.base_root;
        self.merge_dir(store, root, base_root, head_root, "/")?;
        self.base_root = head_root;
        Ok(())
    }

    fn merge_dir(
        &mut self,
        store: &NodeStore,
        t: usize,
        base: NodeRevId,
        head: NodeRevId,
        path: &str,
    ) -> Result<()> {
        if base == head {
            return Ok(());
        }
        let conflict = |path: &str| FsError::Conflict {
            path: path.to_string(),
        };
        let b = store.read_node(&base)?;
        let h = store.read_node(&head)?;
        if b.node_id != h.node_id {
            return Err(conflict(path));
        }

        if h.props != b.props {
            if self.arena[t].props == b.props {
                self.arena[t].props = h.props.clone();
            } else if self.arena[t].props != h.props {
                return Err(conflict(path));
            }
        }

        let names: BTreeSet<&String> = b.entries.keys().chain(h.entries.keys()).collect();
        for name in names {
            let be = b.entries.get(name);
            let he = h.entries.get(name);
            if be.map(|e| e.id) == he.map(|e| e.id) {
                continue;
            }
            let child_path = join(path, name);
            let te = self.arena[t].entries.get(name.as_str()).copied();
            let untouched = match (be, te) {
                (Some(be), Some(te)) => te.node == NodeRef::Stored(be.id),
                (None, None) => true,
                _ => false,
            };
            if untouched {
                match he {
                    Some(he) => {
                        self.arena[t].entries.insert(
                            name.clone(),
                            StagedEntry {
                                kind: he.kind,
                                node: NodeRef::Stored(he.id),
                            },
                        );
                    }
                    None => {
                        self.arena[t].entries.remove(name.as_str());
                    }
                }
                continue;
            }

            match (be, he, te) {
                (
                    Some(DirEntry {
                        kind: NodeKind::Dir,
                        id: base_id,
                    }),
                    Some(DirEntry {
                        kind: NodeKind::Dir,
                        id: head_id,
                    }),
                    Some(StagedEntry {
                        kind: NodeKind::Dir,
                        node: NodeRef::Staged(child),
                    }),
                ) if self.arena[child].predecessor == Some(*base_id) => {
                    self.merge_dir(store, child, *base_id, *head_id, &child_path)?;
                }
                _ => return Err(conflict(&child_path)),
            }
        }

        self.arena[t].predecessor = Some(head);
        self.arena[t].predecessor_count = h.predecessor_count + 1;
        Ok(())
    }

    /// Write every staged node bottom-up as part of revision `rev` and
    /// return the new root
    pub fn write_tree(&self, store: &NodeStore, rev: Revision) -> Result<NodeRevId> {
        let root = self
            .root
            .ok_or_else(|| FsError::protocol(format!("transaction '{}' has no root", self.id)))?;
        self.write_node(store, root, rev)
    }

    fn write_node(&self, store: &NodeStore, idx: usize, rev: Revision) -> Result<NodeRevId> {
        let staged = &self.arena[idx];
        let mut entries = BTreeMap::new();
        for (name, entry) in &staged.entries {
            let id = match entry.node {
                NodeRef::Stored(id) => id,
                NodeRef::Staged(child) => self.write_node(store, child, rev)?,
            };
            entries.insert(
                name.clone(),
                DirEntry {
                    kind: entry.kind,
                    id,
                },
            );
        }
        if staged.kind == NodeKind::File && staged.text.is_none() {
            return Err(FsError::protocol(format!(
                "content of '{}' was never prepared",
                staged.path
            )));
        }
        let node = NodeRevision {
            node_id: staged.node_id.clone(),
            kind: staged.kind,
            created_rev: rev,
            created_path: staged.path.clone(),
            predecessor: staged.predecessor,
            predecessor_count: staged.predecessor_count,
            copy_from: staged.copy_from.clone(),
            props: staged.props.clone(),
            entries,
            text: staged.text.clone(),
        };
        store.write_node(&node)
    }
}
