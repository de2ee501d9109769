//! Repository
//!
//! The owned context that ties the engine together: one backend, the node
//! store and path index on top of it, revision properties, node keys, hooks
//! and the set of open transactions. Published revisions are read without
//! any repository-wide lock; commits serialize only while the next revision
//! number is assigned and published.

use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{Backend, MemoryBackend};
use crate::checksum::Checksum;
use crate::config::{BackendKind, CONFIG_FILE, RepositoryConfig};
use crate::disk_backend::FsBackend;
use crate::editor::TextSink;
use crate::error::{FsError, NotFoundKind, Result};
use crate::hooks::{HookManager, PreCommitInfo, RevpropChange};
use crate::keys::{KeyAllocator, NodeId};
use crate::node::{
    ChangedPath, CommitInfo, CopyFrom, DirEntry, NodeKind, NodeRevId, NodeRevision, Revision,
    RevisionRecord,
};
use crate::paths::{PathIndex, canonicalize};
use crate::properties::{PropertySet, format_date, svn_props};
use crate::revprops::RevpropsManager;
use crate::sqlite_backend::SqliteBackend;
use crate::store::NodeStore;
use crate::txn::{CopySource, Transaction, TxnId, TxnState};

/// Metadata entry holding the next unused node key
const NEXT_NODE_ID: &str = "next-node-id";

/// One revision as reported by [`Repository::log`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub revision: Revision,
    pub props: PropertySet,
    pub changes: Vec<ChangedPath>,
}

impl LogEntry {
    pub fn author(&self) -> Option<&str> {
        self.props.get(svn_props::AUTHOR).map(String::as_str)
    }

    pub fn date(&self) -> Option<&str> {
        self.props.get(svn_props::DATE).map(String::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.props.get(svn_props::LOG).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    pub revision: Revision,
    pub message: String,
}

/// Outcome of [`Repository::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Revisions that verified cleanly
    pub revisions: u64,
    /// Distinct node records read
    pub nodes: u64,
    /// Distinct file texts reconstructed
    pub files: u64,
    pub bytes: u64,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

type TxnHandle = Arc<Mutex<Transaction>>;

pub struct Repository {
    path: Option<PathBuf>,
    config: RepositoryConfig,
    store: NodeStore,
    index: PathIndex,
    revprops: RevpropsManager,
    keys: KeyAllocator,
    hooks: Option<HookManager>,
    txns: Mutex<HashMap<TxnId, TxnHandle>>,
    txn_seq: AtomicU64,
    commit_lock: Mutex<()>,
}

impl Repository {
    /// Create a new repository in `path`
    pub fn create(path: &Path, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        if path.join(CONFIG_FILE).exists() {
            return Err(FsError::AlreadyExists {
                path: path.display().to_string(),
            });
        }
        std::fs::create_dir_all(path)?;
        config.save(path)?;
        let hooks = HookManager::new(path);
        hooks.ensure_hooks_dir()?;

        let repo = Self::on_disk(path, config, hooks)?;
        tracing::info!(
            "Created {} repository {} at {}",
            repo.store.backend().name(),
            repo.config.uuid,
            path.display()
        );
        Ok(repo)
    }

    /// Open an existing repository
    pub fn open(path: &Path) -> Result<Self> {
        if !path.join(CONFIG_FILE).exists() {
            return Err(FsError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} is not a repository", path.display()),
            )));
        }
        let config = RepositoryConfig::load(path)?;
        let repo = Self::on_disk(path, config, HookManager::new(path))?;
        tracing::info!(
            "Opened repository {} at r{}",
            path.display(),
            repo.youngest()?
        );
        Ok(repo)
    }

    fn on_disk(path: &Path, config: RepositoryConfig, hooks: HookManager) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendKind::Filesystem => Arc::new(FsBackend::open(path)?),
            BackendKind::Sqlite => Arc::new(SqliteBackend::open(path)?),
        };
        let mut repo = Self::with_backend(backend, config)?;
        repo.path = Some(path.to_path_buf());
        repo.hooks = Some(hooks);
        Ok(repo)
    }

    /// Scratch repository kept entirely in memory
    pub fn in_memory(config: RepositoryConfig) -> Result<Self> {
        Self::with_backend(Arc::new(MemoryBackend::new()), config)
    }

    /// Build a repository over any backend. An empty backend gets revision 0.
    pub fn with_backend(backend: Arc<dyn Backend>, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let store = NodeStore::new(
            backend.clone(),
            config.checksum,
            config.delta,
            config.compression_level,
        );
        let revprops = RevpropsManager::open(
            backend.clone(),
            config.revprops_pack_size,
            config.compression_level,
        )?;

        if backend.youngest()?.is_none() {
            Self::initialize(&store, &revprops)?;
        }
        let next_key = match backend.read_meta(NEXT_NODE_ID)? {
            Some(data) => String::from_utf8(data)
                .map_err(|_| FsError::fs_corrupt("node key counter is not text"))?,
            None => "1".to_string(),
        };
        let keys = KeyAllocator::new(next_key.trim())?;

        Ok(Self {
            path: None,
            index: PathIndex::new(config.path_cache_capacity),
            keys,
            config,
            store,
            revprops,
            hooks: None,
            txns: Mutex::new(HashMap::new()),
            txn_seq: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        })
    }

    /// Publish revision 0: an empty root directory
    fn initialize(store: &NodeStore, revprops: &RevpropsManager) -> Result<()> {
        let root = store.write_node(&NodeRevision::new_dir(NodeId::root(), 0, "/"))?;
        let mut props = PropertySet::new();
        props.set(svn_props::DATE, format_date(&Utc::now()));
        revprops.write_new(0, &props)?;
        store.backend().write_meta(NEXT_NODE_ID, b"1")?;
        let record = RevisionRecord {
            root,
            changes: Vec::new(),
        };
        store.backend().finalize(0, &record.to_bytes()?)?;
        tracing::debug!("Initialized revision 0");
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn uuid(&self) -> &str {
        &self.config.uuid
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    // ==================== Read API ====================

    pub fn youngest(&self) -> Result<Revision> {
        self.store
            .backend()
            .youngest()?
            .ok_or_else(|| FsError::fs_corrupt("repository has no revision 0"))
    }

    fn record(&self, rev: Revision) -> Result<RevisionRecord> {
        RevisionRecord::from_bytes(rev, &self.store.backend().revision(rev)?)
    }

    pub fn revision_root(&self, rev: Revision) -> Result<NodeRevId> {
        Ok(self.record(rev)?.root)
    }

    pub fn node_rev_id(&self, rev: Revision, path: &str) -> Result<NodeRevId> {
        let root = self.revision_root(rev)?;
        self.index.resolve(&self.store, rev, root, path)
    }

    pub fn node(&self, rev: Revision, path: &str) -> Result<NodeRevision> {
        self.store.read_node(&self.node_rev_id(rev, path)?)
    }

    /// Kind of the node at `path@rev`, `None` if nothing is there
    pub fn check_path(&self, rev: Revision, path: &str) -> Result<Option<NodeKind>> {
        match self.node_rev_id(rev, path) {
            Ok(id) => Ok(Some(self.store.read_node(&id)?.kind)),
            Err(FsError::NotFound(NotFoundKind::Path { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn file_node(&self, rev: Revision, path: &str) -> Result<NodeRevision> {
        let node = self.node(rev, path)?;
        if !node.is_file() {
            return Err(FsError::NotAFile {
                path: canonicalize(path)?,
            });
        }
        Ok(node)
    }

    pub fn file_contents(&self, rev: Revision, path: &str) -> Result<Bytes> {
        let node = self.file_node(rev, path)?;
        match &node.text {
            Some(text) => Ok(Bytes::from(self.store.read_text(text, node.created_rev)?)),
            None => Ok(Bytes::new()),
        }
    }

    pub fn file_checksum(&self, rev: Revision, path: &str) -> Result<Checksum> {
        let node = self.file_node(rev, path)?;
        Ok(node.text.map_or_else(
            || Checksum::compute(self.store.checksum_kind(), b""),
            |t| t.checksum,
        ))
    }

    pub fn list_dir(&self, rev: Revision, path: &str) -> Result<BTreeMap<String, DirEntry>> {
        let node = self.node(rev, path)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory {
                path: canonicalize(path)?,
            });
        }
        Ok(node.entries)
    }

    pub fn node_props(&self, rev: Revision, path: &str) -> Result<PropertySet> {
        Ok(self.node(rev, path)?.props)
    }

    pub fn revision_props(&self, rev: Revision) -> Result<PropertySet> {
        if rev > self.youngest()? {
            return Err(FsError::NotFound(NotFoundKind::Revision(rev)));
        }
        self.revprops.read(rev)
    }

    pub fn changed_paths(&self, rev: Revision) -> Result<Vec<ChangedPath>> {
        Ok(self.record(rev)?.changes)
    }

    /// Up to `limit` revisions from `start` downwards, newest first
    pub fn log(&self, start: Revision, limit: usize) -> Result<Vec<LogEntry>> {
        if start > self.youngest()? {
            return Err(FsError::NotFound(NotFoundKind::Revision(start)));
        }
        (0..=start)
            .rev()
            .take(limit)
            .map(|revision| {
                Ok(LogEntry {
                    revision,
                    props: self.revprops.read(revision)?,
                    changes: self.changed_paths(revision)?,
                })
            })
            .collect()
    }

    /// Set (`Some`) or delete (`None`) a property of a published revision
    pub fn set_revision_property(
        &self,
        rev: Revision,
        name: &str,
        value: Option<&str>,
        author: &str,
    ) -> Result<()> {
        let current = self.revision_props(rev)?;
        let action = match (current.get(name), value) {
            (_, None) => 'D',
            (None, Some(_)) => 'A',
            (Some(_), Some(_)) => 'M',
        };
        let change = RevpropChange {
            revision: rev,
            author,
            name,
            action,
            value,
        };
        if let Some(hooks) = &self.hooks {
            hooks.run_pre_revprop_change(&change)?;
        }
        self.revprops.change(rev, name, value)?;
        if let Some(hooks) = &self.hooks {
            hooks.run_post_revprop_change(&change);
        }
        Ok(())
    }

    /// Pack every complete batch of unpacked revision properties
    pub fn pack_revprops(&self) -> Result<usize> {
        self.revprops.pack_pending(self.youngest()?)
    }

    /// Walk every node of revisions `start..=end`, reconstructing each file
    /// text once and checking its checksum. Damaged revisions are reported,
    /// not returned as errors.
    pub fn verify(&self, start: Revision, end: Revision) -> Result<VerifyReport> {
        let youngest = self.youngest()?;
        if end > youngest {
            return Err(FsError::NotFound(NotFoundKind::Revision(end)));
        }
        let mut report = VerifyReport::default();
        let mut seen = HashSet::new();
        for rev in start..=end {
            match self.verify_revision(rev, &mut seen, &mut report) {
                Ok(()) => report.revisions += 1,
                Err(e) if e.is_corruption() || e.is_not_found() => {
                    tracing::warn!("Verification of r{} failed: {}", rev, e);
                    report.failures.push(VerifyFailure {
                        revision: rev,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    fn verify_revision(
        &self,
        rev: Revision,
        seen: &mut HashSet<NodeRevId>,
        report: &mut VerifyReport,
    ) -> Result<()> {
        self.revprops.read(rev)?;
        let mut stack = vec![self.revision_root(rev)?];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.store.read_node(&id)?;
            report.nodes += 1;
            match node.kind {
                NodeKind::Dir => stack.extend(node.entries.values().map(|e| e.id)),
                NodeKind::File => {
                    let text = node.text.as_ref().ok_or_else(|| {
                        FsError::fs_corrupt(format!("file {} has no content", node.created_path))
                    })?;
                    let data = self.store.read_text(text, node.created_rev)?;
                    report.files += 1;
                    report.bytes += data.len() as u64;
                }
            }
        }
        Ok(())
    }

    // ==================== Transactions ====================

    /// Start a transaction based on `base`
    pub fn begin_txn(&self, base: Revision) -> Result<TxnId> {
        let root = self.revision_root(base)?;
        let id = format!("{}-{}", base, self.txn_seq.fetch_add(1, Ordering::Relaxed));
        let txn = Transaction::new(id.clone(), base, root);
        self.txns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(Mutex::new(txn)));
        Ok(id)
    }

    fn txn_handle(&self, id: &str) -> Result<TxnHandle> {
        self.txns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| FsError::NotFound(NotFoundKind::Transaction(id.to_string())))
    }

    fn forget(&self, id: &str) {
        self.txns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn abort_locked(&self, txn: &mut Transaction, reason: &FsError) {
        if txn.abort().is_ok() {
            tracing::warn!("Aborted transaction {}: {}", txn.id(), reason);
        }
        self.forget(txn.id());
    }

    /// Run an edit on an open transaction; errors that end the transaction
    /// abort it before they are returned
    fn with_txn<T>(&self, id: &str, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let handle = self.txn_handle(id)?;
        let mut txn = handle.lock().unwrap_or_else(PoisonError::into_inner);
        txn.ensure_open()?;
        let result = f(&mut *txn);
        if let Err(e) = &result {
            if e.aborts_transaction() {
                self.abort_locked(&mut *txn, e);
            }
        }
        result
    }

    /// Abort `id` because of `reason`, if it is still open
    pub(crate) fn abort_with(&self, id: &str, reason: &FsError) {
        if let Ok(handle) = self.txn_handle(id) {
            let mut txn = handle.lock().unwrap_or_else(PoisonError::into_inner);
            self.abort_locked(&mut *txn, reason);
        }
    }

    /// State of a live transaction; finished ones are `NotFound`
    pub fn txn_state(&self, id: &str) -> Result<TxnState> {
        let handle = self.txn_handle(id)?;
        let txn = handle.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(txn.state())
    }

    pub fn txn_base_revision(&self, id: &str) -> Result<Revision> {
        let handle = self.txn_handle(id)?;
        let txn = handle.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(txn.base_revision())
    }

    pub fn txn_changes(&self, id: &str) -> Result<Vec<ChangedPath>> {
        self.with_txn(id, |txn| Ok(txn.changes()))
    }

    pub fn set_txn_prop(&self, id: &str, name: &str, value: Option<&str>) -> Result<()> {
        self.with_txn(id, |txn| {
            txn.set_txn_prop(name, value);
            Ok(())
        })
    }

    pub fn open_dir(&self, id: &str, path: &str) -> Result<()> {
        self.with_txn(id, |txn| txn.expect_kind(&self.store, path, NodeKind::Dir))
    }

    pub fn open_file(&self, id: &str, path: &str) -> Result<()> {
        self.with_txn(id, |txn| txn.expect_kind(&self.store, path, NodeKind::File))
    }

    fn copy_source(&self, copy_from: Option<(Revision, &str)>) -> Result<Option<CopySource>> {
        let Some((revision, path)) = copy_from else {
            return Ok(None);
        };
        let path = canonicalize(path)?;
        let node = self.node_rev_id(revision, &path)?;
        Ok(Some(CopySource {
            from: CopyFrom { revision, path },
            node,
        }))
    }

    fn add(
        &self,
        id: &str,
        path: &str,
        kind: NodeKind,
        copy_from: Option<(Revision, &str)>,
    ) -> Result<()> {
        self.with_txn(id, |txn| {
            let copy = self.copy_source(copy_from)?;
            txn.add(&self.store, &self.keys, path, kind, copy)
        })
    }

    pub fn add_dir(&self, id: &str, path: &str, copy_from: Option<(Revision, &str)>) -> Result<()> {
        self.add(id, path, NodeKind::Dir, copy_from)
    }

    pub fn add_file(&self, id: &str, path: &str, copy_from: Option<(Revision, &str)>) -> Result<()> {
        self.add(id, path, NodeKind::File, copy_from)
    }

    pub fn delete_entry(&self, id: &str, path: &str) -> Result<()> {
        self.with_txn(id, |txn| txn.delete(&self.store, path))
    }

    /// Set (`Some`) or delete (`None`) a versioned property
    pub fn set_node_prop(&self, id: &str, path: &str, name: &str, value: Option<&str>) -> Result<()> {
        self.with_txn(id, |txn| txn.set_property(&self.store, path, name, value))
    }

    /// Open a sink for the new content of `path`.
    ///
    /// With `base_checksum`, the file's current content must match it.
    pub fn apply_text(
        &self,
        id: &str,
        path: &str,
        base_checksum: Option<&Checksum>,
    ) -> Result<TextSink<'_>> {
        let canonical = canonicalize(path)?;
        self.with_txn(id, |txn| {
            if let Some(expected) = base_checksum {
                let actual = txn.text_checksum(&self.store, &canonical)?;
                if &actual != expected {
                    return Err(FsError::ChecksumMismatch {
                        path: canonical.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            } else {
                txn.expect_kind(&self.store, &canonical, NodeKind::File)?;
            }
            Ok(())
        })?;
        Ok(TextSink::new(self, id, canonical, self.store.checksum_kind()))
    }

    pub(crate) fn txn_text(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.with_txn(id, |txn| txn.current_text(&self.store, path))
    }

    pub(crate) fn stage_text(&self, id: &str, path: &str, data: Vec<u8>, checksum: Checksum) -> Result<()> {
        self.with_txn(id, |txn| txn.stage_text(&self.store, path, data, checksum))
    }

    pub(crate) fn txn_text_checksum(&self, id: &str, path: &str) -> Result<Checksum> {
        self.with_txn(id, |txn| txn.text_checksum(&self.store, path))
    }

    /// Discard a transaction. Aborting a finished transaction is a no-op.
    pub fn abort_txn(&self, id: &str) -> Result<()> {
        let Ok(handle) = self.txn_handle(id) else {
            return Ok(());
        };
        let mut txn = handle.lock().unwrap_or_else(PoisonError::into_inner);
        txn.abort()?;
        self.forget(id);
        tracing::debug!("Transaction {} aborted by caller", id);
        Ok(())
    }

    /// Publish a transaction as the next revision.
    ///
    /// Either the new revision is fully visible or nothing is, and the
    /// transaction is gone either way.
    pub fn commit_txn(&self, id: &str) -> Result<CommitInfo> {
        let handle = self.txn_handle(id)?;
        let mut txn = handle.lock().unwrap_or_else(PoisonError::into_inner);
        txn.begin_finalize()?;

        let info = match self.finalize(&mut *txn) {
            Ok(info) => info,
            Err(e) => {
                self.abort_locked(&mut *txn, &e);
                return Err(e);
            }
        };
        let log = txn.props().get(svn_props::LOG).cloned().unwrap_or_default();
        txn.mark_committed()?;
        self.forget(id);
        drop(txn);

        tracing::info!(
            "Committed r{} by {}",
            info.revision,
            info.author.as_deref().unwrap_or("(no author)")
        );
        if let Some(hooks) = &self.hooks {
            hooks.run_post_commit(
                info.revision,
                info.author.as_deref().unwrap_or(""),
                &log,
                &format_date(&info.date),
            );
        }
        if let Err(e) = self.revprops.pack_pending(info.revision) {
            tracing::warn!("Packing revprops after r{} failed: {}", info.revision, e);
        }
        Ok(info)
    }

    fn finalize(&self, txn: &mut Transaction) -> Result<CommitInfo> {
        txn.stage_root(&self.store)?;
        txn.prepare_texts(&self.store)?;

        let author = txn.props().get(svn_props::AUTHOR).cloned();
        let changes = txn.changes();
        if let Some(hooks) = &self.hooks {
            let log = txn.props().get(svn_props::LOG).cloned().unwrap_or_default();
            hooks.run_pre_commit(&PreCommitInfo {
                txn: txn.id(),
                base_revision: txn.base_revision(),
                author: author.as_deref().unwrap_or(""),
                log: &log,
                changes: &changes,
            })?;
        }

        let _commit = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let head = self.youngest()?;
        if head != txn.base_revision() {
            txn.merge_onto(&self.store, self.revision_root(head)?)?;
            tracing::debug!(
                "Merged transaction {} from r{} onto r{}",
                txn.id(),
                txn.base_revision(),
                head
            );
        }

        let revision = head + 1;
        let root = txn.write_tree(&self.store, revision)?;
        let date = Utc::now();
        let mut props = txn.props().clone();
        props.set(svn_props::DATE, format_date(&date));
        self.revprops.write_new(revision, &props)?;
        self.store
            .backend()
            .write_meta(NEXT_NODE_ID, self.keys.peek().as_bytes())?;

        let record = RevisionRecord { root, changes };
        self.store.backend().finalize(revision, &record.to_bytes()?)?;
        Ok(CommitInfo {
            revision,
            date,
            author,
        })
    }
}
