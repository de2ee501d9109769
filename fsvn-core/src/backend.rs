//! Storage backend capability
//!
//! The engine only ever asks a backend for three things: store an object,
//! fetch an object, and publish a revision. Everything above that (node
//! records, deltas, revprops) is encoded by the caller. Backends also keep a
//! handful of named metadata blobs used for the revprops manifest, revprops
//! records and the node-key counter.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::{FsError, NotFoundKind, Result};
use crate::node::Revision;
use crate::object::ObjectId;

pub trait Backend: Send + Sync {
    /// Store bytes and return their content address. Idempotent.
    fn write(&self, data: &[u8]) -> Result<ObjectId>;

    /// Fetch stored bytes; `NotFound(Object)` when unknown
    fn read(&self, id: &ObjectId) -> Result<Vec<u8>>;

    /// Durably record `rev` and make it the youngest revision.
    ///
    /// `rev` must be exactly one past the current youngest (or 0 for an
    /// empty backend). Nothing is visible until this returns `Ok`.
    fn finalize(&self, rev: Revision, record: &[u8]) -> Result<()>;

    /// Fetch a published revision record; `NotFound(Revision)` when unknown
    fn revision(&self, rev: Revision) -> Result<Vec<u8>>;

    /// Youngest published revision, `None` before revision 0 exists
    fn youngest(&self) -> Result<Option<Revision>>;

    fn read_meta(&self, name: &str) -> Result<Option<Vec<u8>>>;

    fn write_meta(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Remove a metadata blob; removing a missing one is not an error
    fn remove_meta(&self, name: &str) -> Result<()>;

    /// Short name for log lines
    fn name(&self) -> &'static str;
}

pub(crate) fn check_next_revision(youngest: Option<Revision>, rev: Revision) -> Result<()> {
    let expected = youngest.map_or(0, |y| y + 1);
    if rev != expected {
        return Err(FsError::fs_corrupt(format!(
            "cannot publish r{}: next revision is r{}",
            rev, expected
        )));
    }
    Ok(())
}

/// In-process backend for tests and scratch repositories
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<ObjectId, Vec<u8>>>,
    revisions: RwLock<Vec<Vec<u8>>>,
    meta: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Backend for MemoryBackend {
    fn write(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::from_data(data);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| data.to_vec());
        Ok(id)
    }

    fn read(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(FsError::NotFound(NotFoundKind::Object(*id)))
    }

    fn finalize(&self, rev: Revision, record: &[u8]) -> Result<()> {
        let mut revisions = self.revisions.write().unwrap_or_else(PoisonError::into_inner);
        let youngest = (revisions.len() as u64).checked_sub(1);
        check_next_revision(youngest, rev)?;
        revisions.push(record.to_vec());
        Ok(())
    }

    fn revision(&self, rev: Revision) -> Result<Vec<u8>> {
        self.revisions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rev as usize)
            .cloned()
            .ok_or(FsError::NotFound(NotFoundKind::Revision(rev)))
    }

    fn youngest(&self) -> Result<Option<Revision>> {
        let len = self
            .revisions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        Ok((len as u64).checked_sub(1))
    }

    fn read_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    fn write_meta(&self, name: &str, data: &[u8]) -> Result<()> {
        self.meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove_meta(&self, name: &str) -> Result<()> {
        self.meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
