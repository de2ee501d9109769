//! Revision properties and their packing
//!
//! Each revision's properties (`svn:author`, `svn:date`, `svn:log`, ...) are
//! first written as a single JSON record. Once `pack_size` consecutive
//! revisions exist they are merged into one compressed pack and the
//! per-revision records are dropped.
//!
//! A manifest maps every packed revision to its pack: one pack name per
//! revision, one name per line. Pack names read `{first}.{tag}`; rewriting a
//! pack (after a property change) stores it under the next tag so that a
//! reader holding the previous manifest still finds the previous pack until
//! the swap completes.
//!
//! ```text
//! revprops/manifest         — pack names, one line per packed revision
//! revprops/packs/{first}.{tag}
//! revprops/revs/{rev}       — unpacked JSON records
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::backend::Backend;
use crate::error::{FsError, NotFoundKind, Result};
use crate::node::Revision;
use crate::properties::PropertySet;

pub const MANIFEST: &str = "revprops/manifest";

fn unpacked_name(rev: Revision) -> String {
    format!("revprops/revs/{}", rev)
}

fn pack_meta_name(pack: &str) -> String {
    format!("revprops/packs/{}", pack)
}

/// Maps revisions to the pack holding their properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevpropsManifest {
    first_revision: Revision,
    pack_names: Vec<String>,
}

impl RevpropsManifest {
    pub fn new(first_revision: Revision) -> Self {
        Self {
            first_revision,
            pack_names: Vec::new(),
        }
    }

    /// Parse newline-separated pack names, one line per revision.
    ///
    /// A blank line would be a revision without a pack, so it is corruption.
    pub fn parse(first_revision: Revision, text: &str) -> Result<Self> {
        let mut pack_names = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                return Err(FsError::fs_corrupt(format!(
                    "revprops manifest has no pack for r{}",
                    first_revision + i as u64
                )));
            }
            pack_names.push(line.to_string());
        }
        Ok(Self {
            first_revision,
            pack_names,
        })
    }

    pub fn from_bytes(first_revision: Revision, data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| FsError::fs_corrupt(format!("revprops manifest is not UTF-8: {}", e)))?;
        Self::parse(first_revision, text)
    }

    pub fn first_revision(&self) -> Revision {
        self.first_revision
    }

    pub fn len(&self) -> usize {
        self.pack_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pack_names.is_empty()
    }

    /// First revision not covered by any pack
    pub fn packed_until(&self) -> Revision {
        self.first_revision + self.pack_names.len() as u64
    }

    pub fn contains(&self, revision: Revision) -> bool {
        revision >= self.first_revision && revision < self.packed_until()
    }

    /// Name of the pack holding `revision`
    pub fn get_pack_name(&self, revision: Revision) -> Result<&str> {
        if !self.contains(revision) {
            return Err(FsError::fs_corrupt(format!(
                "revision {} is outside the revprops manifest ({}..{})",
                revision,
                self.first_revision,
                self.packed_until()
            )));
        }
        Ok(&self.pack_names[(revision - self.first_revision) as usize])
    }

    /// Bump the tag of the pack starting at `new_first_revision` and record
    /// the new name for all `revisions_count` slots of the batch.
    pub fn update_pack_name(
        &mut self,
        new_first_revision: Revision,
        revisions_count: u64,
    ) -> Result<String> {
        let start = self.get_pack_name(new_first_revision).map(|_| {
            (new_first_revision - self.first_revision) as usize
        })?;
        let end = start + revisions_count as usize;
        if revisions_count == 0 || end > self.pack_names.len() {
            return Err(FsError::fs_corrupt(format!(
                "pack batch r{}+{} exceeds the revprops manifest",
                new_first_revision, revisions_count
            )));
        }

        let old_name = &self.pack_names[start];
        let dot = old_name.find('.').ok_or_else(|| {
            FsError::fs_corrupt(format!("Packed file '{}' misses a tag", old_name))
        })?;
        let tag: u64 = old_name[dot + 1..].parse().map_err(|_| {
            FsError::fs_corrupt(format!("Packed file '{}' has a non-numeric tag", old_name))
        })?;

        let new_name = format!("{}.{}", new_first_revision, tag + 1);
        for slot in &mut self.pack_names[start..end] {
            slot.clone_from(&new_name);
        }
        Ok(new_name)
    }

    /// Record a freshly written pack `{first}.0` covering `count` revisions
    pub fn append_pack(&mut self, first: Revision, count: u64) -> Result<String> {
        if first != self.packed_until() {
            return Err(FsError::fs_corrupt(format!(
                "pack starting at r{} does not follow the manifest end r{}",
                first,
                self.packed_until()
            )));
        }
        let name = format!("{}.0", first);
        self.pack_names
            .extend(std::iter::repeat_n(name.clone(), count as usize));
        Ok(name)
    }

    pub fn as_string(&self) -> String {
        let mut out = String::with_capacity(self.pack_names.len() * 8);
        for name in &self.pack_names {
            out.push_str(name);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RevpropsPack {
    first: Revision,
    revisions: Vec<PropertySet>,
}

/// Reads, writes and packs revision properties
pub struct RevpropsManager {
    backend: Arc<dyn Backend>,
    pack_size: u64,
    compression_level: i32,
    manifest: RwLock<Arc<RevpropsManifest>>,
    writer: Mutex<()>,
}

impl RevpropsManager {
    pub fn open(backend: Arc<dyn Backend>, pack_size: u64, compression_level: i32) -> Result<Self> {
        let manifest = Self::load_manifest(backend.as_ref())?;
        Ok(Self {
            backend,
            pack_size: pack_size.max(1),
            compression_level,
            manifest: RwLock::new(Arc::new(manifest)),
            writer: Mutex::new(()),
        })
    }

    fn load_manifest(backend: &dyn Backend) -> Result<RevpropsManifest> {
        match backend.read_meta(MANIFEST)? {
            Some(data) => RevpropsManifest::from_bytes(0, &data),
            None => Ok(RevpropsManifest::new(0)),
        }
    }

    /// The manifest readers currently see
    pub fn snapshot(&self) -> Arc<RevpropsManifest> {
        self.manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, manifest: RevpropsManifest) -> Result<()> {
        self.backend
            .write_meta(MANIFEST, manifest.as_string().as_bytes())?;
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(manifest);
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let manifest = Self::load_manifest(self.backend.as_ref())?;
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(manifest);
        Ok(())
    }

    fn read_unpacked(&self, rev: Revision) -> Result<Option<PropertySet>> {
        match self.backend.read_meta(&unpacked_name(rev))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
                FsError::fs_corrupt(format!("revprops of r{} are unreadable: {}", rev, e))
            })?)),
            None => Ok(None),
        }
    }

    fn read_pack(&self, name: &str) -> Result<Option<RevpropsPack>> {
        let Some(data) = self.backend.read_meta(&pack_meta_name(name))? else {
            return Ok(None);
        };
        let decoded = zstd::decode_all(&data[..])
            .map_err(|e| FsError::fs_corrupt(format!("revprops pack '{}': {}", name, e)))?;
        let pack: RevpropsPack = bincode::deserialize(&decoded)
            .map_err(|e| FsError::fs_corrupt(format!("revprops pack '{}': {}", name, e)))?;
        Ok(Some(pack))
    }

    fn write_pack(&self, name: &str, pack: &RevpropsPack) -> Result<()> {
        let encoded = bincode::serialize(pack)?;
        let compressed = zstd::encode_all(&encoded[..], self.compression_level)?;
        self.backend.write_meta(&pack_meta_name(name), &compressed)
    }

    fn lookup(&self, manifest: &RevpropsManifest, rev: Revision) -> Result<Option<PropertySet>> {
        if !manifest.contains(rev) {
            return self.read_unpacked(rev);
        }
        let name = manifest.get_pack_name(rev)?;
        let Some(pack) = self.read_pack(name)? else {
            return Ok(None);
        };
        pack.revisions
            .get(rev.wrapping_sub(pack.first) as usize)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                FsError::fs_corrupt(format!("revprops pack '{}' does not hold r{}", name, rev))
            })
    }

    /// Properties of `rev`.
    ///
    /// A record that vanished under an older manifest snapshot (packed or
    /// repacked meanwhile) is retried once against a freshly loaded manifest.
    pub fn read(&self, rev: Revision) -> Result<PropertySet> {
        if let Some(props) = self.lookup(&self.snapshot(), rev)? {
            return Ok(props);
        }
        self.reload()?;
        let manifest = self.snapshot();
        match self.lookup(&manifest, rev)? {
            Some(props) => Ok(props),
            None if manifest.contains(rev) => Err(FsError::fs_corrupt(format!(
                "revprops pack '{}' is missing",
                manifest.get_pack_name(rev)?
            ))),
            None => Err(FsError::NotFound(NotFoundKind::Revision(rev))),
        }
    }

    /// Record the properties of a revision about to be published
    pub fn write_new(&self, rev: Revision, props: &PropertySet) -> Result<()> {
        let data = serde_json::to_vec(props)?;
        self.backend.write_meta(&unpacked_name(rev), &data)
    }

    /// Set (or delete, with `None`) one property of a published revision
    pub fn change(&self, rev: Revision, name: &str, value: Option<&str>) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let manifest = self.snapshot();

        if !manifest.contains(rev) {
            let mut props = self
                .read_unpacked(rev)?
                .ok_or(FsError::NotFound(NotFoundKind::Revision(rev)))?;
            props.apply(name, value);
            return self.write_new(rev, &props);
        }

        let old_name = manifest.get_pack_name(rev)?.to_string();
        let mut pack = self
            .read_pack(&old_name)?
            .ok_or_else(|| FsError::fs_corrupt(format!("revprops pack '{}' is missing", old_name)))?;
        let slot = pack
            .revisions
            .get_mut(rev.wrapping_sub(pack.first) as usize)
            .ok_or_else(|| {
                FsError::fs_corrupt(format!("revprops pack '{}' does not hold r{}", old_name, rev))
            })?;
        slot.apply(name, value);

        let mut next = (*manifest).clone();
        let new_name = next.update_pack_name(pack.first, pack.revisions.len() as u64)?;
        self.write_pack(&new_name, &pack)?;
        self.publish(next)?;
        self.backend.remove_meta(&pack_meta_name(&old_name))?;
        tracing::info!("Repacked revprops '{}' as '{}'", old_name, new_name);
        Ok(())
    }

    /// Pack every complete batch of revisions up to `youngest`.
    /// Returns the number of packs written.
    pub fn pack_pending(&self, youngest: Revision) -> Result<usize> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut written = 0;
        loop {
            let manifest = self.snapshot();
            let first = manifest.packed_until();
            let last = first + self.pack_size - 1;
            if last > youngest {
                break;
            }

            let mut revisions = Vec::with_capacity(self.pack_size as usize);
            for rev in first..=last {
                let props = self.read_unpacked(rev)?.ok_or_else(|| {
                    FsError::fs_corrupt(format!("revprops of r{} are missing", rev))
                })?;
                revisions.push(props);
            }

            let mut next = (*manifest).clone();
            let name = next.append_pack(first, self.pack_size)?;
            self.write_pack(&name, &RevpropsPack { first, revisions })?;
            self.publish(next)?;
            for rev in first..=last {
                self.backend.remove_meta(&unpacked_name(rev))?;
            }
            tracing::info!("Packed revprops r{}..r{} into '{}'", first, last, name);
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn props_for(rev: Revision) -> PropertySet {
        let mut props = PropertySet::new();
        props.set("svn:log", format!("commit {}", rev));
        props
    }

    fn manager(backend: &Arc<MemoryBackend>, pack_size: u64) -> RevpropsManager {
        RevpropsManager::open(backend.clone(), pack_size, 3).unwrap()
    }

    #[test]
    fn test_manifest_parse_and_lookup() {
        let manifest = RevpropsManifest::parse(0, "0.0\n0.0\n2.3\n2.3\n").unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.get_pack_name(0).unwrap(), "0.0");
        assert_eq!(manifest.get_pack_name(3).unwrap(), "2.3");
        assert!(manifest.get_pack_name(4).unwrap_err().is_corruption());
        assert_eq!(manifest.as_string(), "0.0\n0.0\n2.3\n2.3\n");
    }

    #[test]
    fn test_manifest_blank_line_is_corrupt() {
        for text in ["0.0\n\n2.0\n", "\n0.0\n", "0.0\n \n"] {
            let err = RevpropsManifest::parse(0, text).unwrap_err();
            assert!(err.is_corruption(), "{:?}", text);
        }
        assert!(RevpropsManifest::parse(5, "").unwrap().is_empty());
    }

    #[test]
    fn test_get_pack_name_range() {
        let manifest = RevpropsManifest::parse(10, "10.0\n10.0\n").unwrap();
        assert!(manifest.get_pack_name(9).is_err());
        assert_eq!(manifest.get_pack_name(10).unwrap(), "10.0");
        assert_eq!(manifest.get_pack_name(11).unwrap(), "10.0");
        assert!(manifest.get_pack_name(12).is_err());
    }

    #[test]
    fn test_manifest_rejects_non_utf8() {
        assert!(
            RevpropsManifest::from_bytes(0, &[0xff, 0xfe, b'\n'])
                .unwrap_err()
                .is_corruption()
        );
    }

    #[test]
    fn test_update_pack_name_single_increment_across_batch() {
        let mut manifest = RevpropsManifest::parse(0, "0.4\n0.4\n0.4\n3.0\n").unwrap();
        let name = manifest.update_pack_name(0, 3).unwrap();
        assert_eq!(name, "0.5");
        assert_eq!(manifest.as_string(), "0.5\n0.5\n0.5\n3.0\n");

        assert_eq!(manifest.update_pack_name(3, 1).unwrap(), "3.1");
        assert_eq!(manifest.get_pack_name(3).unwrap(), "3.1");
    }

    #[test]
    fn test_update_pack_name_malformed_tags() {
        let mut manifest = RevpropsManifest::parse(0, "0\n").unwrap();
        assert!(manifest.update_pack_name(0, 1).unwrap_err().is_corruption());

        let mut manifest = RevpropsManifest::parse(0, "0.x\n").unwrap();
        assert!(manifest.update_pack_name(0, 1).unwrap_err().is_corruption());

        let mut manifest = RevpropsManifest::parse(0, "0.0\n").unwrap();
        assert!(manifest.update_pack_name(0, 2).is_err());
        assert!(manifest.update_pack_name(5, 1).is_err());
        assert_eq!(manifest.get_pack_name(0).unwrap(), "0.0");
    }

    #[test]
    fn test_append_pack_must_be_contiguous() {
        let mut manifest = RevpropsManifest::new(0);
        assert_eq!(manifest.append_pack(0, 2).unwrap(), "0.0");
        assert!(manifest.append_pack(5, 2).is_err());
        assert_eq!(manifest.append_pack(2, 2).unwrap(), "2.0");
        assert_eq!(manifest.packed_until(), 4);
    }

    #[test]
    fn test_pack_when_batch_complete() {
        let backend = Arc::new(MemoryBackend::new());
        let revprops = manager(&backend, 4);
        for rev in 0..=2 {
            revprops.write_new(rev, &props_for(rev)).unwrap();
        }
        assert_eq!(revprops.pack_pending(2).unwrap(), 0);

        revprops.write_new(3, &props_for(3)).unwrap();
        revprops.write_new(4, &props_for(4)).unwrap();
        assert_eq!(revprops.pack_pending(4).unwrap(), 1);

        let manifest = revprops.snapshot();
        assert_eq!(manifest.as_string(), "0.0\n0.0\n0.0\n0.0\n");
        assert!(backend.read_meta("revprops/revs/0").unwrap().is_none());
        assert!(backend.read_meta("revprops/packs/0.0").unwrap().is_some());
        assert!(backend.read_meta("revprops/revs/4").unwrap().is_some());

        for rev in 0..=4 {
            assert_eq!(revprops.read(rev).unwrap(), props_for(rev));
        }
        assert!(revprops.read(5).unwrap_err().is_not_found());
    }

    #[test]
    fn test_change_packed_revision_retags() {
        let backend = Arc::new(MemoryBackend::new());
        let revprops = manager(&backend, 2);
        for rev in 0..4 {
            revprops.write_new(rev, &props_for(rev)).unwrap();
        }
        assert_eq!(revprops.pack_pending(3).unwrap(), 2);

        revprops.change(3, "svn:log", Some("fixed message")).unwrap();
        let manifest = revprops.snapshot();
        assert_eq!(manifest.as_string(), "0.0\n0.0\n2.1\n2.1\n");
        assert!(backend.read_meta("revprops/packs/2.0").unwrap().is_none());

        let props = revprops.read(3).unwrap();
        assert_eq!(props.get("svn:log").map(String::as_str), Some("fixed message"));
        assert_eq!(revprops.read(2).unwrap(), props_for(2));

        revprops.change(2, "svn:log", None).unwrap();
        assert_eq!(revprops.snapshot().get_pack_name(2).unwrap(), "2.2");
        assert!(revprops.read(2).unwrap().is_empty());
    }

    #[test]
    fn test_change_unpacked_revision() {
        let backend = Arc::new(MemoryBackend::new());
        let revprops = manager(&backend, 16);
        revprops.write_new(0, &props_for(0)).unwrap();
        revprops.change(0, "svn:author", Some("alice")).unwrap();
        let props = revprops.read(0).unwrap();
        assert_eq!(props.get("svn:author").map(String::as_str), Some("alice"));
        assert!(revprops.change(1, "svn:author", Some("bob")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_stale_snapshot_retries_after_pack() {
        let backend = Arc::new(MemoryBackend::new());
        let reader = manager(&backend, 2);
        let packer = manager(&backend, 2);
        for rev in 0..2 {
            packer.write_new(rev, &props_for(rev)).unwrap();
        }
        // Reader's snapshot predates the pack
        assert!(reader.snapshot().is_empty());
        packer.pack_pending(1).unwrap();

        assert_eq!(reader.read(1).unwrap(), props_for(1));
        assert_eq!(reader.snapshot().len(), 2);
    }

    #[test]
    fn test_manifest_survives_reopen() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let revprops = manager(&backend, 2);
            for rev in 0..3 {
                revprops.write_new(rev, &props_for(rev)).unwrap();
            }
            revprops.pack_pending(2).unwrap();
        }
        let reopened = manager(&backend, 2);
        assert_eq!(reopened.snapshot().len(), 2);
        assert_eq!(reopened.read(0).unwrap(), props_for(0));
        assert_eq!(reopened.read(2).unwrap(), props_for(2));
    }
}
