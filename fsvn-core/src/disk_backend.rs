//! Filesystem backend
//!
//! Layout on disk:
//! ```text
//! {root}/
//!   objects/{hash[0..2]}/{hash[2..]}  — content-addressed records
//!   revs/{rev}                        — published revision records
//!   current                           — youngest revision number (text)
//!   meta/{name}                       — named metadata (revprops, counters)
//! ```
//!
//! Every file is written to a uniquely named temp file, synced, then renamed
//! into place, so readers only ever observe complete files. A revision is
//! published by rewriting `current` after its record is durable.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::backend::{Backend, check_next_revision};
use crate::error::{FsError, NotFoundKind, Result};
use crate::node::Revision;
use crate::object::ObjectId;

pub struct FsBackend {
    root: PathBuf,
    youngest: RwLock<Option<Revision>>,
    publish: Mutex<()>,
}

impl FsBackend {
    /// Open or create a backend rooted at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let root = path.to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("revs"))?;
        fs::create_dir_all(root.join("meta"))?;

        let youngest = match fs::read_to_string(root.join("current")) {
            Ok(text) => Some(text.trim().parse::<u64>().map_err(|_| {
                FsError::fs_corrupt(format!("unparseable 'current' file: {:?}", text.trim()))
            })?),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            root,
            youngest: RwLock::new(youngest),
            publish: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.fanout_path();
        self.root.join("objects").join(dir).join(file)
    }

    fn revision_path(&self, rev: Revision) -> PathBuf {
        self.root.join("revs").join(rev.to_string())
    }

    fn meta_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with('/')
            && name
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid {
            return Err(FsError::InvalidPath {
                path: name.to_string(),
            });
        }
        Ok(self.root.join("meta").join(name))
    }
}

/// Write `data` to `path` through a synced temp file and a rename
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| FsError::InvalidPath {
            path: path.display().to_string(),
        })?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

impl Backend for FsBackend {
    fn write(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::from_data(data);
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        write_atomic(&path, data)?;
        Ok(id)
    }

    fn read(&self, id: &ObjectId) -> Result<Vec<u8>> {
        match fs::read(self.object_path(id)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FsError::NotFound(NotFoundKind::Object(*id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn finalize(&self, rev: Revision, record: &[u8]) -> Result<()> {
        let _guard = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let youngest = *self.youngest.read().unwrap_or_else(PoisonError::into_inner);
        check_next_revision(youngest, rev)?;

        write_atomic(&self.revision_path(rev), record)?;
        write_atomic(&self.root.join("current"), rev.to_string().as_bytes())?;

        *self.youngest.write().unwrap_or_else(PoisonError::into_inner) = Some(rev);
        Ok(())
    }

    fn revision(&self, rev: Revision) -> Result<Vec<u8>> {
        // A record on disk past `current` belongs to an unfinished publish
        let youngest = *self.youngest.read().unwrap_or_else(PoisonError::into_inner);
        if youngest.is_none_or(|y| rev > y) {
            return Err(FsError::NotFound(NotFoundKind::Revision(rev)));
        }
        match fs::read(self.revision_path(rev)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FsError::fs_corrupt(format!(
                "record for published r{} is missing",
                rev
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn youngest(&self) -> Result<Option<Revision>> {
        Ok(*self.youngest.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn read_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.meta_path(name)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_meta(&self, name: &str, data: &[u8]) -> Result<()> {
        write_atomic(&self.meta_path(name)?, data)
    }

    fn remove_meta(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.meta_path(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
