//! Repository paths and the path index
//!
//! Paths are absolute, `/`-separated and canonical: no empty, `.` or `..`
//! components and no trailing slash. The root is `/`.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use crate::error::{FsError, NotFoundKind, Result};
use crate::node::{NodeRevId, Revision};
use crate::store::NodeStore;

/// Canonicalize a repository path, accepting it with or without the leading
/// slash and ignoring doubled or trailing slashes
pub fn canonicalize(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == "." || part == ".." || part.contains('\0') {
            return Err(FsError::InvalidPath {
                path: path.to_string(),
            });
        }
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Components of a canonical path; empty for the root
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Split a canonical path into parent and final name; `None` for the root
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether `path` is `ancestor` or lies below it
pub fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor == "/"
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Resolves `path@revision` to the node-revision stored there.
///
/// Published revisions never change, so resolved ids are memoized without
/// invalidation.
pub struct PathIndex {
    cache: Option<Mutex<LruCache<(Revision, String), NodeRevId>>>,
}

impl PathIndex {
    /// A capacity of 0 disables memoization
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    fn cached(&self, revision: Revision, path: &str) -> Option<NodeRevId> {
        let cache = self.cache.as_ref()?;
        cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(revision, path.to_string()))
            .copied()
    }

    fn remember(&self, revision: Revision, path: String, id: NodeRevId) {
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put((revision, path), id);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| {
            c.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk from the revision's root to `path`
    pub fn resolve(
        &self,
        store: &NodeStore,
        revision: Revision,
        root: NodeRevId,
        path: &str,
    ) -> Result<NodeRevId> {
        let canonical = canonicalize(path)?;
        if canonical == "/" {
            return Ok(root);
        }
        if let Some(id) = self.cached(revision, &canonical) {
            return Ok(id);
        }

        let parts = components(&canonical);
        let not_found = || {
            FsError::NotFound(NotFoundKind::Path {
                revision,
                path: canonical.clone(),
            })
        };

        // Start from the deepest ancestor already resolved
        let mut id = root;
        let mut start = 0;
        let mut prefix = String::new();
        for depth in (1..parts.len()).rev() {
            let ancestor = format!("/{}", parts[..depth].join("/"));
            if let Some(hit) = self.cached(revision, &ancestor) {
                id = hit;
                start = depth;
                prefix = ancestor;
                break;
            }
        }

        for part in &parts[start..] {
            let node = store.read_node(&id)?;
            let entry = node.entries.get(*part).ok_or_else(not_found)?;
            id = entry.id;
            prefix.push('/');
            prefix.push_str(part);
            self.remember(revision, prefix.clone(), id);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::checksum::ChecksumKind;
    use crate::config::DeltaPolicy;
    use crate::keys::NodeId;
    use crate::node::{DirEntry, NodeKind, NodeRevision};
    use std::sync::Arc;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("").unwrap(), "/");
        assert_eq!(canonicalize("/").unwrap(), "/");
        assert_eq!(canonicalize("a/b").unwrap(), "/a/b");
        assert_eq!(canonicalize("//a///b/").unwrap(), "/a/b");
        assert!(canonicalize("/a/../b").is_err());
        assert!(canonicalize("./a").is_err());
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_parent("/"), None);
        assert_eq!(split_parent("/a"), Some(("/", "a")));
        assert_eq!(split_parent("/a/b/c.txt"), Some(("/a/b", "c.txt")));
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert!(components("/").is_empty());
        assert_eq!(components("/a/b"), vec!["a", "b"]);
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(is_within("/anything", "/"));
        assert!(!is_within("/ab", "/a"));
    }

    fn tree() -> (NodeStore, NodeRevId) {
        let store = NodeStore::new(
            Arc::new(MemoryBackend::new()),
            ChecksumKind::Sha256,
            DeltaPolicy::default(),
            0,
        );
        let file = NodeRevision::new_file(NodeId::root(), 1, "/a/b.txt");
        let file_id = store.write_node(&file).unwrap();
        let mut dir = NodeRevision::new_dir(NodeId::root(), 1, "/a");
        dir.entries.insert(
            "b.txt".into(),
            DirEntry {
                kind: NodeKind::File,
                id: file_id,
            },
        );
        let dir_id = store.write_node(&dir).unwrap();
        let mut root = NodeRevision::new_dir(NodeId::root(), 1, "/");
        root.entries.insert(
            "a".into(),
            DirEntry {
                kind: NodeKind::Dir,
                id: dir_id,
            },
        );
        let root_id = store.write_node(&root).unwrap();
        (store, root_id)
    }

    #[test]
    fn test_resolve_and_cache() {
        let (store, root) = tree();
        let index = PathIndex::new(16);

        assert_eq!(index.resolve(&store, 1, root, "/").unwrap(), root);
        let file = index.resolve(&store, 1, root, "a/b.txt").unwrap();
        assert_eq!(store.read_node(&file).unwrap().created_path, "/a/b.txt");
        // "/a" and "/a/b.txt" are both memoized
        assert_eq!(index.len(), 2);
        assert_eq!(index.resolve(&store, 1, root, "/a/b.txt").unwrap(), file);
    }

    #[test]
    fn test_resolve_missing() {
        let (store, root) = tree();
        let index = PathIndex::new(0);
        let err = index.resolve(&store, 1, root, "/a/nope").unwrap_err();
        assert!(matches!(
            err,
            FsError::NotFound(NotFoundKind::Path { revision: 1, ref path }) if path == "/a/nope"
        ));
        // Walking through a file finds nothing below it
        assert!(index.resolve(&store, 1, root, "/a/b.txt/c").unwrap_err().is_not_found());
        assert!(index.is_empty());
    }
}
