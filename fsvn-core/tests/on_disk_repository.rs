//! Repositories on the filesystem and SQLite backends

use fsvn_core::{
    BackendKind, DeltaPolicy, FsError, Repository, RepositoryConfig, RevpropsManifest, svn_props,
};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

fn config(backend: BackendKind) -> RepositoryConfig {
    RepositoryConfig {
        backend,
        revprops_pack_size: 4,
        ..RepositoryConfig::default()
    }
}

fn commit_text(repo: &Repository, path: &str, content: &[u8], log: &str) -> u64 {
    let txn = repo.begin_txn(repo.youngest().unwrap()).unwrap();
    repo.set_txn_prop(&txn, svn_props::AUTHOR, Some("carol")).unwrap();
    repo.set_txn_prop(&txn, svn_props::LOG, Some(log)).unwrap();
    if repo.check_path(repo.youngest().unwrap(), path).unwrap().is_none() {
        repo.add_file(&txn, path, None).unwrap();
    }
    let mut sink = repo.apply_text(&txn, path, None).unwrap();
    sink.write_all(content).unwrap();
    sink.finish().unwrap();
    repo.commit_txn(&txn).unwrap().revision
}

/// Ten revisions of one growing file, so later ones are delta chains
fn history(repo: &Repository) -> Vec<Vec<u8>> {
    let mut texts = Vec::new();
    let mut text = b"line 0 of a slowly growing file\n".repeat(40);
    for i in 1..=10 {
        text.extend_from_slice(format!("appended line {}\n", i).as_bytes());
        commit_text(repo, "/doc.txt", &text, &format!("edit {}", i));
        texts.push(text.clone());
    }
    texts
}

fn reopen_roundtrip(backend: BackendKind) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("repo");
    let texts = {
        let repo = Repository::create(&path, config(backend)).unwrap();
        history(&repo)
    };

    let repo = Repository::open(&path).unwrap();
    assert_eq!(repo.config().backend, backend);
    assert_eq!(repo.youngest().unwrap(), 10);
    for (i, text) in texts.iter().enumerate() {
        let rev = i as u64 + 1;
        assert_eq!(&repo.file_contents(rev, "/doc.txt").unwrap()[..], &text[..]);
        assert_eq!(
            repo.revision_props(rev).unwrap().get(svn_props::LOG).unwrap(),
            &format!("edit {}", rev)
        );
    }
    let node = repo.node(10, "/doc.txt").unwrap();
    assert!(node.text.unwrap().chain_len > 0);
    assert_eq!(node.predecessor_count, 9);

    let report = repo.verify(0, 10).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.files, 10);

    assert_eq!(commit_text(&repo, "/more.txt", b"after reopen", "more"), 11);
}

#[test]
fn test_filesystem_reopen() {
    reopen_roundtrip(BackendKind::Filesystem);
}

#[test]
fn test_sqlite_reopen() {
    reopen_roundtrip(BackendKind::Sqlite);
}

#[test]
fn test_fulltext_only_policy() {
    let tmp = TempDir::new().unwrap();
    let repo = Repository::create(
        tmp.path(),
        RepositoryConfig {
            delta: DeltaPolicy::fulltext_only(),
            ..RepositoryConfig::default()
        },
    )
    .unwrap();
    history(&repo);
    let node = repo.node(10, "/doc.txt").unwrap();
    assert_eq!(node.text.unwrap().chain_len, 0);
}

fn manifest(repo_path: &Path) -> RevpropsManifest {
    let data = fs::read(repo_path.join("meta/revprops/manifest")).unwrap();
    RevpropsManifest::from_bytes(0, &data).unwrap()
}

#[test]
fn test_revprops_pack_and_retag() {
    let tmp = TempDir::new().unwrap();
    let repo = Repository::create(tmp.path(), config(BackendKind::Filesystem)).unwrap();
    for i in 1..=5 {
        commit_text(&repo, "/f", format!("{}", i).as_bytes(), &format!("log {}", i));
    }

    // r0..r3 were packed when r3 landed
    let packed = manifest(tmp.path());
    assert_eq!(packed.len(), 4);
    assert_eq!(packed.get_pack_name(2).unwrap(), "0.0");
    assert!(tmp.path().join("meta/revprops/packs/0.0").exists());
    assert!(!tmp.path().join("meta/revprops/revs/2").exists());
    assert!(tmp.path().join("meta/revprops/revs/4").exists());

    repo.set_revision_property(2, svn_props::LOG, Some("reworded"), "carol")
        .unwrap();
    let retagged = manifest(tmp.path());
    for rev in 0..4 {
        assert_eq!(retagged.get_pack_name(rev).unwrap(), "0.1");
    }
    assert!(matches!(
        retagged.get_pack_name(4),
        Err(FsError::FsCorrupt { .. })
    ));
    assert!(!tmp.path().join("meta/revprops/packs/0.0").exists());

    let props = repo.revision_props(2).unwrap();
    assert_eq!(props.get(svn_props::LOG).unwrap(), "reworded");
    assert_eq!(props.get(svn_props::AUTHOR).unwrap(), "carol");
    assert_eq!(
        repo.revision_props(3).unwrap().get(svn_props::LOG).unwrap(),
        "log 3"
    );

    // Survives a reopen, and unpacked revisions are still editable
    drop(repo);
    let repo = Repository::open(tmp.path()).unwrap();
    assert_eq!(
        repo.revision_props(2).unwrap().get(svn_props::LOG).unwrap(),
        "reworded"
    );
    repo.set_revision_property(5, "custom", Some("x"), "carol").unwrap();
    assert_eq!(repo.revision_props(5).unwrap().get("custom").unwrap(), "x");
}

#[test]
fn test_corrupt_object_is_reported_by_verify() {
    let tmp = TempDir::new().unwrap();
    let repo = Repository::create(
        tmp.path(),
        RepositoryConfig {
            compression_level: 0,
            ..RepositoryConfig::default()
        },
    )
    .unwrap();
    commit_text(&repo, "/f", b"intact content", "one");
    let text = repo.node(1, "/f").unwrap().text.unwrap();

    let (dir, file) = text.rep.fanout_path();
    let object = tmp.path().join("objects").join(dir).join(file);
    let mut data = fs::read(&object).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&object, data).unwrap();

    let err = repo.file_contents(1, "/f").unwrap_err();
    assert!(err.is_corruption(), "{:?}", err);
    let report = repo.verify(0, 1).unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].revision, 1);
}

#[test]
fn test_malformed_node_key_counter_refuses_to_open() {
    let tmp = TempDir::new().unwrap();
    {
        let repo = Repository::create(tmp.path(), RepositoryConfig::default()).unwrap();
        commit_text(&repo, "/a", b"a", "one");
        commit_text(&repo, "/b", b"b", "two");
    }
    fs::write(tmp.path().join("meta").join("next-node-id"), "garbage!").unwrap();

    let err = Repository::open(tmp.path()).err().unwrap();
    assert!(err.is_corruption(), "{:?}", err);
}

#[cfg(unix)]
#[test]
fn test_pre_commit_hook_rejects() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let repo = Repository::create(tmp.path(), RepositoryConfig::default()).unwrap();
    let hook = tmp.path().join("hooks/pre-commit");
    fs::write(
        &hook,
        "#!/bin/sh\nif grep -q '^LOG: $'; then echo 'log message required' >&2; exit 1; fi\nexit 0\n",
    )
    .unwrap();
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

    let txn = repo.begin_txn(0).unwrap();
    repo.add_file(&txn, "/f", None).unwrap();
    match repo.commit_txn(&txn).unwrap_err() {
        FsError::HookFailed { hook, message } => {
            assert_eq!(hook, "pre-commit");
            assert_eq!(message, "log message required");
        }
        other => panic!("expected hook failure, got {:?}", other),
    }
    assert_eq!(repo.youngest().unwrap(), 0);

    assert_eq!(commit_text(&repo, "/f", b"ok", "has a log"), 1);
}
