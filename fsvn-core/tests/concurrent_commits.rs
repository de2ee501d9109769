//! Concurrent and out-of-date transactions

use fsvn_core::{FsError, Repository, RepositoryConfig, svn_props};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::thread;

fn repo() -> Repository {
    Repository::in_memory(RepositoryConfig::default()).unwrap()
}

fn write_file(repo: &Repository, txn: &str, path: &str, content: &str) {
    let mut sink = repo.apply_text(txn, path, None).unwrap();
    sink.write_all(content.as_bytes()).unwrap();
    sink.finish().unwrap();
}

/// r1: /left/f, /right/f
fn two_sided() -> Repository {
    let repo = repo();
    let txn = repo.begin_txn(0).unwrap();
    for side in ["left", "right"] {
        repo.add_dir(&txn, &format!("/{}", side), None).unwrap();
        let file = format!("/{}/f", side);
        repo.add_file(&txn, &file, None).unwrap();
        write_file(&repo, &txn, &file, side);
    }
    repo.commit_txn(&txn).unwrap();
    repo
}

#[test]
fn test_parallel_commits_get_distinct_revisions() {
    let repo = Arc::new(repo());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                let txn = repo.begin_txn(0).unwrap();
                repo.set_txn_prop(&txn, svn_props::AUTHOR, Some(format!("user{}", i).as_str()))
                    .unwrap();
                let path = format!("/file{}", i);
                repo.add_file(&txn, &path, None).unwrap();
                write_file(&repo, &txn, &path, &path);
                repo.commit_txn(&txn).unwrap().revision
            })
        })
        .collect();

    let revisions: HashSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(revisions, (1..=8).collect());
    assert_eq!(repo.youngest().unwrap(), 8);

    // Every disjoint add survived the merges
    let head = repo.list_dir(8, "/").unwrap();
    assert_eq!(head.len(), 8);
    for i in 0..8 {
        let path = format!("/file{}", i);
        assert_eq!(&repo.file_contents(8, &path).unwrap()[..], path.as_bytes());
    }
    let keys: HashSet<String> = (0..8)
        .map(|i| repo.node(8, &format!("/file{}", i)).unwrap().node_id.to_string())
        .collect();
    assert_eq!(keys.len(), 8);
}

#[test]
fn test_out_of_date_disjoint_edits_merge() {
    let repo = two_sided();
    let first = repo.begin_txn(1).unwrap();
    let second = repo.begin_txn(1).unwrap();
    write_file(&repo, &first, "/left/f", "left edited");
    write_file(&repo, &second, "/right/f", "right edited");

    assert_eq!(repo.commit_txn(&first).unwrap().revision, 2);
    assert_eq!(repo.commit_txn(&second).unwrap().revision, 3);

    assert_eq!(&repo.file_contents(3, "/left/f").unwrap()[..], b"left edited");
    assert_eq!(&repo.file_contents(3, "/right/f").unwrap()[..], b"right edited");
    assert_eq!(
        repo.node_rev_id(2, "/left").unwrap(),
        repo.node_rev_id(3, "/left").unwrap()
    );
}

#[test]
fn test_out_of_date_same_file_conflicts() {
    let repo = two_sided();
    let first = repo.begin_txn(1).unwrap();
    let second = repo.begin_txn(1).unwrap();
    write_file(&repo, &first, "/left/f", "mine");
    write_file(&repo, &second, "/left/f", "theirs");

    repo.commit_txn(&first).unwrap();
    match repo.commit_txn(&second).unwrap_err() {
        FsError::Conflict { path } => assert_eq!(path, "/left/f"),
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(repo.youngest().unwrap(), 2);
    assert!(repo.txn_state(&second).unwrap_err().is_not_found());
    assert_eq!(&repo.file_contents(2, "/left/f").unwrap()[..], b"mine");
}

#[test]
fn test_out_of_date_property_conflict() {
    let repo = two_sided();
    let first = repo.begin_txn(1).unwrap();
    let second = repo.begin_txn(1).unwrap();
    repo.set_node_prop(&first, "/left", "owner", Some("a")).unwrap();
    repo.set_node_prop(&second, "/left", "owner", Some("b")).unwrap();
    repo.commit_txn(&first).unwrap();
    assert!(matches!(
        repo.commit_txn(&second),
        Err(FsError::Conflict { .. })
    ));
}

#[test]
fn test_readers_see_whole_revisions() {
    let repo = Arc::new(two_sided());
    let writer = {
        let repo = Arc::clone(&repo);
        thread::spawn(move || {
            for i in 0..20 {
                let base = repo.youngest().unwrap();
                let txn = repo.begin_txn(base).unwrap();
                let content = format!("{}", i);
                write_file(&repo, &txn, "/left/f", &content);
                write_file(&repo, &txn, "/right/f", &content);
                repo.commit_txn(&txn).unwrap();
            }
        })
    };

    for _ in 0..50 {
        let rev = repo.youngest().unwrap();
        if rev < 2 {
            continue;
        }
        let left = repo.file_contents(rev, "/left/f").unwrap();
        let right = repo.file_contents(rev, "/right/f").unwrap();
        assert_eq!(left, right, "r{} is torn", rev);
    }
    writer.join().unwrap();
    assert_eq!(repo.youngest().unwrap(), 21);
}
