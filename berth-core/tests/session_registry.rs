//! Session registry behaviour against an on-disk store.

use std::path::Path;

use berth_core::{NewSession, RegistryError, SessionId, SessionMode, Store};
use rstest::rstest;

fn open(dir: &assert_fs::TempDir) -> Store {
    Store::open(dir.path().join("registry.db")).expect("open store")
}

fn sid(s: &str) -> SessionId {
    SessionId::from(s)
}

// ---------------------------------------------------------------------------
// 1. Insert
// ---------------------------------------------------------------------------

#[test]
fn insert_applies_defaults_and_timestamps() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);

    let row = store
        .insert(NewSession::new("001", "/p", "/s/001"))
        .expect("insert");

    assert_eq!(row.session_id, sid("001"));
    assert_eq!(row.mode, SessionMode::Docker);
    assert!(!row.in_place);
    assert_eq!(row.branch, "");
    assert!(row.destroyed_at.is_none());
    assert!(row.is_active());
    assert!(row.created_at <= chrono::Utc::now());
}

#[test]
fn insert_keeps_optional_fields() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);

    let row = store
        .insert(
            NewSession::new("002", "/p", "/p")
                .branch("feature/ports")
                .mode(SessionMode::Native)
                .in_place(true),
        )
        .expect("insert");

    assert_eq!(row.branch, "feature/ports");
    assert_eq!(row.mode, SessionMode::Native);
    assert!(row.in_place);
}

#[rstest]
#[case::same_project("/p")]
#[case::other_project("/elsewhere")]
fn duplicate_active_session_id_fails_in_any_project(#[case] second_root: &str) {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    store
        .insert(NewSession::new("001", "/p", "/s/001"))
        .expect("first insert");

    let err = store
        .insert(NewSession::new("001", second_root, "/s/other"))
        .unwrap_err();
    assert!(
        matches!(&err, RegistryError::DuplicateSession { session_id } if session_id == "001"),
        "got: {err}"
    );
    assert_eq!(store.list_all().expect("list").len(), 1);
}

// ---------------------------------------------------------------------------
// 2. Lookups and listing
// ---------------------------------------------------------------------------

#[test]
fn find_session_is_scoped_by_project() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    store.insert(NewSession::new("001", "/p", "/s/001")).unwrap();

    assert!(store.find_session(Path::new("/p"), &sid("001")).unwrap().is_some());
    assert!(store.find_session(Path::new("/q"), &sid("001")).unwrap().is_none());
}

#[test]
fn find_by_dir_resolves_identity() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    store.insert(NewSession::new("004", "/p", "/work/p-004")).unwrap();

    let row = store
        .find_by_dir(Path::new("/work/p-004"))
        .unwrap()
        .expect("found");
    assert_eq!(row.session_id, sid("004"));
    assert!(store.find_by_dir(Path::new("/work/none")).unwrap().is_none());
}

#[test]
fn list_by_project_is_sorted_by_session_id() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    // Insert out of order intentionally
    for id in ["003", "001", "002"] {
        store
            .insert(NewSession::new(id, "/p", format!("/s/{id}")))
            .unwrap();
    }
    store.insert(NewSession::new("010", "/q", "/s/010")).unwrap();

    let ids: Vec<String> = store
        .list_by_project(Path::new("/p"))
        .unwrap()
        .into_iter()
        .map(|r| r.session_id.0)
        .collect();
    assert_eq!(ids, vec!["001", "002", "003"]);

    let all = store.list_all().unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all.last().unwrap().project_root, Path::new("/q"));
}

#[test]
fn used_session_ids_spans_projects() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    store.insert(NewSession::new("001", "/p", "/s/001")).unwrap();
    store.insert(NewSession::new("002", "/q", "/s/002")).unwrap();

    let used = store.used_session_ids().unwrap();
    assert!(used.contains(&sid("001")));
    assert!(used.contains(&sid("002")));
    assert_eq!(store.next_session_id().unwrap(), sid("003"));
}

// ---------------------------------------------------------------------------
// 3. Destroy and purge
// ---------------------------------------------------------------------------

#[test]
fn mark_destroyed_hides_row_and_is_idempotent() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    store.insert(NewSession::new("001", "/p", "/s/001")).unwrap();

    assert!(store.mark_destroyed(Path::new("/p"), &sid("001")).unwrap());
    assert!(!store.mark_destroyed(Path::new("/p"), &sid("001")).unwrap());

    assert!(store.find_session(Path::new("/p"), &sid("001")).unwrap().is_none());
    assert!(store.find_by_dir(Path::new("/s/001")).unwrap().is_none());
    assert!(store.list_all().unwrap().is_empty());
    assert!(store.list_by_project(Path::new("/p")).unwrap().is_empty());
}

#[test]
fn mark_destroyed_on_missing_row_is_false() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    assert!(!store.mark_destroyed(Path::new("/p"), &sid("404")).unwrap());
}

#[test]
fn remove_purges_active_and_destroyed_rows() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut store = open(&dir);
    store.insert(NewSession::new("001", "/p", "/s/001")).unwrap();
    store.mark_destroyed(Path::new("/p"), &sid("001")).unwrap();
    store.insert(NewSession::new("001", "/p", "/s/001")).unwrap();

    assert!(store.remove(Path::new("/p"), &sid("001")).unwrap());
    assert!(!store.remove(Path::new("/p"), &sid("001")).unwrap());
    assert_eq!(store.purge_destroyed().unwrap(), 0, "remove took the destroyed row too");
}

#[test]
fn rows_persist_across_reopen() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    {
        let mut store = open(&dir);
        store.insert(NewSession::new("001", "/p", "/s/001")).unwrap();
        store.close().expect("close");
    }
    let store = open(&dir);
    let row = store
        .find_session(Path::new("/p"), &sid("001"))
        .unwrap()
        .expect("persisted");
    assert_eq!(row.session_dir, Path::new("/s/001"));
}
