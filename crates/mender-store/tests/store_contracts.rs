//! Contract tests for FileStore.
//!
//! These exercise the public surface the knowledge base relies on:
//! round-trips, idempotent saves, NotFound vs. I/O, listing and backups.

use std::collections::BTreeMap;
use std::fs;

use mender_store::{FileStore, StoreError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PatternLike {
    id: Uuid,
    signature: String,
    strategy: String,
    confidence: f64,
    usage_count: u64,
    metadata: BTreeMap<String, String>,
}

fn sample(strategy: &str) -> PatternLike {
    PatternLike {
        id: Uuid::new_v4(),
        signature: "nil pointer dereference|handler@main.go".to_string(),
        strategy: strategy.to_string(),
        confidence: 0.75,
        usage_count: 4,
        metadata: BTreeMap::from([("lang".to_string(), "go".to_string())]),
    }
}

fn make_store() -> (tempfile::TempDir, FileStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();
    (dir, store)
}

// ===========================================================================
// Round-trip / idempotence
// ===========================================================================

#[test]
fn save_then_load_returns_equal_record() {
    let (_dir, store) = make_store();
    let record = sample("null_check");
    let id = record.id.to_string();

    store.save("patterns", &id, &record).unwrap();
    let loaded: PatternLike = store.load("patterns", &id).unwrap();

    assert_eq!(loaded, record);
}

#[test]
fn save_is_idempotent_under_identical_inputs() {
    let (dir, store) = make_store();
    let record = sample("null_check");
    let id = record.id.to_string();

    store.save("patterns", &id, &record).unwrap();
    let first = fs::read(dir.path().join("patterns").join(format!("{id}.json"))).unwrap();
    store.save("patterns", &id, &record).unwrap();
    let second = fs::read(dir.path().join("patterns").join(format!("{id}.json"))).unwrap();

    assert_eq!(first, second);
    assert_eq!(store.list("patterns").unwrap(), vec![id]);
}

#[test]
fn save_overwrites_previous_value() {
    let (_dir, store) = make_store();
    let mut record = sample("null_check");
    let id = record.id.to_string();
    store.save("patterns", &id, &record).unwrap();

    record.usage_count = 9;
    store.save("patterns", &id, &record).unwrap();

    let loaded: PatternLike = store.load("patterns", &id).unwrap();
    assert_eq!(loaded.usage_count, 9);
}

// ===========================================================================
// NotFound / delete
// ===========================================================================

#[test]
fn delete_then_load_is_not_found() {
    let (_dir, store) = make_store();
    let record = sample("resource_cleanup");
    let id = record.id.to_string();
    store.save("patterns", &id, &record).unwrap();

    store.delete("patterns", &id).unwrap();

    let err = store.load::<PatternLike>("patterns", &id).unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert!(!store.contains("patterns", &id).unwrap());
}

#[cfg(unix)]
#[test]
fn unreadable_record_is_io_not_not_found() {
    let (dir, store) = make_store();
    let record = sample("resource_cleanup");
    let id = record.id.to_string();
    store.save("patterns", &id, &record).unwrap();

    // A directory where the record file should be makes `read` fail with
    // something other than NotFound.
    let path = dir.path().join("patterns").join(format!("{id}.json"));
    fs::remove_file(&path).unwrap();
    fs::create_dir(&path).unwrap();

    let err = store.load::<PatternLike>("patterns", &id).unwrap_err();
    assert!(matches!(err, StoreError::Io(_)), "got {err:?}");
}

// ===========================================================================
// Collections are isolated
// ===========================================================================

#[test]
fn collections_do_not_leak() {
    let (_dir, store) = make_store();
    store.save("patterns", "p1", &sample("a")).unwrap();
    store.save("fixes", "f1", &sample("b")).unwrap();

    assert_eq!(store.list("patterns").unwrap(), vec!["p1"]);
    assert_eq!(store.list("fixes").unwrap(), vec!["f1"]);
}

// ===========================================================================
// Backup / restore
// ===========================================================================

#[test]
fn backup_is_timestamped_under_backups_dir() {
    let (dir, store) = make_store();
    store.save("patterns", "p1", &sample("a")).unwrap();

    let archive = store.backup("patterns").unwrap();

    assert!(archive.starts_with(dir.path().join("backups")));
    let name = archive.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("patterns_"));
    assert!(name.ends_with(".tar.gz"));
    // patterns_YYYYMMDD_HHMMSS.tar.gz
    assert_eq!(name.len(), "patterns_".len() + 15 + ".tar.gz".len());
}

#[test]
fn restore_replaces_collection_contents() {
    let (_dir, store) = make_store();
    let keep = sample("null_check");
    store.save("patterns", "keep", &keep).unwrap();
    let archive = store.backup("patterns").unwrap();

    store.save("patterns", "added_later", &sample("x")).unwrap();
    store.delete("patterns", "keep").unwrap();

    let restored = store.restore(&archive, "patterns").unwrap();

    assert_eq!(restored, 1);
    assert_eq!(store.list("patterns").unwrap(), vec!["keep"]);
    let loaded: PatternLike = store.load("patterns", "keep").unwrap();
    assert_eq!(loaded, keep);
}

#[test]
fn restore_into_other_collection_is_rejected() {
    let (_dir, store) = make_store();
    store.save("patterns", "p1", &sample("a")).unwrap();
    store.save("fixes", "f1", &sample("b")).unwrap();
    let archive = store.backup("patterns").unwrap();

    let err = store.restore(&archive, "fixes").unwrap_err();

    assert!(matches!(err, StoreError::Archive(_)));
    assert_eq!(store.list("fixes").unwrap(), vec!["f1"]);
}

#[test]
fn backup_of_empty_collection_restores_to_empty() {
    let (_dir, store) = make_store();
    let archive = store.backup("patterns").unwrap();
    store.save("patterns", "p1", &sample("a")).unwrap();

    let restored = store.restore(&archive, "patterns").unwrap();

    assert_eq!(restored, 0);
    assert!(store.list("patterns").unwrap().is_empty());
}
