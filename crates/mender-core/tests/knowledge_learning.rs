//! Knowledge persistence through the file store.

use std::sync::Arc;

use chrono::Utc;
use mender_core::config::KnowledgeConfig;
use mender_core::domain::{CodeChange, ErrorEvent, ErrorFixPattern, Fix, Severity};
use mender_core::knowledge::{KnowledgeBase, PATTERNS_COLLECTION};
use mender_core::metrics::PipelineMetrics;
use mender_store::FileStore;

fn finished(event: &ErrorEvent, strategy: &str, verified: bool) -> Fix {
    let mut fix = Fix::new(
        event,
        strategy,
        vec![CodeChange::add("main.go", 1, "// x")],
        0.8,
        "test fix",
    );
    let now = Utc::now();
    fix.begin(now).unwrap();
    if verified {
        fix.mark_applied(now).unwrap();
        fix.mark_verified(now).unwrap();
    } else {
        fix.mark_failed(now, "sandbox tests failed").unwrap();
    }
    fix
}

fn open(store: &Arc<FileStore>) -> KnowledgeBase {
    KnowledgeBase::open(
        &KnowledgeConfig::default(),
        Arc::clone(store),
        Arc::new(PipelineMetrics::new()),
    )
    .unwrap()
}

#[test]
fn patterns_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let event = ErrorEvent::new("nil pointer dereference", Severity::High, "app.log")
        .with_location("main.go", 12);

    let kb = open(&store);
    kb.observe(&finished(&event, "null_check", true)).unwrap();
    kb.observe(&finished(&event, "null_check", false)).unwrap();
    kb.observe(&finished(&event, "code_refactoring", true)).unwrap();
    assert_eq!(kb.len(), 2);
    assert_eq!(store.list(PATTERNS_COLLECTION).unwrap().len(), 2);

    let reopened = open(&store);
    assert_eq!(reopened.len(), 2);
    let learned = reopened
        .patterns()
        .into_iter()
        .find(|p| p.strategy == "null_check")
        .unwrap();
    assert_eq!(learned.usage_count, 2);
    assert!((learned.success_rate - 0.5).abs() < 1e-9);
    assert!(reopened.lookup(&event).is_some());
}

#[test]
fn duplicate_pair_records_are_collapsed_in_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let now = Utc::now();
    let quiet = ErrorFixPattern::first_observation("nil pointer|", "null_check", true, 0.6, now);
    let mut busy = ErrorFixPattern::first_observation("nil pointer|", "null_check", true, 0.6, now);
    busy.record_outcome(true, 0.6, now);
    busy.record_outcome(false, 0.6, now);
    for p in [&quiet, &busy] {
        store.save(PATTERNS_COLLECTION, &p.id.to_string(), p).unwrap();
    }

    let kb = open(&store);
    assert_eq!(kb.len(), 1);
    assert_eq!(kb.patterns()[0].usage_count, 3);
    assert_eq!(store.list(PATTERNS_COLLECTION).unwrap(), vec![busy.id.to_string()]);

    let reopened = open(&store);
    assert_eq!(reopened.len(), 1);
}

#[test]
fn unreadable_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let event = ErrorEvent::new("index out of range", Severity::High, "app.log");
    open(&store)
        .observe(&finished(&event, "condition_inversion", true))
        .unwrap();
    std::fs::write(dir.path().join(PATTERNS_COLLECTION).join("garbage.json"), "{not json").unwrap();

    let kb = open(&store);
    assert_eq!(kb.len(), 1);
}

#[test]
fn backup_and_restore_round_trip_through_knowledge() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let event = ErrorEvent::new("too many open files", Severity::High, "app.log");
    let kb = open(&store);
    kb.observe(&finished(&event, "resource_cleanup", true)).unwrap();

    let archive = store.backup(PATTERNS_COLLECTION).unwrap();
    for id in store.list(PATTERNS_COLLECTION).unwrap() {
        store.delete(PATTERNS_COLLECTION, &id).unwrap();
    }
    assert!(open(&store).is_empty());

    assert_eq!(store.restore(&archive, PATTERNS_COLLECTION).unwrap(), 1);
    let restored = open(&store);
    assert_eq!(restored.patterns()[0].strategy, "resource_cleanup");
}

#[test]
fn learning_disabled_observes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let kb = KnowledgeBase::open(
        &KnowledgeConfig {
            learning_enabled: false,
            ..KnowledgeConfig::default()
        },
        Arc::clone(&store),
        Arc::new(PipelineMetrics::new()),
    )
    .unwrap();
    let event = ErrorEvent::new("boom", Severity::High, "app.log");
    assert!(kb.observe(&finished(&event, "code_refactoring", true)).is_none());
    assert!(store.list(PATTERNS_COLLECTION).unwrap().is_empty());
}
