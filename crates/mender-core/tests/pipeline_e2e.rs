//! A log line goes in; a verified patch comes out.
#![cfg(unix)]

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use mender_core::config::MenderConfig;
use mender_core::domain::FixStatus;
use mender_core::pipeline::Pipeline;
use tokio_util::sync::CancellationToken;

const MAIN_GO: &str = "package main

import \"os\"

func load(p string) error {
\tf, err := os.Open(p)
\tif err != nil {
\t\treturn err
\t}
\t_ = f
\treturn nil
}
";

fn config(root: &Path, auto_deploy: bool) -> MenderConfig {
    let src = root.join("src");
    let mut config = MenderConfig::default();
    config.collector.log_paths = vec![format!("{}/logs/*.log", root.display())];
    config.collector.polling_interval = Duration::from_millis(50);
    config.analyzer.source_root = src.clone();
    config.deployment.auto_deploy = auto_deploy;
    config.deployment.worktree_root = src;
    config.deployment.test_command = Some("test -f main.go".to_string());
    config.deployment.verify_command = Some("grep -q 'defer f.Close()' main.go".to_string());
    config.knowledge.storage_path = root.join("store");
    config
}

fn setup() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("logs")).unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/main.go"), MAIN_GO).unwrap();
    dir
}

fn log_failure(root: &Path) {
    let line = serde_json::json!({
        "time": "2024-03-21T10:00:00Z",
        "level": "error",
        "msg": "open data.csv: too many open files",
        "file": "main.go",
        "line": 6,
    });
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join("logs/app.log"))
        .unwrap();
    writeln!(f, "{line}").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_line_to_verified_fix() {
    let dir = setup();
    let mut pipeline = Pipeline::new(config(dir.path(), true)).unwrap();
    let mut remediations = pipeline.take_remediations().unwrap();
    pipeline.start(CancellationToken::new()).unwrap();

    log_failure(dir.path());

    let remediation = tokio::time::timeout(Duration::from_secs(20), remediations.recv())
        .await
        .expect("no remediation within deadline")
        .unwrap();
    assert_eq!(remediation.fix.status, FixStatus::Verified, "{:?}", remediation.fix.failure_reason);
    assert_eq!(remediation.fix.strategy, "resource_cleanup");
    assert!(remediation.event.fixed);
    assert_eq!(remediation.event.fix_id, Some(remediation.fix.id));

    let patched = std::fs::read_to_string(dir.path().join("src/main.go")).unwrap();
    assert!(patched.contains("\tf, err := os.Open(p)\n\tdefer f.Close()\n"));

    for _ in 0..200 {
        if !pipeline.knowledge().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(pipeline.knowledge().patterns()[0].strategy, "resource_cleanup");

    let report = pipeline.stop(Duration::from_secs(10)).await.unwrap();
    assert!(report.is_clean(), "abandoned: {:?}", report.abandoned);
    assert!(!pipeline.is_halted());

    let metrics = pipeline.metrics();
    assert_eq!(metrics.events_detected, 1);
    assert_eq!(metrics.fixes_verified, 1);
    assert_eq!(metrics.total_queue_drops(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suggestion_mode_leaves_tree_untouched() {
    let dir = setup();
    let mut pipeline = Pipeline::new(config(dir.path(), false)).unwrap();
    let mut suggestions = pipeline.take_suggestions().unwrap();
    pipeline.start(CancellationToken::new()).unwrap();

    log_failure(dir.path());

    let candidate = tokio::time::timeout(Duration::from_secs(20), suggestions.recv())
        .await
        .expect("no suggestion within deadline")
        .unwrap();
    assert_eq!(candidate.fix.status, FixStatus::Pending);
    assert_eq!(candidate.fix.strategy, "resource_cleanup");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/main.go")).unwrap(),
        MAIN_GO
    );

    pipeline.stop(Duration::from_secs(10)).await.unwrap();
    assert_eq!(pipeline.metrics().fixes_suggested, 1);
}
