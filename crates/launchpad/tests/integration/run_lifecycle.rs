use std::path::Path;
use std::time::Duration;

use launchpad::bundle::GeneratedBundle;

use super::{SH_COMMANDS, orchestrator, server_bundle, sh_config};

/// A server bundle that records its termination in `marker`
fn marked_bundle(marker: &Path) -> GeneratedBundle {
    let mut bundle = server_bundle();
    bundle.env.insert(
        "STOP_MARKER".to_string(),
        marker.to_string_lossy().into_owned(),
    );
    bundle
}

fn stop_count(marker: &Path) -> usize {
    std::fs::read_to_string(marker)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_status_reflects_registry() {
    let scratch = tempfile::tempdir().unwrap();
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));
    source.insert("status", &server_bundle());

    let before = orch.status("status").await;
    assert!(!before.running);
    assert!(before.port.is_none());

    let report = orch.run("status").await;
    assert!(report.success, "run failed: {report:?}");

    let status = orch.status("status").await;
    assert!(status.running);
    assert_eq!(status.port, report.port);
    assert_eq!(status.health_check_url, report.health_check_url);
    assert_eq!(status.started_at, report.started_at);
    // Fresh probe; nothing answers HTTP on the script server
    assert!(!status.health.unwrap().success);

    assert!(orch.stop("status").await);
    assert!(!orch.status("status").await.running);
    assert!(!orch.stop("status").await);
}

#[tokio::test]
async fn test_stop_terminates_server_and_removes_workspace() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("stop.marker");
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));
    source.insert("stopme", &marked_bundle(&marker));

    assert!(orch.run("stopme").await.success);
    assert!(scratch.path().join("stopme").is_dir());

    assert!(orch.stop("stopme").await);
    assert_eq!(stop_count(&marker), 1);
    assert!(!scratch.path().join("stopme").exists());
    assert!(orch.registry().is_empty().await);
}

#[tokio::test]
async fn test_rerun_evicts_previous_instance() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("evict.marker");
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));
    source.insert("evict", &marked_bundle(&marker));

    assert!(orch.run("evict").await.success);
    let first = orch.registry().info("evict").await.unwrap();

    assert!(orch.run("evict").await.success);
    let second = orch.registry().info("evict").await.unwrap();

    assert!(second.generation > first.generation);
    assert_ne!(second.pid, first.pid);
    assert_eq!(stop_count(&marker), 1);
    assert_eq!(orch.registry().len().await, 1);

    orch.shutdown().await;
    assert_eq!(stop_count(&marker), 2);
}

#[tokio::test]
async fn test_reaper_fires_after_retention() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("reap.marker");
    let mut config = sh_config(scratch.path(), SH_COMMANDS);
    config.timeouts.retention = 1;
    let (orch, source) = orchestrator(config);
    source.insert("reap", &marked_bundle(&marker));

    assert!(orch.run("reap").await.success);
    let workspace = scratch.path().join("reap");

    tokio::time::timeout(Duration::from_secs(15), async {
        while orch.registry().contains("reap").await || workspace.exists() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("reaper did not clean up");
    assert_eq!(stop_count(&marker), 1);
    assert!(!orch.status("reap").await.running);
}

#[tokio::test]
async fn test_stale_reaper_spares_newer_run() {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = sh_config(scratch.path(), SH_COMMANDS);
    config.timeouts.retention = 2;
    let (orch, source) = orchestrator(config);
    source.insert("rerun", &server_bundle());

    assert!(orch.run("rerun").await.success);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(orch.run("rerun").await.success);
    let newer = orch.registry().info("rerun").await.unwrap();

    // Past the first run's retention window, short of the second's
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let still = orch.registry().info("rerun").await;
    assert_eq!(still.map(|i| i.generation), Some(newer.generation));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_runs_of_different_projects() {
    let scratch = tempfile::tempdir().unwrap();
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));
    source.insert("one", &server_bundle());
    source.insert("two", &server_bundle());

    let (a, b) = tokio::join!(orch.run("one"), orch.run("two"));
    assert!(a.success && b.success, "runs failed: {a:?} {b:?}");
    assert_eq!(orch.registry().project_ids().await, vec!["one", "two"]);

    orch.shutdown().await;
    assert!(orch.registry().is_empty().await);
    assert!(!scratch.path().join("one").exists());
    assert!(!scratch.path().join("two").exists());
}

#[tokio::test]
async fn test_concurrent_runs_of_same_project_serialize() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("same.marker");
    let (orch, source) = orchestrator(sh_config(scratch.path(), SH_COMMANDS));
    source.insert("same", &marked_bundle(&marker));

    let (a, b) = tokio::join!(orch.run("same"), orch.run("same"));
    assert!(a.success && b.success, "runs failed: {a:?} {b:?}");

    // One run evicted the other; exactly one instance survives
    assert_eq!(orch.registry().len().await, 1);
    assert_eq!(stop_count(&marker), 1);
    assert!(scratch.path().join("same/server.sh").is_file());

    orch.shutdown().await;
}
