//! End-to-end orchestrator tests: real filesystem events through the
//! monitor, backups, validation, the change log, and rebuild hooks.

use anyhow::Result;
use async_trait::async_trait;
use keeper_core::backup::BackupFilter;
use keeper_core::changelog::ChangeLogEntry;
use keeper_core::config::KeeperConfig;
use keeper_core::diff::report::ReportFormat;
use keeper_core::event::{ChangeEvent, ChangeKind};
use keeper_service::hooks::RebuildHook;
use keeper_service::orchestrator::UpdateOrchestrator;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config(root: &Path) -> KeeperConfig {
    let mut config = KeeperConfig::default();
    config.monitor.debounce_ms = 100;
    config.backup.dir = root.join("backups");
    config.orchestrator.log_dir = root.join("logs");
    config
}

struct RecordingHook {
    calls: Arc<Mutex<Vec<(ChangeKind, u64)>>>,
}

#[async_trait]
impl RebuildHook for RecordingHook {
    async fn handle(&self, event: &ChangeEvent, entry: &ChangeLogEntry) -> Result<()> {
        self.calls.lock().push((event.kind, entry.id));
        Ok(())
    }
}

struct FailingHook;

#[async_trait]
impl RebuildHook for FailingHook {
    async fn handle(&self, _event: &ChangeEvent, _entry: &ChangeLogEntry) -> Result<()> {
        anyhow::bail!("rebuild exploded")
    }
}

async fn wait_for_entries(orchestrator: &UpdateOrchestrator, count: usize) -> Vec<ChangeLogEntry> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let entries = orchestrator.changelog().read_recent(None, None).unwrap();
        if entries.len() >= count {
            return entries;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {count} change log entries, got {}",
            entries.len()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn change_cycle_backs_up_validates_logs_and_runs_hooks() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let file = data_dir.join("stores.csv");
    fs::write(&file, "name,phone\nBook Haven,555-0101\n").unwrap();

    let orchestrator = UpdateOrchestrator::new(test_config(dir.path())).unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .hooks()
        .register("recorder", "records invocations", Arc::new(RecordingHook { calls: calls.clone() }))
        .unwrap();
    orchestrator.watch(&file).unwrap();
    settle().await;

    fs::write(&file, "name,phone\nBook Haven,555-0199\n").unwrap();

    let entries = wait_for_entries(&orchestrator, 1).await;
    let entry = &entries[0];
    assert_eq!(entry.event.kind, ChangeKind::Changed);

    let metadata = entry.metadata.as_ref().expect("cycle metadata");
    let backup_id = metadata.backup_id.as_ref().expect("auto-backup id");
    assert!(orchestrator.store().verify_backup(backup_id));
    let validation = metadata.validation.as_ref().expect("validation summary");
    assert!(validation.is_valid);
    assert_eq!(metadata.row_count, Some(1));
    assert_eq!(metadata.column_count, Some(2));

    // The hook observed exactly this entry.
    assert_eq!(calls.lock().as_slice(), &[(ChangeKind::Changed, entry.id)]);

    let status = orchestrator.status();
    assert_eq!(status.change_count, 1);
    assert_eq!(status.active_watches.len(), 1);
    assert!(status.hooks.contains(&"recorder".to_string()));
    assert!(status.recent_errors.is_empty());

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hook_failure_is_isolated_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let file = data_dir.join("stores.csv");
    fs::write(&file, "name\nBook Haven\n").unwrap();

    let orchestrator = UpdateOrchestrator::new(test_config(dir.path())).unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    orchestrator
        .hooks()
        .register("faulty", "always fails", Arc::new(FailingHook))
        .unwrap();
    orchestrator
        .hooks()
        .register("recorder", "records invocations", Arc::new(RecordingHook { calls: calls.clone() }))
        .unwrap();
    orchestrator.watch(&file).unwrap();
    settle().await;

    fs::write(&file, "name\nThe Reading Room\n").unwrap();
    let entries = wait_for_entries(&orchestrator, 1).await;
    assert_eq!(entries.len(), 1);

    // The failing hook did not stop the later hook.
    assert_eq!(calls.lock().len(), 1);
    let status = orchestrator.status();
    assert!(status
        .recent_errors
        .iter()
        .any(|e| e.context == "hook:faulty" && e.message.contains("rebuild exploded")));

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn awaiting_creation_then_create_is_logged_as_added() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let file = data_dir.join("new.csv");

    let orchestrator = UpdateOrchestrator::new(test_config(dir.path())).unwrap();
    orchestrator.watch(&file).unwrap();
    settle().await;

    fs::write(&file, "name\nBook Haven\n").unwrap();
    let entries = wait_for_entries(&orchestrator, 1).await;
    assert_eq!(entries[0].event.kind, ChangeKind::Added);
    assert!(entries[0]
        .metadata
        .as_ref()
        .and_then(|m| m.backup_id.as_ref())
        .is_some());

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_logs_without_backup() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let file = data_dir.join("stores.csv");
    fs::write(&file, "name\nBook Haven\n").unwrap();

    let orchestrator = UpdateOrchestrator::new(test_config(dir.path())).unwrap();
    orchestrator.watch(&file).unwrap();
    settle().await;

    fs::remove_file(&file).unwrap();
    let entries = wait_for_entries(&orchestrator, 1).await;
    assert_eq!(entries[0].event.kind, ChangeKind::Deleted);
    assert!(entries[0].metadata.is_none());

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn diff_reports_are_written_after_second_change() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let file = data_dir.join("stores.csv");
    fs::write(&file, "name,phone\nBook Haven,555-0101\n").unwrap();

    let reports_dir = dir.path().join("reports");
    let mut config = test_config(dir.path());
    config.orchestrator.diff_against_backups = true;
    config.reports.output_dir = Some(reports_dir.clone());
    config.reports.formats = vec![ReportFormat::Markdown];
    config.diff.key_columns = vec!["name".to_string()];

    let orchestrator = UpdateOrchestrator::new(config).unwrap();
    orchestrator.watch(&file).unwrap();
    settle().await;

    fs::write(&file, "name,phone\nBook Haven,555-0150\n").unwrap();
    wait_for_entries(&orchestrator, 1).await;

    fs::write(&file, "name,phone\nBook Haven,555-0199\n").unwrap();
    wait_for_entries(&orchestrator, 2).await;

    let deadline = Instant::now() + Duration::from_secs(10);
    let report = loop {
        let found = fs::read_dir(&reports_dir)
            .ok()
            .and_then(|entries| entries.flatten().next().map(|e| e.path()));
        if let Some(path) = found {
            break path;
        }
        assert!(Instant::now() < deadline, "timed out waiting for diff report");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    let text = fs::read_to_string(report).unwrap();
    assert!(text.contains("555-0150"));
    assert!(text.contains("555-0199"));

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unwatch_stops_new_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let file = data_dir.join("stores.csv");
    fs::write(&file, "name\nBook Haven\n").unwrap();

    let orchestrator = UpdateOrchestrator::new(test_config(dir.path())).unwrap();
    orchestrator.watch(&file).unwrap();
    settle().await;
    orchestrator.unwatch(&file);

    fs::write(&file, "name\nChanged\n").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let entries = orchestrator.changelog().read_recent(None, None).unwrap();
    assert!(entries.is_empty(), "unexpected entries: {entries:?}");

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn on_demand_surface_works_without_watching() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let file = data_dir.join("stores.csv");
    fs::write(&file, "name,latitude\nBook Haven,95.0\n").unwrap();

    let orchestrator = UpdateOrchestrator::new(test_config(dir.path())).unwrap();

    let result = orchestrator.validate_file(&file).unwrap();
    assert!(!result.is_valid);

    let outcome = orchestrator.store().create_backup(&file, Some("manual"), &[]);
    let record = outcome.record().expect("manual backup").clone();

    fs::write(&file, "name,latitude\nBook Haven,41.0\n").unwrap();
    let diff = orchestrator.compare_with_backup(&record.id, &file).unwrap();
    assert_eq!(diff.statistics.rows_modified, 1);

    let filter = BackupFilter::default();
    assert_eq!(orchestrator.store().list_backups(&filter).len(), 1);

    orchestrator.shutdown().await;
}
