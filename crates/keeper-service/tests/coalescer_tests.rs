//! Coalescer behavior, driven deterministically by injecting raw
//! notifications instead of relying on backend timing.

use keeper_core::checksum::{self, ChecksumAlgorithm};
use keeper_core::event::{ChangeEvent, ChangeKind};
use keeper_service::monitor::{
    spawn_coalescer, CoalescerSettings, FileBaseline, RawNotification, WatchIssue, WatchState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Harness {
    raw_tx: mpsc::UnboundedSender<RawNotification>,
    event_rx: mpsc::UnboundedReceiver<ChangeEvent>,
    _error_tx_keepalive: mpsc::UnboundedSender<WatchIssue>,
    error_rx: mpsc::UnboundedReceiver<WatchIssue>,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

fn settings() -> CoalescerSettings {
    CoalescerSettings {
        debounce: Duration::from_millis(300),
        digest_comparison: true,
        algorithm: ChecksumAlgorithm::Blake3,
    }
}

fn start(watched: Arc<Mutex<HashMap<PathBuf, WatchState>>>) -> Harness {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = spawn_coalescer(
        raw_rx,
        watched,
        settings(),
        event_tx,
        error_tx.clone(),
        shutdown_rx,
    );
    Harness {
        raw_tx,
        event_rx,
        _error_tx_keepalive: error_tx,
        error_rx,
        shutdown_tx,
        handle,
    }
}

fn baseline_of(content: &[u8]) -> FileBaseline {
    FileBaseline {
        size: content.len() as u64,
        modified_at: None,
        digest: Some(checksum::digest_bytes(ChecksumAlgorithm::Blake3, content)),
    }
}

fn watched_map(path: &Path, baseline: Option<FileBaseline>) -> Arc<Mutex<HashMap<PathBuf, WatchState>>> {
    let dir = path.parent().unwrap().to_path_buf();
    let map = Arc::new(Mutex::new(HashMap::new()));
    map.lock().insert(
        path.to_path_buf(),
        WatchState { baseline, dir },
    );
    map
}

async fn expect_event(harness: &mut Harness) -> ChangeEvent {
    tokio::time::timeout(Duration::from_secs(5), harness.event_rx.recv())
        .await
        .expect("timed out waiting for change event")
        .expect("event channel closed")
}

async fn expect_no_event(harness: &mut Harness) {
    let outcome =
        tokio::time::timeout(Duration::from_millis(800), harness.event_rx.recv()).await;
    assert!(outcome.is_err(), "unexpected event: {:?}", outcome);
}

async fn stop(harness: Harness) {
    let _ = harness.shutdown_tx.send(true);
    let _ = harness.handle.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn three_rapid_notifications_coalesce_into_one_changed_event() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stores.csv");
    let initial = b"name,phone\nBook Haven,555-0101\n";
    fs::write(&file, initial).unwrap();

    let watched = watched_map(&file, Some(baseline_of(initial)));
    let mut harness = start(watched);

    // The file reaches its final state, then three raw notifications land
    // within 200 ms of each other.
    let final_content = b"name,phone\nBook Haven,555-0199\n";
    fs::write(&file, final_content).unwrap();
    for _ in 0..3 {
        harness
            .raw_tx
            .send(RawNotification {
                path: file.clone(),
                rename_to: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let event = expect_event(&mut harness).await;
    assert_eq!(event.kind, ChangeKind::Changed);
    assert_eq!(
        event.current_digest.as_deref(),
        Some(checksum::digest_bytes(ChecksumAlgorithm::Blake3, final_content).as_str()),
        "event must reflect only the final state"
    );
    assert_eq!(
        event.previous_digest.as_deref(),
        Some(checksum::digest_bytes(ChecksumAlgorithm::Blake3, initial).as_str())
    );

    expect_no_event(&mut harness).await;
    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn touch_without_write_is_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stores.csv");
    let content = b"name,phone\nBook Haven,555-0101\n";
    fs::write(&file, content).unwrap();

    let watched = watched_map(&file, Some(baseline_of(content)));
    let mut harness = start(watched);

    harness
        .raw_tx
        .send(RawNotification {
            path: file.clone(),
            rename_to: None,
        })
        .unwrap();

    expect_no_event(&mut harness).await;
    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn creation_after_awaiting_is_added() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("later.csv");

    let watched = watched_map(&file, None);
    let mut harness = start(watched.clone());

    fs::write(&file, b"name\nBook Haven\n").unwrap();
    harness
        .raw_tx
        .send(RawNotification {
            path: file.clone(),
            rename_to: None,
        })
        .unwrap();

    let event = expect_event(&mut harness).await;
    assert_eq!(event.kind, ChangeKind::Added);
    assert!(event.previous_digest.is_none());
    assert!(event.current_digest.is_some());

    // The baseline was established, so a repeat notification with no
    // further writes stays quiet.
    harness
        .raw_tx
        .send(RawNotification {
            path: file.clone(),
            rename_to: None,
        })
        .unwrap();
    expect_no_event(&mut harness).await;
    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removal_of_known_file_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stores.csv");
    let content = b"name\nBook Haven\n";
    fs::write(&file, content).unwrap();

    let watched = watched_map(&file, Some(baseline_of(content)));
    let mut harness = start(watched);

    fs::remove_file(&file).unwrap();
    harness
        .raw_tx
        .send(RawNotification {
            path: file.clone(),
            rename_to: None,
        })
        .unwrap();

    let event = expect_event(&mut harness).await;
    assert_eq!(event.kind, ChangeKind::Deleted);
    assert_eq!(event.size, content.len() as u64);
    assert!(event.previous_digest.is_some());
    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_away_is_classified_as_renamed() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stores.csv");
    let moved = dir.path().join("archive.csv");
    let content = b"name\nBook Haven\n";
    fs::write(&file, content).unwrap();

    let watched = watched_map(&file, Some(baseline_of(content)));
    let mut harness = start(watched);

    fs::rename(&file, &moved).unwrap();
    harness
        .raw_tx
        .send(RawNotification {
            path: file.clone(),
            rename_to: Some(moved.clone()),
        })
        .unwrap();

    let event = expect_event(&mut harness).await;
    assert_eq!(event.kind, ChangeKind::Renamed);
    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_change_for_unwatched_path_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stores.csv");
    let content = b"name\nBook Haven\n";
    fs::write(&file, content).unwrap();

    let watched = watched_map(&file, Some(baseline_of(content)));
    let mut harness = start(watched.clone());

    fs::write(&file, b"name\nChanged\n").unwrap();
    harness
        .raw_tx
        .send(RawNotification {
            path: file.clone(),
            rename_to: None,
        })
        .unwrap();
    // Unwatch before the debounce window elapses.
    watched.lock().clear();

    expect_no_event(&mut harness).await;
    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_path_reports_a_watch_issue() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("stores.csv");
    let content = b"name\nBook Haven\n";
    fs::write(&file, content).unwrap();

    // Baseline present but the file is replaced by a directory, which makes
    // digesting fail and must surface on the error channel, not kill the
    // coalescer.
    let watched = watched_map(&file, Some(baseline_of(content)));
    let mut harness = start(watched);

    fs::remove_file(&file).unwrap();
    fs::create_dir(&file).unwrap();
    harness
        .raw_tx
        .send(RawNotification {
            path: file.clone(),
            rename_to: None,
        })
        .unwrap();

    let issue = tokio::time::timeout(Duration::from_secs(5), harness.error_rx.recv())
        .await
        .expect("timed out waiting for watch issue")
        .expect("error channel closed");
    assert_eq!(issue.path.as_deref(), Some(file.as_path()));
    stop(harness).await;
}
