//! Debounce-and-classify loop.
//!
//! Raw notifications land in a pending map; once a path has been quiet for
//! the full debounce window its net state change is classified against the
//! baseline and at most one [`ChangeEvent`] is emitted. Classification and
//! the subsequent baseline update happen inside this single task, so no
//! second event for a path can be classified while the previous baseline
//! update is still in flight.
//!
//! Classification order: no baseline and the file exists -> added; rename
//! hint and the file is gone -> renamed; baseline and the file is gone ->
//! deleted; digest (or size/mtime) delta -> changed; no net difference ->
//! suppressed.

use super::{read_baseline, FileBaseline, RawNotification, WatchIssue, WatchState};
use chrono::Utc;
use keeper_core::checksum::ChecksumAlgorithm;
use keeper_core::event::{ChangeEvent, ChangeKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub struct CoalescerSettings {
    pub debounce: Duration,
    pub digest_comparison: bool,
    pub algorithm: ChecksumAlgorithm,
}

struct PendingChange {
    last_notify: Instant,
    rename_to: Option<PathBuf>,
}

/// Spawn the coalescer task. Returns its join handle; the task ends when
/// the raw channel closes or shutdown is signalled.
pub fn spawn_coalescer(
    mut raw_rx: mpsc::UnboundedReceiver<RawNotification>,
    watched: Arc<Mutex<HashMap<PathBuf, WatchState>>>,
    settings: CoalescerSettings,
    event_tx: mpsc::UnboundedSender<ChangeEvent>,
    error_tx: mpsc::UnboundedSender<WatchIssue>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();
        loop {
            tokio::select! {
                maybe = raw_rx.recv() => {
                    match maybe {
                        Some(raw) => {
                            let entry = pending.entry(raw.path.clone()).or_insert(PendingChange {
                                last_notify: Instant::now(),
                                rename_to: None,
                            });
                            entry.last_notify = Instant::now();
                            if raw.rename_to.is_some() {
                                entry.rename_to = raw.rename_to;
                            }
                        }
                        None => {
                            debug!("raw channel closed, coalescer exiting");
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    // flush tick
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let now = Instant::now();
            let ready: Vec<PathBuf> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_notify) >= settings.debounce)
                .map(|(path, _)| path.clone())
                .collect();

            for path in ready {
                let Some(change) = pending.remove(&path) else { continue };
                // An unwatch while the change was pending cancels it.
                let state = { watched.lock().get(&path).cloned() };
                let Some(state) = state else {
                    trace!(path = %path.display(), "pending change for unwatched path dropped");
                    continue;
                };

                match classify(&path, state.baseline.as_ref(), &change, &settings) {
                    Ok(Some((event, new_baseline))) => {
                        {
                            let mut watched = watched.lock();
                            if let Some(state) = watched.get_mut(&path) {
                                state.baseline = new_baseline;
                            }
                        }
                        debug!(
                            kind = event.kind.as_str(),
                            path = %path.display(),
                            "change event"
                        );
                        if event_tx.send(event).is_err() {
                            debug!("event channel closed, coalescer exiting");
                            return;
                        }
                    }
                    Ok(None) => {
                        trace!(path = %path.display(), "no net change, event suppressed");
                    }
                    Err(e) => {
                        let _ = error_tx.send(WatchIssue {
                            path: Some(path.clone()),
                            message: format!("{e:#}"),
                        });
                    }
                }
            }
        }
    })
}

fn classify(
    path: &Path,
    baseline: Option<&FileBaseline>,
    pending: &PendingChange,
    settings: &CoalescerSettings,
) -> anyhow::Result<Option<(ChangeEvent, Option<FileBaseline>)>> {
    let exists = path.exists();
    match baseline {
        Some(prev) => {
            if !exists {
                let kind = if pending.rename_to.is_some() {
                    ChangeKind::Renamed
                } else {
                    ChangeKind::Deleted
                };
                return Ok(Some((
                    ChangeEvent {
                        kind,
                        path: path.to_path_buf(),
                        timestamp: Utc::now(),
                        previous_digest: prev.digest.clone(),
                        current_digest: None,
                        size: prev.size,
                        modified_at: prev.modified_at,
                    },
                    None,
                )));
            }
            let current = read_baseline(path, settings)?;
            let changed = if settings.digest_comparison {
                current.digest != prev.digest
            } else {
                current.size != prev.size || current.modified_at != prev.modified_at
            };
            if !changed {
                return Ok(None);
            }
            Ok(Some((
                ChangeEvent {
                    kind: ChangeKind::Changed,
                    path: path.to_path_buf(),
                    timestamp: Utc::now(),
                    previous_digest: prev.digest.clone(),
                    current_digest: current.digest.clone(),
                    size: current.size,
                    modified_at: current.modified_at,
                },
                Some(current),
            )))
        }
        None => {
            if !exists {
                return Ok(None);
            }
            let current = read_baseline(path, settings)?;
            Ok(Some((
                ChangeEvent {
                    kind: ChangeKind::Added,
                    path: path.to_path_buf(),
                    timestamp: Utc::now(),
                    previous_digest: None,
                    current_digest: current.digest.clone(),
                    size: current.size,
                    modified_at: current.modified_at,
                },
                Some(current),
            )))
        }
    }
}
