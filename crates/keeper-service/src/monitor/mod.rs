//! Change monitor built on the `notify` crate.
//!
//! Raw backend notifications are bridged from notify's callback thread into
//! an async channel, then coalesced per path over a debounce window before
//! classification. The monitor watches each target file's parent
//! directory (non-recursive, refcounted) so files that do not exist yet
//! ("awaiting creation") and deletions are both observable.
//!
//! Watcher-level I/O errors flow through a separate error channel and
//! never stop monitoring of other paths.

mod coalesce;

pub use coalesce::{spawn_coalescer, CoalescerSettings};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keeper_core::checksum::{self, ChecksumAlgorithm};
use keeper_core::config::MonitorConfig;
use keeper_core::event::ChangeEvent;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("path unreachable: {}: {message}", path.display())]
    Unreachable { path: PathBuf, message: String },
    #[error(transparent)]
    Backend(#[from] notify::Error),
}

/// Problem report from the watcher or classifier, consumed by the
/// orchestrator's recent-error ring.
#[derive(Debug, Clone)]
pub struct WatchIssue {
    pub path: Option<PathBuf>,
    pub message: String,
}

/// What the monitor knew about a file the last time it looked.
#[derive(Debug, Clone)]
pub struct FileBaseline {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub digest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatchState {
    /// `None` while the file is awaiting creation.
    pub baseline: Option<FileBaseline>,
    pub dir: PathBuf,
}

/// Raw, uncoalesced notification forwarded from the notify backend.
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub path: PathBuf,
    pub rename_to: Option<PathBuf>,
}

pub struct ChangeMonitor {
    watcher: Mutex<RecommendedWatcher>,
    watched: Arc<Mutex<HashMap<PathBuf, WatchState>>>,
    dir_refs: Mutex<HashMap<PathBuf, usize>>,
    settings: CoalescerSettings,
    shutdown_tx: watch::Sender<bool>,
    _coalescer: tokio::task::JoinHandle<()>,
}

impl ChangeMonitor {
    /// Must be created inside a Tokio runtime: the coalescer task is
    /// spawned immediately.
    pub fn new(
        config: &MonitorConfig,
        algorithm: ChecksumAlgorithm,
        event_tx: mpsc::UnboundedSender<ChangeEvent>,
        error_tx: mpsc::UnboundedSender<WatchIssue>,
    ) -> Result<Self> {
        let settings = CoalescerSettings {
            debounce: Duration::from_millis(config.debounce_ms),
            digest_comparison: config.digest_comparison,
            algorithm,
        };
        let watched: Arc<Mutex<HashMap<PathBuf, WatchState>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (sync_tx, sync_rx) = std_mpsc::channel::<Result<notify::Event, notify::Error>>();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            notify::Config::default(),
        )?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawNotification>();
        let bridge_errors = error_tx.clone();
        std::thread::Builder::new()
            .name("keeper-watch-bridge".into())
            .spawn(move || loop {
                match sync_rx.recv() {
                    Ok(Ok(event)) => {
                        for raw in split_event(&event) {
                            if raw_tx.send(raw).is_err() {
                                debug!("coalescer gone, stopping watch bridge");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "watch backend error");
                        let _ = bridge_errors.send(WatchIssue {
                            path: None,
                            message: e.to_string(),
                        });
                    }
                    Err(_) => {
                        debug!("watcher dropped, stopping watch bridge");
                        return;
                    }
                }
            })
            .context("spawn watch bridge thread")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coalescer = spawn_coalescer(
            raw_rx,
            watched.clone(),
            settings,
            event_tx,
            error_tx,
            shutdown_rx,
        );

        Ok(Self {
            watcher: Mutex::new(watcher),
            watched,
            dir_refs: Mutex::new(HashMap::new()),
            settings,
            shutdown_tx,
            _coalescer: coalescer,
        })
    }

    /// Resolve a watch target to its canonical form: canonicalized parent
    /// joined with the file name. The file itself may not exist yet.
    pub fn normalize(&self, path: &Path) -> Result<PathBuf, WatchError> {
        normalize(path)
    }

    /// Begin observing a path. Establishes a baseline when the file exists;
    /// a missing file is treated as awaiting creation, an unreachable
    /// parent is an error. Idempotent.
    pub fn watch(&self, path: &Path) -> Result<PathBuf, WatchError> {
        let canonical = normalize(path)?;
        let dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WatchError::Unreachable {
                path: canonical.clone(),
                message: "path has no parent directory".into(),
            })?;

        let baseline = if canonical.exists() {
            Some(
                read_baseline(&canonical, &self.settings).map_err(|e| {
                    WatchError::Unreachable {
                        path: canonical.clone(),
                        message: format!("{e:#}"),
                    }
                })?,
            )
        } else {
            None
        };

        {
            let mut watched = self.watched.lock();
            if watched.contains_key(&canonical) {
                return Ok(canonical);
            }
            watched.insert(
                canonical.clone(),
                WatchState {
                    baseline,
                    dir: dir.clone(),
                },
            );
        }

        let mut refs = self.dir_refs.lock();
        let count = refs.entry(dir.clone()).or_insert(0);
        if *count == 0 {
            self.watcher
                .lock()
                .watch(&dir, RecursiveMode::NonRecursive)?;
        }
        *count += 1;
        info!(path = %canonical.display(), "watching");
        Ok(canonical)
    }

    /// Stop observing a path. Pending debounce work for it is discarded at
    /// the next coalescer flush. Idempotent.
    pub fn unwatch(&self, path: &Path) {
        let canonical = normalize(path).unwrap_or_else(|_| path.to_path_buf());
        let removed = {
            let mut watched = self.watched.lock();
            watched
                .remove(&canonical)
                .or_else(|| watched.remove(path))
        };
        let Some(state) = removed else { return };
        let mut refs = self.dir_refs.lock();
        if let Some(count) = refs.get_mut(&state.dir) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                refs.remove(&state.dir);
                if let Err(e) = self.watcher.lock().unwatch(&state.dir) {
                    debug!(dir = %state.dir.display(), error = %e, "unwatch backend");
                }
            }
        }
        info!(path = %canonical.display(), "stopped watching");
    }

    pub fn unwatch_all(&self) {
        let paths: Vec<PathBuf> = self.watched.lock().keys().cloned().collect();
        for path in paths {
            self.unwatch(&path);
        }
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.watched.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Stop the coalescer. In-flight classification finishes; nothing new
    /// starts.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn normalize(path: &Path) -> Result<PathBuf, WatchError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| WatchError::Unreachable {
            path: path.to_path_buf(),
            message: "path has no file name".into(),
        })?
        .to_os_string();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = parent.canonicalize().map_err(|e| WatchError::Unreachable {
        path: path.to_path_buf(),
        message: format!("parent directory unreachable: {e}"),
    })?;
    Ok(parent.join(file_name))
}

/// Flatten a notify event into per-path raw notifications. Renames carry
/// their destination; the destination also gets its own notification in
/// case it is itself a watched path (the atomic-save pattern).
fn split_event(event: &notify::Event) -> Vec<RawNotification> {
    use notify::event::ModifyKind;
    use notify::EventKind;

    let mut out = Vec::new();
    match &event.kind {
        EventKind::Modify(ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            out.push(RawNotification {
                path: event.paths[0].clone(),
                rename_to: Some(event.paths[1].clone()),
            });
            out.push(RawNotification {
                path: event.paths[1].clone(),
                rename_to: None,
            });
        }
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            for path in &event.paths {
                out.push(RawNotification {
                    path: path.clone(),
                    rename_to: None,
                });
            }
        }
        _ => {}
    }
    out
}

pub(crate) fn read_baseline(
    path: &Path,
    settings: &CoalescerSettings,
) -> Result<FileBaseline> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?;
    let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
    let (digest, size) = if settings.digest_comparison {
        let (digest, size) = checksum::digest_file(settings.algorithm, path)?;
        (Some(digest), size)
    } else {
        (None, metadata.len())
    };
    Ok(FileBaseline {
        size,
        modified_at,
        digest,
    })
}
