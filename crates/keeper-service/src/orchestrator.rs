//! Update orchestrator: reacts to coalesced change events according to
//! policy.
//!
//! Every watched path gets its own unbounded queue and consumer task, so
//! reactions for one file are strictly sequential while different files
//! proceed independently, and a slow backup or diff never delays the
//! monitor. The cycle for an added/changed file is: auto-backup,
//! auto-validate (with an optional late backup on validation failure),
//! exactly one change-log append, every enabled rebuild hook in
//! registration order, then an optional diff against the most recent
//! earlier backup. Disabled steps are skipped, not faked.
//!
//! Internal failures land in a bounded recent-error ring and are logged;
//! nothing here terminates the hosting process.

use crate::hooks::{CommandHook, HookRegistry};
use crate::monitor::{ChangeMonitor, WatchIssue};
use crate::status::{PipelineStatus, RecentError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keeper_core::backup::{BackupFilter, BackupOutcome, BackupSort, BackupStore};
use keeper_core::changelog::{ChangeLog, ChangeLogEntry, ChangeLogMetadata};
use keeper_core::config::KeeperConfig;
use keeper_core::diff::report;
use keeper_core::diff::{DiffEngine, DiffResult};
use keeper_core::event::{ChangeEvent, ChangeKind};
use keeper_core::validate::{ValidationPipeline, ValidationResult, ValidationSummary};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct UpdateOrchestrator {
    inner: Arc<Inner>,
    monitor: ChangeMonitor,
    router: tokio::task::JoinHandle<()>,
    error_pump: tokio::task::JoinHandle<()>,
}

struct Inner {
    config: KeeperConfig,
    store: BackupStore,
    validator: ValidationPipeline,
    diff: DiffEngine,
    changelog: ChangeLog,
    hooks: HookRegistry,
    state: Mutex<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    change_count: u64,
    last_change: Option<DateTime<Utc>>,
    recent_errors: VecDeque<RecentError>,
    last_validation: Option<ValidationSummary>,
    lanes: HashMap<PathBuf, mpsc::UnboundedSender<ChangeEvent>>,
    consumers: Vec<tokio::task::JoinHandle<()>>,
}

impl UpdateOrchestrator {
    /// Must be created inside a Tokio runtime.
    pub fn new(config: KeeperConfig) -> Result<Self> {
        config.validate()?;
        let store = BackupStore::open(config.backup.clone())?;
        let validator = ValidationPipeline::new(config.validation.clone(), config.csv.clone());
        let diff = DiffEngine::new(config.diff.clone(), config.csv.clone());
        let changelog = ChangeLog::new(&config.orchestrator.log_dir)?;

        let hooks = HookRegistry::new();
        for command in &config.orchestrator.rebuild_commands {
            hooks.register(
                &command.name,
                "configured rebuild command",
                Arc::new(CommandHook::new(
                    command.program.clone(),
                    command.args.clone(),
                )),
            )?;
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<WatchIssue>();
        let monitor = ChangeMonitor::new(
            &config.monitor,
            config.backup.checksum_algorithm,
            event_tx,
            error_tx,
        )?;

        let inner = Arc::new(Inner {
            config,
            store,
            validator,
            diff,
            changelog,
            hooks,
            state: Mutex::new(RuntimeState::default()),
        });

        // Router: distribute coalesced events to per-path lanes. Sends are
        // unbounded, so one busy path never delays another, or the monitor.
        let router = {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    let lane = { inner.state.lock().lanes.get(&event.path).cloned() };
                    match lane {
                        Some(tx) => {
                            let _ = tx.send(event);
                        }
                        None => {
                            debug!(path = %event.path.display(), "event for unrouted path dropped");
                        }
                    }
                }
            })
        };

        let error_pump = {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(issue) = error_rx.recv().await {
                    let message = match issue.path {
                        Some(path) => format!("{}: {}", path.display(), issue.message),
                        None => issue.message,
                    };
                    inner.record_error("watch", message);
                }
            })
        };

        Ok(Self {
            inner,
            monitor,
            router,
            error_pump,
        })
    }

    // ── Watch lifecycle ─────────────────────────────────────────────────

    pub fn watch(&self, path: &Path) -> Result<()> {
        let canonical = self.monitor.watch(path)?;
        let mut state = self.inner.state.lock();
        if state.lanes.contains_key(&canonical) {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        state.lanes.insert(canonical, tx);
        let inner = self.inner.clone();
        state.consumers.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.process_event(event).await;
            }
        }));
        Ok(())
    }

    /// Stop watching. Pending debounce work is cancelled; an in-flight
    /// cycle for the path finishes.
    pub fn unwatch(&self, path: &Path) {
        let canonical = self
            .monitor
            .normalize(path)
            .unwrap_or_else(|_| path.to_path_buf());
        self.monitor.unwatch(path);
        self.inner.state.lock().lanes.remove(&canonical);
    }

    pub async fn shutdown(self) {
        self.monitor.unwatch_all();
        self.monitor.shutdown();
        let consumers = {
            let mut state = self.inner.state.lock();
            state.lanes.clear();
            std::mem::take(&mut state.consumers)
        };
        for handle in consumers {
            let _ = handle.await;
        }
        self.router.abort();
        self.error_pump.abort();
        info!("orchestrator stopped");
    }

    // ── Caller-facing operations ────────────────────────────────────────

    pub fn status(&self) -> PipelineStatus {
        let state = self.inner.state.lock();
        PipelineStatus {
            active_watches: self.monitor.watched_paths(),
            change_count: state.change_count,
            last_change: state.last_change,
            hooks: self.inner.hooks.names(),
            validators: self.inner.validator.validator_names(),
            recent_errors: state.recent_errors.iter().cloned().collect(),
            backups: if self.inner.config.orchestrator.auto_backup {
                Some(self.inner.store.summary())
            } else {
                None
            },
            last_validation: state.last_validation.clone(),
        }
    }

    pub fn validate_file(&self, path: &Path) -> Result<ValidationResult> {
        self.inner.validator.validate_file(path)
    }

    /// Compare a file on disk against one of its stored backups.
    pub fn compare_with_backup(&self, backup_id: &str, path: &Path) -> Result<DiffResult> {
        self.inner.diff_file_against_record(backup_id, path)
    }

    pub fn store(&self) -> &BackupStore {
        &self.inner.store
    }

    pub fn validator(&self) -> &ValidationPipeline {
        &self.inner.validator
    }

    pub fn diff_engine(&self) -> &DiffEngine {
        &self.inner.diff
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn changelog(&self) -> &ChangeLog {
        &self.inner.changelog
    }
}

impl Inner {
    async fn process_event(&self, event: ChangeEvent) {
        info!(
            kind = event.kind.as_str(),
            path = %event.path.display(),
            "processing change"
        );
        {
            let mut state = self.state.lock();
            state.change_count += 1;
            state.last_change = Some(event.timestamp);
        }

        let settings = &self.config.orchestrator;
        if !matches!(event.kind, ChangeKind::Added | ChangeKind::Changed) {
            // Deleted/renamed files have no content to back up or validate.
            let entry = match self.changelog.append(&event, None) {
                Ok(entry) => entry,
                Err(e) => {
                    self.record_error("changelog", format!("{e:#}"));
                    return;
                }
            };
            self.run_hooks(&event, &entry).await;
            return;
        }

        let mut metadata = ChangeLogMetadata::default();
        let mut backup_id: Option<String> = None;

        if settings.auto_backup {
            match self
                .store
                .create_backup(&event.path, Some("auto"), &["auto".to_string()])
            {
                BackupOutcome::Created(record) => backup_id = Some(record.id),
                BackupOutcome::Failed { error, .. } => self.record_error("backup", error),
            }
        }

        if settings.auto_validate {
            match self.validator.validate_file(&event.path) {
                Ok(result) => {
                    let summary = ValidationSummary::from(&result);
                    metadata.row_count = Some(result.row_count);
                    metadata.column_count = Some(result.headers.len());
                    if !result.is_valid
                        && settings.backup_on_validation_failure
                        && backup_id.is_none()
                    {
                        match self.store.create_backup(
                            &event.path,
                            Some("validation-failure"),
                            &["validation-failure".to_string()],
                        ) {
                            BackupOutcome::Created(record) => backup_id = Some(record.id),
                            BackupOutcome::Failed { error, .. } => {
                                self.record_error("backup", error)
                            }
                        }
                    }
                    self.state.lock().last_validation = Some(summary.clone());
                    metadata.validation = Some(summary);
                }
                Err(e) => self.record_error("validate", format!("{e:#}")),
            }
        }

        metadata.backup_id = backup_id.clone();
        let entry = match self.changelog.append(&event, Some(metadata)) {
            Ok(entry) => entry,
            Err(e) => {
                self.record_error("changelog", format!("{e:#}"));
                return;
            }
        };

        self.run_hooks(&event, &entry).await;

        if settings.diff_against_backups {
            if let Some(current_id) = backup_id {
                if let Err(e) = self.diff_against_previous(&event.path, &current_id) {
                    self.record_error("diff", format!("{e:#}"));
                }
            }
        }
    }

    async fn run_hooks(&self, event: &ChangeEvent, entry: &ChangeLogEntry) {
        for registration in self.hooks.snapshot() {
            if !registration.enabled {
                continue;
            }
            match registration.hook().handle(event, entry).await {
                Ok(()) => debug!(hook = %registration.name, "hook completed"),
                Err(e) => self.record_error(
                    &format!("hook:{}", registration.name),
                    format!("{e:#}"),
                ),
            }
        }
    }

    /// Diff the current file contents against the most recent backup other
    /// than the one just taken, rendering reports per configuration.
    fn diff_against_previous(&self, path: &Path, current_id: &str) -> Result<()> {
        let filter = BackupFilter {
            original_path: Some(path.display().to_string()),
            sort: BackupSort::Version,
            ..BackupFilter::default()
        };
        let previous = self
            .store
            .list_backups(&filter)
            .into_iter()
            .find(|r| r.id != current_id);
        let Some(previous) = previous else {
            debug!(path = %path.display(), "no earlier backup to diff against");
            return Ok(());
        };

        let result = self.diff_file_against_record(&previous.id, path)?;
        match &self.config.reports.output_dir {
            Some(dir) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "table".to_string());
                for format in &self.config.reports.formats {
                    let out =
                        dir.join(format!("{stem}_v{}_diff.{}", previous.version, format.extension()));
                    report::write_report(&result, *format, &out)?;
                    info!(report = %out.display(), "diff report written");
                }
            }
            None => {
                info!(
                    added = result.statistics.rows_added,
                    removed = result.statistics.rows_removed,
                    modified = result.statistics.rows_modified,
                    moved = result.statistics.rows_moved,
                    "diff against previous backup"
                );
            }
        }
        Ok(())
    }

    fn diff_file_against_record(&self, backup_id: &str, path: &Path) -> Result<DiffResult> {
        let record = self
            .store
            .find(backup_id)
            .with_context(|| format!("backup not found: {backup_id}"))?;
        let payload = self.store.read_payload(&record.id)?;

        // The diff engine works on files; materialize the payload briefly.
        let staging = tempfile::tempdir().context("create diff staging directory")?;
        let file_name = Path::new(&record.original_path)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot.csv".into());
        let snapshot = staging.path().join(file_name);
        std::fs::write(&snapshot, payload)
            .with_context(|| format!("write snapshot {}", snapshot.display()))?;

        let mut result = self.diff.compare_files(&snapshot, path)?;
        // Point the report at the backup, not the staging file.
        result.source_files.old =
            PathBuf::from(format!("{}#v{}", record.original_path, record.version));
        Ok(result)
    }

    fn record_error(&self, context: &str, message: String) {
        warn!(context = context, message = %message, "pipeline error");
        let cap = self.config.orchestrator.max_recent_errors;
        if cap == 0 {
            return;
        }
        let mut state = self.state.lock();
        while state.recent_errors.len() >= cap {
            state.recent_errors.pop_front();
        }
        state.recent_errors.push_back(RecentError {
            at: Utc::now(),
            context: context.to_string(),
            message,
        });
    }
}
