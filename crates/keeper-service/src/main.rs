use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use keeper_core::backup::{BackupFilter, BackupOutcome, BackupSort, RestoreOutcome};
use keeper_core::config::KeeperConfig;
use keeper_core::diff::report::{self, ReportFormat};
use keeper_service::orchestrator::UpdateOrchestrator;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::signal;
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "tablekeeper.toml";

#[derive(Parser, Debug)]
#[command(
    name = "keeper",
    version,
    about = "Change-management pipeline for delimited tabular data",
    long_about = None
)]
struct Cli {
    /// TOML config file (defaults to ./tablekeeper.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch files and react to changes until interrupted
    Watch {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Validate a file on demand
    Validate { file: PathBuf },
    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Compare a file against another file or a stored backup
    Diff {
        /// The newer side of the comparison
        file: PathBuf,
        /// Older file to compare against
        #[arg(long, conflicts_with = "backup")]
        old: Option<PathBuf>,
        /// Backup id to compare against
        #[arg(long)]
        backup: Option<String>,
        /// Report format: console, html, json, markdown
        #[arg(long, default_value = "console")]
        format: String,
        /// Write the rendered report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Change log queries and exports
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    /// Back up a file now
    Create {
        file: PathBuf,
        #[arg(long)]
        context: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List stored backups
    List {
        /// Only backups of this original file
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        limit: Option<usize>,
        /// Sort key: timestamp, size, version
        #[arg(long, default_value = "timestamp")]
        sort: String,
    },
    /// Verify a backup payload against its recorded checksum
    Verify { id: String },
    /// Restore a backup over its original path (or --target)
    Restore {
        id: String,
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Delete one backup
    Delete { id: String },
    /// Apply the retention policy to one original file now
    Prune { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum LogCommands {
    /// Show recent change-log entries
    Recent {
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Only entries for this file
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Export the change log
    Export {
        out: PathBuf,
        /// Export format: json or csv
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch { paths } => watch_command(config, paths).await,
        Commands::Validate { file } => validate_command(config, &file),
        Commands::Backup { command } => backup_command(config, command),
        Commands::Diff {
            file,
            old,
            backup,
            format,
            output,
        } => diff_command(config, &file, old.as_deref(), backup.as_deref(), &format, output.as_deref()),
        Commands::Log { command } => log_command(config, command),
    }
}

/// The working directory's config file wins; otherwise fall back to the
/// user-level config location.
fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    ProjectDirs::from("dev", "tablekeeper", "tablekeeper")
        .map(|dirs| dirs.config_dir().join(DEFAULT_CONFIG_FILE))
        .filter(|p| p.exists())
}

fn load_config(path: Option<&Path>) -> Result<KeeperConfig> {
    let mut figment = Figment::from(Serialized::defaults(KeeperConfig::default()));
    match path {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow!("config file not found: {}", path.display()));
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(path) = default_config_path() {
                figment = figment.merge(Toml::file(path));
            }
        }
    }
    let config: KeeperConfig = figment
        .merge(Env::prefixed("KEEPER_").split("__"))
        .extract()
        .context("load configuration")?;
    config.validate()?;
    Ok(config)
}

async fn watch_command(config: KeeperConfig, paths: Vec<PathBuf>) -> Result<()> {
    let orchestrator = UpdateOrchestrator::new(config)?;
    for path in &paths {
        orchestrator.watch(path)?;
    }
    info!(count = paths.len(), "watching; press ctrl-c to stop");
    signal::ctrl_c().await?;
    let status = orchestrator.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    orchestrator.shutdown().await;
    Ok(())
}

fn validate_command(config: KeeperConfig, file: &Path) -> Result<()> {
    let pipeline = keeper_core::validate::ValidationPipeline::new(
        config.validation.clone(),
        config.csv.clone(),
    );
    let result = pipeline.validate_file(file)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_valid {
        return Err(anyhow!(
            "validation failed with {} error(s)",
            result.errors.len()
        ));
    }
    Ok(())
}

fn backup_command(config: KeeperConfig, command: BackupCommands) -> Result<()> {
    let store = keeper_core::backup::BackupStore::open(config.backup.clone())?;
    match command {
        BackupCommands::Create {
            file,
            context,
            tags,
        } => match store.create_backup(&file, context.as_deref(), &tags) {
            BackupOutcome::Created(record) => {
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
            BackupOutcome::Failed { error, .. } => Err(anyhow!("backup failed: {error}")),
        },
        BackupCommands::List { path, limit, sort } => {
            let filter = BackupFilter {
                original_path: path.map(|p| p.display().to_string()),
                limit,
                sort: parse_sort(&sort)?,
                ..BackupFilter::default()
            };
            let records = store.list_backups(&filter);
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        BackupCommands::Verify { id } => {
            if store.verify_backup(&id) {
                println!("backup {id} verified");
                Ok(())
            } else {
                Err(anyhow!("backup {id} failed verification"))
            }
        }
        BackupCommands::Restore { id, target } => {
            match store.restore_from_backup(&id, target.as_deref()) {
                RestoreOutcome::Restored {
                    record,
                    safety_backup,
                } => {
                    println!("restored {} (v{})", record.id, record.version);
                    if let Some(safety) = safety_backup {
                        println!("safety backup: {}", safety.id);
                    }
                    Ok(())
                }
                RestoreOutcome::Failed {
                    error,
                    rollback_error,
                } => {
                    let mut message = format!("restore failed: {error}");
                    if let Some(rollback) = rollback_error {
                        message.push_str(&format!(" (rollback also failed: {rollback})"));
                    }
                    Err(anyhow!(message))
                }
            }
        }
        BackupCommands::Delete { id } => {
            let record = store.delete_backup(&id)?;
            println!("deleted {} (v{})", record.id, record.version);
            Ok(())
        }
        BackupCommands::Prune { file } => {
            let pruned = store.apply_retention(&file);
            println!("pruned {} backup(s)", pruned.len());
            Ok(())
        }
    }
}

fn diff_command(
    config: KeeperConfig,
    file: &Path,
    old: Option<&Path>,
    backup: Option<&str>,
    format: &str,
    output: Option<&Path>,
) -> Result<()> {
    let format = ReportFormat::from_str(format).map_err(|e| anyhow!(e))?;
    let engine = keeper_core::diff::DiffEngine::new(config.diff.clone(), config.csv.clone());

    let result = match (old, backup) {
        (Some(old), None) => engine.compare_files(old, file)?,
        (None, Some(backup_id)) => {
            let store = keeper_core::backup::BackupStore::open(config.backup.clone())?;
            let record = store
                .find(backup_id)
                .with_context(|| format!("backup not found: {backup_id}"))?;
            let payload = store.read_payload(&record.id)?;
            let staging = tempfile::tempdir()?;
            let snapshot = staging.path().join(
                Path::new(&record.original_path)
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("snapshot.csv")),
            );
            std::fs::write(&snapshot, payload)?;
            let mut result = engine.compare_files(&snapshot, file)?;
            result.source_files.old =
                PathBuf::from(format!("{}#v{}", record.original_path, record.version));
            result
        }
        _ => {
            return Err(anyhow!(
                "exactly one of --old <FILE> or --backup <ID> is required"
            ))
        }
    };

    match output {
        Some(path) => {
            report::write_report(&result, format, path)?;
            println!("report written to {}", path.display());
        }
        None => print!("{}", report::render(&result, format)),
    }
    Ok(())
}

fn log_command(config: KeeperConfig, command: LogCommands) -> Result<()> {
    let log = keeper_core::changelog::ChangeLog::new(&config.orchestrator.log_dir)?;
    match command {
        LogCommands::Recent { limit, path } => {
            let entries = match path {
                Some(path) => {
                    let path = path.canonicalize().unwrap_or(path);
                    log.entries_for_path(&path, Some(limit))?
                }
                None => log.read_recent(Some(limit), None)?,
            };
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
        LogCommands::Export { out, format } => {
            let count = match format.to_ascii_lowercase().as_str() {
                "json" => log.export_json(&out)?,
                "csv" | "delimited" => log.export_delimited(&out)?,
                other => return Err(anyhow!("unknown export format: {other}")),
            };
            println!("exported {count} entries to {}", out.display());
            Ok(())
        }
    }
}

fn parse_sort(s: &str) -> Result<BackupSort> {
    match s.to_ascii_lowercase().as_str() {
        "timestamp" | "time" => Ok(BackupSort::Timestamp),
        "size" => Ok(BackupSort::Size),
        "version" => Ok(BackupSort::Version),
        other => Err(anyhow!("unknown sort key: {other}")),
    }
}
