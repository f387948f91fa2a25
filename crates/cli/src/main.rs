use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkvault_core::config::{config_path, load_settings, save_settings, to_toml};
use chunkvault_core::key_text::{decode_key_text, generate_key_text};
use chunkvault_core::run_log::{RunKind, start_run_log};
use chunkvault_core::{
    APP_NAME, BackupOptions, BackupOutcome, BackupStatus, ChunkCache, DirFileWriter, DirScanner,
    Engine, EngineConfig, LocalDirBackend, ProgressSink, PruneOptions, PruneOutcome,
    RestoreOptions, RestoreOutcome, RestoreStatus, RunProgress, Settings,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const KEY_FILE_NAME: &str = "master.key";
const CACHE_FILE_NAME: &str = "cache.sqlite";

#[derive(Parser)]
#[command(name = "chunkvault")]
#[command(about = "Encrypted, deduplicated backups to a local directory", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Print task progress as NDJSON lines on stdout.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Master key file (defaults to `<config_dir>/master.key`).
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Directory that holds the backup blobs.
    #[arg(long)]
    remote: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Key {
        #[command(subcommand)]
        cmd: KeyCmd,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Snapshots {
        #[command(subcommand)]
        cmd: SnapshotsCmd,
    },
    Stats {
        #[command(subcommand)]
        cmd: StatsCmd,
    },
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
    Restore {
        #[command(subcommand)]
        cmd: RestoreCmd,
    },
    /// Deletes snapshots outside the retention policy and the chunks only they used.
    Prune,
}

#[derive(Subcommand)]
enum KeyCmd {
    /// Writes a fresh master key to the key file. Refuses to overwrite.
    Init,
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    /// Writes the default settings file if none exists.
    Init,
}

#[derive(Subcommand)]
enum SnapshotsCmd {
    List {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum StatsCmd {
    Get,
}

#[derive(Subcommand)]
enum BackupCmd {
    Run {
        #[arg(long)]
        source: PathBuf,
        /// Prune after a fully successful backup.
        #[arg(long)]
        prune: bool,
    },
}

#[derive(Subcommand)]
enum RestoreCmd {
    Run {
        /// Snapshot path, time or hash; the newest snapshot when omitted.
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long)]
        target: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

impl From<chunkvault_core::Error> for CliError {
    fn from(e: chunkvault_core::Error) -> Self {
        use chunkvault_core::Error;
        match e {
            Error::InvalidConfig { message } => CliError::new("config.invalid", message),
            Error::Backend { message } => CliError::retryable("backend.unavailable", message),
            Error::NotFound { path } => {
                CliError::new("not_found", format!("not found: {path}"))
            }
            Error::Authentication { message } => CliError::new("crypto.authentication", message),
            Error::Mismatch { message } => CliError::new("crypto.mismatch", message),
            Error::Integrity { message } => CliError::new("integrity", message),
            Error::CacheRepopulate { message } => {
                CliError::retryable("cache.repopulate_failed", message)
            }
            Error::AlreadyRunning { operation } => CliError::retryable(
                "task.already_running",
                format!("{operation} already running"),
            ),
            Error::PruneBlocked { last_backup } => CliError::new(
                "prune.blocked",
                format!("last backup did not succeed: {last_backup}"),
            ),
            Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
            Error::Internal { message } => CliError::new("internal", message),
            other => CliError::new("unknown", other.to_string()),
        }
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn report(&self, p: &RunProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "phase": p.phase.as_str(),
            "filesTotal": p.files.total,
            "filesDone": p.files.done,
            "filesFailed": p.files_failed,
            "chunksTotal": p.chunks.total,
            "chunksDone": p.chunks.done,
            "bytesRead": p.bytes_read,
            "bytesMoved": p.bytes_moved,
            "bytesDeduped": p.bytes_deduped,
            "snapshotsDeleted": p.snapshots_deleted,
        });
        println!("{line}");
    }
}

struct Dirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
    key_file: PathBuf,
    remote: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| env_path("CHUNKVAULT_CONFIG_DIR"))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| env_path("CHUNKVAULT_DATA_DIR"))
        .unwrap_or_else(default_data_dir);
    let dirs = Dirs {
        key_file: cli
            .key_file
            .unwrap_or_else(|| config_dir.join(KEY_FILE_NAME)),
        remote: cli.remote.or_else(|| env_path("CHUNKVAULT_REMOTE")),
        config_dir,
        data_dir,
    };

    match cli.cmd {
        Command::Key { cmd } => match cmd {
            KeyCmd::Init => key_init(&dirs.key_file, cli.json),
        },
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&dirs.config_dir, cli.json),
            SettingsCmd::Init => settings_init(&dirs.config_dir, cli.json),
        },
        Command::Snapshots { cmd } => match cmd {
            SnapshotsCmd::List { limit } => snapshots_list(&dirs, limit, cli.json).await,
        },
        Command::Stats { cmd } => match cmd {
            StatsCmd::Get => stats_get(&dirs, cli.json).await,
        },
        Command::Backup { cmd } => match cmd {
            BackupCmd::Run { source, prune } => {
                backup_run(&dirs, source, prune, cli.json, cli.events).await
            }
        },
        Command::Restore { cmd } => match cmd {
            RestoreCmd::Run { snapshot, target } => {
                restore_run(&dirs, snapshot, target, cli.json, cli.events).await
            }
        },
        Command::Prune => prune_run(&dirs, cli.json, cli.events).await,
    }
}

fn key_init(key_file: &Path, json: bool) -> Result<(), CliError> {
    if let Some(parent) = key_file.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::new("key.write_failed", e.to_string()))?;
    }
    let mut file = create_private(key_file).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            CliError::new("key.write_failed", "master key already exists")
        } else {
            CliError::new("key.write_failed", e.to_string())
        }
    })?;
    let text = generate_key_text();
    writeln!(file, "{text}")
        .and_then(|()| file.sync_all())
        .map_err(|e| CliError::new("key.write_failed", e.to_string()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "keyFile": key_file.display().to_string() })
        );
    } else {
        println!("keyFile={}", key_file.display());
    }
    Ok(())
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        print!("{}", to_toml(&settings)?);
    }
    Ok(())
}

fn settings_init(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = config_path(config_dir);
    let created = !path.exists();
    if created {
        save_settings(config_dir, &Settings::default())?;
    }
    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "created": created })
        );
    } else {
        println!("path={}", path.display());
        println!("created={created}");
    }
    Ok(())
}

async fn snapshots_list(dirs: &Dirs, limit: u32, json: bool) -> Result<(), CliError> {
    let engine = open_engine(dirs).await?;
    let snapshots: Vec<_> = engine
        .list_snapshots()
        .await?
        .into_iter()
        .take(limit as usize)
        .collect();

    if json {
        println!("{}", serde_json::json!({ "snapshots": snapshots }));
    } else {
        for s in &snapshots {
            println!("{}\ttime={}\tfiles={}\tsize={}", s.path, s.time, s.files, s.size);
        }
    }
    Ok(())
}

async fn stats_get(dirs: &Dirs, json: bool) -> Result<(), CliError> {
    let engine = open_engine(dirs).await?;
    let snapshots_total = engine.list_snapshots().await?.len() as u64;
    let chunks = engine.cache().all_chunks().await?;
    let chunks_total = chunks.len() as u64;
    let chunks_bytes_total: u64 = chunks.iter().map(|c| c.size).sum();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "snapshotsTotal": snapshots_total,
                "chunksTotal": chunks_total,
                "chunksBytesTotal": chunks_bytes_total,
            })
        );
    } else {
        println!("snapshotsTotal={snapshots_total}");
        println!("chunksTotal={chunks_total}");
        println!("chunksBytesTotal={chunks_bytes_total}");
    }
    Ok(())
}

async fn backup_run(
    dirs: &Dirs,
    source: PathBuf,
    prune: bool,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let engine = open_engine(dirs).await?;
    let run_id = new_run_id();
    let _log = open_run_log(RunKind::Backup, &run_id, &dirs.data_dir)?;
    let cancel = cancel_on_ctrl_c();

    emit_task_state(events, &run_id, "backup", "running");
    let sink = NdjsonProgressSink {
        task_id: run_id.clone(),
    };
    let scanner = DirScanner::new(source);
    let backup = BackupOptions {
        run_id: Some(run_id.clone()),
        cancel: Some(&cancel),
        progress: if events { Some(&sink) } else { None },
    };

    let result = if prune {
        let prune = PruneOptions {
            run_id: Some(run_id.clone()),
            cancel: Some(&cancel),
            progress: if events { Some(&sink) } else { None },
        };
        engine.backup_and_prune(&scanner, backup, prune).await
    } else {
        engine.backup(&scanner, backup).await.map(|b| (b, None))
    };
    let (outcome, pruned) = finish_task(events, &run_id, "backup", result)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "backup": outcome, "prune": pruned })
        );
    } else {
        print_backup(&outcome);
        if let Some(p) = &pruned {
            print_prune(p);
        }
    }

    if outcome.status == BackupStatus::Failed {
        return Err(CliError::retryable(
            "backup.failed",
            format!("no file could be backed up ({} failed)", outcome.failures.len()),
        ));
    }
    Ok(())
}

async fn restore_run(
    dirs: &Dirs,
    snapshot: Option<String>,
    target: PathBuf,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let engine = open_engine(dirs).await?;
    let run_id = new_run_id();
    let _log = open_run_log(RunKind::Restore, &run_id, &dirs.data_dir)?;
    let cancel = cancel_on_ctrl_c();

    let handle = match snapshot {
        Some(name) => engine.find_snapshot(&name).await?,
        None => engine
            .list_snapshots()
            .await?
            .into_iter()
            .next()
            .map(|s| s.handle)
            .ok_or_else(|| CliError::new("not_found", "no snapshots"))?,
    };

    emit_task_state(events, &run_id, "restore", "running");
    let sink = NdjsonProgressSink {
        task_id: run_id.clone(),
    };
    let writer = DirFileWriter::new(target);
    let result = engine
        .restore(
            &handle,
            &writer,
            RestoreOptions {
                run_id: Some(run_id.clone()),
                cancel: Some(&cancel),
                progress: if events { Some(&sink) } else { None },
            },
        )
        .await;
    let outcome = finish_task(events, &run_id, "restore", result)?;

    if json {
        println!(
            "{}",
            serde_json::to_string(&outcome)
                .map_err(|e| CliError::new("unknown", format!("json encode failed: {e}")))?
        );
    } else {
        print_restore(&outcome);
    }

    if outcome.status == RestoreStatus::Failed {
        return Err(CliError::new(
            "restore.failed",
            format!("no file could be restored ({} failed)", outcome.failures.len()),
        ));
    }
    Ok(())
}

async fn prune_run(dirs: &Dirs, json: bool, events: bool) -> Result<(), CliError> {
    let engine = open_engine(dirs).await?;
    let run_id = new_run_id();
    let _log = open_run_log(RunKind::Prune, &run_id, &dirs.data_dir)?;
    let cancel = cancel_on_ctrl_c();

    emit_task_state(events, &run_id, "prune", "running");
    let sink = NdjsonProgressSink {
        task_id: run_id.clone(),
    };
    let result = engine
        .prune(PruneOptions {
            run_id: Some(run_id.clone()),
            cancel: Some(&cancel),
            progress: if events { Some(&sink) } else { None },
        })
        .await;
    let outcome = finish_task(events, &run_id, "prune", result)?;

    if json {
        println!(
            "{}",
            serde_json::to_string(&outcome)
                .map_err(|e| CliError::new("unknown", format!("json encode failed: {e}")))?
        );
    } else {
        print_prune(&outcome);
    }
    Ok(())
}

async fn open_engine(dirs: &Dirs) -> Result<Engine, CliError> {
    let remote = dirs.remote.as_ref().ok_or_else(|| {
        CliError::new("config.invalid", "--remote (or CHUNKVAULT_REMOTE) is required")
    })?;
    let settings = load_settings(&dirs.config_dir)?;

    let key_text = std::fs::read_to_string(&dirs.key_file).map_err(|e| {
        CliError::new(
            "key.missing",
            format!(
                "master key read failed: {}: {e} (run `chunkvault key init`)",
                dirs.key_file.display()
            ),
        )
    })?;
    let key = decode_key_text(&key_text)?;

    std::fs::create_dir_all(&dirs.data_dir)
        .map_err(|e| CliError::new("config.invalid", format!("data dir create failed: {e}")))?;
    let cache = ChunkCache::open(&dirs.data_dir.join(CACHE_FILE_NAME)).await?;

    Ok(Engine::new(
        Arc::new(LocalDirBackend::new(remote.clone())),
        cache,
        &key,
        EngineConfig::from_settings(&settings),
    )?)
}

fn open_run_log(
    kind: RunKind,
    run_id: &str,
    data_dir: &Path,
) -> Result<chunkvault_core::run_log::RunLogGuard, CliError> {
    start_run_log(kind, run_id, data_dir)
        .map_err(|e| CliError::new("log.open_failed", format!("run log open failed: {e}")))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(event = "task.cancel_requested", "task.cancel_requested");
            token.cancel();
        }
    });
    cancel
}

fn finish_task<T>(
    events: bool,
    run_id: &str,
    kind: &str,
    result: chunkvault_core::Result<T>,
) -> Result<T, CliError> {
    match result {
        Ok(v) => {
            emit_task_state(events, run_id, kind, "finished");
            Ok(v)
        }
        Err(e) => {
            let e = CliError::from(e);
            emit_task_state(events, run_id, kind, e.code);
            Err(e)
        }
    }
}

fn emit_task_state(events: bool, run_id: &str, kind: &str, state: &str) {
    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": run_id,
                "kind": kind,
                "state": state,
            })
        );
    }
}

fn print_backup(o: &BackupOutcome) {
    let c = &o.counters;
    println!("runId={}", o.run_id);
    println!("status={}", o.status.as_str());
    println!("snapshot={}", o.snapshot_path.as_deref().unwrap_or("-"));
    println!(
        "files: total={} unchanged={} backedUp={} failed={}",
        c.files_total, c.files_unchanged, c.files_backed_up, c.files_failed
    );
    println!(
        "chunks: total={} uploaded={} deduped={}",
        c.chunks_total, c.chunks_uploaded, c.chunks_deduped
    );
    println!(
        "bytes: read={} uploaded={} deduped={}",
        c.bytes_read, c.bytes_uploaded, c.bytes_deduped
    );
    for f in &o.failures {
        println!("failed: {}: {}", f.id, f.error);
    }
}

fn print_restore(o: &RestoreOutcome) {
    println!("runId={}", o.run_id);
    println!("status={}", o.status.as_str());
    println!("snapshot={}", o.snapshot_path);
    println!(
        "files: total={} restored={} failed={}",
        o.files_total, o.files_restored, o.files_failed
    );
    println!(
        "chunksDownloaded={} bytesDownloaded={} bytesWritten={}",
        o.chunks_downloaded, o.bytes_downloaded, o.bytes_written
    );
    for f in &o.failures {
        println!("failed: {}: {}", f.id, f.error);
    }
}

fn print_prune(o: &PruneOutcome) {
    println!(
        "prune: considered={} resumed={} deleted={} chunksDeleted={}",
        o.snapshots_considered, o.snapshots_resumed, o.snapshots_deleted, o.chunks_deleted
    );
    for f in &o.failures {
        println!("failed: {}: {}", f.path, f.error);
    }
}

fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME)
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
