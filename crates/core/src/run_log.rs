//! One NDJSON file per backup, restore or prune run.
//!
//! A single global subscriber formats every `tracing` event as JSON. Events land in the file of
//! the run that is currently open and are dropped between runs.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "CHUNKVAULT_LOG";
pub const LOG_DIR_ENV: &str = "CHUNKVAULT_LOG_DIR";
const DEFAULT_DIRECTIVES: &str = "debug";

static SINK: OnceLock<RunLogSink> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Backup,
    Restore,
    Prune,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Backup => "backup",
            RunKind::Restore => "restore",
            RunKind::Prune => "prune",
        }
    }
}

#[derive(Debug)]
struct OpenRun {
    kind: RunKind,
    out: BufWriter<File>,
}

#[derive(Debug, Default)]
struct RunLogSink {
    open: Mutex<Option<OpenRun>>,
}

impl RunLogSink {
    fn slot(&self) -> MutexGuard<'_, Option<OpenRun>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, kind: RunKind, path: &Path) -> std::io::Result<()> {
        let mut slot = self.slot();
        if let Some(run) = slot.as_ref() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("a {} run log is already open", run.kind.as_str()),
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *slot = Some(OpenRun {
            kind,
            out: BufWriter::new(file),
        });
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut run) = self.slot().take() else {
            return Ok(());
        };
        run.out.flush()?;
        run.out.get_ref().sync_all()
    }
}

/// Writes into the open run's file; discards bytes when no run is open.
struct RunLogLine<'a>(MutexGuard<'a, Option<OpenRun>>);

impl Write for RunLogLine<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.as_mut() {
            Some(run) => run.out.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.as_mut() {
            Some(run) => run.out.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static RunLogSink {
    type Writer = RunLogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogLine(self.slot())
    }
}

fn filter_directives<'a>(app_log: Option<&'a str>, rust_log: Option<&'a str>) -> EnvFilter {
    app_log
        .or(rust_log)
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the global subscriber once. Later calls are no-ops.
pub fn init_run_logging() {
    SUBSCRIBER.get_or_init(|| {
        let sink: &'static RunLogSink = SINK.get_or_init(RunLogSink::default);
        let filter = filter_directives(
            std::env::var(LOG_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(sink);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .try_init();
    });
}

/// The open run log. Dropping it closes the file as well, ignoring errors.
pub struct RunLogGuard {
    path: PathBuf,
    closed: bool,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and fsyncs the file, returning its path.
    pub fn finish(mut self) -> std::io::Result<PathBuf> {
        self.closed = true;
        close_sink()?;
        Ok(std::mem::take(&mut self.path))
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if !self.closed {
            let _ = close_sink();
        }
    }
}

fn close_sink() -> std::io::Result<()> {
    match SINK.get() {
        Some(sink) => sink.close(),
        None => Ok(()),
    }
}

/// Opens `run-<kind>-<utc>-<run_id>.ndjson` in `$CHUNKVAULT_LOG_DIR`, or `<data_dir>/logs`.
///
/// Only one run log is open at a time.
pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_run_logging();

    let dir = match std::env::var(LOG_DIR_ENV) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => data_dir.join("logs"),
    };
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(run_log_file_name(kind, run_id, Utc::now()));

    SINK.get_or_init(RunLogSink::default).open(kind, &path)?;
    Ok(RunLogGuard {
        path,
        closed: false,
    })
}

fn run_log_file_name(kind: RunKind, run_id: &str, at: chrono::DateTime<Utc>) -> String {
    let run_id: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "run-{}-{}-{run_id}.ndjson",
        kind.as_str(),
        at.format("%Y%m%dT%H%M%SZ")
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn app_filter_wins_over_rust_log() {
        assert_eq!(filter_directives(Some("info"), Some("debug")).to_string(), "info");
        assert_eq!(filter_directives(None, Some("warn")).to_string(), "warn");
        assert_eq!(filter_directives(None, None).to_string(), "debug");
    }

    #[test]
    fn file_name_carries_kind_time_and_clean_run_id() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            run_log_file_name(RunKind::Restore, "run_a/b c", at),
            "run-restore-20240309T070501Z-run_a_b_c.ndjson"
        );
    }

    #[test]
    fn run_events_are_written_as_ndjson() {
        let temp = tempfile::tempdir().expect("create tempdir");
        let guard = start_run_log(RunKind::Prune, "run_test", temp.path()).expect("start_run_log");
        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));

        let second = start_run_log(RunKind::Backup, "run_other", temp.path());
        assert_eq!(
            second.err().map(|e| e.kind()),
            Some(std::io::ErrorKind::AlreadyExists)
        );

        tracing::info!(event = "run.start", kind = "prune", run_id = "run_test", "run.start");
        tracing::info!(
            event = "run.finish",
            kind = "prune",
            run_id = "run_test",
            status = "succeeded",
            "run.finish"
        );
        let path = guard.finish().expect("finish run log");

        let text = std::fs::read_to_string(&path).expect("read run log");
        let mut events = Vec::new();
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            assert!(v.get("timestamp").is_some());
            assert!(v.get("level").is_some());
            if let Some(event) = v.pointer("/fields/event").and_then(|e| e.as_str()) {
                events.push(event.to_string());
            }
        }
        assert!(events.iter().any(|e| e == "run.start"));
        assert!(events.iter().any(|e| e == "run.finish"));

        // closed: a new run may open its own file
        let next = start_run_log(RunKind::Backup, "run_next", temp.path()).expect("reopen");
        drop(next);
    }
}
