//! Progress reports, emitted at file and chunk boundaries.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Scan,
    Upload,
    Snapshot,
    Download,
    Prune,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Scan => "scan",
            RunPhase::Upload => "upload",
            RunPhase::Snapshot => "snapshot",
            RunPhase::Download => "download",
            RunPhase::Prune => "prune",
        }
    }
}

/// `done` out of `total`. A zero `total` means not known yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub done: u64,
    pub total: u64,
}

/// Cumulative counters of the running backup, restore or prune.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub phase: RunPhase,
    pub files: Tally,
    pub files_failed: u64,
    pub chunks: Tally,
    pub bytes_read: u64,
    /// Uploaded by a backup, downloaded by a restore.
    pub bytes_moved: u64,
    pub bytes_deduped: u64,
    pub snapshots_deleted: u64,
}

impl RunProgress {
    pub fn new(phase: RunPhase) -> Self {
        Self {
            phase,
            files: Tally::default(),
            files_failed: 0,
            chunks: Tally::default(),
            bytes_read: 0,
            bytes_moved: 0,
            bytes_deduped: 0,
            snapshots_deleted: 0,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &RunProgress);
}
