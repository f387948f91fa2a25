use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::backup::{BackupOptions, BackupOutcome, BackupPhase, BackupStatus};
use crate::chunk_cache::ChunkCache;
use crate::chunker::ChunkingConfig;
use crate::config::{Settings, validate_owner_id};
use crate::handle::{FileHandle, SnapshotName, TopLevelFolder};
use crate::keys::{KeyProvider, KeyPurpose};
use crate::prune::{PruneOptions, PruneOutcome};
use crate::retention::RetentionPolicy;
use crate::scanner::Scanner;
use crate::snapshot::{SnapshotNaming, list_snapshot_handles, load_snapshot};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub owner_id: String,
    pub chunking: ChunkingConfig,
    pub retention: RetentionPolicy,
    pub naming: SnapshotNaming,
}

impl EngineConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            chunking: ChunkingConfig::default(),
            retention: RetentionPolicy::default(),
            naming: SnapshotNaming::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            owner_id: settings.owner_id.clone(),
            chunking: settings.chunking.clone(),
            retention: settings.retention,
            naming: settings.snapshots.naming,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_owner_id(&self.owner_id)?;
        self.chunking.validate()?;
        self.retention.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub path: String,
    #[serde(skip)]
    pub handle: FileHandle,
    pub time: i64,
    pub size: u64,
    pub files: u64,
}

/// One backup set: a backend folder, its local chunk cache and the stream key.
///
/// At most one backup (or prune) and one restore run at a time; a second request fails with
/// [`Error::AlreadyRunning`].
pub struct Engine {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) cache: ChunkCache,
    pub(crate) stream_key: [u8; 32],
    pub(crate) folder: TopLevelFolder,
    pub(crate) config: EngineConfig,
    backup_running: AtomicBool,
    restore_running: AtomicBool,
    phase: AtomicU8,
}

pub(crate) struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Engine {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: ChunkCache,
        keys: &dyn KeyProvider,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            cache,
            stream_key: keys.derive_sub_key(KeyPurpose::Stream)?,
            folder: TopLevelFolder::new(config.owner_id.clone()),
            config,
            backup_running: AtomicBool::new(false),
            restore_running: AtomicBool::new(false),
            phase: AtomicU8::new(BackupPhase::Idle as u8),
        })
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    pub fn folder(&self) -> &TopLevelFolder {
        &self.folder
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backup_phase(&self) -> BackupPhase {
        BackupPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: BackupPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn is_backup_running(&self) -> bool {
        self.backup_running.load(Ordering::Acquire)
    }

    pub(crate) fn start_backup(&self, operation: &'static str) -> Result<RunGuard<'_>> {
        try_start(&self.backup_running, operation)
    }

    pub(crate) fn start_restore(&self) -> Result<RunGuard<'_>> {
        try_start(&self.restore_running, "restore")
    }

    /// The owner's snapshots, newest first.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        let handles = list_snapshot_handles(self.backend.as_ref(), &self.folder).await?;
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let snapshot = load_snapshot(self.backend.as_ref(), &self.stream_key, &handle).await?;
            out.push(SnapshotSummary {
                path: handle.relative_path(),
                handle,
                time: snapshot.time,
                size: snapshot.size,
                files: snapshot.files.len() as u64,
            });
        }
        out.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.path.cmp(&a.path)));
        Ok(out)
    }

    /// Newest time-named snapshot, if any. Used to keep snapshot names strictly increasing.
    pub(crate) async fn latest_snapshot_time(&self) -> Result<Option<i64>> {
        let handles = list_snapshot_handles(self.backend.as_ref(), &self.folder).await?;
        Ok(handles
            .iter()
            .filter_map(|h| match h {
                FileHandle::Snapshot {
                    name: SnapshotName::Time(t),
                    ..
                } => Some(*t),
                _ => None,
            })
            .max())
    }

    /// Backs up, then prunes only when every file made it into the snapshot.
    ///
    /// One backup guard covers both phases, so no other backup or prune starts in between.
    pub async fn backup_and_prune(
        &self,
        scanner: &dyn Scanner,
        backup: BackupOptions<'_>,
        prune: PruneOptions<'_>,
    ) -> Result<(BackupOutcome, Option<PruneOutcome>)> {
        let _guard = self.start_backup("backup")?;
        let outcome = self.backup_guarded(scanner, backup).await?;
        if outcome.status != BackupStatus::Succeeded {
            warn!(
                event = "prune.skipped",
                run_id = %outcome.run_id,
                status = outcome.status.as_str(),
                "prune.skipped"
            );
            return Ok((outcome, None));
        }
        let pruned = self.prune_guarded(prune).await?;
        info!(
            event = "prune.after_backup",
            snapshots_deleted = pruned.snapshots_deleted,
            "prune.after_backup"
        );
        Ok((outcome, Some(pruned)))
    }
}

fn try_start<'a>(flag: &'a AtomicBool, operation: &'static str) -> Result<RunGuard<'a>> {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| Error::AlreadyRunning { operation })?;
    Ok(RunGuard { flag })
}

pub(crate) fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4())
}

pub(crate) fn check_cancel(cancel: Option<&CancellationToken>) -> Result<()> {
    if let Some(cancel) = cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Per-item errors are recorded; cache and cancellation errors end the run.
pub(crate) fn is_fatal(e: &Error) -> bool {
    matches!(
        e,
        Error::Sqlite(_) | Error::SqliteMigrate(_) | Error::Cancelled | Error::CacheRepopulate { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_guard_is_rejected_until_first_drops() {
        let flag = AtomicBool::new(false);
        let g = try_start(&flag, "backup").unwrap();
        assert!(matches!(
            try_start(&flag, "backup"),
            Err(Error::AlreadyRunning { operation: "backup" })
        ));
        drop(g);
        assert!(try_start(&flag, "backup").is_ok());
    }

    #[test]
    fn engine_config_validation() {
        assert!(EngineConfig::new("phone").validate().is_ok());
        assert!(EngineConfig::new("a/b").validate().is_err());
    }
}
