use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk_cache::RUN_KIND_BACKUP;
use crate::engine::{Engine, check_cancel, is_fatal, new_run_id};
use crate::handle::{FileHandle, SnapshotName};
use crate::progress::{ProgressSink, RunPhase, RunProgress};
use crate::repopulate::ensure_consistent;
use crate::retention::snapshots_to_delete;
use crate::snapshot::{Snapshot, list_snapshot_handles, load_snapshot};
use crate::{Error, Result};

#[derive(Default)]
pub struct PruneOptions<'a> {
    pub run_id: Option<String>,
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneOutcome {
    pub run_id: String,
    pub snapshots_considered: u64,
    /// Interrupted deletions from an earlier prune that were finished by this run.
    pub snapshots_resumed: u64,
    pub snapshots_deleted: u64,
    pub chunks_deleted: u64,
    pub failures: Vec<SnapshotFailure>,
}

impl Engine {
    /// Deletes snapshots that fall outside the retention policy and then every chunk no
    /// remaining snapshot references.
    ///
    /// Refuses to run unless the last backup succeeded. Decrements for a snapshot are
    /// journaled before its blob is removed, so an interrupted prune is finished by the next one.
    pub async fn prune(&self, options: PruneOptions<'_>) -> Result<PruneOutcome> {
        let _guard = self.start_backup("prune")?;
        self.prune_guarded(options).await
    }

    /// The prune itself; the caller holds the backup guard.
    pub(crate) async fn prune_guarded(&self, options: PruneOptions<'_>) -> Result<PruneOutcome> {
        let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
        info!(event = "run.start", kind = "prune", run_id = %run_id, "run.start");

        let result = self.run_prune(&options, &run_id).await;
        match &result {
            Ok(o) => info!(
                event = "run.finish",
                kind = "prune",
                run_id = %run_id,
                status = if o.failures.is_empty() { "succeeded" } else { "partial" },
                snapshots_considered = o.snapshots_considered,
                snapshots_deleted = o.snapshots_deleted,
                chunks_deleted = o.chunks_deleted,
                failures = o.failures.len() as u64,
                "run.finish"
            ),
            Err(e) => error!(
                event = "run.finish",
                kind = "prune",
                run_id = %run_id,
                status = "failed",
                error = %e,
                "run.finish"
            ),
        }
        result
    }

    async fn run_prune(&self, options: &PruneOptions<'_>, run_id: &str) -> Result<PruneOutcome> {
        let last_backup = self
            .cache
            .run_state(RUN_KIND_BACKUP)
            .await?
            .map(|s| s.status)
            .unwrap_or_else(|| "none".to_string());
        if last_backup != "succeeded" {
            warn!(event = "prune.blocked", last_backup = %last_backup, "prune.blocked");
            return Err(Error::PruneBlocked { last_backup });
        }

        let started = Instant::now();
        debug!(event = "phase.start", phase = "prune", "phase.start");
        let mut outcome = PruneOutcome {
            run_id: run_id.to_string(),
            ..PruneOutcome::default()
        };

        self.resume_journaled(&mut outcome).await?;
        ensure_consistent(
            &self.cache,
            self.backend.as_ref(),
            &self.stream_key,
            &self.folder,
        )
        .await?;

        let mut by_time = BTreeMap::<i64, Vec<(FileHandle, Option<Snapshot>)>>::new();
        for handle in list_snapshot_handles(self.backend.as_ref(), &self.folder).await? {
            check_cancel(options.cancel)?;
            match &handle {
                FileHandle::Snapshot {
                    name: SnapshotName::Time(t),
                    ..
                } => by_time.entry(*t).or_default().push((handle, None)),
                _ => match load_snapshot(self.backend.as_ref(), &self.stream_key, &handle).await {
                    Ok(s) => by_time.entry(s.time).or_default().push((handle, Some(s))),
                    Err(e) => record_failure(&mut outcome, &handle, &e),
                },
            }
        }
        outcome.snapshots_considered = by_time.values().map(|v| v.len() as u64).sum();

        let times: Vec<i64> = by_time.keys().copied().collect();
        let doomed: BTreeSet<i64> = snapshots_to_delete(&times, &self.config.retention)
            .into_iter()
            .collect();
        debug!(
            event = "prune.plan",
            snapshots = outcome.snapshots_considered,
            to_delete = doomed.len() as u64,
            "prune.plan"
        );

        for (time, entries) in by_time {
            if !doomed.contains(&time) {
                continue;
            }
            for (handle, loaded) in entries {
                check_cancel(options.cancel)?;
                match self.delete_snapshot(&handle, loaded).await {
                    Ok(chunks) => {
                        outcome.snapshots_deleted += 1;
                        outcome.chunks_deleted += chunks;
                        info!(event = "prune.snapshot.deleted", path = %handle, time, chunks_deleted = chunks, "prune.snapshot.deleted");
                    }
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => record_failure(&mut outcome, &handle, &e),
                }
                report(options.progress, &outcome);
            }
        }

        debug!(
            event = "phase.finish",
            phase = "prune",
            duration_ms = started.elapsed().as_millis() as u64,
            snapshots_deleted = outcome.snapshots_deleted,
            chunks_deleted = outcome.chunks_deleted,
            "phase.finish"
        );
        Ok(outcome)
    }

    /// Finishes deletions whose decrements were journaled by an interrupted prune.
    async fn resume_journaled(&self, outcome: &mut PruneOutcome) -> Result<()> {
        for path in self.cache.journaled_snapshots().await? {
            let handle = FileHandle::parse(&path)?;
            warn!(event = "prune.resume", path = %path, "prune.resume");
            match self.finish_deletion(&handle).await {
                Ok(chunks) => {
                    outcome.snapshots_resumed += 1;
                    outcome.chunks_deleted += chunks;
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => record_failure(outcome, &handle, &e),
            }
        }
        Ok(())
    }

    async fn delete_snapshot(&self, handle: &FileHandle, loaded: Option<Snapshot>) -> Result<u64> {
        let snapshot = match loaded {
            Some(s) => s,
            None => load_snapshot(self.backend.as_ref(), &self.stream_key, handle).await?,
        };
        let path = handle.relative_path();
        let applied = self
            .cache
            .journal_prune_decrements(&path, &snapshot.chunk_references())
            .await?;
        if !applied {
            debug!(event = "prune.already_journaled", path = %path, "prune.already_journaled");
        }
        self.finish_deletion(handle).await
    }

    /// Removes unreferenced chunks, then the snapshot blob, then the journal row.
    async fn finish_deletion(&self, handle: &FileHandle) -> Result<u64> {
        let chunks = self.sweep_unreferenced().await?;
        self.backend.remove(handle).await.map_err(|e| {
            error!(
                event = "io.backend.remove_failed",
                backend = self.backend.name(),
                path = %handle,
                error = %e,
                "io.backend.remove_failed"
            );
            e
        })?;
        self.cache.clear_journal(&handle.relative_path()).await?;
        Ok(chunks)
    }

    /// Deletes chunks with no remaining references from the backend, then from the cache.
    /// A chunk whose remote delete failed stays cached and is retried by the next sweep.
    async fn sweep_unreferenced(&self) -> Result<u64> {
        let ids = self.cache.unreferenced_chunks().await?;
        let mut deleted = Vec::with_capacity(ids.len());
        let mut first_error = None;
        for id in ids {
            let handle = FileHandle::blob(&self.folder, id.clone());
            match self.backend.remove(&handle).await {
                Ok(()) => deleted.push(id),
                Err(e) => {
                    error!(
                        event = "io.backend.remove_failed",
                        backend = self.backend.name(),
                        chunk_hash = %id,
                        error = %e,
                        "io.backend.remove_failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        self.cache.delete_chunks(&deleted).await?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted.len() as u64),
        }
    }
}

fn record_failure(outcome: &mut PruneOutcome, handle: &FileHandle, e: &Error) {
    warn!(event = "prune.snapshot.failed", path = %handle, error = %e, "prune.snapshot.failed");
    outcome.failures.push(SnapshotFailure {
        path: handle.relative_path(),
        error: e.to_string(),
    });
}

fn report(progress: Option<&dyn ProgressSink>, o: &PruneOutcome) {
    if let Some(sink) = progress {
        sink.report(&RunProgress {
            snapshots_deleted: o.snapshots_deleted,
            ..RunProgress::new(RunPhase::Prune)
        });
    }
}
