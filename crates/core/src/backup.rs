use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk_cache::{CachedFile, RUN_KIND_BACKUP};
use crate::chunker::{Chunk, Chunker, chunk_id_bytes};
use crate::crypto::{chunk_ad, encrypt_blob};
use crate::engine::{Engine, check_cancel, is_fatal, new_run_id};
use crate::handle::FileHandle;
use crate::pack::PackBuilder;
use crate::progress::{ProgressSink, RunPhase, RunProgress, Tally};
use crate::repopulate::ensure_consistent;
use crate::scanner::{ContentFile, Scanner};
use crate::snapshot::{
    ChunkRef, PackedRange, Snapshot, SnapshotFile, list_snapshot_handles, save_sealed,
    seal_snapshot,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BackupPhase {
    Idle = 0,
    Scanning = 1,
    DedupAndUpload = 2,
    WritingSnapshot = 3,
    Done = 4,
    Failed = 5,
}

impl BackupPhase {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => BackupPhase::Scanning,
            2 => BackupPhase::DedupAndUpload,
            3 => BackupPhase::WritingSnapshot,
            4 => BackupPhase::Done,
            5 => BackupPhase::Failed,
            _ => BackupPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Succeeded,
    /// A snapshot was written but some files are missing from it.
    Partial,
    /// No snapshot was written.
    Failed,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Succeeded => "succeeded",
            BackupStatus::Partial => "partial",
            BackupStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BackupCounters {
    pub files_total: u64,
    pub files_unchanged: u64,
    pub files_backed_up: u64,
    pub files_failed: u64,
    pub chunks_total: u64,
    pub chunks_uploaded: u64,
    pub chunks_deduped: u64,
    pub bytes_read: u64,
    pub bytes_uploaded: u64,
    pub bytes_deduped: u64,
    pub cache_repopulated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub run_id: String,
    pub status: BackupStatus,
    pub snapshot_path: Option<String>,
    #[serde(skip)]
    pub snapshot: Option<FileHandle>,
    pub counters: BackupCounters,
    pub failures: Vec<FileFailure>,
}

#[derive(Default)]
pub struct BackupOptions<'a> {
    pub run_id: Option<String>,
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

struct RunCtx<'o, 'a> {
    options: &'o BackupOptions<'a>,
    run_time: i64,
    counters: BackupCounters,
    records: Vec<SnapshotFile>,
    reused: Vec<String>,
    failures: Vec<FileFailure>,
}

impl RunCtx<'_, '_> {
    fn check_cancel(&self) -> Result<()> {
        check_cancel(self.options.cancel)
    }

    fn report(&self, phase: RunPhase) {
        if let Some(sink) = self.options.progress {
            let c = &self.counters;
            sink.report(&RunProgress {
                files: Tally {
                    done: c.files_unchanged + c.files_backed_up,
                    total: c.files_total,
                },
                files_failed: c.files_failed,
                chunks: Tally {
                    done: c.chunks_uploaded + c.chunks_deduped,
                    total: c.chunks_total,
                },
                bytes_read: c.bytes_read,
                bytes_moved: c.bytes_uploaded,
                bytes_deduped: c.bytes_deduped,
                ..RunProgress::new(phase)
            });
        }
    }
}

impl Engine {
    pub async fn backup(
        &self,
        scanner: &dyn Scanner,
        options: BackupOptions<'_>,
    ) -> Result<BackupOutcome> {
        let _guard = self.start_backup("backup")?;
        self.backup_guarded(scanner, options).await
    }

    /// The backup itself; the caller holds the backup guard.
    pub(crate) async fn backup_guarded(
        &self,
        scanner: &dyn Scanner,
        options: BackupOptions<'_>,
    ) -> Result<BackupOutcome> {
        let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
        info!(event = "run.start", kind = "backup", run_id = %run_id, "run.start");
        self.set_phase(BackupPhase::Idle);
        self.cache
            .set_run_state(RUN_KIND_BACKUP, "running", &run_id)
            .await?;

        let result = self.run_backup(scanner, &options, &run_id).await;
        let status = match &result {
            Ok(outcome) => outcome.status.as_str(),
            Err(Error::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        self.set_phase(match &result {
            Ok(o) if o.status != BackupStatus::Failed => BackupPhase::Done,
            _ => BackupPhase::Failed,
        });
        if let Err(e) = self
            .cache
            .set_run_state(RUN_KIND_BACKUP, status, &run_id)
            .await
        {
            error!(event = "io.sqlite.run_state_failed", run_id = %run_id, error = %e, "io.sqlite.run_state_failed");
            if result.is_ok() {
                return Err(e);
            }
        }

        match &result {
            Ok(o) => info!(
                event = "run.finish",
                kind = "backup",
                run_id = %run_id,
                status,
                files_total = o.counters.files_total,
                files_failed = o.counters.files_failed,
                chunks_uploaded = o.counters.chunks_uploaded,
                bytes_uploaded = o.counters.bytes_uploaded,
                bytes_deduped = o.counters.bytes_deduped,
                "run.finish"
            ),
            Err(e) => error!(
                event = "run.finish",
                kind = "backup",
                run_id = %run_id,
                status,
                error = %e,
                "run.finish"
            ),
        }
        result
    }

    async fn run_backup(
        &self,
        scanner: &dyn Scanner,
        options: &BackupOptions<'_>,
        run_id: &str,
    ) -> Result<BackupOutcome> {
        self.set_phase(BackupPhase::Scanning);
        let scan_started = Instant::now();
        debug!(event = "phase.start", phase = "scan", "phase.start");

        let now = chrono::Utc::now().timestamp_millis();
        let run_time = match self.latest_snapshot_time().await? {
            Some(latest) if latest >= now => latest + 1,
            _ => now,
        };
        let mut ctx = RunCtx {
            options,
            run_time,
            counters: BackupCounters::default(),
            records: Vec::new(),
            reused: Vec::new(),
            failures: Vec::new(),
        };
        ctx.check_cancel()?;

        let repopulated = ensure_consistent(
            &self.cache,
            self.backend.as_ref(),
            &self.stream_key,
            &self.folder,
        )
        .await?;
        ctx.counters.cache_repopulated = repopulated.is_some();

        let files = scanner.scan().await.map_err(|e| {
            error!(event = "scan.failed", error = %e, "scan.failed");
            e
        })?;
        ctx.counters.files_total = files.len() as u64;
        ctx.report(RunPhase::Scan);
        debug!(
            event = "phase.finish",
            phase = "scan",
            duration_ms = scan_started.elapsed().as_millis() as u64,
            files_total = ctx.counters.files_total,
            cache_repopulated = ctx.counters.cache_repopulated,
            "phase.finish"
        );

        self.set_phase(BackupPhase::DedupAndUpload);
        let upload_started = Instant::now();
        debug!(event = "phase.start", phase = "upload", "phase.start");

        let mut small = Vec::new();
        for file in &files {
            ctx.check_cancel()?;
            if self.reuse_unchanged(&mut ctx, file).await? {
                continue;
            }
            if file.size == 0 {
                self.record_file(&mut ctx, file, Vec::new(), None).await?;
            } else if self.config.chunking.is_small(file.size) {
                small.push(file);
            } else {
                let res = self.backup_large_file(&mut ctx, scanner, file).await;
                self.settle_file(&mut ctx, file, res).await?;
            }
            ctx.report(RunPhase::Upload);
        }
        self.backup_small_files(&mut ctx, scanner, &small).await?;

        debug!(
            event = "phase.finish",
            phase = "upload",
            duration_ms = upload_started.elapsed().as_millis() as u64,
            chunks_uploaded = ctx.counters.chunks_uploaded,
            chunks_deduped = ctx.counters.chunks_deduped,
            bytes_uploaded = ctx.counters.bytes_uploaded,
            bytes_deduped = ctx.counters.bytes_deduped,
            files_failed = ctx.counters.files_failed,
            "phase.finish"
        );

        if ctx.records.is_empty() && !ctx.failures.is_empty() {
            warn!(event = "backup.no_snapshot", run_id, files_failed = ctx.counters.files_failed, "backup.no_snapshot");
            return Ok(BackupOutcome {
                run_id: run_id.to_string(),
                status: BackupStatus::Failed,
                snapshot_path: None,
                snapshot: None,
                counters: ctx.counters,
                failures: ctx.failures,
            });
        }

        ctx.check_cancel()?;
        self.set_phase(BackupPhase::WritingSnapshot);
        ctx.report(RunPhase::Snapshot);
        let handle = self.commit_snapshot(&mut ctx).await?;

        let status = if ctx.failures.is_empty() {
            BackupStatus::Succeeded
        } else {
            BackupStatus::Partial
        };
        Ok(BackupOutcome {
            run_id: run_id.to_string(),
            status,
            snapshot_path: Some(handle.relative_path()),
            snapshot: Some(handle),
            counters: ctx.counters,
            failures: ctx.failures,
        })
    }

    /// Reuses the cached chunk plan when size and mtime match and every chunk is still cached.
    async fn reuse_unchanged(&self, ctx: &mut RunCtx<'_, '_>, file: &ContentFile) -> Result<bool> {
        let Some(cached) = self.cache.get_file(&file.id).await? else {
            return Ok(false);
        };
        if cached.size != file.size || cached.last_modified != file.last_modified {
            return Ok(false);
        }
        for c in &cached.chunks {
            if self.cache.get_chunk(&c.id).await?.is_none() {
                debug!(event = "backup.file.chunk_gone", file_id = %file.id, chunk_hash = %c.id, "backup.file.chunk_gone");
                return Ok(false);
            }
        }

        ctx.counters.files_unchanged += 1;
        ctx.counters.bytes_deduped += file.size;
        ctx.reused.push(file.id.clone());
        ctx.records.push(cached.to_record());
        Ok(true)
    }

    async fn backup_large_file(
        &self,
        ctx: &mut RunCtx<'_, '_>,
        scanner: &dyn Scanner,
        file: &ContentFile,
    ) -> Result<Vec<ChunkRef>> {
        let mut reader = scanner.open(file).await?;
        let chunker = Chunker::new(self.config.chunking.chunk_size_max);
        let mut refs = Vec::new();
        while let Some(chunk) = chunker.next_chunk(&mut reader).await? {
            ctx.check_cancel()?;
            ctx.counters.bytes_read += chunk.bytes.len() as u64;
            self.store_chunk(ctx, &chunk).await?;
            refs.push(ChunkRef {
                id: chunk.id,
                size: chunk.bytes.len() as u64,
            });
        }
        Ok(refs)
    }

    async fn backup_small_files(
        &self,
        ctx: &mut RunCtx<'_, '_>,
        scanner: &dyn Scanner,
        files: &[&ContentFile],
    ) -> Result<()> {
        let mut packer = PackBuilder::new(self.config.chunking.zip_chunk_size_max);
        let mut pending: Vec<&ContentFile> = Vec::new();

        for &file in files {
            ctx.check_cancel()?;
            let bytes = match read_all(scanner, file).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.settle_file(ctx, file, Err(e)).await?;
                    continue;
                }
            };

            if bytes.is_empty() {
                self.record_file(ctx, file, Vec::new(), None).await?;
                continue;
            }
            if bytes.len() > self.config.chunking.zip_chunk_size_max {
                // Grew past the pack limit since the scan; chunk it like a large file.
                let res = self.backup_bytes_as_chunks(ctx, bytes).await;
                self.settle_file(ctx, file, res).await?;
                continue;
            }

            if !packer.fits(bytes.len()) {
                self.flush_pack(ctx, &mut packer, &mut pending).await?;
            }
            packer.push(pending.len(), &bytes)?;
            ctx.counters.bytes_read += bytes.len() as u64;
            pending.push(file);
            ctx.report(RunPhase::Upload);
        }
        self.flush_pack(ctx, &mut packer, &mut pending).await
    }

    async fn backup_bytes_as_chunks(
        &self,
        ctx: &mut RunCtx<'_, '_>,
        bytes: Vec<u8>,
    ) -> Result<Vec<ChunkRef>> {
        let mut refs = Vec::new();
        for piece in bytes.chunks(self.config.chunking.chunk_size_max) {
            let chunk = Chunk::new(piece.to_vec());
            self.store_chunk(ctx, &chunk).await?;
            refs.push(ChunkRef {
                id: chunk.id,
                size: chunk.bytes.len() as u64,
            });
        }
        ctx.counters.bytes_read += bytes.len() as u64;
        Ok(refs)
    }

    async fn flush_pack(
        &self,
        ctx: &mut RunCtx<'_, '_>,
        packer: &mut PackBuilder,
        pending: &mut Vec<&ContentFile>,
    ) -> Result<()> {
        if packer.is_empty() {
            return Ok(());
        }
        let pack = packer.finalize()?;
        let stored = self.store_chunk(ctx, &pack.chunk).await;
        let files: Vec<&ContentFile> = std::mem::take(pending);

        if let Err(e) = stored {
            if is_fatal(&e) {
                return Err(e);
            }
            for file in files {
                self.fail_file(ctx, file, &e).await?;
            }
            return Ok(());
        }

        let zip_ref = ChunkRef {
            id: pack.chunk.id.clone(),
            size: pack.chunk.bytes.len() as u64,
        };
        for entry in pack.entries {
            let Some(file) = files.get(entry.index) else {
                return Err(Error::Integrity {
                    message: format!("pack entry {} has no file", entry.index),
                });
            };
            let range = PackedRange {
                offset: entry.offset,
                length: entry.len,
            };
            self.record_file(ctx, file, vec![zip_ref.clone()], Some(range))
                .await?;
        }
        Ok(())
    }

    /// Dedup against the cache, otherwise encrypt and upload, then cache.
    async fn store_chunk(&self, ctx: &mut RunCtx<'_, '_>, chunk: &Chunk) -> Result<()> {
        let len = chunk.bytes.len() as u64;
        ctx.counters.chunks_total += 1;

        if self.cache.get_chunk(&chunk.id).await?.is_some() {
            ctx.counters.chunks_deduped += 1;
            ctx.counters.bytes_deduped += len;
            return Ok(());
        }

        let ad = chunk_ad(&chunk_id_bytes(&chunk.id)?);
        let blob = encrypt_blob(&self.stream_key, &ad, &chunk.bytes)?;
        let blob_bytes = blob.len() as u64;
        let handle = FileHandle::blob(&self.folder, chunk.id.clone());
        self.backend.save(&handle, blob).await.map_err(|e| {
            error!(
                event = "io.backend.save_failed",
                backend = self.backend.name(),
                chunk_hash = %chunk.id,
                blob_bytes,
                error = %e,
                "io.backend.save_failed"
            );
            e
        })?;
        self.cache.insert_new(&chunk.id, len).await?;

        ctx.counters.chunks_uploaded += 1;
        ctx.counters.bytes_uploaded += blob_bytes;
        Ok(())
    }

    async fn settle_file(
        &self,
        ctx: &mut RunCtx<'_, '_>,
        file: &ContentFile,
        res: Result<Vec<ChunkRef>>,
    ) -> Result<()> {
        match res {
            Ok(chunks) => self.record_file(ctx, file, chunks, None).await,
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => self.fail_file(ctx, file, &e).await,
        }
    }

    async fn record_file(
        &self,
        ctx: &mut RunCtx<'_, '_>,
        file: &ContentFile,
        chunks: Vec<ChunkRef>,
        packed: Option<PackedRange>,
    ) -> Result<()> {
        let size = match packed {
            Some(range) => range.length,
            None => chunks.iter().map(|c| c.size).sum(),
        };
        let record = SnapshotFile {
            id: file.id.clone(),
            size,
            last_modified: file.last_modified,
            chunks,
            packed,
        };
        self.cache
            .upsert_file(&CachedFile::from_record(&record, ctx.run_time))
            .await?;
        ctx.counters.files_backed_up += 1;
        ctx.records.push(record);
        Ok(())
    }

    /// The file is left out of this snapshot and its cache entry dropped, so the next run retries it.
    async fn fail_file(&self, ctx: &mut RunCtx<'_, '_>, file: &ContentFile, e: &Error) -> Result<()> {
        warn!(event = "backup.file.failed", file_id = %file.id, error = %e, "backup.file.failed");
        self.cache.remove_file(&file.id).await?;
        ctx.counters.files_failed += 1;
        ctx.failures.push(FileFailure {
            id: file.id.clone(),
            error: e.to_string(),
        });
        Ok(())
    }

    /// Counts references, then writes the snapshot.
    async fn commit_snapshot(&self, ctx: &mut RunCtx<'_, '_>) -> Result<FileHandle> {
        let started = Instant::now();
        debug!(event = "phase.start", phase = "snapshot", "phase.start");

        let snapshot = Snapshot::new(ctx.run_time, std::mem::take(&mut ctx.records));
        let (handle, blob) =
            seal_snapshot(&self.stream_key, &self.folder, &snapshot, self.config.naming)?;
        let refs = snapshot.chunk_references();
        self.cache.increment_refs(&refs).await?;

        if let Err(e) = save_sealed(self.backend.as_ref(), &handle, blob).await {
            self.release_refs_if_absent(&handle, &refs).await;
            return Err(e);
        }

        self.cache.touch_files(&ctx.reused, ctx.run_time).await?;
        let evicted = self.cache.evict_files_not_seen_since(ctx.run_time).await?;

        debug!(
            event = "phase.finish",
            phase = "snapshot",
            duration_ms = started.elapsed().as_millis() as u64,
            path = %handle,
            files = snapshot.files.len() as u64,
            references = refs.len() as u64,
            evicted_files = evicted,
            "phase.finish"
        );
        Ok(handle)
    }

    /// A failed save may still have stored the blob. Counts are only rolled back once the
    /// snapshot is confirmed absent; otherwise they stay counted, matching the stored snapshot.
    async fn release_refs_if_absent(&self, handle: &FileHandle, refs: &[String]) {
        match list_snapshot_handles(self.backend.as_ref(), &self.folder).await {
            Ok(listed) if !listed.contains(handle) => {
                if let Err(undo) = self.cache.decrement_refs(refs).await {
                    error!(event = "io.sqlite.refcount_undo_failed", error = %undo, "io.sqlite.refcount_undo_failed");
                }
            }
            Ok(_) => warn!(
                event = "backup.snapshot.stored_despite_error",
                path = %handle,
                "backup.snapshot.stored_despite_error"
            ),
            Err(e) => warn!(
                event = "backup.refs_kept",
                path = %handle,
                error = %e,
                "backup.refs_kept"
            ),
        }
    }
}

async fn read_all(scanner: &dyn Scanner, file: &ContentFile) -> Result<Vec<u8>> {
    let mut reader = scanner.open(file).await?;
    let mut bytes = Vec::with_capacity(file.size as usize);
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}
