use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::BoxFuture;
use crate::chunker::{chunk_id_bytes, sha256_hex};
use crate::crypto::{chunk_ad, decrypt_blob};
use crate::engine::{Engine, check_cancel, new_run_id};
use crate::handle::{FileHandle, SnapshotName};
use crate::pack::extract_packed;
use crate::progress::{ProgressSink, RunPhase, RunProgress, Tally};
use crate::snapshot::{SnapshotFile, list_snapshot_handles, load_snapshot};
use crate::{Error, Result};

/// Final placement of restored files.
pub trait FileWriter: Send + Sync {
    /// `bytes.len()` always equals `record.size`.
    fn write<'a>(&'a self, record: &'a SnapshotFile, bytes: Vec<u8>) -> BoxFuture<'a, ()>;
}

/// Writes each file below `target`, using the record id as a `/`-separated relative path.
#[derive(Debug, Clone)]
pub struct DirFileWriter {
    target: PathBuf,
}

impl DirFileWriter {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        let rel = Path::new(id);
        let mut out = self.target.clone();
        let mut depth = 0usize;
        for c in rel.components() {
            match c {
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => {
                    return Err(Error::InvalidConfig {
                        message: format!("file id escapes restore target: {id:?}"),
                    });
                }
            }
        }
        if depth == 0 {
            return Err(Error::InvalidConfig {
                message: format!("file id has no path: {id:?}"),
            });
        }
        Ok(out)
    }
}

impl FileWriter for DirFileWriter {
    fn write<'a>(&'a self, record: &'a SnapshotFile, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(&record.id)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, bytes).await?;

            if let Some(ms) = record.last_modified
                && ms >= 0
            {
                let mtime = UNIX_EPOCH + Duration::from_millis(ms as u64);
                tokio::task::spawn_blocking(move || {
                    std::fs::File::options()
                        .write(true)
                        .open(&path)?
                        .set_modified(mtime)
                })
                .await
                .map_err(|e| Error::Internal {
                    message: format!("set mtime task failed: {e}"),
                })??;
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Succeeded,
    Partial,
    Failed,
}

impl RestoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreStatus::Succeeded => "succeeded",
            RestoreStatus::Partial => "partial",
            RestoreStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub run_id: String,
    pub status: RestoreStatus,
    pub snapshot_path: String,
    pub files_total: u64,
    pub files_restored: u64,
    pub files_failed: u64,
    pub chunks_downloaded: u64,
    pub bytes_downloaded: u64,
    pub bytes_written: u64,
    pub failures: Vec<RestoreFailure>,
}

#[derive(Default)]
pub struct RestoreOptions<'a> {
    pub run_id: Option<String>,
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
}

/// Decrypted chunks that a later file in the snapshot still needs.
struct ChunkStore {
    remaining: HashMap<String, usize>,
    held: HashMap<String, Arc<Vec<u8>>>,
    unavailable: HashMap<String, String>,
}

impl ChunkStore {
    fn new(files: &[SnapshotFile]) -> Self {
        let mut remaining = HashMap::<String, usize>::new();
        for f in files {
            for c in &f.chunks {
                *remaining.entry(c.id.clone()).or_default() += 1;
            }
        }
        Self {
            remaining,
            held: HashMap::new(),
            unavailable: HashMap::new(),
        }
    }

    /// Consumes one use of `id`; returns the held bytes if present.
    fn take_use(&mut self, id: &str) -> Option<Arc<Vec<u8>>> {
        let left = self.remaining.get_mut(id).map(|n| {
            *n = n.saturating_sub(1);
            *n
        });
        if left == Some(0) {
            self.remaining.remove(id);
            self.held.remove(id)
        } else {
            self.held.get(id).cloned()
        }
    }

    fn hold(&mut self, id: &str, bytes: Arc<Vec<u8>>) {
        if self.remaining.contains_key(id) {
            self.held.insert(id.to_string(), bytes);
        }
    }
}

impl Engine {
    /// Resolves a snapshot by its path, its time name or its hash name.
    pub async fn find_snapshot(&self, name: &str) -> Result<FileHandle> {
        let handles = list_snapshot_handles(self.backend.as_ref(), &self.folder).await?;
        handles
            .into_iter()
            .find(|h| {
                if h.relative_path() == name {
                    return true;
                }
                match h {
                    FileHandle::Snapshot {
                        name: SnapshotName::Time(t),
                        ..
                    } => t.to_string() == name,
                    FileHandle::Snapshot {
                        name: SnapshotName::Hash(hash),
                        ..
                    } => hash == name,
                    _ => false,
                }
            })
            .ok_or_else(|| Error::NotFound {
                path: name.to_string(),
            })
    }

    pub async fn restore(
        &self,
        snapshot: &FileHandle,
        writer: &dyn FileWriter,
        options: RestoreOptions<'_>,
    ) -> Result<RestoreOutcome> {
        let _guard = self.start_restore()?;
        let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
        info!(event = "run.start", kind = "restore", run_id = %run_id, snapshot = %snapshot, "run.start");

        let result = self.run_restore(snapshot, writer, &options, &run_id).await;
        match &result {
            Ok(o) => info!(
                event = "run.finish",
                kind = "restore",
                run_id = %run_id,
                status = o.status.as_str(),
                files_restored = o.files_restored,
                files_failed = o.files_failed,
                chunks_downloaded = o.chunks_downloaded,
                bytes_written = o.bytes_written,
                "run.finish"
            ),
            Err(e) => error!(
                event = "run.finish",
                kind = "restore",
                run_id = %run_id,
                status = if matches!(e, Error::Cancelled) { "cancelled" } else { "failed" },
                error = %e,
                "run.finish"
            ),
        }
        result
    }

    async fn run_restore(
        &self,
        handle: &FileHandle,
        writer: &dyn FileWriter,
        options: &RestoreOptions<'_>,
        run_id: &str,
    ) -> Result<RestoreOutcome> {
        let started = Instant::now();
        debug!(event = "phase.start", phase = "download", "phase.start");

        let snapshot = load_snapshot(self.backend.as_ref(), &self.stream_key, handle).await?;
        let mut store = ChunkStore::new(&snapshot.files);
        let mut outcome = RestoreOutcome {
            run_id: run_id.to_string(),
            status: RestoreStatus::Succeeded,
            snapshot_path: handle.relative_path(),
            files_total: snapshot.files.len() as u64,
            files_restored: 0,
            files_failed: 0,
            chunks_downloaded: 0,
            bytes_downloaded: 0,
            bytes_written: 0,
            failures: Vec::new(),
        };

        for record in &snapshot.files {
            check_cancel(options.cancel)?;
            let assembled = self
                .assemble_file(record, &mut store, &mut outcome, options)
                .await;
            let res = match assembled {
                Ok(bytes) => {
                    let len = bytes.len() as u64;
                    writer.write(record, bytes).await.map(|()| len)
                }
                Err(e) => Err(e),
            };
            match res {
                Ok(len) => {
                    outcome.files_restored += 1;
                    outcome.bytes_written += len;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(event = "restore.file.failed", file_id = %record.id, error = %e, "restore.file.failed");
                    outcome.files_failed += 1;
                    outcome.failures.push(RestoreFailure {
                        id: record.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
            report(options.progress, &outcome);
        }

        outcome.status = if outcome.failures.is_empty() {
            RestoreStatus::Succeeded
        } else if outcome.files_restored == 0 {
            RestoreStatus::Failed
        } else {
            RestoreStatus::Partial
        };
        debug!(
            event = "phase.finish",
            phase = "download",
            duration_ms = started.elapsed().as_millis() as u64,
            chunks_downloaded = outcome.chunks_downloaded,
            bytes_downloaded = outcome.bytes_downloaded,
            "phase.finish"
        );
        Ok(outcome)
    }

    /// Replays the record's chunk sequence. Uses of every chunk are consumed even when an
    /// earlier piece failed, so held chunks are released on schedule.
    async fn assemble_file(
        &self,
        record: &SnapshotFile,
        store: &mut ChunkStore,
        outcome: &mut RestoreOutcome,
        options: &RestoreOptions<'_>,
    ) -> Result<Vec<u8>> {
        let mut pieces: Vec<Arc<Vec<u8>>> = Vec::with_capacity(record.chunks.len());
        let mut failed: Option<Error> = None;
        for c in &record.chunks {
            let held = store.take_use(&c.id);
            if failed.is_some() {
                continue;
            }
            check_cancel(options.cancel)?;
            let bytes = match held {
                Some(bytes) => Ok(bytes),
                None => self.fetch_chunk(&c.id, c.size, store, outcome).await,
            };
            match bytes {
                Ok(bytes) => {
                    store.hold(&c.id, bytes.clone());
                    pieces.push(bytes);
                }
                Err(e) => failed = Some(e),
            }
            report(options.progress, outcome);
        }
        if let Some(e) = failed {
            return Err(e);
        }

        let out = match record.packed {
            Some(range) => {
                let [container] = pieces.as_slice() else {
                    return Err(Error::Integrity {
                        message: format!(
                            "packed file {} lists {} chunks",
                            record.id,
                            pieces.len()
                        ),
                    });
                };
                extract_packed(container, range.offset, range.length)?.to_vec()
            }
            None => {
                let mut out = Vec::with_capacity(record.size as usize);
                for p in &pieces {
                    out.extend_from_slice(p);
                }
                out
            }
        };

        if out.len() as u64 != record.size {
            return Err(Error::Integrity {
                message: format!(
                    "file size mismatch: id={} expected={} got={}",
                    record.id,
                    record.size,
                    out.len()
                ),
            });
        }
        Ok(out)
    }

    async fn fetch_chunk(
        &self,
        id: &str,
        size: u64,
        store: &mut ChunkStore,
        outcome: &mut RestoreOutcome,
    ) -> Result<Arc<Vec<u8>>> {
        if let Some(message) = store.unavailable.get(id) {
            return Err(Error::Backend {
                message: format!("chunk {id} unavailable: {message}"),
            });
        }

        let handle = FileHandle::blob(&self.folder, id.to_string());
        let res: Result<(Vec<u8>, u64)> = async {
            let blob = self.backend.load(&handle).await.map_err(|e| {
                error!(
                    event = "io.backend.load_failed",
                    backend = self.backend.name(),
                    chunk_hash = %id,
                    error = %e,
                    "io.backend.load_failed"
                );
                e
            })?;
            let downloaded = blob.len() as u64;
            let plain = decrypt_blob(&self.stream_key, &chunk_ad(&chunk_id_bytes(id)?), &blob)?;
            if sha256_hex(&plain) != id {
                return Err(Error::Integrity {
                    message: format!("chunk hash mismatch: {id}"),
                });
            }
            if plain.len() as u64 != size {
                return Err(Error::Integrity {
                    message: format!(
                        "chunk length mismatch: chunk_hash={id} expected_len={size} got_len={}",
                        plain.len()
                    ),
                });
            }
            Ok((plain, downloaded))
        }
        .await;

        match res {
            Ok((plain, downloaded)) => {
                outcome.chunks_downloaded += 1;
                outcome.bytes_downloaded += downloaded;
                Ok(Arc::new(plain))
            }
            Err(e) => {
                store.unavailable.insert(id.to_string(), e.to_string());
                Err(e)
            }
        }
    }
}

fn report(progress: Option<&dyn ProgressSink>, o: &RestoreOutcome) {
    if let Some(sink) = progress {
        sink.report(&RunProgress {
            files: Tally {
                done: o.files_restored,
                total: o.files_total,
            },
            files_failed: o.files_failed,
            chunks: Tally {
                done: o.chunks_downloaded,
                total: 0,
            },
            bytes_moved: o.bytes_downloaded,
            ..RunProgress::new(RunPhase::Download)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ChunkRef;

    fn record(id: &str, chunks: &[&str]) -> SnapshotFile {
        SnapshotFile {
            id: id.to_string(),
            size: 0,
            last_modified: None,
            chunks: chunks
                .iter()
                .map(|c| ChunkRef {
                    id: c.to_string(),
                    size: 1,
                })
                .collect(),
            packed: None,
        }
    }

    #[test]
    fn held_chunks_are_released_after_last_use() {
        let files = vec![record("a", &["x", "y"]), record("b", &["x"])];
        let mut store = ChunkStore::new(&files);

        assert!(store.take_use("x").is_none());
        store.hold("x", Arc::new(vec![1]));
        assert!(store.take_use("y").is_none());
        store.hold("y", Arc::new(vec![2]));
        assert!(store.held.get("y").is_none());

        assert_eq!(store.take_use("x").as_deref(), Some(&vec![1]));
        assert!(store.held.is_empty());
        assert!(store.remaining.is_empty());
    }

    #[test]
    fn dir_writer_rejects_escaping_ids() {
        let w = DirFileWriter::new("/tmp/target");
        assert_eq!(
            w.path_for("a/b.txt").unwrap(),
            PathBuf::from("/tmp/target/a/b.txt")
        );
        assert!(w.path_for("../etc/passwd").is_err());
        assert!(w.path_for("/abs").is_err());
        assert!(w.path_for("").is_err());
    }

    #[tokio::test]
    async fn dir_writer_writes_bytes_and_mtime() {
        let temp = tempfile::tempdir().unwrap();
        let w = DirFileWriter::new(temp.path());
        let mut r = record("d/e.bin", &[]);
        r.size = 3;
        r.last_modified = Some(1_700_000_000_000);
        w.write(&r, vec![7, 8, 9]).await.unwrap();

        let path = temp.path().join("d/e.bin");
        assert_eq!(std::fs::read(&path).unwrap(), vec![7, 8, 9]);
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(
            mtime.duration_since(UNIX_EPOCH).unwrap().as_millis(),
            1_700_000_000_000
        );
    }
}
