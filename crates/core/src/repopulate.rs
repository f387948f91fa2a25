use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::chunk_cache::{CachedChunk, ChunkCache};
use crate::crypto::BLOB_VERSION;
use crate::handle::{FileHandle, HandleKind, TopLevelFolder};
use crate::snapshot::{list_snapshot_handles, load_snapshot};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepopulateOutcome {
    pub snapshots: u64,
    pub chunks: u64,
    /// Referenced by a snapshot but absent from the backend.
    pub missing_chunks: u64,
    pub orphans_removed: u64,
}

/// Compares the remote chunk listing with the cache and rebuilds the cache when they differ.
///
/// Returns `Some` when a repopulation ran.
pub async fn ensure_consistent(
    cache: &ChunkCache,
    backend: &dyn Backend,
    stream_key: &[u8; 32],
    folder: &TopLevelFolder,
) -> Result<Option<RepopulateOutcome>> {
    let remote = list_remote_chunks(backend, folder).await?;
    let cached = cache.all_chunk_hashes().await?;

    let missing_remote = cached.iter().filter(|id| !remote.contains_key(*id)).count();
    let unknown_local = remote.keys().filter(|id| !cached.contains(*id)).count();
    if missing_remote == 0 && unknown_local == 0 {
        debug!(
            event = "cache.consistent",
            chunks = cached.len() as u64,
            "cache.consistent"
        );
        return Ok(None);
    }

    warn!(
        event = "cache.inconsistent",
        cached = cached.len() as u64,
        remote = remote.len() as u64,
        missing_remote = missing_remote as u64,
        unknown_local = unknown_local as u64,
        "cache.inconsistent"
    );
    repopulate(cache, backend, stream_key, folder, remote)
        .await
        .map(Some)
}

/// Rebuilds the chunk table from every remote snapshot, then sweeps unreferenced remote chunks.
async fn repopulate(
    cache: &ChunkCache,
    backend: &dyn Backend,
    stream_key: &[u8; 32],
    folder: &TopLevelFolder,
    remote: HashMap<String, FileHandle>,
) -> Result<RepopulateOutcome> {
    let started = Instant::now();
    info!(event = "cache.repopulate.start", folder = %folder.name(), "cache.repopulate.start");

    let journaled = cache.journaled_snapshots().await?;
    let handles = list_snapshot_handles(backend, folder)
        .await
        .map_err(|e| repopulate_failed(format!("list snapshots: {e}")))?;

    let mut outcome = RepopulateOutcome::default();
    let mut refs = BTreeMap::<String, (u64, i64)>::new();
    for handle in &handles {
        if journaled.contains(&handle.relative_path()) {
            debug!(event = "cache.repopulate.skip_pruned", path = %handle, "cache.repopulate.skip_pruned");
            continue;
        }
        let snapshot = load_snapshot(backend, stream_key, handle)
            .await
            .map_err(|e| repopulate_failed(format!("snapshot {handle}: {e}")))?;
        for (id, (size, count)) in snapshot.reference_counts() {
            refs.entry(id).or_insert((size, 0)).1 += count;
        }
        outcome.snapshots += 1;
    }

    let mut chunks = Vec::with_capacity(refs.len());
    let mut lost = Vec::new();
    for (id, (size, ref_count)) in &refs {
        let chunk = CachedChunk {
            id: id.clone(),
            size: *size,
            ref_count: *ref_count,
            version: BLOB_VERSION,
        };
        if remote.contains_key(id) {
            chunks.push(chunk);
        } else {
            warn!(event = "cache.repopulate.missing_chunk", chunk_hash = %id, "cache.repopulate.missing_chunk");
            lost.push(chunk);
        }
    }
    outcome.chunks = chunks.len() as u64;
    outcome.missing_chunks = lost.len() as u64;
    cache
        .clear_and_repopulate(&chunks, &lost)
        .await
        .map_err(|e| repopulate_failed(format!("write cache: {e}")))?;

    for (id, handle) in &remote {
        if refs.contains_key(id) {
            continue;
        }
        match backend.remove(handle).await {
            Ok(()) => outcome.orphans_removed += 1,
            Err(e) => {
                error!(
                    event = "io.backend.remove_failed",
                    backend = backend.name(),
                    path = %handle,
                    error = %e,
                    "io.backend.remove_failed"
                );
            }
        }
    }

    info!(
        event = "cache.repopulate.finish",
        duration_ms = started.elapsed().as_millis() as u64,
        snapshots = outcome.snapshots,
        chunks = outcome.chunks,
        missing_chunks = outcome.missing_chunks,
        orphans_removed = outcome.orphans_removed,
        "cache.repopulate.finish"
    );
    Ok(outcome)
}

async fn list_remote_chunks(
    backend: &dyn Backend,
    folder: &TopLevelFolder,
) -> Result<HashMap<String, FileHandle>> {
    let listed = backend
        .list(Some(folder), &[HandleKind::Blob])
        .await
        .map_err(|e| {
            error!(
                event = "io.backend.list_failed",
                backend = backend.name(),
                folder = %folder.name(),
                error = %e,
                "io.backend.list_failed"
            );
            repopulate_failed(format!("list chunks: {e}"))
        })?;
    Ok(listed
        .into_iter()
        .filter_map(|b| match &b.handle {
            FileHandle::Blob { hash, .. } => Some((hash.clone(), b.handle.clone())),
            _ => None,
        })
        .collect())
}

fn repopulate_failed(message: String) -> Error {
    Error::CacheRepopulate { message }
}
