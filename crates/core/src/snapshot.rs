use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::backend::Backend;
use crate::chunker::sha256_hex;
use crate::crypto::{decrypt_blob, encrypt_blob, snapshot_hash_ad, snapshot_time_ad};
use crate::handle::{FileHandle, HandleKind, SnapshotName, TopLevelFolder};
use crate::{Error, Result};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotNaming {
    #[default]
    Timestamp,
    ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedRange {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub id: String,
    pub size: u64,
    pub last_modified: Option<i64>,
    /// Ordered chunk sequence. A packed file lists exactly its zip chunk.
    pub chunks: Vec<ChunkRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packed: Option<PackedRange>,
}

impl SnapshotFile {
    /// Each hash once, however often the file repeats it.
    pub fn distinct_chunk_ids(&self) -> BTreeSet<&str> {
        self.chunks.iter().map(|c| c.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Run start, milliseconds since the Unix epoch.
    pub time: i64,
    pub size: u64,
    pub files: Vec<SnapshotFile>,
}

impl Snapshot {
    pub fn new(time: i64, files: Vec<SnapshotFile>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            time,
            size: files.iter().map(|f| f.size).sum(),
            files,
        }
    }

    /// One entry per (file record, distinct chunk) pair: the refcount contribution of this snapshot.
    pub fn chunk_references(&self) -> Vec<String> {
        self.files
            .iter()
            .flat_map(|f| f.distinct_chunk_ids().into_iter().map(str::to_string))
            .collect()
    }

    /// Chunk id to (size, reference count) for this snapshot alone.
    pub fn reference_counts(&self) -> BTreeMap<String, (u64, i64)> {
        let mut out = BTreeMap::<String, (u64, i64)>::new();
        for f in &self.files {
            let mut seen = BTreeSet::new();
            for c in &f.chunks {
                if seen.insert(c.id.as_str()) {
                    out.entry(c.id.clone()).or_insert((c.size, 0)).1 += 1;
                }
            }
        }
        out
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Encode {
            message: format!("snapshot serialize failed: {e}"),
        })?;
        Ok(zstd::stream::encode_all(json.as_slice(), 0)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let json = zstd::stream::decode_all(bytes).map_err(|e| Error::Corrupt {
            message: format!("snapshot decompress failed: {e}"),
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&json).map_err(|e| Error::Corrupt {
            message: format!("invalid snapshot json: {e}"),
        })?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                version: u8::try_from(snapshot.version).unwrap_or(u8::MAX),
            });
        }
        Ok(snapshot)
    }
}

/// Encrypts `snapshot` and picks the handle it will be stored under.
pub fn seal_snapshot(
    stream_key: &[u8; 32],
    folder: &TopLevelFolder,
    snapshot: &Snapshot,
    naming: SnapshotNaming,
) -> Result<(FileHandle, Vec<u8>)> {
    let plain = snapshot.encode()?;
    Ok(match naming {
        SnapshotNaming::Timestamp => {
            let blob = encrypt_blob(stream_key, &snapshot_time_ad(snapshot.time), &plain)?;
            let name = SnapshotName::Time(snapshot.time);
            (FileHandle::snapshot(folder, name), blob)
        }
        SnapshotNaming::ContentHash => {
            let blob = encrypt_blob(stream_key, &snapshot_hash_ad(), &plain)?;
            let name = SnapshotName::Hash(sha256_hex(&blob));
            (FileHandle::snapshot(folder, name), blob)
        }
    })
}

pub async fn save_sealed(backend: &dyn Backend, handle: &FileHandle, blob: Vec<u8>) -> Result<()> {
    let blob_bytes = blob.len() as u64;
    backend.save(handle, blob).await.map_err(|e| {
        error!(
            event = "io.backend.save_failed",
            backend = backend.name(),
            path = %handle,
            blob_bytes,
            error = %e,
            "io.backend.save_failed"
        );
        e
    })?;
    debug!(event = "snapshot.saved", path = %handle, blob_bytes, "snapshot.saved");
    Ok(())
}

/// Encrypts and saves `snapshot`, returning the handle it was stored under.
pub async fn write_snapshot(
    backend: &dyn Backend,
    stream_key: &[u8; 32],
    folder: &TopLevelFolder,
    snapshot: &Snapshot,
    naming: SnapshotNaming,
) -> Result<FileHandle> {
    let (handle, blob) = seal_snapshot(stream_key, folder, snapshot, naming)?;
    save_sealed(backend, &handle, blob).await?;
    Ok(handle)
}

pub async fn load_snapshot(
    backend: &dyn Backend,
    stream_key: &[u8; 32],
    handle: &FileHandle,
) -> Result<Snapshot> {
    let FileHandle::Snapshot { name, .. } = handle else {
        return Err(Error::Internal {
            message: format!("not a snapshot handle: {handle}"),
        });
    };

    let blob = backend.load(handle).await.map_err(|e| {
        error!(
            event = "io.backend.load_failed",
            backend = backend.name(),
            path = %handle,
            error = %e,
            "io.backend.load_failed"
        );
        e
    })?;

    match name {
        SnapshotName::Time(time) => {
            let plain = decrypt_blob(stream_key, &snapshot_time_ad(*time), &blob)?;
            let snapshot = Snapshot::decode(&plain)?;
            if snapshot.time != *time {
                return Err(Error::Mismatch {
                    message: format!("snapshot time {} stored as {time}", snapshot.time),
                });
            }
            Ok(snapshot)
        }
        SnapshotName::Hash(hash) => {
            let actual = sha256_hex(&blob);
            if &actual != hash {
                return Err(Error::Integrity {
                    message: format!("snapshot blob hash {actual} != name {hash}"),
                });
            }
            Snapshot::decode(&decrypt_blob(stream_key, &snapshot_hash_ad(), &blob)?)
        }
    }
}

pub async fn list_snapshot_handles(
    backend: &dyn Backend,
    folder: &TopLevelFolder,
) -> Result<Vec<FileHandle>> {
    let listed = backend
        .list(Some(folder), &[HandleKind::Snapshot])
        .await
        .map_err(|e| {
            error!(
                event = "io.backend.list_failed",
                backend = backend.name(),
                folder = %folder.name(),
                error = %e,
                "io.backend.list_failed"
            );
            e
        })?;
    Ok(listed.into_iter().map(|b| b.handle).collect())
}
